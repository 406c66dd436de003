//! In-memory record store for tests/dev.
//!
//! One mutex guards every key, so a batch is applied atomically. Expiry is
//! lazy: an expired key is dropped the next time any operation touches it.
//! Time comes from an injected [`Clock`] so tests can fast-forward TTLs.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use texforge_core::{Clock, SystemClock};

use super::{Batch, RecordStore, StoreError, StoreOp, StoreReply, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    SortedSet(BTreeMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn persistent(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
pub struct InMemoryRecordStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    pushed: Notify,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            pushed: Notify::new(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Whether `key` currently holds a live (unexpired) value.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.lock();
        live(&mut entries, key, now).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_pop_front(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let popped = match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => list.pop_front(),
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => None,
        };
        drop_if_empty(&mut entries, key);
        Ok(popped)
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str, now: DateTime<Utc>) {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
}

fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    purge_expired(entries, key, now);
    entries.get_mut(key)
}

fn live_or_insert<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
    empty: fn() -> Value,
) -> &'a mut Entry {
    purge_expired(entries, key, now);
    entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::persistent(empty()))
}

/// Collections disappear once their last element is removed.
fn drop_if_empty(entries: &mut HashMap<String, Entry>, key: &str) {
    let empty = match entries.get(key).map(|e| &e.value) {
        Some(Value::List(l)) => l.is_empty(),
        Some(Value::Set(s)) => s.is_empty(),
        Some(Value::SortedSet(z)) => z.is_empty(),
        _ => false,
    };
    if empty {
        entries.remove(key);
    }
}

fn ttl_deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn count(n: usize) -> StoreReply {
    StoreReply::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

fn apply(
    entries: &mut HashMap<String, Entry>,
    op: StoreOp,
    now: DateTime<Utc>,
) -> StoreResult<StoreReply> {
    let reply = match op {
        StoreOp::SetEx { key, value, ttl } => {
            entries.insert(
                key,
                Entry {
                    value: Value::Bytes(value),
                    expires_at: Some(ttl_deadline(now, ttl)),
                },
            );
            StoreReply::Done
        }
        StoreOp::Get { key } => match live(entries, &key, now) {
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => StoreReply::Value(Some(bytes.clone())),
            Some(_) => return Err(StoreError::WrongType(key)),
            None => StoreReply::Value(None),
        },
        StoreOp::Del { key } => {
            let existed = live(entries, &key, now).is_some();
            entries.remove(&key);
            StoreReply::Int(i64::from(existed))
        }
        StoreOp::RPush { key, value } => {
            let entry = live_or_insert(entries, &key, now, || Value::List(VecDeque::new()));
            match &mut entry.value {
                Value::List(list) => {
                    list.push_back(value);
                    count(list.len())
                }
                _ => return Err(StoreError::WrongType(key)),
            }
        }
        StoreOp::LRem { key, value } => {
            let removed = match live(entries, &key, now) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => match list.iter().position(|v| *v == value) {
                    Some(idx) => {
                        list.remove(idx);
                        1
                    }
                    None => 0,
                },
                Some(_) => return Err(StoreError::WrongType(key)),
                None => 0,
            };
            drop_if_empty(entries, &key);
            StoreReply::Int(removed)
        }
        StoreOp::LLen { key } => match live(entries, &key, now) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => count(list.len()),
            Some(_) => return Err(StoreError::WrongType(key)),
            None => StoreReply::Int(0),
        },
        StoreOp::SAdd { key, member } => {
            let entry = live_or_insert(entries, &key, now, || Value::Set(BTreeSet::new()));
            match &mut entry.value {
                Value::Set(set) => StoreReply::Int(i64::from(set.insert(member))),
                _ => return Err(StoreError::WrongType(key)),
            }
        }
        StoreOp::SRem { key, member } => {
            let removed = match live(entries, &key, now) {
                Some(Entry {
                    value: Value::Set(set),
                    ..
                }) => set.remove(&member),
                Some(_) => return Err(StoreError::WrongType(key)),
                None => false,
            };
            drop_if_empty(entries, &key);
            StoreReply::Int(i64::from(removed))
        }
        StoreOp::SMembers { key } => match live(entries, &key, now) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => StoreReply::Members(set.iter().cloned().collect()),
            Some(_) => return Err(StoreError::WrongType(key)),
            None => StoreReply::Members(Vec::new()),
        },
        StoreOp::SCard { key } => match live(entries, &key, now) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => count(set.len()),
            Some(_) => return Err(StoreError::WrongType(key)),
            None => StoreReply::Int(0),
        },
        StoreOp::ZAdd { key, score, member } => {
            let entry = live_or_insert(entries, &key, now, || Value::SortedSet(BTreeMap::new()));
            match &mut entry.value {
                Value::SortedSet(zset) => StoreReply::Int(i64::from(zset.insert(member, score).is_none())),
                _ => return Err(StoreError::WrongType(key)),
            }
        }
        StoreOp::ZRem { key, member } => {
            let removed = match live(entries, &key, now) {
                Some(Entry {
                    value: Value::SortedSet(zset),
                    ..
                }) => zset.remove(&member).is_some(),
                Some(_) => return Err(StoreError::WrongType(key)),
                None => false,
            };
            drop_if_empty(entries, &key);
            StoreReply::Int(i64::from(removed))
        }
        StoreOp::ZRemRangeByScore { key, min, max } => {
            let removed = match live(entries, &key, now) {
                Some(Entry {
                    value: Value::SortedSet(zset),
                    ..
                }) => {
                    let before = zset.len();
                    zset.retain(|_, score| *score < min || *score > max);
                    before - zset.len()
                }
                Some(_) => return Err(StoreError::WrongType(key)),
                None => 0,
            };
            drop_if_empty(entries, &key);
            count(removed)
        }
        StoreOp::ZCard { key } => match live(entries, &key, now) {
            Some(Entry {
                value: Value::SortedSet(zset),
                ..
            }) => count(zset.len()),
            Some(_) => return Err(StoreError::WrongType(key)),
            None => StoreReply::Int(0),
        },
        StoreOp::Expire { key, ttl } => match live(entries, &key, now) {
            Some(entry) => {
                entry.expires_at = Some(ttl_deadline(now, ttl));
                StoreReply::Int(1)
            }
            None => StoreReply::Int(0),
        },
    };
    Ok(reply)
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn execute(&self, batch: Batch) -> StoreResult<Vec<StoreReply>> {
        let now = self.clock.now();
        let mut pushed = false;
        let replies = {
            let mut entries = self.lock();
            let mut replies = Vec::with_capacity(batch.len());
            for op in batch.into_ops() {
                pushed |= matches!(op, StoreOp::RPush { .. });
                replies.push(apply(&mut entries, op, now)?);
            }
            replies
        };
        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(replies)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before looking, so a push racing with the
            // check still wakes us.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop_front(key)? {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}
