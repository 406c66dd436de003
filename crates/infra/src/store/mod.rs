//! Record store abstraction.
//!
//! A durable key-value store with per-key expiry and list / set / sorted-set
//! primitives. It is the only shared mutable resource of the system: job
//! payloads, status records, artifacts, the work queue, the processing set and
//! rate-limit windows all live here.
//!
//! Backends implement two methods:
//! - [`RecordStore::execute`] runs a [`Batch`] of operations atomically
//!   (no other client observes a partially applied batch)
//! - [`RecordStore::blpop`] pops a list head, waiting a bounded time
//!
//! Everything else is a provided convenience wrapper around a one-op batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

pub mod in_memory;
pub mod keys;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryRecordStore;
pub use keys::KeySpace;
#[cfg(feature = "redis")]
pub use self::redis::RedisRecordStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Record store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
    #[error("operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
    #[error("record codec error: {0}")]
    Codec(String),
}

/// One store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Set a string value with a TTL.
    SetEx {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    Get {
        key: String,
    },
    Del {
        key: String,
    },
    /// Append to the list tail.
    RPush {
        key: String,
        value: String,
    },
    /// Remove the first occurrence of `value` from the list.
    LRem {
        key: String,
        value: String,
    },
    LLen {
        key: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    SMembers {
        key: String,
    },
    SCard {
        key: String,
    },
    ZAdd {
        key: String,
        score: i64,
        member: String,
    },
    ZRem {
        key: String,
        member: String,
    },
    /// Remove members whose score lies in `[min, max]`.
    ZRemRangeByScore {
        key: String,
        min: i64,
        max: i64,
    },
    ZCard {
        key: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Shape of the reply an operation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Done,
    Int,
    Value,
    Members,
}

impl StoreOp {
    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            StoreOp::SetEx { .. } => ReplyKind::Done,
            StoreOp::Get { .. } => ReplyKind::Value,
            StoreOp::SMembers { .. } => ReplyKind::Members,
            StoreOp::Del { .. }
            | StoreOp::RPush { .. }
            | StoreOp::LRem { .. }
            | StoreOp::LLen { .. }
            | StoreOp::SAdd { .. }
            | StoreOp::SRem { .. }
            | StoreOp::SCard { .. }
            | StoreOp::ZAdd { .. }
            | StoreOp::ZRem { .. }
            | StoreOp::ZRemRangeByScore { .. }
            | StoreOp::ZCard { .. }
            | StoreOp::Expire { .. } => ReplyKind::Int,
        }
    }
}

/// Reply to one [`StoreOp`], positionally matched to the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    Done,
    Int(i64),
    Value(Option<Vec<u8>>),
    Members(Vec<String>),
}

impl StoreReply {
    pub fn into_int(self) -> StoreResult<i64> {
        match self {
            StoreReply::Int(n) => Ok(n),
            other => Err(StoreError::UnexpectedReply(format!("expected integer, got {other:?}"))),
        }
    }

    pub fn into_value(self) -> StoreResult<Option<Vec<u8>>> {
        match self {
            StoreReply::Value(v) => Ok(v),
            other => Err(StoreError::UnexpectedReply(format!("expected value, got {other:?}"))),
        }
    }

    pub fn into_members(self) -> StoreResult<Vec<String>> {
        match self {
            StoreReply::Members(m) => Ok(m),
            other => Err(StoreError::UnexpectedReply(format!("expected members, got {other:?}"))),
        }
    }
}

/// Ordered group of operations applied as one atomic unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<StoreOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(op: StoreOp) -> Self {
        Self { ops: vec![op] }
    }

    pub fn push(mut self, op: StoreOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn set_ex(self, key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        self.push(StoreOp::SetEx {
            key: key.into(),
            value,
            ttl,
        })
    }

    pub fn rpush(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(StoreOp::RPush {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn zadd(self, key: impl Into<String>, score: i64, member: impl Into<String>) -> Self {
        self.push(StoreOp::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        })
    }

    pub fn zrem_range_by_score(self, key: impl Into<String>, min: i64, max: i64) -> Self {
        self.push(StoreOp::ZRemRangeByScore {
            key: key.into(),
            min,
            max,
        })
    }

    pub fn zcard(self, key: impl Into<String>) -> Self {
        self.push(StoreOp::ZCard { key: key.into() })
    }

    pub fn expire(self, key: impl Into<String>, ttl: Duration) -> Self {
        self.push(StoreOp::Expire {
            key: key.into(),
            ttl,
        })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Apply every operation of `batch` atomically, returning one reply per op.
    async fn execute(&self, batch: Batch) -> StoreResult<Vec<StoreReply>>;

    /// Pop the head of list `key`, waiting up to `timeout` for an element.
    async fn blpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>>;

    async fn single(&self, op: StoreOp) -> StoreResult<StoreReply> {
        self.execute(Batch::of(op))
            .await?
            .pop()
            .ok_or_else(|| StoreError::UnexpectedReply("empty reply to single operation".into()))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.single(StoreOp::Get { key: key.to_string() })
            .await?
            .into_value()
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        self.single(StoreOp::SetEx {
            key: key.to_string(),
            value,
            ttl,
        })
        .await
        .map(|_| ())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let removed = self
            .single(StoreOp::Del { key: key.to_string() })
            .await?
            .into_int()?;
        Ok(removed > 0)
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<i64> {
        self.single(StoreOp::LRem {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await?
        .into_int()
    }

    async fn llen(&self, key: &str) -> StoreResult<i64> {
        self.single(StoreOp::LLen { key: key.to_string() })
            .await?
            .into_int()
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let added = self
            .single(StoreOp::SAdd {
                key: key.to_string(),
                member: member.to_string(),
            })
            .await?
            .into_int()?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed = self
            .single(StoreOp::SRem {
                key: key.to_string(),
                member: member.to_string(),
            })
            .await?
            .into_int()?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.single(StoreOp::SMembers { key: key.to_string() })
            .await?
            .into_members()
    }

    async fn scard(&self, key: &str) -> StoreResult<i64> {
        self.single(StoreOp::SCard { key: key.to_string() })
            .await?
            .into_int()
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed = self
            .single(StoreOp::ZRem {
                key: key.to_string(),
                member: member.to_string(),
            })
            .await?
            .into_int()?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> StoreResult<i64> {
        self.single(StoreOp::ZCard { key: key.to_string() })
            .await?
            .into_int()
    }
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    async fn execute(&self, batch: Batch) -> StoreResult<Vec<StoreReply>> {
        (**self).execute(batch).await
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        (**self).blpop(key, timeout).await
    }
}

/// Serialize a record for storage.
pub fn encode_json<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Deserialize a stored record.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}
