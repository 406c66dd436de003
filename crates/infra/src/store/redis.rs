//! Redis-backed record store (durable, shared by producers and workers).
//!
//! - **Batches** become `MULTI`/`EXEC` pipelines, so a batch is applied
//!   atomically with respect to every other client
//! - **Regular commands** go through a [`ConnectionManager`] which reconnects
//!   transparently after a dropped connection
//! - **Blocking pops** use a dedicated connection: a `BLPOP` parked on the
//!   shared multiplexed connection would stall every other command queued
//!   behind it

use std::time::Duration;

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::{FromRedisValue, RedisError};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Batch, RecordStore, ReplyKind, StoreError, StoreOp, StoreReply, StoreResult};

pub struct RedisRecordStore {
    client: ::redis::Client,
    conn: ConnectionManager,
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl core::fmt::Debug for RedisRecordStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisRecordStore")
            .field("connection", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

fn map_err(e: RedisError) -> StoreError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

fn decode<T: FromRedisValue>(value: &::redis::Value) -> StoreResult<T> {
    ::redis::from_redis_value(value).map_err(|e| StoreError::UnexpectedReply(e.to_string()))
}

/// Redis `EX` arguments must be at least one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisRecordStore {
    /// Connect to Redis at `redis_url` (e.g. `redis://localhost:6379/0`).
    ///
    /// Fails fast when the server cannot be reached.
    pub async fn connect(redis_url: impl AsRef<str>) -> StoreResult<Self> {
        let client = ::redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client.get_connection_manager().await.map_err(map_err)?;

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(None),
        })
    }

    /// Round-trip a `PING`; used by health checks.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    fn build_pipeline(ops: &[StoreOp]) -> ::redis::Pipeline {
        let mut pipe = ::redis::pipe();
        pipe.atomic();

        for op in ops {
            match op {
                StoreOp::SetEx { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value.as_slice())
                        .arg("EX")
                        .arg(ttl_secs(*ttl));
                }
                StoreOp::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
                StoreOp::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                StoreOp::RPush { key, value } => {
                    pipe.cmd("RPUSH").arg(key).arg(value);
                }
                StoreOp::LRem { key, value } => {
                    pipe.cmd("LREM").arg(key).arg(1).arg(value);
                }
                StoreOp::LLen { key } => {
                    pipe.cmd("LLEN").arg(key);
                }
                StoreOp::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member);
                }
                StoreOp::SRem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member);
                }
                StoreOp::SMembers { key } => {
                    pipe.cmd("SMEMBERS").arg(key);
                }
                StoreOp::SCard { key } => {
                    pipe.cmd("SCARD").arg(key);
                }
                StoreOp::ZAdd { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
                }
                StoreOp::ZRem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member);
                }
                StoreOp::ZRemRangeByScore { key, min, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg(*min).arg(*max);
                }
                StoreOp::ZCard { key } => {
                    pipe.cmd("ZCARD").arg(key);
                }
                StoreOp::Expire { key, ttl } => {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(*ttl));
                }
            }
        }

        pipe
    }

    async fn blocking_connection(
        &self,
        slot: &mut Option<MultiplexedConnection>,
    ) -> StoreResult<MultiplexedConnection> {
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_err)?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn execute(&self, batch: Batch) -> StoreResult<Vec<StoreReply>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let pipe = Self::build_pipeline(batch.ops());
        let mut conn = self.conn.clone();
        let values: Vec<::redis::Value> = pipe.query_async(&mut conn).await.map_err(map_err)?;

        if values.len() != batch.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                batch.len(),
                values.len()
            )));
        }

        batch
            .ops()
            .iter()
            .zip(values.iter())
            .map(|(op, value)| match op.reply_kind() {
                ReplyKind::Done => Ok(StoreReply::Done),
                ReplyKind::Int => decode::<i64>(value).map(StoreReply::Int),
                ReplyKind::Value => decode::<Option<Vec<u8>>>(value).map(StoreReply::Value),
                ReplyKind::Members => decode::<Vec<String>>(value).map(StoreReply::Members),
            })
            .collect()
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let mut slot = self.blocking.lock().await;
        let mut conn = self.blocking_connection(&mut slot).await?;

        let popped: Result<Option<(String, String)>, RedisError> = ::redis::cmd("BLPOP")
            .arg(key)
            .arg(ttl_secs(timeout))
            .query_async(&mut conn)
            .await;

        match popped {
            Ok(reply) => Ok(reply.map(|(_, value)| value)),
            Err(e) => {
                // Drop the broken connection; the next call reconnects.
                *slot = None;
                Err(map_err(e))
            }
        }
    }
}
