//! Redis Streams adapter.
//!
//! | operation      | command                                   |
//! |----------------|-------------------------------------------|
//! | `append`       | `XADD key * message <envelope>`           |
//! | `ensure_group` | `XGROUP CREATE key group 0 MKSTREAM`      |
//! | `read_group`   | `XREADGROUP GROUP g c COUNT n BLOCK ms >` |
//! | `acknowledge`  | `XACK key group id`                       |
//! | `read_backlog` | `XREADGROUP GROUP g c COUNT n <after>`    |
//! | `claim_stale`  | `XAUTOCLAIM key group c min-idle cursor`  |
//! | `pending`      | `XPENDING key group - + n`                |
//!
//! Redis serves one connection's commands in order, so a blocked
//! `XREADGROUP` holds back everything queued behind it on that connection.
//! Give each consumer loop its own [`RedisLogStore`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamPendingCountReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, ErrorKind, RedisError};
use tracing::{debug, info};

use crate::dedupe::DedupeStore;
use crate::error::StoreError;
use crate::store::{
    ClaimBatch, GroupStatus, LogStore, PendingEntry, SequenceId, StartPosition, StreamEntry,
};

/// Stream field holding the encoded envelope.
pub const MESSAGE_FIELD: &str = "message";

/// [`LogStore`] and [`DedupeStore`] backed by Redis.
#[derive(Clone)]
pub struct RedisLogStore {
    conn: ConnectionManager,
}

impl RedisLogStore {
    /// Connect to `url` (for example `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(classify)?;
        let conn = ConnectionManager::new(client).await.map_err(classify)?;
        info!(url = %redacted(url), "connected to redis");
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

impl std::fmt::Debug for RedisLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLogStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn append(&self, stream: &str, body: &[u8]) -> Result<SequenceId, StoreError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", &[(MESSAGE_FIELD, body)])
            .await
            .map_err(|e| classify_for(stream, e))?;
        parse_id(stream, &id)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupStatus, StoreError> {
        let mut conn = self.conn.clone();
        let from = match start {
            StartPosition::Beginning => "0",
            StartPosition::Latest => "$",
        };
        let created: Result<(), RedisError> =
            conn.xgroup_create_mkstream(stream, group, from).await;
        match created {
            Ok(()) => Ok(GroupStatus::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupStatus::AlreadyExists),
            Err(e) => Err(classify_for(stream, e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count);
        if !block_timeout.is_zero() {
            // BLOCK 0 waits forever.
            options = options.block((block_timeout.as_millis() as usize).max(1));
        }
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(|e| classify_for(stream, e))?;
        collect_entries(stream, reply, false)
    }

    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        id: SequenceId,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .xack(stream, group, &[id.to_string()])
            .await
            .map_err(|e| classify_for(stream, e))?;
        Ok(removed > 0)
    }

    async fn read_backlog(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: SequenceId,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[after.to_string()], &options)
            .await
            .map_err(|e| classify_for(stream, e))?;
        collect_entries(stream, reply, true)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: SequenceId,
        max_count: usize,
    ) -> Result<ClaimBatch, StoreError> {
        let mut conn = self.conn.clone();
        let options = StreamAutoClaimOptions::default().count(max_count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream,
                group,
                consumer,
                min_idle.as_millis() as u64,
                cursor.to_string(),
                options,
            )
            .await
            .map_err(|e| classify_for(stream, e))?;

        let mut batch = ClaimBatch {
            next_cursor: parse_id(stream, &reply.next_stream_id)?,
            ..Default::default()
        };
        for claimed in &reply.claimed {
            match to_entry(stream, claimed)? {
                Some(entry) => batch.entries.push(entry),
                None => batch.deleted.push(parse_id(stream, &claimed.id)?),
            }
        }
        for id in &reply.deleted_ids {
            batch.deleted.push(parse_id(stream, id)?);
        }
        Ok(batch)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        max_count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", max_count)
            .await
            .map_err(|e| classify_for(stream, e))?;

        reply
            .ids
            .iter()
            .map(|pending| {
                Ok(PendingEntry {
                    id: parse_id(stream, &pending.id)?,
                    consumer: pending.consumer.clone(),
                    idle: Duration::from_millis(pending.last_delivered_ms as u64),
                    delivery_count: pending.times_delivered as u64,
                })
            })
            .collect()
    }
}

#[async_trait]
impl DedupeStore for RedisLogStore {
    async fn is_processed(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(classify)
    }

    async fn mark_processed(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn collect_entries(
    stream: &str,
    reply: Option<StreamReadReply>,
    skip_deleted: bool,
) -> Result<Vec<StreamEntry>, StoreError> {
    let Some(reply) = reply else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for key in reply.keys.iter().filter(|key| key.key == stream) {
        for id in &key.ids {
            match to_entry(stream, id)? {
                Some(entry) => entries.push(entry),
                None if skip_deleted => {
                    debug!(stream, sequence_id = %id.id, "pending entry was deleted from the stream")
                }
                // A delivered entry without fields still goes through the
                // decoder so it is reported as malformed.
                None => entries.push(StreamEntry {
                    id: parse_id(stream, &id.id)?,
                    body: Vec::new(),
                }),
            }
        }
    }
    Ok(entries)
}

/// `None` when the entry no longer has any fields (deleted or trimmed).
fn to_entry(stream: &str, id: &StreamId) -> Result<Option<StreamEntry>, StoreError> {
    if id.map.is_empty() {
        return Ok(None);
    }
    let body = match id.map.get(MESSAGE_FIELD) {
        Some(value) => redis::from_redis_value::<Vec<u8>>(value).unwrap_or_default(),
        None => Vec::new(),
    };
    Ok(Some(StreamEntry {
        id: parse_id(stream, &id.id)?,
        body,
    }))
}

fn parse_id(stream: &str, raw: &str) -> Result<SequenceId, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::unavailable(stream, format!("unexpected entry id {:?}: {}", raw, e)))
}

fn classify(e: RedisError) -> StoreError {
    classify_for("", e)
}

fn classify_for(stream: &str, e: RedisError) -> StoreError {
    if is_transient(&e) {
        StoreError::connection(e.to_string())
    } else {
        StoreError::unavailable(stream, e.to_string())
    }
}

/// Network failures, and server states that clear on their own (a restart
/// loading its dataset, a failover, a resharding cluster).
fn is_transient(e: &RedisError) -> bool {
    e.is_io_error()
        || e.is_connection_refusal()
        || e.is_connection_dropped()
        || e.is_timeout()
        || e.is_cluster_error()
        || matches!(
            e.kind(),
            ErrorKind::BusyLoadingError
                | ErrorKind::TryAgain
                | ErrorKind::MasterDown
                | ErrorKind::ClusterDown
                | ErrorKind::ReadOnly
        )
}

/// Strip credentials from a connection URL before logging it.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}***{}", &url[..scheme + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}
