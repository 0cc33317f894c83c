//! Redis-backed task store.
//!
//! # Key layout
//!
//! - `{prefix}:seq`: counter used to mint task ids (rendered as hex)
//! - `{prefix}:queue`: sorted set, score = priority, member = task id
//!   zero-padded to 16 hex digits so equal priorities pop in push order
//! - `{prefix}:task:{id}`: hash with `id`, `data` (serialized envelope),
//!   `state`, and once finished `error`, `result`, `duration_ms`, `finished_at`
//!
//! # Atomicity
//!
//! Push, pop and cancel each run as a single Lua script, so a concurrent pop
//! never sees a queue entry without its body, and an id leaves the queue at
//! most once.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use super::{
    Backend, BackendError, PoppedTask, ReportStatus, ResultRecord, TaskEnvelope, TaskReport,
};
use crate::config::RedisConfig;
use crate::error::TaskError;

/// Task type recorded when the body holding the real one is unreadable.
const UNKNOWN_TASK_TYPE: &str = "unknown";

/// KEYS: seq, queue. ARGV: task key prefix, priority, body.
const PUSH_SCRIPT: &str = r#"
local seq = redis.call('INCR', KEYS[1])
local id = string.format('%x', seq)
local key = ARGV[1] .. id
redis.call('HSET', key, 'id', id, 'data', ARGV[3], 'state', 'queued')
redis.call('ZADD', KEYS[2], ARGV[2], string.format('%016x', seq))
return id
"#;

/// KEYS: queue. ARGV: task key prefix.
const POP_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
local id = string.format('%x', tonumber(popped[1], 16))
local key = ARGV[1] .. id
local data = redis.call('HGET', key, 'data')
redis.call('HSET', key, 'state', 'popped')
if not data then
  return {id}
end
return {id, data}
"#;

/// KEYS: queue, task key. ARGV: id, ttl seconds, finished_at.
const CANCEL_SCRIPT: &str = r#"
local seq = tonumber(ARGV[1], 16)
if not seq or redis.call('ZREM', KEYS[1], string.format('%016x', seq)) == 0 then
  return 0
end
redis.call('HSET', KEYS[2], 'state', 'canceled', 'error', 'task canceled', 'finished_at', ARGV[3])
redis.call('EXPIRE', KEYS[2], ARGV[2])
return 1
"#;

/// Redis [`Backend`] over a sorted-set priority queue.
pub struct RedisBackend {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    config: RedisConfig,
    seq_key: String,
    queue_key: String,
    task_prefix: String,
    push_script: Script,
    pop_script: Script,
    cancel_script: Script,
}

impl RedisBackend {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::ConnectionFailed` if the connection fails.
    pub async fn connect(config: RedisConfig) -> Result<Self, BackendError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, config))
    }

    /// Creates a backend from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, config: RedisConfig) -> Self {
        let prefix = config.key_prefix.clone();
        Self {
            redis,
            config,
            seq_key: format!("{}:seq", prefix),
            queue_key: format!("{}:queue", prefix),
            task_prefix: format!("{}:task:", prefix),
            push_script: Script::new(PUSH_SCRIPT),
            pop_script: Script::new(POP_SCRIPT),
            cancel_script: Script::new(CANCEL_SCRIPT),
        }
    }

    fn task_key(&self, id: &str) -> String {
        format!("{}{}", self.task_prefix, id)
    }

    fn result_ttl_secs(&self) -> u64 {
        self.config.result_ttl.as_secs().max(1)
    }

    /// Records a popped task whose body cannot be decoded as failed, so the id
    /// does not stay `popped` forever. Returns the error for the caller.
    async fn fail_popped(&self, id: String, reason: String) -> BackendError {
        if let Err(e) = self.report_result(corrupt_report(&id, &reason)).await {
            warn!(task_id = %id, error = %e, "Failed to record undecodable task");
        }
        BackendError::Corrupt { id, reason }
    }

    /// Returns the number of queued tasks.
    pub async fn len(&self) -> Result<usize, BackendError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(&self.queue_key).await?;
        Ok(len)
    }

    pub async fn is_empty(&self) -> Result<bool, BackendError> {
        Ok(self.len().await? == 0)
    }

    /// Deletes every key under the configured prefix.
    ///
    /// **Warning**: This permanently drops queued tasks and stored results.
    pub async fn clear(&self) -> Result<(), BackendError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}:*", self.config.key_prefix);
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                conn.del::<_, ()>(&keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(())
    }

    /// Returns the key prefix.
    pub fn key_prefix(&self) -> &str {
        &self.config.key_prefix
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn push_task(
        &self,
        envelope: TaskEnvelope,
        priority: i64,
    ) -> Result<String, BackendError> {
        let body = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.clone();

        let id: String = self
            .push_script
            .key(&self.seq_key)
            .key(&self.queue_key)
            .arg(&self.task_prefix)
            .arg(priority)
            .arg(body)
            .invoke_async(&mut conn)
            .await?;

        debug!(task_id = %id, task_type = %envelope.task_type, priority, "Pushed task");
        Ok(id)
    }

    async fn pop_task(&self) -> Result<PoppedTask, BackendError> {
        let mut conn = self.redis.clone();

        let popped: Option<Vec<String>> = self
            .pop_script
            .key(&self.queue_key)
            .arg(&self.task_prefix)
            .invoke_async(&mut conn)
            .await?;

        let mut fields = popped.ok_or(BackendError::Empty)?.into_iter();
        let id = fields.next().ok_or(BackendError::Empty)?;
        let Some(body) = fields.next() else {
            return Err(self
                .fail_popped(id, "task hash has no data field".to_string())
                .await);
        };

        match serde_json::from_str::<TaskEnvelope>(&body) {
            Ok(envelope) => Ok(PoppedTask::from_envelope(id, envelope)),
            Err(e) => Err(self.fail_popped(id, format!("bad task body: {}", e)).await),
        }
    }

    async fn cancel_task(&self, id: &str) -> Result<(), BackendError> {
        let mut conn = self.redis.clone();

        let removed: i64 = self
            .cancel_script
            .key(&self.queue_key)
            .key(self.task_key(id))
            .arg(id)
            .arg(self.result_ttl_secs())
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(BackendError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn report_result(&self, report: TaskReport) -> Result<(), BackendError> {
        let record = report.to_record();
        let key = self.task_key(&record.id);

        let mut fields: Vec<(&str, String)> = vec![
            ("state", record.status.to_string()),
            ("type", record.task_type.clone()),
            ("duration_ms", record.duration_ms.to_string()),
            ("finished_at", record.finished_at.to_rfc3339()),
        ];
        if let Some(ref error) = record.error {
            fields.push(("error", error.clone()));
        }
        if let Some(ref result) = record.result {
            fields.push(("result", serde_json::to_string(result)?));
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.result_ttl_secs())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn get_result(&self, id: &str) -> Result<Option<ResultRecord>, BackendError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.task_key(id)).await?;
        parse_result_record(id, &fields)
    }
}

/// Failure report for a popped id whose body could not be decoded.
fn corrupt_report(id: &str, reason: &str) -> TaskReport {
    TaskReport {
        id: id.to_string(),
        task_type: UNKNOWN_TASK_TYPE.to_string(),
        duration: Duration::ZERO,
        outcome: Err(TaskError::msg(reason.to_string())),
    }
}

/// Builds a [`ResultRecord`] from a task hash. Returns `None` while the task
/// is still queued or running.
fn parse_result_record(
    id: &str,
    fields: &HashMap<String, String>,
) -> Result<Option<ResultRecord>, BackendError> {
    let Some(status) = fields
        .get("state")
        .and_then(|s| s.parse::<ReportStatus>().ok())
    else {
        return Ok(None);
    };

    let corrupt = |reason: String| BackendError::Corrupt {
        id: id.to_string(),
        reason,
    };

    let task_type = match fields.get("type") {
        Some(t) => t.clone(),
        None => {
            let body = fields
                .get("data")
                .ok_or_else(|| corrupt("missing data field".to_string()))?;
            serde_json::from_str::<TaskEnvelope>(body)?.task_type
        }
    };

    let result = fields
        .get("result")
        .map(|r| serde_json::from_str(r))
        .transpose()?;

    let duration_ms = match fields.get("duration_ms") {
        Some(d) => d
            .parse()
            .map_err(|_| corrupt(format!("bad duration_ms '{}'", d)))?,
        None => 0,
    };

    let finished_at = match fields.get("finished_at") {
        Some(t) => DateTime::parse_from_rfc3339(t)
            .map_err(|e| corrupt(format!("bad finished_at: {}", e)))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    Ok(Some(ResultRecord {
        id: id.to_string(),
        task_type,
        status,
        error: fields.get("error").cloned(),
        result,
        duration_ms,
        finished_at,
    }))
}
