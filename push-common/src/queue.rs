//! §6: the side key-value store's three work-queue shapes — the immediate list, the delayed
//! sorted set, and the per-job paused list. Grounded on the original system's
//! `util.RedisClient` connection pattern and `worker.ResumeJobWorker`'s RPUSH/RPOP draining of
//! `<jobId>-pausedjobs`, reimplemented against the `redis` crate's async connection manager.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::PushError;
use crate::model::TargetUser;

const IMMEDIATE_LIST: &str = "queue:process_batch_worker";
const SCHEDULE_SET: &str = "schedule";
/// Not part of the external interface in §6 (which only documents the batch queues C5 reads):
/// the trigger list a job creator pushes a `jobId` onto to ask C4 to expand it into batches.
/// This crate doesn't implement job creation, so it owns both ends of this list itself.
const PRODUCE_TRIGGER_LIST: &str = "queue:produce_batches_worker";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue: String,
    pub jid: String,
    pub args: (Uuid, String, Vec<TargetUser>),
    pub at: i64,
}

impl QueueEntry {
    pub fn new(job_id: Uuid, app_name: &str, users: Vec<TargetUser>, at: i64) -> Self {
        Self {
            queue: "process_batch_worker".to_owned(),
            jid: job_id.to_string(),
            args: (job_id, app_name.to_owned(), users),
            at,
        }
    }
}

#[derive(Clone)]
pub struct BatchQueue {
    conn: redis::aio::ConnectionManager,
}

impl BatchQueue {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }

    /// §4.4 step 5, `localized=false, startsAt=0`.
    pub async fn push_immediate(&self, entry: &QueueEntry) -> Result<(), PushError> {
        let payload = serde_json::to_string(entry).map_err(|e| PushError::fatal(e))?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(IMMEDIATE_LIST, payload)
            .await
            .map_err(PushError::transient)
    }

    /// §4.4 step 5, delayed/localized batches: scored by the nanosecond epoch the batch becomes
    /// due.
    pub async fn push_delayed(&self, entry: &QueueEntry, dispatch_at_nanos: i64) -> Result<(), PushError> {
        let payload = serde_json::to_string(entry).map_err(|e| PushError::fatal(e))?;
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(SCHEDULE_SET, payload, dispatch_at_nanos)
            .await
            .map_err(PushError::transient)
    }

    /// Pops every batch due by `now_nanos` off the delayed set and returns them in score order,
    /// removing them atomically so two processor instances never double-pop the same entry.
    pub async fn pop_due(&self, now_nanos: i64, limit: isize) -> Result<Vec<QueueEntry>, PushError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(SCHEDULE_SET)
            .arg("-inf")
            .arg(now_nanos)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(PushError::transient)?;

        if raw.is_empty() {
            return Ok(Vec::new());
        }

        conn.zrem::<_, _, ()>(SCHEDULE_SET, &raw)
            .await
            .map_err(PushError::transient)?;

        let mut entries = Vec::with_capacity(raw.len());
        for s in &raw {
            match serde_json::from_str(s) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!(error = %err, "dropping unparseable schedule entry to dead letter");
                    self.dead_letter(SCHEDULE_SET, s).await?;
                }
            }
        }
        Ok(entries)
    }

    /// §4.7 `pause`: diverts a batch payload that would otherwise be processed.
    pub async fn push_paused(&self, job_id: Uuid, entry: &QueueEntry) -> Result<(), PushError> {
        let payload = serde_json::to_string(entry).map_err(|e| PushError::fatal(e))?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(paused_key(job_id), payload)
            .await
            .map_err(PushError::transient)
    }

    /// §4.7 `resume`: drains the paused list (LIFO via RPOP is acceptable, fairness is not
    /// promised) and hands each entry back to the caller to re-enqueue.
    pub async fn drain_paused(&self, job_id: Uuid) -> Result<Vec<QueueEntry>, PushError> {
        let mut conn = self.conn.clone();
        let mut drained = Vec::new();
        loop {
            let raw: Option<String> = conn
                .rpop(paused_key(job_id), None)
                .await
                .map_err(PushError::transient)?;
            match raw {
                Some(s) => match serde_json::from_str(&s) {
                    Ok(entry) => drained.push(entry),
                    Err(err) => {
                        warn!(error = %err, "dropping unparseable paused entry to dead letter");
                        self.dead_letter(&paused_key(job_id), &s).await?;
                    }
                },
                None => break,
            }
        }
        Ok(drained)
    }

    /// Pushes a job id onto the produce-trigger list (see [`PRODUCE_TRIGGER_LIST`]).
    pub async fn push_produce_trigger(&self, job_id: Uuid) -> Result<(), PushError> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(PRODUCE_TRIGGER_LIST, job_id.to_string())
            .await
            .map_err(PushError::transient)
    }

    /// Blocking pop (up to `timeout_secs`) off the produce-trigger list; returns `None` on
    /// timeout (or when the popped payload was poison and got dead-lettered) so the caller can
    /// loop and recheck shutdown/liveness.
    pub async fn pop_produce_trigger(&self, timeout_secs: f64) -> Result<Option<Uuid>, PushError> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> = conn
            .blpop(PRODUCE_TRIGGER_LIST, timeout_secs)
            .await
            .map_err(PushError::transient)?;
        match result {
            Some((_, raw)) => match Uuid::parse_str(&raw) {
                Ok(job_id) => Ok(Some(job_id)),
                Err(err) => {
                    warn!(error = %err, "dropping unparseable produce-trigger entry to dead letter");
                    self.dead_letter(PRODUCE_TRIGGER_LIST, &raw).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// §7 poison-message handling: after `maxRetries`, move the raw payload to `dead:<queue>`.
    pub async fn dead_letter(&self, queue_name: &str, raw_payload: &str) -> Result<(), PushError> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(format!("dead:{queue_name}"), raw_payload)
            .await
            .map_err(PushError::transient)
    }
}

fn paused_key(job_id: Uuid) -> String {
    format!("{job_id}-pausedjobs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_key_matches_external_interface_shape() {
        let id = Uuid::nil();
        assert_eq!(paused_key(id), "00000000-0000-0000-0000-000000000000-pausedjobs");
    }

    #[test]
    fn queue_entry_serializes_args_as_tuple() {
        let entry = QueueEntry::new(Uuid::nil(), "acme", vec![], 0);
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json["args"].is_array());
        assert_eq!(json["args"].as_array().unwrap().len(), 3);
    }
}
