//! `InflightRegistry`: the KV-backed crash-recovery index for in-flight
//! tasks. Native KV primitives only — no server-side scripting — keeps this
//! portable and test-doublable; the optimistic re-read after
//! `ZRANGEBYSCORE` eliminates the race with a concurrent heartbeat, and the
//! GC lock serializes cleanup across processes so the non-atomic
//! read-then-delete sequence is safe.

use std::sync::Arc;
use std::time::Duration;

use dispatcher_common::job_queue::{JobPayload, JobQueue};
use dispatcher_common::kv::Kv;
use tracing::{info, warn};

const INFLIGHT_INDEX_KEY: &str = "async_http:inflight_index";
const INFLIGHT_JOBS_KEY: &str = "async_http:inflight_jobs";
const GC_LOCK_KEY: &str = "async_http:gc_lock";

const MIN_TTL: Duration = Duration::from_secs(3600);
const MIN_GC_LOCK_TTL: Duration = Duration::from_secs(120);

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("kv error: {0}")]
    Kv(#[from] dispatcher_common::kv::KvError),
}

pub struct InflightRegistry {
    kv: Arc<dyn Kv>,
    job_queue: Arc<dyn JobQueue>,
    process_id: String,
    gc_token: String,
}

impl InflightRegistry {
    pub fn new(kv: Arc<dyn Kv>, job_queue: Arc<dyn JobQueue>, process_id: impl Into<String>) -> Self {
        Self {
            kv,
            job_queue,
            process_id: process_id.into(),
            gc_token: uuid::Uuid::now_v7().to_string(),
        }
    }

    fn member(&self, task_id: &str) -> String {
        format!("{}:{}", self.process_id, task_id)
    }

    pub async fn register(&self, task_id: &str, now_ms: i64, job_payload: &JobPayload, orphan_threshold: Duration) -> Result<(), RegistryError> {
        let member = self.member(task_id);
        let serialized = serde_json::to_string(job_payload).expect("JobPayload always serializes");
        let ttl = (orphan_threshold * 3).max(MIN_TTL);

        self.kv.zadd(INFLIGHT_INDEX_KEY, &member, now_ms).await?;
        self.kv.hset(INFLIGHT_JOBS_KEY, &member, &serialized).await?;
        self.kv.expire(INFLIGHT_INDEX_KEY, ttl).await?;
        self.kv.expire(INFLIGHT_JOBS_KEY, ttl).await?;
        Ok(())
    }

    pub async fn update_heartbeats(&self, task_ids: &[String], now_ms: i64) -> Result<(), RegistryError> {
        let entries: Vec<(String, i64)> = task_ids.iter().map(|id| (self.member(id), now_ms)).collect();
        self.kv.zadd_many(INFLIGHT_INDEX_KEY, &entries).await?;
        Ok(())
    }

    pub async fn unregister(&self, task_id: &str) -> Result<(), RegistryError> {
        let member = self.member(task_id);
        self.kv.zrem(INFLIGHT_INDEX_KEY, &member).await?;
        self.kv.hdel(INFLIGHT_JOBS_KEY, &member).await?;
        Ok(())
    }

    /// Remove every KV-backed entry owned by this process (member prefix
    /// `"<process_id>:"`), called by `Dispatcher::stop` as part of "cleanup
    /// for process-specific KV keys" (distilled spec §4.8). Without this,
    /// entries for tasks stranded at shutdown would linger in
    /// `inflight_index`/`inflight_jobs` until their TTL, and a live process's
    /// later `cleanup_orphans` pass would re-`Push` the same payload that
    /// `TaskHandler::retry` already re-enqueued here — violating the
    /// exactly-once retry/callback invariant (§8).
    pub async fn cleanup_process_entries(&self) -> Result<u64, RegistryError> {
        let prefix = format!("{}:", self.process_id);
        let members = self.kv.zrangebyscore(INFLIGHT_INDEX_KEY, i64::MIN, i64::MAX).await?;

        let mut removed = 0u64;
        for member in members {
            if !member.starts_with(&prefix) {
                continue;
            }
            self.kv.zrem(INFLIGHT_INDEX_KEY, &member).await?;
            self.kv.hdel(INFLIGHT_JOBS_KEY, &member).await?;
            removed += 1;
        }

        if removed > 0 {
            info!("removed {removed} process-owned inflight entries during shutdown");
        }
        Ok(removed)
    }

    pub async fn acquire_gc_lock(&self, heartbeat_interval: Duration) -> Result<bool, RegistryError> {
        let ttl = (heartbeat_interval * 2).max(MIN_GC_LOCK_TTL);
        Ok(self.kv.set_nx_ex(GC_LOCK_KEY, &self.gc_token, ttl).await?)
    }

    pub async fn release_gc_lock(&self) -> Result<bool, RegistryError> {
        Ok(self.kv.delete_if_value_eq(GC_LOCK_KEY, &self.gc_token).await?)
    }

    /// Must be called only while holding the GC lock. Returns the count of
    /// entries re-enqueued.
    pub async fn cleanup_orphans(&self, orphan_threshold: Duration, now_ms: i64) -> Result<u64, RegistryError> {
        let cutoff = now_ms - orphan_threshold.as_millis() as i64;
        let candidates = self.kv.zrangebyscore(INFLIGHT_INDEX_KEY, i64::MIN, cutoff).await?;

        let mut cleaned = 0u64;
        for member in candidates {
            // Optimistic re-read: if the score has been refreshed past the
            // cutoff by a concurrent heartbeat, skip this candidate.
            match self.kv.zscore(INFLIGHT_INDEX_KEY, &member).await? {
                Some(score) if score >= cutoff => continue,
                None => continue,
                _ => {}
            }

            let Some(serialized) = self.kv.hget(INFLIGHT_JOBS_KEY, &member).await? else {
                self.kv.zrem(INFLIGHT_INDEX_KEY, &member).await?;
                continue;
            };

            let payload: JobPayload = match serde_json::from_str(&serialized) {
                Ok(p) => p,
                Err(e) => {
                    warn!("orphan cleanup: malformed job payload for {member}: {e}");
                    continue;
                }
            };

            match self.job_queue.push(payload).await {
                Ok(_) => {
                    self.kv.zrem(INFLIGHT_INDEX_KEY, &member).await?;
                    self.kv.hdel(INFLIGHT_JOBS_KEY, &member).await?;
                    cleaned += 1;
                }
                Err(e) => {
                    warn!("orphan cleanup: failed to re-enqueue {member}: {e}");
                }
            }
        }

        if cleaned > 0 {
            info!("orphan cleanup re-enqueued {cleaned} task(s)");
        }
        Ok(cleaned)
    }
}
