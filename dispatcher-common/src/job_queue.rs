//! `JobQueue`: the host job system collaborator. The enqueue API and job
//! hash shape belong to the host process, so this module only defines the
//! narrow interface the dispatcher depends on, plus an in-memory fake used
//! by tests and a logging placeholder used by the standalone binary.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum JobQueueError {
    #[error("job queue push failed: {0}")]
    PushFailed(String),
}

/// A job payload as understood by the host job system: an opaque class name,
/// a job id, and a JSON argument array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    pub class: String,
    pub jid: String,
    pub args: Vec<serde_json::Value>,
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Push a job payload, returning its assigned job id.
    async fn push(&self, job: JobPayload) -> Result<String, JobQueueError>;
}

/// A `JobQueue` that logs every push via `tracing` instead of delivering it
/// anywhere. The host job system's actual enqueue API is out of scope for
/// this crate; this stands in for it in `dispatcher-service` so the binary
/// is runnable without a real host integration wired in.
#[derive(Default)]
pub struct LoggingJobQueue;

impl LoggingJobQueue {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl JobQueue for LoggingJobQueue {
    async fn push(&self, job: JobPayload) -> Result<String, JobQueueError> {
        tracing::info!(class = %job.class, jid = %job.jid, "job queue push (no host integration configured)");
        Ok(job.jid)
    }
}

/// An in-memory `JobQueue` fake for tests: records every pushed payload.
#[derive(Default)]
pub struct FakeJobQueue {
    pushed: Mutex<Vec<JobPayload>>,
}

impl FakeJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushed(&self) -> Vec<JobPayload> {
        self.pushed.lock().expect("poisoned mutex").clone()
    }
}

#[async_trait::async_trait]
impl JobQueue for FakeJobQueue {
    async fn push(&self, job: JobPayload) -> Result<String, JobQueueError> {
        let jid = job.jid.clone();
        self.pushed.lock().expect("poisoned mutex").push(job);
        Ok(jid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_records_pushed_jobs() {
        let q = FakeJobQueue::new();
        q.push(JobPayload {
            class: "MyCallback".into(),
            jid: "j-1".into(),
            args: vec![],
        })
        .await
        .unwrap();
        assert_eq!(q.pushed().len(), 1);
        assert_eq!(q.pushed()[0].jid, "j-1");
    }
}
