//! `SynchronousExecutor`: runs a single task inline on the caller's task,
//! bypassing the reactor queue and `InflightRegistry` entirely (distilled
//! spec §4.11). Intended for call sites that already run on their own
//! dedicated worker and only need the same request-building and
//! redirect-following semantics the reactor uses, without crash-recovery
//! bookkeeping for a task that isn't actually handed off.

use std::sync::Arc;
use std::time::Duration;

use dispatcher_common::task::RequestTask;

use crate::pool::HttpClientPool;
use crate::reactor::{drive_request, ReactorConfig};

pub struct SynchronousExecutor {
    config: ReactorConfig,
    pool: Arc<HttpClientPool>,
}

impl SynchronousExecutor {
    pub fn new(
        max_connections: usize,
        request_timeout: Duration,
        max_response_size: usize,
        user_agent: Option<String>,
        raise_error_responses: bool,
        orphan_threshold: Duration,
        pool: Arc<HttpClientPool>,
    ) -> Self {
        Self {
            config: ReactorConfig {
                max_connections,
                request_timeout,
                max_response_size,
                user_agent,
                raise_error_responses,
                orphan_threshold,
            },
            pool,
        }
    }

    /// Drives `task` to a terminal outcome and invokes its `TaskHandler`,
    /// exactly as the reactor would, but without registering it in the
    /// crash-recovery index and without going through the reactor's channel.
    pub async fn execute(&self, mut task: RequestTask) {
        task.started();
        let outcome = drive_request(&self.config, &self.pool, &mut task).await;
        match outcome {
            Ok(crate::reactor::Outcome::Completed(response)) => task.completed(response).await,
            Ok(crate::reactor::Outcome::Errored(error_value)) => task.errored(error_value).await,
            Err(transport_error) => task.errored_transport(&transport_error).await,
        }
    }
}
