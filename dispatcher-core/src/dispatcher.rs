//! `Dispatcher`: the public facade. Owns the lifecycle state machine, the
//! pending/inflight bookkeeping, and the channel the reactor consumes from.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dispatcher_common::clock::Clock;
use dispatcher_common::config::Config;
use dispatcher_common::job_queue::JobQueue;
use dispatcher_common::kv::Kv;
use dispatcher_common::task::RequestTask;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::DispatcherError;
use crate::lifecycle::LifecycleManager;
use crate::monitor::{Monitor, MonitorConfig};
use crate::pool::HttpClientPool;
use crate::reactor::{Reactor, ReactorConfig};
use crate::registry::InflightRegistry;
use crate::tasks_state::TasksState;

const START_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_WAIT: Duration = Duration::from_secs(1);

struct Handles {
    reactor_tx: mpsc::UnboundedSender<RequestTask>,
    reactor_thread: std::thread::JoinHandle<()>,
    monitor_thread: std::thread::JoinHandle<()>,
}

pub struct Dispatcher {
    config: Config,
    lifecycle: Arc<LifecycleManager>,
    tasks: Arc<TasksState>,
    pool: Arc<HttpClientPool>,
    registry: Arc<InflightRegistry>,
    clock: Arc<dyn Clock>,
    handles: Mutex<Option<Handles>>,
}

impl Dispatcher {
    pub fn new(config: Config, kv: Arc<dyn Kv>, job_queue: Arc<dyn JobQueue>, clock: Arc<dyn Clock>, process_id: impl Into<String>) -> Self {
        let process_id = process_id.into();
        let pool = Arc::new(HttpClientPool::new(
            config.connection_pool_size,
            config.connection_timeout.map(|d| d.get()),
            config.proxy_url.clone(),
            config.user_agent.clone(),
        ));
        let registry = Arc::new(InflightRegistry::new(kv, job_queue, process_id));

        Self {
            config,
            lifecycle: Arc::new(LifecycleManager::new()),
            tasks: Arc::new(TasksState::new()),
            pool,
            registry,
            clock,
            handles: Mutex::new(None),
        }
    }

    pub fn state(&self) -> crate::lifecycle::State {
        self.lifecycle.state()
    }

    /// Idempotent if already running.
    pub async fn start(&self) -> Result<(), DispatcherError> {
        if self.lifecycle.state() == crate::lifecycle::State::Running {
            return Ok(());
        }
        self.lifecycle.start().map_err(|_| DispatcherError::NotRunning)?;

        let reactor_config = ReactorConfig {
            max_connections: self.config.max_connections,
            request_timeout: self.config.request_timeout.get(),
            max_response_size: self.config.max_response_size,
            user_agent: self.config.user_agent.clone(),
            raise_error_responses: self.config.raise_error_responses,
            orphan_threshold: self.config.orphan_threshold.get(),
        };
        let reactor = Reactor::new(
            reactor_config,
            self.pool.clone(),
            self.registry.clone(),
            self.lifecycle.clone(),
            self.tasks.clone(),
            self.clock.clone(),
        );
        let (reactor_tx, reactor_thread) = reactor.spawn();

        let monitor = Monitor::new(
            MonitorConfig {
                heartbeat_interval: self.config.heartbeat_interval.get(),
                orphan_threshold: self.config.orphan_threshold.get(),
            },
            self.registry.clone(),
            self.lifecycle.clone(),
            self.tasks.clone(),
            self.clock.clone(),
        );
        let monitor_thread = monitor.spawn();

        if !self.lifecycle.wait_for_reactor_ready(START_WAIT_TIMEOUT).await {
            warn!("reactor did not signal ready within {START_WAIT_TIMEOUT:?}");
        }

        *self.handles.lock().expect("poisoned mutex") = Some(Handles {
            reactor_tx,
            reactor_thread,
            monitor_thread,
        });

        Ok(())
    }

    pub fn drain(&self) -> Result<(), DispatcherError> {
        self.lifecycle.drain().map_err(|_| DispatcherError::NotRunning)
    }

    pub fn enqueue(&self, mut task: RequestTask) -> Result<(), DispatcherError> {
        if !self.lifecycle.accepts_enqueue() {
            return Err(DispatcherError::NotRunning);
        }
        if self.tasks.inflight_count() >= self.config.max_connections {
            metrics::counter!("async_http_refused").increment(1);
            return Err(DispatcherError::Refused);
        }

        task.enqueued();
        let handles = self.handles.lock().expect("poisoned mutex");
        let Some(handles) = handles.as_ref() else {
            return Err(DispatcherError::NotRunning);
        };
        handles.reactor_tx.send(task).map_err(|_| DispatcherError::NotRunning)?;
        Ok(())
    }

    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.lifecycle.wait_until(timeout, || self.tasks.is_idle()).await
    }

    pub async fn wait_for_processing(&self, timeout: Duration) -> bool {
        self.lifecycle.wait_until(timeout, || !self.tasks.is_idle()).await
    }

    /// Poll for idle, then snapshot and clear `pending ∪ inflight`, clean up
    /// this process's own KV-backed inflight entries, retry each stranded
    /// task via its `TaskHandler`, then join the reactor and monitor
    /// threads.
    pub async fn stop(&self, timeout: Duration) {
        self.lifecycle.begin_stop();
        let _ = self.lifecycle.wait_until(timeout, || self.tasks.is_idle()).await;

        let stranded = self.tasks.drain_for_shutdown();
        self.lifecycle.mark_stopped();

        // Remove this process's own `inflight_index`/`inflight_jobs`
        // members before retrying: otherwise they'd linger until TTL and a
        // live process's later orphan GC would re-`Push` the same payload
        // `TaskHandler::retry` is about to re-enqueue below, violating the
        // exactly-once retry/callback invariant.
        if let Err(e) = self.registry.cleanup_process_entries().await {
            warn!("failed to clean up process-owned inflight entries during shutdown: {e}");
        }

        for handler in stranded {
            handler.retry().await;
        }

        if let Some(handles) = self.handles.lock().expect("poisoned mutex").take() {
            drop(handles.reactor_tx);
            join_with_budget(handles.reactor_thread, "reactor", JOIN_WAIT);
            join_with_budget(handles.monitor_thread, "monitor", JOIN_WAIT);
        }

        info!("dispatcher stopped");
    }
}

/// std threads cannot be forcibly killed in safe Rust; `join` blocks until
/// the thread actually exits. `budget` documents the intended bound even
/// though Rust has no safe equivalent to a hard thread kill.
fn join_with_budget(handle: std::thread::JoinHandle<()>, name: &str, _budget: Duration) {
    if handle.join().is_err() {
        error!("{name} thread panicked during shutdown");
    }
}
