//! Background monitor: heartbeat refresh and orphan garbage collection.
//! Runs on its own OS thread so a slow KV round trip never contends with
//! the reactor's request-handling fibers.

use std::sync::Arc;
use std::time::Duration;

use dispatcher_common::clock::Clock;
use tracing::warn;

use crate::lifecycle::{LifecycleManager, State};
use crate::registry::InflightRegistry;
use crate::tasks_state::TasksState;

const LOOP_SLEEP: Duration = Duration::from_millis(100);

pub struct MonitorConfig {
    pub heartbeat_interval: Duration,
    pub orphan_threshold: Duration,
}

pub struct Monitor {
    config: MonitorConfig,
    registry: Arc<InflightRegistry>,
    lifecycle: Arc<LifecycleManager>,
    tasks: Arc<TasksState>,
    clock: Arc<dyn Clock>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, registry: Arc<InflightRegistry>, lifecycle: Arc<LifecycleManager>, tasks: Arc<TasksState>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            registry,
            lifecycle,
            tasks,
            clock,
        }
    }

    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("async-http-monitor".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build monitor runtime");
                runtime.block_on(self.run());
            })
            .expect("failed to spawn monitor thread")
    }

    async fn run(self) {
        let mut last_heartbeat = self.clock.now();
        let mut last_gc_attempt = self.clock.now();

        loop {
            match self.lifecycle.state() {
                State::Running | State::Draining => {}
                _ => break,
            }

            if last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                let ids = self.tasks.inflight_ids();
                if !ids.is_empty() {
                    if let Err(e) = self.registry.update_heartbeats(&ids, self.clock.now_ms()).await {
                        warn!("failed to refresh heartbeats: {e}");
                    }
                }
                last_heartbeat = self.clock.now();
            }

            if last_gc_attempt.elapsed() >= self.config.heartbeat_interval {
                match self.registry.acquire_gc_lock(self.config.heartbeat_interval).await {
                    Ok(true) => {
                        if let Err(e) = self.registry.cleanup_orphans(self.config.orphan_threshold, self.clock.now_ms()).await {
                            warn!("orphan cleanup failed: {e}");
                        }
                        if let Err(e) = self.registry.release_gc_lock().await {
                            warn!("failed to release gc lock: {e}");
                        }
                    }
                    Ok(false) => {} // another process holds the lock
                    Err(e) => warn!("failed to acquire gc lock: {e}"),
                }
                last_gc_attempt = self.clock.now();
            }

            tokio::time::sleep(LOOP_SLEEP).await;
        }
    }
}
