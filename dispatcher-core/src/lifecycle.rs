//! `LifecycleManager`: the dispatcher's state machine. A compact, testable
//! state machine is required because enqueue admission, shutdown
//! choreography, and restart safety all branch on state; atomic reads
//! without coarse locking would leave an observable race between
//! "draining" and "stop" acceptance checks.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Draining,
    Stopping,
}

#[derive(thiserror::Error, Debug)]
#[error("cannot transition from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: State,
    pub to: State,
}

pub struct LifecycleManager {
    state: Mutex<State>,
    reactor_ready_tx: watch::Sender<bool>,
    reactor_ready_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

const POLL_GRANULARITY: Duration = Duration::from_millis(1);

impl LifecycleManager {
    pub fn new() -> Self {
        let (reactor_ready_tx, reactor_ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            state: Mutex::new(State::Stopped),
            reactor_ready_tx,
            reactor_ready_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().expect("poisoned mutex")
    }

    /// `stopped/draining → starting`. Idempotent if already running or starting.
    pub fn start(&self) -> Result<(), TransitionError> {
        let mut state = self.state.lock().expect("poisoned mutex");
        match *state {
            State::Running | State::Starting => Ok(()),
            State::Stopped | State::Draining => {
                *state = State::Starting;
                let _ = self.reactor_ready_tx.send(false);
                let _ = self.shutdown_tx.send(false);
                Ok(())
            }
            State::Stopping => Err(TransitionError {
                from: *state,
                to: State::Starting,
            }),
        }
    }

    /// Invoked by the reactor once it is ready to accept work. Unconditional.
    pub fn mark_running(&self) {
        let mut state = self.state.lock().expect("poisoned mutex");
        *state = State::Running;
        let _ = self.reactor_ready_tx.send(true);
    }

    pub fn drain(&self) -> Result<(), TransitionError> {
        let mut state = self.state.lock().expect("poisoned mutex");
        if *state == State::Draining {
            return Ok(());
        }
        if *state != State::Running {
            return Err(TransitionError {
                from: *state,
                to: State::Draining,
            });
        }
        *state = State::Draining;
        Ok(())
    }

    /// Any non-terminal state transitions to `stopping`. Idempotent.
    pub fn begin_stop(&self) {
        let mut state = self.state.lock().expect("poisoned mutex");
        if *state == State::Stopping || *state == State::Stopped {
            return;
        }
        *state = State::Stopping;
        let _ = self.shutdown_tx.send(true);
    }

    pub fn mark_stopped(&self) {
        let mut state = self.state.lock().expect("poisoned mutex");
        *state = State::Stopped;
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    pub fn accepts_enqueue(&self) -> bool {
        self.state() == State::Running
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub async fn wait_for_reactor_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.reactor_ready_rx.clone();
        let deadline = Instant::now() + timeout;
        loop {
            if *rx.borrow() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining.min(POLL_GRANULARITY.max(remaining)), rx.changed())
                .await
                .is_err()
            {
                continue;
            }
        }
    }

    /// Bounded-wait predicate, fixed ~1ms poll granularity.
    pub async fn wait_until(&self, timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate() {
                return true;
            }
            if Instant::now() >= deadline {
                return predicate();
            }
            tokio::time::sleep(POLL_GRANULARITY).await;
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_from_stopped() {
        let lm = LifecycleManager::new();
        lm.start().unwrap();
        assert_eq!(lm.state(), State::Starting);
        lm.mark_running();
        assert_eq!(lm.state(), State::Running);
    }

    #[test]
    fn start_is_idempotent_when_already_running() {
        let lm = LifecycleManager::new();
        lm.start().unwrap();
        lm.mark_running();
        lm.start().unwrap();
        assert_eq!(lm.state(), State::Running);
    }

    #[test]
    fn drain_requires_running() {
        let lm = LifecycleManager::new();
        assert!(lm.drain().is_err());
        lm.start().unwrap();
        assert!(lm.drain().is_err()); // still starting
        lm.mark_running();
        lm.drain().unwrap();
        assert_eq!(lm.state(), State::Draining);
    }

    #[test]
    fn drain_is_idempotent() {
        let lm = LifecycleManager::new();
        lm.start().unwrap();
        lm.mark_running();
        lm.drain().unwrap();
        lm.drain().unwrap();
        assert_eq!(lm.state(), State::Draining);
    }

    #[test]
    fn begin_stop_from_any_nonterminal_state() {
        let lm = LifecycleManager::new();
        lm.start().unwrap();
        lm.begin_stop();
        assert_eq!(lm.state(), State::Stopping);
        assert!(lm.shutdown_requested());
    }

    #[test]
    fn cannot_start_while_stopping() {
        let lm = LifecycleManager::new();
        lm.start().unwrap();
        lm.begin_stop();
        assert!(lm.start().is_err());
    }

    #[tokio::test]
    async fn wait_for_reactor_ready_resolves_once_marked() {
        let lm = std::sync::Arc::new(LifecycleManager::new());
        lm.start().unwrap();
        let waiter = lm.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_reactor_ready(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        lm.mark_running();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_reactor_ready_times_out() {
        let lm = LifecycleManager::new();
        lm.start().unwrap();
        assert!(!lm.wait_for_reactor_ready(Duration::from_millis(20)).await);
    }
}
