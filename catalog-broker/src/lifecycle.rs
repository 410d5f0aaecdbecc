use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::BrokerError;

/// Fraction of the shutdown budget spent waiting on in-flight tasks.
const DRAIN_SHARE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

/// Adapter state machine `Stopped -> [Starting ->] Running -> ShuttingDown -> Stopped`
/// together with the shutdown signal observed by consume streams.
pub struct Lifecycle {
    state: Mutex<AdapterState>,
    shutdown: Mutex<CancellationToken>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        Self {
            state: Mutex::new(AdapterState::Stopped),
            shutdown: Mutex::new(shutdown),
        }
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    /// Claims the `Stopped -> Starting` transition. Only one caller wins; it
    /// must follow up with `mark_running` or `abort_start`.
    pub fn begin_start(&self) -> bool {
        let mut state = self.state.lock();
        if *state != AdapterState::Stopped {
            return false;
        }
        *state = AdapterState::Starting;
        true
    }

    pub fn abort_start(&self) {
        let mut state = self.state.lock();
        if *state == AdapterState::Starting {
            *state = AdapterState::Stopped;
        }
    }

    /// Moves to `Running` with a fresh shutdown signal. Returns false when the
    /// adapter was neither stopped nor starting.
    pub fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, AdapterState::Stopped | AdapterState::Starting) {
            return false;
        }
        *self.shutdown.lock() = CancellationToken::new();
        *state = AdapterState::Running;
        true
    }

    /// Moves to `ShuttingDown` and fires the shutdown signal. Returns false when
    /// the adapter was not running.
    pub fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if *state != AdapterState::Running {
            return false;
        }
        *state = AdapterState::ShuttingDown;
        self.shutdown.lock().cancel();
        true
    }

    pub fn mark_stopped(&self) {
        *self.state.lock() = AdapterState::Stopped;
    }

    pub fn is_running(&self) -> bool {
        self.state() == AdapterState::Running && !self.shutdown.lock().is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().clone()
    }

    /// Rejects operations that need a live adapter.
    pub fn ensure_running(&self, operation: &'static str) -> Result<(), BrokerError> {
        match self.state() {
            AdapterState::Running => Ok(()),
            AdapterState::ShuttingDown => Err(BrokerError::ShuttingDown(operation)),
            AdapterState::Stopped | AdapterState::Starting => Err(BrokerError::NotRunning),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits one total shutdown timeout across the shutdown phases. Draining
/// in-flight work gets 80%; the consumer stop gets half of what is left after
/// draining, and the producer flush gets half of what is left after that.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownBudget {
    started: Instant,
    total: Duration,
}

impl ShutdownBudget {
    pub fn start(total: Duration) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    pub fn drain_limit(&self) -> Duration {
        self.total.mul_f64(DRAIN_SHARE)
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.started.elapsed())
    }

    pub fn consumer_limit(&self) -> Duration {
        self.remaining() / 2
    }

    pub fn producer_limit(&self) -> Duration {
        self.remaining() / 2
    }
}
