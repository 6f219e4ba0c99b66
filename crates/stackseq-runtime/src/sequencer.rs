//! Startup sequencer that brings a resolved stack up in dependency order.
//!
//! One supervisor task runs per service. Tasks suspend on the shared
//! [`StateBoard`] until their dependency conditions hold, so services in
//! the same wave start concurrently. Shutdown propagates in reverse
//! dependency order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stackseq_common::config::StackConfig;
use stackseq_common::constants::{DEFAULT_RESTART_DELAY, DEFAULT_STARTUP_TIMEOUT, DEFAULT_STOP_GRACE};
use stackseq_common::error::{Result, StackError};
use stackseq_common::types::{BlockedService, ServiceState};
use stackseq_compose::ResolvedStack;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::backend::ServiceBackend;
use crate::event::EventLog;
use crate::state::StateBoard;
use crate::supervisor::{Supervisor, SupervisorReport};

/// Timing knobs for a sequencer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerConfig {
    /// Deadline for every service to settle.
    pub startup_timeout: Duration,
    /// Default time a service gets to stop before it is killed.
    pub stop_grace: Duration,
    /// Pause before a requeued service starts again.
    pub restart_delay: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

impl From<&StackConfig> for SequencerConfig {
    fn from(config: &StackConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout,
            stop_grace: config.stop_grace,
            restart_delay: config.restart_delay,
        }
    }
}

/// Drives a [`ResolvedStack`] through its startup sequence.
pub struct Sequencer {
    backend: Arc<dyn ServiceBackend>,
    config: SequencerConfig,
    events: EventLog,
}

impl Sequencer {
    /// Creates a sequencer with default timings.
    #[must_use]
    pub fn new(backend: Arc<dyn ServiceBackend>) -> Self {
        Self {
            backend,
            config: SequencerConfig::default(),
            events: EventLog::new(),
        }
    }

    /// Overrides the timings.
    #[must_use]
    pub const fn with_config(mut self, config: SequencerConfig) -> Self {
        self.config = config;
        self
    }

    /// Records events into `events` instead of a private log.
    #[must_use]
    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// Starts every service and waits until each one has settled.
    ///
    /// A service settles once it is healthy (or running without a health
    /// check), or once it has exited cleanly and will not be restarted. A
    /// service that failed to start or exited abnormally for good never
    /// settles and is reported as blocked.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::StartupTimeout`] naming every unsettled
    /// service and the dependencies it was waiting on. The stack is shut
    /// down before the error is returned.
    pub async fn up(&self, stack: Arc<ResolvedStack>) -> Result<RunningStack> {
        tracing::info!(
            backend = self.backend.name(),
            services = stack.order.len(),
            timeout = ?self.config.startup_timeout,
            "starting stack"
        );
        let board = StateBoard::new(stack.order.iter().map(String::as_str), self.events.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for name in &stack.order {
            let Some(writer) = board.writer(name) else {
                continue;
            };
            let supervisor = Supervisor::new(
                name.clone(),
                Arc::clone(&stack),
                Arc::clone(&self.backend),
                Arc::clone(&board),
                writer,
                shutdown_rx.clone(),
                self.config,
            );
            let _ = tasks.spawn(supervisor.run());
        }

        let running = RunningStack {
            stack,
            board,
            shutdown: shutdown_tx,
            tasks,
        };
        match running.settle(self.config.startup_timeout).await {
            Ok(()) => {
                tracing::info!("all services settled");
                Ok(running)
            }
            Err(blocked) => {
                let err = StackError::StartupTimeout {
                    timeout: self.config.startup_timeout,
                    blocked,
                };
                tracing::warn!(error = %err, "startup timed out, shutting down");
                let _ = running.shutdown().await;
                Err(err)
            }
        }
    }
}

/// Summary of an orderly shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Services in the order they reached `stopped` during shutdown.
    pub stopped: Vec<String>,
    /// Services whose stop had to be forced.
    pub forced: Vec<String>,
    /// Restarts performed per service over the whole run.
    pub restarts: BTreeMap<String, u32>,
}

/// A stack whose services are being supervised.
pub struct RunningStack {
    stack: Arc<ResolvedStack>,
    board: Arc<StateBoard>,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<SupervisorReport>,
}

impl RunningStack {
    /// Current state of every service.
    #[must_use]
    pub fn states(&self) -> BTreeMap<String, ServiceState> {
        self.board.snapshot()
    }

    /// Current state of `service`.
    #[must_use]
    pub fn state(&self, service: &str) -> Option<ServiceState> {
        self.board.state(service)
    }

    /// Event log of this run.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        self.board.events()
    }

    fn settled(&self, service: &str) -> bool {
        self.board
            .state(service)
            .is_some_and(ServiceState::is_healthy)
            || self.board.finished_cleanly(service)
    }

    fn blocked(&self) -> Vec<BlockedService> {
        self.stack
            .order
            .iter()
            .filter(|name| !self.settled(name))
            .map(|name| BlockedService {
                service: name.clone(),
                state: self.board.state(name).unwrap_or_default(),
                waiting_on: Supervisor::unmet(&self.board, &self.stack, name),
            })
            .collect()
    }

    /// Waits until every service settles or `timeout` elapses.
    async fn settle(&self, timeout: Duration) -> std::result::Result<(), Vec<BlockedService>> {
        let deadline = Instant::now() + timeout;
        let mut changes = self.board.changes();
        loop {
            let _ = changes.borrow_and_update();
            let blocked = self.blocked();
            if blocked.is_empty() {
                return Ok(());
            }
            tokio::select! {
                res = changes.changed() => if res.is_err() { return Err(blocked); },
                () = tokio::time::sleep_until(deadline) => return Err(self.blocked()),
            }
        }
    }

    /// Signals shutdown and waits for every supervisor to finish.
    ///
    /// Each service stops after its dependents have stopped, or after its
    /// grace period. Forced stops are reported, not treated as errors.
    pub async fn shutdown(mut self) -> ShutdownReport {
        tracing::info!("shutting down stack");
        let first_seq = self.board.events().history().len();
        let _ = self.shutdown.send_replace(true);

        let mut report = ShutdownReport::default();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(done) => {
                    if done.forced {
                        report.forced.push(done.service.clone());
                    }
                    let _ = report.restarts.insert(done.service, done.restarts);
                }
                Err(e) => tracing::error!(error = %e, "supervisor task failed"),
            }
        }
        report.forced.sort();
        report.stopped = self
            .board
            .events()
            .history()
            .into_iter()
            .skip(first_seq)
            .filter(|e| e.entered() == Some(ServiceState::Stopped))
            .map(|e| e.service)
            .collect();
        tracing::info!(stopped = ?report.stopped, forced = ?report.forced, "stack stopped");
        report
    }

    /// Leaves the services running and releases the handle.
    ///
    /// Supervision ends; process instances survive only if their backend
    /// was created detached.
    #[must_use]
    pub fn detach(self) -> BTreeMap<String, ServiceState> {
        let states = self.states();
        tracing::info!(?states, "detaching from stack");
        states
    }
}
