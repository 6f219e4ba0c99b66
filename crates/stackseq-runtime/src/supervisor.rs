//! Per-service lifecycle task.
//!
//! A supervisor waits for its dependencies, launches an instance,
//! probes it, applies the restart policy when it ends, and takes part in
//! the ordered shutdown.

use std::sync::Arc;
use std::time::Duration;

use stackseq_common::error::StackError;
use stackseq_common::types::{HealthState, InstanceId, ServiceState};
use stackseq_compose::model::{HealthCheck, ServiceDescriptor};
use stackseq_compose::ResolvedStack;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout};

use crate::backend::{ExitStatus, ProbeOutcome, ServiceBackend, ServiceInstance, StopOutcome};
use crate::event::EventKind;
use crate::health::HealthTracker;
use crate::sequencer::SequencerConfig;
use crate::state::{StateBoard, StateWriter};

/// Outcome of one supervisor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Service name.
    pub service: String,
    /// Restarts performed.
    pub restarts: u32,
    /// Whether the final stop had to be forced.
    pub forced: bool,
}

/// Why an instance stopped being watched.
enum End {
    Exited(ExitStatus),
    Unhealthy,
    Shutdown,
}

pub(crate) struct Supervisor {
    name: String,
    stack: Arc<ResolvedStack>,
    backend: Arc<dyn ServiceBackend>,
    board: Arc<StateBoard>,
    writer: StateWriter,
    shutdown: watch::Receiver<bool>,
    config: SequencerConfig,
}

impl Supervisor {
    pub(crate) const fn new(
        name: String,
        stack: Arc<ResolvedStack>,
        backend: Arc<dyn ServiceBackend>,
        board: Arc<StateBoard>,
        writer: StateWriter,
        shutdown: watch::Receiver<bool>,
        config: SequencerConfig,
    ) -> Self {
        Self {
            name,
            stack,
            backend,
            board,
            writer,
            shutdown,
            config,
        }
    }

    fn service(&self) -> Option<&ServiceDescriptor> {
        self.stack.stack.service(&self.name)
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn stop_grace(&self) -> Duration {
        self.service()
            .and_then(|s| s.stop_grace_period)
            .unwrap_or(self.config.stop_grace)
    }

    /// Dependencies whose condition is not met.
    pub(crate) fn unmet(board: &StateBoard, stack: &ResolvedStack, name: &str) -> Vec<String> {
        stack
            .graph
            .dependencies(name)
            .into_iter()
            .filter(|(dep, cond)| !board.satisfied(dep, *cond))
            .map(|(dep, _)| dep)
            .collect()
    }

    /// Runs the service until shutdown or a terminal stop.
    pub(crate) async fn run(mut self) -> SupervisorReport {
        let mut restarts = 0;
        let mut forced = false;
        let mut clean = true;
        loop {
            if !self.await_dependencies().await {
                forced = self.shut_down(None).await;
                break;
            }
            let Some(service) = self.service().cloned() else {
                break;
            };

            let id = InstanceId::generate();
            self.writer.set(ServiceState::Starting, Some(&id));
            let (abnormal, id) = match self.backend.start(&service, id.clone()).await {
                Ok(instance) => match self
                    .watch_instance(&service, instance.as_ref(), restarts)
                    .await
                {
                    End::Shutdown => {
                        forced = self.shut_down(Some(instance.as_ref())).await;
                        break;
                    }
                    End::Exited(status) => {
                        self.board.events().exited(&self.name, &id, status);
                        tracing::info!(service = %self.name, %status, "instance exited");
                        self.writer.set(ServiceState::Stopped, Some(&id));
                        (!status.success(), id)
                    }
                    End::Unhealthy => {
                        self.writer.set(ServiceState::Stopping, Some(&id));
                        let _ = self.stop_instance(instance.as_ref()).await;
                        self.writer.set(ServiceState::Stopped, Some(&id));
                        (true, id)
                    }
                },
                Err(e) => {
                    tracing::error!(service = %self.name, error = %e, "failed to start instance");
                    self.board.events().record(
                        &self.name,
                        Some(&id),
                        EventKind::Failed {
                            message: e.to_string(),
                        },
                    );
                    self.writer.set(ServiceState::Stopped, Some(&id));
                    (true, id)
                }
            };

            clean = !abnormal;
            if self.shutting_down() || !service.restart.requeues(abnormal, restarts) {
                tracing::debug!(service = %self.name, instance = id.short(), "service is terminal");
                if self.shutting_down() {
                    forced = self.shut_down(None).await;
                }
                break;
            }
            restarts += 1;
            self.board.events().record(
                &self.name,
                Some(&id),
                EventKind::Restarting { attempt: restarts },
            );
            tracing::info!(service = %self.name, attempt = restarts, policy = %service.restart, "restarting");
            if !self.pause(self.config.restart_delay).await {
                forced = self.shut_down(None).await;
                break;
            }
            self.writer.set(ServiceState::Pending, None);
        }
        self.board.finish(&self.name, clean);
        SupervisorReport {
            service: self.name,
            restarts,
            forced,
        }
    }

    /// Suspends in `waiting_for_deps` until every dependency condition
    /// holds. A service without dependencies passes straight through.
    ///
    /// Returns `false` if shutdown began first.
    async fn await_dependencies(&mut self) -> bool {
        self.writer.set(ServiceState::WaitingForDeps, None);
        let mut changes = self.board.changes();
        loop {
            let _ = changes.borrow_and_update();
            if self.shutting_down() {
                return false;
            }
            let unmet = Self::unmet(&self.board, &self.stack, &self.name);
            if unmet.is_empty() {
                return true;
            }
            tracing::debug!(service = %self.name, ?unmet, "waiting for dependencies");
            tokio::select! {
                res = changes.changed() => if res.is_err() { return false; },
                res = self.shutdown.changed() => if res.is_err() { return false; },
            }
        }
    }

    /// Sleeps for `delay` unless shutdown begins. Returns `false` on
    /// shutdown.
    async fn pause(&mut self, delay: Duration) -> bool {
        if self.shutting_down() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => !self.shutting_down(),
            _ = self.shutdown.changed() => false,
        }
    }

    /// Follows a live instance until it exits, turns unhealthy under a
    /// policy that would restart it, or shutdown begins. Under any other
    /// policy an unhealthy instance keeps being probed and may recover.
    async fn watch_instance(
        &mut self,
        service: &ServiceDescriptor,
        instance: &dyn ServiceInstance,
        restarts: u32,
    ) -> End {
        let id = instance.id().clone();
        let Some(check) = service.healthcheck.as_ref() else {
            self.writer.set(ServiceState::Healthy, Some(&id));
            self.writer.set(ServiceState::Running, Some(&id));
            return tokio::select! {
                status = instance.wait() => End::Exited(status),
                _ = self.shutdown.changed() => End::Shutdown,
            };
        };

        let mut tracker = HealthTracker::new(check);
        let mut next_probe = Instant::now() + check.start_period;
        loop {
            if self.shutting_down() {
                return End::Shutdown;
            }
            tokio::select! {
                status = instance.wait() => return End::Exited(status),
                _ = self.shutdown.changed() => return End::Shutdown,
                () = sleep_until(next_probe) => {
                    let outcome = self.probe(check, instance).await;
                    next_probe = Instant::now() + check.interval;
                    if let ProbeOutcome::Failed(reason) = &outcome {
                        self.board.events().record(
                            &self.name,
                            Some(&id),
                            EventKind::ProbeFailed {
                                consecutive: tracker.failures() + 1,
                                reason: reason.clone(),
                            },
                        );
                    }
                    match tracker.record(&outcome) {
                        Some(HealthState::Healthy) => {
                            self.writer.set(ServiceState::Healthy, Some(&id));
                            self.writer.set(ServiceState::Running, Some(&id));
                        }
                        Some(HealthState::Unhealthy) => {
                            tracing::warn!(service = %self.name, failures = tracker.failures(), "service is unhealthy");
                            self.writer.set(ServiceState::Unhealthy, Some(&id));
                            if !self.shutting_down() && service.restart.requeues(true, restarts) {
                                return End::Unhealthy;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Runs one probe bounded by the check's timeout.
    async fn probe(&self, check: &HealthCheck, instance: &dyn ServiceInstance) -> ProbeOutcome {
        if let Ok(outcome) = timeout(check.timeout, instance.probe(&check.test)).await {
            return outcome;
        }
        let err = StackError::HealthCheckTimeout {
            service: self.name.clone(),
            timeout: check.timeout,
        };
        tracing::warn!(service = %self.name, error = %err, "health probe timed out");
        ProbeOutcome::Failed(err.to_string())
    }

    /// Stops `instance` with the service's grace period. Returns `true`
    /// if the stop had to be forced.
    async fn stop_instance(&self, instance: &dyn ServiceInstance) -> bool {
        match instance.stop(self.stop_grace()).await {
            Ok(StopOutcome::Graceful) => false,
            Ok(StopOutcome::Forced) => {
                tracing::warn!(service = %self.name, grace = ?self.stop_grace(), "forced stop after grace period");
                self.board
                    .events()
                    .record(&self.name, Some(instance.id()), EventKind::ForcedStop);
                true
            }
            Err(e) => {
                tracing::error!(service = %self.name, error = %e, "failed to stop instance");
                self.board.events().record(
                    &self.name,
                    Some(instance.id()),
                    EventKind::Failed {
                        message: e.to_string(),
                    },
                );
                false
            }
        }
    }

    /// Takes part in the stack shutdown: waits (bounded by the grace
    /// period) for every dependent to stop, then stops this service.
    async fn shut_down(&self, instance: Option<&dyn ServiceInstance>) -> bool {
        let Some(instance) = instance else {
            self.writer.set(ServiceState::Stopped, None);
            return false;
        };
        let id = instance.id().clone();
        let grace = self.stop_grace();
        if timeout(grace, self.await_dependents_stopped()).await.is_err() {
            tracing::warn!(service = %self.name, ?grace, "dependents still running, stopping anyway");
        }
        self.writer.set(ServiceState::Stopping, Some(&id));
        let forced = self.stop_instance(instance).await;
        self.writer.set(ServiceState::Stopped, Some(&id));
        forced
    }

    async fn await_dependents_stopped(&self) {
        let dependents = self.stack.graph.dependents(&self.name);
        let mut changes = self.board.changes();
        loop {
            let _ = changes.borrow_and_update();
            let pending: Vec<&String> = dependents
                .iter()
                .filter(|d| self.board.state(d) != Some(ServiceState::Stopped))
                .collect();
            if pending.is_empty() {
                return;
            }
            tracing::debug!(service = %self.name, ?pending, "waiting for dependents to stop");
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}
