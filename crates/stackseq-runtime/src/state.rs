//! Shared view of every service's lifecycle state.
//!
//! Each service has one `watch` channel. Only the supervisor owning a
//! service holds its [`StateWriter`]; everyone else subscribes. The board
//! also remembers which services have ever entered `starting`, and how
//! each supervisor ended.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use stackseq_common::types::{DependencyCondition, InstanceId, ServiceState};
use tokio::sync::watch;

use crate::event::{EventKind, EventLog};

/// Per-service state channels plus a global change counter.
#[derive(Debug)]
pub struct StateBoard {
    states: BTreeMap<String, watch::Sender<ServiceState>>,
    version: watch::Sender<u64>,
    started: Mutex<BTreeSet<String>>,
    finished: Mutex<BTreeMap<String, bool>>,
    events: EventLog,
}

impl StateBoard {
    /// Creates a board with every service in `pending`.
    pub fn new<'a>(services: impl IntoIterator<Item = &'a str>, events: EventLog) -> Arc<Self> {
        let states = services
            .into_iter()
            .map(|name| (name.to_owned(), watch::Sender::new(ServiceState::Pending)))
            .collect();
        Arc::new(Self {
            states,
            version: watch::Sender::new(0),
            started: Mutex::default(),
            finished: Mutex::default(),
            events,
        })
    }

    /// Current state of `service`.
    #[must_use]
    pub fn state(&self, service: &str) -> Option<ServiceState> {
        self.states.get(service).map(|tx| *tx.borrow())
    }

    /// Subscribes to changes of `service`.
    #[must_use]
    pub fn subscribe(&self, service: &str) -> Option<watch::Receiver<ServiceState>> {
        self.states.get(service).map(watch::Sender::subscribe)
    }

    /// Subscribes to "any state changed" notifications.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Snapshot of all states.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ServiceState> {
        self.states
            .iter()
            .map(|(name, tx)| (name.clone(), *tx.borrow()))
            .collect()
    }

    /// Returns `true` if `dependency` satisfies `condition`.
    ///
    /// `started` holds once the dependency has entered `starting`, even if
    /// it has exited since. `healthy` looks at the current state.
    #[must_use]
    pub fn satisfied(&self, dependency: &str, condition: DependencyCondition) -> bool {
        match condition {
            DependencyCondition::Started => self.has_started(dependency),
            DependencyCondition::Healthy => self
                .state(dependency)
                .is_some_and(ServiceState::is_healthy),
        }
    }

    /// Returns `true` once `service` has entered `starting` at least once.
    #[must_use]
    pub fn has_started(&self, service: &str) -> bool {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(service)
    }

    /// Marks `service` as terminal: its supervisor will not change its
    /// state again. `clean` is `false` when the last instance failed to
    /// start, exited abnormally, or was left unhealthy.
    pub fn finish(&self, service: &str, clean: bool) {
        let _ = self
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_owned(), clean);
        self.version.send_modify(|v| *v += 1);
    }

    /// Returns `true` if `service` is terminal after a clean exit.
    #[must_use]
    pub fn finished_cleanly(&self, service: &str) -> bool {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .copied()
            .unwrap_or(false)
    }

    /// The event log transitions are recorded in.
    #[must_use]
    pub const fn events(&self) -> &EventLog {
        &self.events
    }

    /// Write handle for `service`. Must be taken by exactly one task.
    #[must_use]
    pub fn writer(self: &Arc<Self>, service: &str) -> Option<StateWriter> {
        self.states.contains_key(service).then(|| StateWriter {
            board: Arc::clone(self),
            service: service.to_owned(),
        })
    }
}

/// Exclusive write access to one service's state.
#[derive(Debug)]
pub struct StateWriter {
    board: Arc<StateBoard>,
    service: String,
}

impl StateWriter {
    /// Current state.
    #[must_use]
    pub fn get(&self) -> ServiceState {
        self.board.state(&self.service).unwrap_or_default()
    }

    /// Moves the service to `to`.
    ///
    /// The transition is recorded in the event log before it becomes
    /// visible to subscribers, so the log never shows a reaction before
    /// its cause.
    pub fn set(&self, to: ServiceState, instance: Option<&InstanceId>) {
        let Some(tx) = self.board.states.get(&self.service) else {
            return;
        };
        let from = *tx.borrow();
        if from == to {
            return;
        }
        self.board
            .events
            .record(&self.service, instance, EventKind::StateChanged { from, to });
        tracing::info!(service = %self.service, %from, %to, "state changed");
        if to == ServiceState::Starting {
            let _ = self
                .board
                .started
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(self.service.clone());
        }
        let _ = tx.send_replace(to);
        self.board.version.send_modify(|v| *v += 1);
    }
}
