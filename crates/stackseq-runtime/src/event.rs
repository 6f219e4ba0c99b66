//! Lifecycle events emitted while a stack runs.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stackseq_common::types::{InstanceId, ServiceState};
use tokio::sync::mpsc;

use crate::backend::ExitStatus;

/// What happened to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The service moved between sequencer states.
    StateChanged {
        /// Previous state.
        from: ServiceState,
        /// New state.
        to: ServiceState,
    },
    /// A health probe failed.
    ProbeFailed {
        /// Consecutive failures so far.
        consecutive: u32,
        /// Failure detail.
        reason: String,
    },
    /// The instance exited on its own.
    Exited {
        /// Exit status text.
        status: String,
    },
    /// The service is queued for another attempt.
    Restarting {
        /// Restart number, starting at 1.
        attempt: u32,
    },
    /// The instance had to be killed after its grace period.
    ForcedStop,
    /// The backend reported an error.
    Failed {
        /// Error text.
        message: String,
    },
}

/// A timestamped lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEvent {
    /// Monotonic sequence number within one run.
    pub seq: u64,
    /// Wall-clock time the event was recorded.
    pub at: DateTime<Utc>,
    /// Service the event concerns.
    pub service: String,
    /// Instance the event concerns, if one was running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceId>,
    /// Event payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl fmt::Display for ServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.service)?;
        if let Some(instance) = &self.instance {
            write!(f, " [{}]", instance.short())?;
        }
        match &self.kind {
            EventKind::StateChanged { from, to } => write!(f, ": {from} -> {to}"),
            EventKind::ProbeFailed {
                consecutive,
                reason,
            } => write!(f, ": health probe failed ({consecutive} in a row): {reason}"),
            EventKind::Exited { status } => write!(f, ": exited with {status}"),
            EventKind::Restarting { attempt } => write!(f, ": restarting (attempt {attempt})"),
            EventKind::ForcedStop => write!(f, ": forced stop after grace period"),
            EventKind::Failed { message } => write!(f, ": {message}"),
        }
    }
}

impl ServiceEvent {
    /// Returns the target state if this is a state change.
    #[must_use]
    pub const fn entered(&self) -> Option<ServiceState> {
        match self.kind {
            EventKind::StateChanged { to, .. } => Some(to),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    history: Vec<ServiceEvent>,
}

/// Ordered, shared record of every event in a run, optionally forwarded
/// to a live subscriber.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<Inner>>,
    forward: Option<mpsc::UnboundedSender<ServiceEvent>>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log that also forwards each event to the returned
    /// receiver.
    #[must_use]
    pub fn with_subscriber() -> (Self, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Self {
            inner: Arc::default(),
            forward: Some(tx),
        };
        (log, rx)
    }

    /// Records an event.
    pub fn record(&self, service: &str, instance: Option<&InstanceId>, kind: EventKind) {
        let event = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let event = ServiceEvent {
                seq: inner.next_seq,
                at: Utc::now(),
                service: service.to_owned(),
                instance: instance.cloned(),
                kind,
            };
            inner.next_seq += 1;
            inner.history.push(event.clone());
            event
        };
        tracing::debug!(%event, "service event");
        if let Some(tx) = &self.forward {
            let _ = tx.send(event);
        }
    }

    /// Records an instance exit.
    pub fn exited(&self, service: &str, instance: &InstanceId, status: ExitStatus) {
        self.record(
            service,
            Some(instance),
            EventKind::Exited {
                status: status.to_string(),
            },
        );
    }

    /// Snapshot of all events so far, in order.
    #[must_use]
    pub fn history(&self) -> Vec<ServiceEvent> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }

    /// Sequence number of the first event where `service` entered
    /// `state`, if it ever did.
    #[must_use]
    pub fn first_entry(&self, service: &str, state: ServiceState) -> Option<u64> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .find(|e| e.service == service && e.entered() == Some(state))
            .map(|e| e.seq)
    }
}
