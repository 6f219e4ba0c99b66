//! In-memory backend driven by per-service scripts.
//!
//! Scripts come from `stackseq.simulate.*` labels on the service or are
//! registered directly. All timing uses `tokio::time`, so runs under a
//! paused clock are deterministic.
//!
//! | Label | Values |
//! |---|---|
//! | `stackseq.simulate.health` | `pass`, `fail`, `hang`, `pass-after:N`, `fail-after:N` |
//! | `stackseq.simulate.exit-after` | duration, e.g. `5s` |
//! | `stackseq.simulate.exit-code` | integer, default `0` |
//! | `stackseq.simulate.ignore-sigterm` | `true` / `false` |
//! | `stackseq.simulate.start` | `ok` / `fail` |

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use stackseq_common::error::{Result, StackError};
use stackseq_common::types::InstanceId;
use stackseq_compose::model::{HealthTest, ServiceDescriptor};
use stackseq_compose::parser::duration::parse_duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ExitStatus, ProbeOutcome, ServiceBackend, ServiceInstance, StopOutcome};

const LABEL_PREFIX: &str = "stackseq.simulate.";

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// How simulated probes behave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SimHealth {
    /// Every probe passes.
    #[default]
    Pass,
    /// Every probe fails.
    Fail,
    /// Probes never complete.
    Hang,
    /// The first `n` probes fail, later ones pass.
    PassAfter(u32),
    /// The first `n` probes pass, later ones fail.
    FailAfter(u32),
}

impl SimHealth {
    fn outcome(self, attempt: u32) -> Option<ProbeOutcome> {
        let passed = match self {
            Self::Pass => true,
            Self::Fail => false,
            Self::Hang => return None,
            Self::PassAfter(n) => attempt >= n,
            Self::FailAfter(n) => attempt < n,
        };
        Some(if passed {
            ProbeOutcome::Passed
        } else {
            ProbeOutcome::Failed(format!("simulated failure (probe {})", attempt + 1))
        })
    }
}

/// Scripted behaviour of one simulated service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimScript {
    /// Probe behaviour.
    pub health: SimHealth,
    /// Instance exits on its own after this long.
    pub exit_after: Option<Duration>,
    /// Exit code used when exiting on its own.
    pub exit_code: i32,
    /// The instance ignores polite stop requests.
    pub ignore_sigterm: bool,
    /// Starting the instance fails.
    pub fail_start: bool,
}

impl SimScript {
    /// Reads a script from `stackseq.simulate.*` labels.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Config`] for a malformed label value.
    pub fn from_labels(service: &str, labels: &BTreeMap<String, String>) -> Result<Self> {
        let mut script = Self::default();
        for (key, value) in labels {
            let Some(key) = key.strip_prefix(LABEL_PREFIX) else {
                continue;
            };
            let bad = || StackError::Config {
                message: format!(
                    "service \"{service}\": invalid value \"{value}\" for label {LABEL_PREFIX}{key}"
                ),
            };
            match key {
                "health" => script.health = parse_health(value).ok_or_else(bad)?,
                "exit-after" => script.exit_after = Some(parse_duration(value).ok_or_else(bad)?),
                "exit-code" => script.exit_code = value.trim().parse().map_err(|_| bad())?,
                "ignore-sigterm" => script.ignore_sigterm = value.trim().parse().map_err(|_| bad())?,
                "start" => {
                    script.fail_start = match value.trim() {
                        "ok" => false,
                        "fail" => true,
                        _ => return Err(bad()),
                    };
                }
                other => {
                    tracing::warn!(service, label = other, "unknown simulate label ignored");
                }
            }
        }
        Ok(script)
    }
}

fn parse_health(value: &str) -> Option<SimHealth> {
    let value = value.trim();
    match value {
        "pass" => return Some(SimHealth::Pass),
        "fail" => return Some(SimHealth::Fail),
        "hang" => return Some(SimHealth::Hang),
        _ => {}
    }
    let (kind, count) = value.split_once(':')?;
    let count = count.trim().parse().ok()?;
    match kind {
        "pass-after" => Some(SimHealth::PassAfter(count)),
        "fail-after" => Some(SimHealth::FailAfter(count)),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Journal {
    starts: BTreeMap<String, u32>,
    stops: Vec<String>,
}

/// Backend that simulates services in memory.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    scripts: BTreeMap<String, SimScript>,
    journal: Arc<Mutex<Journal>>,
}

impl SimulatedBackend {
    /// Creates a backend that scripts every service from its labels.
    #[must_use]
    pub fn from_labels() -> Self {
        Self::default()
    }

    /// Uses `script` for `service` instead of its labels.
    #[must_use]
    pub fn with_script(mut self, service: &str, script: SimScript) -> Self {
        let _ = self.scripts.insert(service.to_owned(), script);
        self
    }

    /// Number of instances started for `service`.
    #[must_use]
    pub fn starts(&self, service: &str) -> u32 {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .starts
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    /// Services in the order stop requests reached them.
    #[must_use]
    pub fn stop_order(&self) -> Vec<String> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stops
            .clone()
    }
}

#[async_trait]
impl ServiceBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulate"
    }

    async fn start(
        &self,
        service: &ServiceDescriptor,
        instance: InstanceId,
    ) -> Result<Box<dyn ServiceInstance>> {
        let script = match self.scripts.get(&service.name) {
            Some(script) => script.clone(),
            None => SimScript::from_labels(&service.name, &service.labels)?,
        };
        {
            let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
            *journal.starts.entry(service.name.clone()).or_default() += 1;
        }
        if script.fail_start {
            return Err(StackError::Backend {
                service: service.name.clone(),
                message: "simulated start failure".into(),
            });
        }

        let exit = Arc::new(watch::Sender::new(None));
        let timer = script.exit_after.map(|after| {
            let exit = Arc::clone(&exit);
            let code = script.exit_code;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = settle(&exit, ExitStatus::code(code));
            })
        });
        tracing::debug!(service = %service.name, instance = instance.short(), ?script, "simulated start");

        Ok(Box::new(SimInstance {
            id: instance,
            service: service.name.clone(),
            script,
            probes: AtomicU32::new(0),
            exit,
            timer,
            journal: Arc::clone(&self.journal),
        }))
    }
}

/// Records `status` unless the instance already exited.
fn settle(exit: &watch::Sender<Option<ExitStatus>>, status: ExitStatus) -> bool {
    exit.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(status);
        true
    })
}

struct SimInstance {
    id: InstanceId,
    service: String,
    script: SimScript,
    probes: AtomicU32,
    exit: Arc<watch::Sender<Option<ExitStatus>>>,
    timer: Option<JoinHandle<()>>,
    journal: Arc<Mutex<Journal>>,
}

impl Drop for SimInstance {
    fn drop(&mut self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

#[async_trait]
impl ServiceInstance for SimInstance {
    fn id(&self) -> &InstanceId {
        &self.id
    }

    async fn probe(&self, _test: &HealthTest) -> ProbeOutcome {
        let attempt = self.probes.fetch_add(1, Ordering::Relaxed);
        match self.script.health.outcome(attempt) {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }

    async fn wait(&self) -> ExitStatus {
        let mut rx = self.exit.subscribe();
        let unknown = ExitStatus {
            code: None,
            signal: None,
        };
        match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(unknown),
            Err(_) => unknown,
        }
    }

    async fn stop(&self, grace: Duration) -> Result<StopOutcome> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stops
            .push(self.service.clone());
        if self.exit.borrow().is_some() {
            return Ok(StopOutcome::Graceful);
        }
        if !self.script.ignore_sigterm {
            let _ = settle(&self.exit, ExitStatus::signaled(SIGTERM));
            return Ok(StopOutcome::Graceful);
        }
        if tokio::time::timeout(grace, self.wait()).await.is_ok() {
            return Ok(StopOutcome::Graceful);
        }
        let _ = settle(&self.exit, ExitStatus::signaled(SIGKILL));
        Ok(StopOutcome::Forced)
    }
}
