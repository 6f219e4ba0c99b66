//! Host-process backend.
//!
//! Each service instance is a child process launched from the service's
//! entrypoint and command, with its environment and working directory.
//! Health probes run as short-lived sibling processes.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use stackseq_common::error::{Result, StackError};
use stackseq_common::types::InstanceId;
use stackseq_compose::model::{HealthTest, ServiceDescriptor};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use super::{ExitStatus, ProbeOutcome, ServiceBackend, ServiceInstance, StopOutcome};

/// Runs services as child processes of the CLI.
#[derive(Debug, Clone, Default)]
pub struct ProcessBackend {
    detached: bool,
}

impl ProcessBackend {
    /// Creates a backend whose children die with the stack handle.
    #[must_use]
    pub const fn new() -> Self {
        Self { detached: false }
    }

    /// When `detached`, children outlive the stack handle and their output
    /// is discarded.
    #[must_use]
    pub const fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }
}

/// Resolves `program` against `PATH` unless it already names a path.
fn resolve_program(service: &str, program: &str) -> Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    which::which(program).map_err(|e| StackError::Backend {
        service: service.to_owned(),
        message: format!("executable \"{program}\" not found: {e}"),
    })
}

fn convert_status(status: std::process::ExitStatus) -> ExitStatus {
    ExitStatus {
        code: status.code(),
        signal: status.signal(),
    }
}

/// Forwards each output line of a child to the log.
fn forward_lines<R>(service: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let _ = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(service = %service, stream, "{line}");
        }
    });
}

#[async_trait]
impl ServiceBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn start(
        &self,
        service: &ServiceDescriptor,
        instance: InstanceId,
    ) -> Result<Box<dyn ServiceInstance>> {
        let argv = service.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(StackError::Backend {
                service: service.name.clone(),
                message: "no command or entrypoint to run as a process".into(),
            });
        };
        let program = resolve_program(&service.name, program)?;

        let mut cmd = Command::new(&program);
        let _ = cmd
            .args(args)
            .envs(&service.environment)
            .stdin(Stdio::null())
            .kill_on_drop(!self.detached);
        if self.detached {
            let _ = cmd.stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            let _ = cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        if let Some(dir) = &service.working_dir {
            let _ = cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| StackError::Backend {
            service: service.name.clone(),
            message: format!("failed to spawn {}: {e}", program.display()),
        })?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw);
        tracing::info!(
            service = %service.name,
            instance = instance.short(),
            pid = pid.map(Pid::as_raw),
            program = %program.display(),
            "process started"
        );

        if let Some(stdout) = child.stdout.take() {
            forward_lines(service.name.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(service.name.clone(), "stderr", stderr);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let _ = tokio::spawn(async move {
            let status = child
                .wait()
                .await
                .map_or(ExitStatus { code: None, signal: None }, convert_status);
            let _ = exit_tx.send_replace(Some(status));
        });

        Ok(Box::new(ProcessInstance {
            id: instance,
            service: service.name.clone(),
            pid,
            exit: exit_rx,
            environment: service.environment.clone(),
            working_dir: service.working_dir.clone(),
        }))
    }
}

/// A running child process.
#[derive(Debug)]
pub struct ProcessInstance {
    id: InstanceId,
    service: String,
    pid: Option<Pid>,
    exit: watch::Receiver<Option<ExitStatus>>,
    environment: BTreeMap<String, String>,
    working_dir: Option<String>,
}

impl ProcessInstance {
    fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match signal::kill(pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(StackError::Backend {
                service: self.service.clone(),
                message: format!("failed to send {sig} to pid {pid}: {e}"),
            }),
        }
    }
}

#[async_trait]
impl ServiceInstance for ProcessInstance {
    fn id(&self) -> &InstanceId {
        &self.id
    }

    async fn probe(&self, test: &HealthTest) -> ProbeOutcome {
        let argv = test.to_argv();
        let Some((program, args)) = argv.split_first() else {
            return ProbeOutcome::Failed("empty health test".into());
        };
        let program = match resolve_program(&self.service, program) {
            Ok(program) => program,
            Err(e) => return ProbeOutcome::Failed(e.to_string()),
        };
        let mut cmd = Command::new(program);
        let _ = cmd
            .args(args)
            .envs(&self.environment)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            let _ = cmd.current_dir(dir);
        }
        match cmd.output().await {
            Ok(output) if output.status.success() => ProbeOutcome::Passed,
            Ok(output) => {
                let status = convert_status(output.status);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = stderr.trim();
                if detail.is_empty() {
                    ProbeOutcome::Failed(status.to_string())
                } else {
                    ProbeOutcome::Failed(format!("{status}: {detail}"))
                }
            }
            Err(e) => ProbeOutcome::Failed(format!("failed to run probe: {e}")),
        }
    }

    async fn wait(&self) -> ExitStatus {
        let mut rx = self.exit.clone();
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
        if self.exited() {
            return Ok(StopOutcome::Graceful);
        }
        self.signal(Signal::SIGTERM)?;
        if tokio::time::timeout(grace, self.wait()).await.is_ok() {
            return Ok(StopOutcome::Graceful);
        }
        tracing::warn!(service = %self.service, ?grace, "grace period elapsed, sending SIGKILL");
        self.signal(Signal::SIGKILL)?;
        let _ = self.wait().await;
        Ok(StopOutcome::Forced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackseq_compose::model::CommandSpec;

    fn service(command: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: "job".into(),
            command: Some(CommandSpec::Shell(command.into())),
            ..ServiceDescriptor::default()
        }
    }

    #[tokio::test]
    async fn image_only_service_is_rejected() {
        let svc = ServiceDescriptor {
            name: "db".into(),
            image: Some("postgres:16".into()),
            ..ServiceDescriptor::default()
        };
        let err = ProcessBackend::new()
            .start(&svc, InstanceId::generate())
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, StackError::Backend { .. }));
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let instance = ProcessBackend::new()
            .start(&service("exit 3"), InstanceId::generate())
            .await
            .expect("start");
        assert_eq!(instance.wait().await, ExitStatus::code(3));
    }

    #[tokio::test]
    async fn probe_runs_with_service_environment() {
        let mut svc = service("sleep 5");
        let _ = svc.environment.insert("READY".into(), "yes".into());
        let instance = ProcessBackend::new()
            .start(&svc, InstanceId::generate())
            .await
            .expect("start");
        let pass = HealthTest::Shell("test \"$READY\" = yes".into());
        let fail = HealthTest::Cmd(vec!["false".into()]);
        assert_eq!(instance.probe(&pass).await, ProbeOutcome::Passed);
        assert!(!instance.probe(&fail).await.passed());
        let outcome = instance.stop(Duration::from_secs(5)).await.expect("stop");
        assert_eq!(outcome, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        let instance = ProcessBackend::new()
            .start(
                &service("trap '' TERM; while true; do sleep 0.1; done"),
                InstanceId::generate(),
            )
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = instance
            .stop(Duration::from_millis(300))
            .await
            .expect("stop");
        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(instance.wait().await.signal, Some(9));
    }
}
