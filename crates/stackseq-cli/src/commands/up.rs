//! `stackseq up` — Start the stack in dependency order and supervise it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use stackseq_common::config::StackConfig;
use stackseq_common::constants::{APP_NAME, ENV_STARTUP_TIMEOUT, ENV_STOP_GRACE};
use stackseq_compose::ResolvedStack;
use stackseq_runtime::{BackendKind, EventLog, RunningStack, Sequencer, SequencerConfig, ShutdownReport};
use tokio::sync::watch;

use super::{FileArgs, GlobalArgs, report_warnings, resolve_stack};
use crate::output::state_marker;

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

/// Arguments for the `up` command.
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Descriptor files.
    #[command(flatten)]
    pub files: FileArgs,

    /// Seconds every service gets to reach its required state.
    #[arg(long, env = ENV_STARTUP_TIMEOUT, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Seconds a service gets to stop before it is killed.
    #[arg(long, env = ENV_STOP_GRACE, value_name = "SECONDS")]
    pub grace: Option<u64>,

    /// How services are run: `process` or `simulate`.
    #[arg(long, default_value = "process")]
    pub backend: BackendKind,

    /// Return once the stack is up instead of waiting for Ctrl+C.
    #[arg(short, long)]
    pub detach: bool,
}

impl UpArgs {
    fn apply(&self, config: &mut StackConfig) {
        if let Some(secs) = self.timeout {
            config.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.grace {
            config.stop_grace = Duration::from_secs(secs);
        }
    }
}

/// Executes the `up` command.
///
/// # Errors
///
/// Returns a resolution error, or a startup timeout naming the services
/// that never settled.
pub fn execute(args: &UpArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let mut config = global.stack_config();
    args.apply(&mut config);
    let stack = resolve_stack(&args.files, &config)?;
    report_warnings(&stack);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(args, &config, stack))
}

async fn run(args: &UpArgs, config: &StackConfig, stack: ResolvedStack) -> anyhow::Result<()> {
    print_header(args.backend);
    let total_start = Instant::now();

    let (events, mut feed) = EventLog::with_subscriber();
    let printer = tokio::spawn(async move {
        while let Some(event) = feed.recv().await {
            eprintln!("  {DIM}{event}{RESET}");
        }
    });

    let backend = args.backend.create(args.detach);
    let sequencer = Sequencer::new(backend)
        .with_config(SequencerConfig::from(config))
        .with_events(events);
    let result = sequencer.up(Arc::new(stack)).await;
    drop(sequencer);
    let running = match result {
        Ok(running) => running,
        Err(e) => {
            let _ = printer.await;
            return Err(e.into());
        }
    };
    report_started(&running, total_start);

    if args.detach {
        let _ = running.detach();
        eprintln!();
        eprintln!("  Running detached.");
        return Ok(());
    }

    wait_for_ctrl_c().await?;
    eprintln!();
    eprintln!("  Stopping services...");
    let report = running.shutdown().await;
    let _ = printer.await;
    report_stopped(&report);
    Ok(())
}

fn print_header(backend: BackendKind) {
    eprintln!();
    eprintln!(
        "  {BOLD}{APP_NAME}{RESET} {DIM}v{} ({backend:?} backend){RESET}",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!();
}

fn report_started(running: &RunningStack, total_start: Instant) {
    let states = running.states();
    eprintln!();
    eprintln!(
        "  {GREEN}{BOLD}Started {}{RESET} service(s) in {:.1}s:",
        states.len(),
        total_start.elapsed().as_secs_f64()
    );
    eprintln!();
    for (name, state) in &states {
        eprintln!("    {} {BOLD}{name}{RESET} {DIM}[{state}]{RESET}", state_marker(*state));
    }
}

fn report_stopped(report: &ShutdownReport) {
    for name in &report.forced {
        eprintln!("  {YELLOW}warning:{RESET} {name} was killed after its grace period");
    }
    eprintln!("  {GREEN}All services stopped{RESET} {DIM}({}){RESET}", report.stopped.join(", "));
}

async fn wait_for_ctrl_c() -> anyhow::Result<()> {
    eprintln!();
    eprintln!("  Press {BOLD}Ctrl+C{RESET} to stop all services...");

    let (tx, mut rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = tx.send(true);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;
    let _ = rx.wait_for(|stop| *stop).await;
    Ok(())
}
