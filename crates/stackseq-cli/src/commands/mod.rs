//! CLI command definitions and dispatch.

pub mod plan;
pub mod up;
pub mod validate;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use stackseq_common::config::StackConfig;
use stackseq_common::constants::BIN_NAME;
use stackseq_compose::ResolvedStack;
use stackseq_compose::stack::{build_env, descriptor_files, resolve};

/// stackseq — resolve layered compose descriptors and start them in order.
#[derive(Parser, Debug)]
#[command(name = BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Options shared by every subcommand.
    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Environment file; repeat for more, later files win.
    #[arg(long = "env-file", global = true, value_name = "PATH")]
    pub env_files: Vec<PathBuf>,

    /// Directory relative paths and default files resolve against.
    #[arg(long, global = true, value_name = "DIR")]
    pub project_directory: Option<PathBuf>,

    /// Do not overlay the process environment on the env files.
    #[arg(long, global = true)]
    pub no_process_env: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

impl GlobalArgs {
    /// Builds the stack configuration these flags describe.
    pub fn stack_config(&self) -> StackConfig {
        StackConfig {
            project_dir: self
                .project_directory
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
            env_files: self.env_files.clone(),
            inherit_process_env: !self.no_process_env,
            ..StackConfig::default()
        }
    }
}

/// Descriptor files, in precedence order.
#[derive(Args, Debug, Clone, Default)]
pub struct FileArgs {
    /// Descriptor files; later files override earlier ones. Defaults to
    /// compose.yaml plus compose.override.yaml in the project directory.
    #[arg(value_name = "FILES")]
    pub files: Vec<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the descriptors load, merge, resolve, and are acyclic.
    Validate(validate::ValidateArgs),
    /// Print the effective stack and its startup order.
    Plan(plan::PlanArgs),
    /// Start the stack in dependency order and supervise it.
    Up(up::UpArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Validate(args) => validate::execute(&args, &cli.global),
        Command::Plan(args) => plan::execute(&args, &cli.global),
        Command::Up(args) => up::execute(&args, &cli.global),
    }
}

/// Runs the resolution pipeline for `files` under `config`.
///
/// # Errors
///
/// Returns the first load, merge, variable, validation, or graph error.
pub fn resolve_stack(files: &FileArgs, config: &StackConfig) -> anyhow::Result<ResolvedStack> {
    let files = descriptor_files(&files.files, config)?;
    let env = build_env(config)?;
    tracing::info!(files = ?files, variables = env.len(), "resolving descriptors");
    Ok(resolve(&files, &env)?)
}

/// Prints validation warnings to stderr.
pub fn report_warnings(stack: &ResolvedStack) {
    for warning in &stack.warnings {
        eprintln!("warning: {warning}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_parse_anywhere() {
        let cli = Cli::try_parse_from([
            "stackseq",
            "plan",
            "--env-file",
            "a.env",
            "base.yaml",
            "--env-file",
            "b.env",
            "--no-process-env",
        ])
        .expect("parse");
        assert_eq!(
            cli.global.env_files,
            vec![PathBuf::from("a.env"), PathBuf::from("b.env")]
        );
        let config = cli.global.stack_config();
        assert!(!config.inherit_process_env);
        let Command::Plan(args) = cli.command else {
            unreachable!("parsed plan");
        };
        assert_eq!(args.files.files, vec![PathBuf::from("base.yaml")]);
    }

    #[test]
    fn project_directory_defaults_to_cwd() {
        let config = GlobalArgs::default().stack_config();
        assert_eq!(config.project_dir, PathBuf::from("."));
        assert!(config.inherit_process_env);
    }
}
