//! `stackseq validate` — Check that a stack resolves cleanly.

use clap::Args;

use super::{FileArgs, GlobalArgs, report_warnings, resolve_stack};

/// Arguments for the `validate` command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Descriptor files.
    #[command(flatten)]
    pub files: FileArgs,

    /// Do not print warnings.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Executes the `validate` command.
///
/// Loads, merges, and resolves the descriptors and builds the dependency
/// graph. Prints a one-line summary on success.
///
/// # Errors
///
/// Returns the first load, merge, variable, validation, or graph error.
pub fn execute(args: &ValidateArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let config = global.stack_config();
    let stack = resolve_stack(&args.files, &config)?;
    if !args.quiet {
        report_warnings(&stack);
    }
    let files: Vec<String> = stack
        .files
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    println!(
        "{}: valid ({} service(s), {} startup wave(s))",
        files.join(" + "),
        stack.order.len(),
        stack.waves.len()
    );
    Ok(())
}
