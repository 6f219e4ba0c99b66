//! `stackseq plan` — Print the effective stack and its startup order.

use clap::{Args, ValueEnum};

use super::{FileArgs, GlobalArgs, resolve_stack};
use crate::output::{PlanDocument, render_plan_text};

/// Output format of the plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum PlanFormat {
    /// Human-readable summary.
    #[default]
    Text,
    /// JSON document.
    Json,
    /// YAML document.
    Yaml,
}

/// Arguments for the `plan` command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Descriptor files.
    #[command(flatten)]
    pub files: FileArgs,

    /// Output format.
    #[arg(long, value_enum, default_value_t = PlanFormat::Text)]
    pub format: PlanFormat,
}

/// Executes the `plan` command.
///
/// Resolves the stack and prints the effective services, the
/// topological startup order, and the startup waves.
///
/// # Errors
///
/// Returns the first resolution error, or a serialization error.
pub fn execute(args: &PlanArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let config = global.stack_config();
    let stack = resolve_stack(&args.files, &config)?;
    match args.format {
        PlanFormat::Text => print!("{}", render_plan_text(&stack)),
        PlanFormat::Json => {
            let doc = PlanDocument::new(&stack);
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        PlanFormat::Yaml => {
            let doc = PlanDocument::new(&stack);
            print!("{}", serde_yaml::to_string(&doc)?);
        }
    }
    Ok(())
}
