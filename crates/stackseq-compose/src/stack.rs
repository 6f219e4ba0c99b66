//! End-to-end resolution pass.
//!
//! load → merge → interpolate → decode → validate → graph → order.
//! Any failure aborts the pass; no partial stack is returned.

use std::path::PathBuf;

use stackseq_common::config::StackConfig;
use stackseq_common::error::Result;

use crate::graph::DependencyGraph;
use crate::loader::{self, Layer};
use crate::merge::merge_layers;
use crate::model::EffectiveStack;
use crate::parser::decode_stack;
use crate::parser::validator::{ValidationWarning, validate};
use crate::resolver::{EnvMapping, resolve_variables};

/// A fully resolved, validated stack with its startup order.
#[derive(Debug, Clone)]
pub struct ResolvedStack {
    /// The effective services.
    pub stack: EffectiveStack,
    /// Dependency graph over the services.
    pub graph: DependencyGraph,
    /// Startup order, dependencies first.
    pub order: Vec<String>,
    /// Groups of services that may start in parallel.
    pub waves: Vec<Vec<String>>,
    /// Non-fatal findings from validation.
    pub warnings: Vec<ValidationWarning>,
    /// Descriptor files in precedence order.
    pub files: Vec<PathBuf>,
}

/// Builds the environment mapping described by `config`.
///
/// # Errors
///
/// Returns an error if an env file is missing or malformed.
pub fn build_env(config: &StackConfig) -> Result<EnvMapping> {
    EnvMapping::load(&config.effective_env_files(), config.inherit_process_env)
}

/// Picks the descriptor files for a pass: `files` resolved against the
/// project directory, or the default discovery when empty.
///
/// # Errors
///
/// Returns [`stackseq_common::error::StackError::NotFound`] if no files
/// were given and none of the default names exist.
pub fn descriptor_files(files: &[PathBuf], config: &StackConfig) -> Result<Vec<PathBuf>> {
    if files.is_empty() {
        loader::discover_files(&config.project_dir)
    } else {
        Ok(files.iter().map(|f| config.resolve_path(f)).collect())
    }
}

/// Loads and resolves `files` in precedence order.
///
/// # Errors
///
/// Returns the first loader, merge, variable, decode, graph, or
/// validation error.
pub fn resolve(files: &[PathBuf], env: &EnvMapping) -> Result<ResolvedStack> {
    tracing::info!(files = files.len(), "resolving stack");
    let layers = loader::load_layers(files)?;
    let mut resolved = resolve_layers(&layers, env)?;
    resolved.files = files.to_vec();
    Ok(resolved)
}

/// Resolves already-loaded layers.
///
/// # Errors
///
/// Returns the first merge, variable, decode, graph, or validation error.
/// Graph errors take precedence over validation errors.
pub fn resolve_layers(layers: &[Layer], env: &EnvMapping) -> Result<ResolvedStack> {
    let mut merged = merge_layers(layers)?;
    resolve_variables(&mut merged, env)?;
    let stack = decode_stack(&merged)?;
    let graph = DependencyGraph::from_stack(&stack)?;
    let order = graph.resolve_order()?;
    let waves = graph.startup_waves()?;
    let warnings = validate(&stack)?;
    tracing::info!(services = order.len(), waves = waves.len(), "stack resolved");
    Ok(ResolvedStack {
        stack,
        graph,
        order,
        waves,
        warnings,
        files: layers.iter().map(|l| l.origin.path.clone()).collect(),
    })
}
