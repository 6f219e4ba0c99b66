//! # stackseq-compose
//!
//! Loader and resolver for layered compose descriptors.
//!
//! Handles:
//! - **Loader**: reading descriptor files into ordered layers.
//! - **Merge**: folding layers into one raw stack with provenance.
//! - **Resolver**: environment mapping and `${VAR}` interpolation.
//! - **Parser**: typed decoding and static validation of services.
//! - **Graph**: dependency graph, startup order, and cycle reporting.
//! - **Stack**: the end-to-end resolution pass.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod graph;
pub mod loader;
pub mod merge;
pub mod model;
pub mod parser;
pub mod resolver;
pub mod stack;

pub use graph::DependencyGraph;
pub use model::{EffectiveStack, ServiceDescriptor};
pub use resolver::EnvMapping;
pub use stack::{ResolvedStack, resolve, resolve_layers};
