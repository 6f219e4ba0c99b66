//! # stackseq — layered compose stack resolver and startup sequencer
//!
//! Validates and merges multi-file service descriptors, prints the
//! effective stack with its startup plan, and brings services up in
//! health-gated dependency order.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;
use stackseq_common::constants::EXIT_VALIDATION;
use stackseq_common::error::StackError;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::commands::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.log_json);

    match commands::execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<StackError>()
                .map_or(EXIT_VALIDATION, StackError::exit_code);
            eprintln!("error: {err:#}");
            ExitCode::from(code)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
