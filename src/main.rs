mod checks;
mod config;
mod control;
mod error;
mod gate;
mod namespace;
mod netstack;
mod orchestrator;
mod registry;
mod report;
mod template;
mod utils;

use anyhow::Result;
use clap::{Parser, error::ErrorKind};
use config::Config;
use error::{PortwrapError, classify};
use log::{error, info};
use namespace::Exit;
use orchestrator::Orchestrator;
use registry::CleanupRegistry;
use std::{process::ExitCode, sync::Arc};

fn main() -> ExitCode {
    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(error) => {
            let _ = error.print();
            return match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    let level = if config.debug.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&config) {
        Ok(exit) => exit_code(exit.code()),
        Err(error) => match classify(&error) {
            Some(interrupt @ PortwrapError::Interrupted { .. }) => {
                info!("{interrupt}");
                exit_code(interrupt.exit_code())
            }
            category => {
                error!("{error:#}");
                exit_code(category.map_or(1, PortwrapError::exit_code))
            }
        },
    }
}

fn run(config: &Config) -> Result<Exit> {
    // Before anything is spawned.
    let registry = CleanupRegistry::new();
    registry::install(Arc::clone(&registry))?;

    let mut orchestrator = Orchestrator::new(config, registry)?;
    orchestrator.run()
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
