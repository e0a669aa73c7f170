pub mod cli;
pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod firewall;
pub mod services;

#[cfg(test)]
mod test_support;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in onionwall: {info}");
        default_hook(info);
    }));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(cli.log_level.as_deref().unwrap_or("onionwall_lib=info"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli::dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!("Command failed: {}", serde_json::to_string(&e).unwrap_or_default());
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
