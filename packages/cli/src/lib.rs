// ABOUTME: DockFormer process entry point: configuration, logging and commands
// ABOUTME: The binary in src/bin is a thin clap wrapper over these functions

pub mod commands;
pub mod config;
pub mod logging;
pub mod server;

pub use config::{Config, ConfigError, RuntimeKind};
pub use server::run_server;

#[cfg(test)]
mod tests;
