//! CLI module for the confweave agent.
//!
//! This module provides the command-line interface for running the agent
//! and inspecting its configuration.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, RunArgs};
pub use output::OutputFormatter;
