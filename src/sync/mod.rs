//! Sync pipeline for template resources.
//!
//! This module provides:
//! - Template rendering against a value snapshot
//! - Stage files and atomic replacement of destinations
//! - Check and reload command execution

mod command;
mod pipeline;
mod render;
mod stage;

pub use command::{render_command, run_command, CommandResult};
pub use pipeline::{SyncOutcome, SyncPipeline, DEFAULT_MODE};
pub use render::{render, render_source};
pub use stage::StageFile;
