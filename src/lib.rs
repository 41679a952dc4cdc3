// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # confweave
//!
//! A configuration templating agent: it renders local files from values held
//! in a key-value store and reloads the owning service when they change.
//!
//! ## Overview
//!
//! Each **template resource** binds one template source to one destination
//! file and a set of backend keys. On every cycle the agent:
//!
//! 1. Fetches the resource's keys into a snapshot
//! 2. Renders the template against the snapshot
//! 3. Stages the output next to the destination and compares it
//! 4. Runs the check command, atomically replaces the destination, and runs
//!    the reload command
//!
//! Cycles run on a fixed interval, once, or whenever the backend reports a
//! change under a resource's keys.
//!
//! ## Modules
//!
//! - [`backend`]: Key-value store clients (etcd, files, environment)
//! - [`config`]: Agent configuration parsing and validation
//! - [`resource`]: Resource definitions, snapshots and template functions
//! - [`sync`]: The render, stage, check, apply and reload pipeline
//! - [`reconciler`]: Per-resource watch loop
//! - [`scheduler`]: Scheduling modes, shutdown and error reporting
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```toml
//! [template]
//! src = "nginx.conf.tmpl"
//! dest = "/etc/nginx/nginx.conf"
//! keys = ["/nginx"]
//! mode = "0644"
//! check_cmd = "nginx -t -c {{ src }}"
//! reload_cmd = "systemctl reload nginx"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod resource;
pub mod scheduler;
pub mod sync;

// ============================================================================
// Re-exports
// ============================================================================

pub use backend::{new_store_client, StoreClient};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{AgentConfig, ConfigParser, ConfigValidator, ScheduleMode};
pub use error::{ConfweaveError, Result};
pub use reconciler::{Reconciler, ReconcilerState};
pub use resource::{Resource, ResourceLoader, Snapshot};
pub use scheduler::{Coordinator, PassSummary};
pub use sync::{SyncOutcome, SyncPipeline};
