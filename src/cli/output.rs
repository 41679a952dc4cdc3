//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::resource::ResourceSummary;
use crate::scheduler::PassSummary;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Source")]
    src: String,
    #[tabled(rename = "Destination")]
    dest: String,
    #[tabled(rename = "Keys")]
    keys: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Owner")]
    owner: String,
    #[tabled(rename = "Reload")]
    reload: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the loaded resources.
    #[must_use]
    pub fn format_resources(&self, resources: &[ResourceSummary], skipped: usize) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "resources": resources,
                    "skipped": skipped,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_resources_text(resources, skipped),
        }
    }

    fn format_resources_text(resources: &[ResourceSummary], skipped: usize) -> String {
        let mut output = String::new();

        if resources.is_empty() {
            output.push_str("No template resources found.\n");
        } else {
            let rows: Vec<ResourceRow> = resources
                .iter()
                .map(|r| ResourceRow {
                    src: Self::truncate(&r.src.display().to_string(), 40),
                    dest: r.dest.display().to_string(),
                    keys: r.keys.join(", "),
                    mode: r.mode.clone().unwrap_or_else(|| String::from("inherit")),
                    owner: format!("{}:{}", r.uid, r.gid),
                    reload: r
                        .reload_cmd
                        .as_deref()
                        .map_or_else(|| "-".dimmed().to_string(), |c| Self::truncate(c, 30)),
                })
                .collect();

            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if skipped > 0 {
            let _ = writeln!(
                output,
                "{} {skipped} definition(s) skipped, see the log for details",
                "⚠".yellow()
            );
        }

        output
    }

    /// Formats the result of a pass.
    #[must_use]
    pub fn format_pass(&self, summary: &PassSummary) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(summary).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if summary.is_success() {
                    format!("{} Pass complete: {} resource(s)", "✓".green(), summary.total())
                } else {
                    format!("{} Pass finished with failures", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Applied: {}", summary.applied.to_string().green());
                let _ = writeln!(output, "   Unchanged: {}", summary.unchanged);
                let _ = writeln!(output, "   Dry run: {}", summary.dry_run.to_string().yellow());
                let _ = writeln!(output, "   Failed: {}", summary.failed.to_string().red());

                if !summary.failures.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for failure in &summary.failures {
                        let _ = writeln!(output, "   - {failure}");
                    }
                }

                output
            }
        }
    }

    /// Formats configuration findings together with the resource count.
    #[must_use]
    pub fn format_validation(
        &self,
        result: &ValidationResult,
        loaded: usize,
        skipped: usize,
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let errors: Vec<_> = result
                    .errors
                    .iter()
                    .map(|e| serde_json::json!({ "field": e.field, "message": e.message }))
                    .collect();
                let json = serde_json::json!({
                    "valid": result.errors.is_empty() && skipped == 0,
                    "errors": errors,
                    "warnings": result.warnings,
                    "resources": loaded,
                    "skipped": skipped,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();

                if result.errors.is_empty() && skipped == 0 {
                    let _ = writeln!(output, "{} Configuration is valid", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration has errors", "✗".red());
                }

                for error in &result.errors {
                    let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                }

                if !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = write!(output, "\nResources: {loaded} loaded, {skipped} skipped\n");
                output
            }
        }
    }

    /// Formats an encrypted value.
    #[must_use]
    pub fn format_encrypted(&self, value: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "value": value });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => value.to_string(),
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.status_line("success", &"✓".green().to_string(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.status_line("error", &"✗".red().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.status_line("warning", &"⚠".yellow().to_string(), message)
    }

    fn status_line(&self, status: &str, marker: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{marker} {message}"),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}
