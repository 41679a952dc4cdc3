//! Check and reload command execution.
//!
//! Command strings are templates themselves: `{{ src }}` expands to the
//! stage file (for check commands) or the template source, and `{{ dest }}`
//! to the destination.

use std::path::Path;
use std::process::Stdio;

use minijinja::{context, Environment, UndefinedBehavior};
use tokio::process::Command;
use tracing::debug;

/// Command execution result.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Whether the command succeeded.
    pub success: bool,
    /// Command output (stdout).
    pub stdout: String,
    /// Command error output (stderr).
    pub stderr: String,
    /// Exit code if available.
    pub exit_code: Option<i32>,
}

impl CommandResult {
    /// Describes a failed run: exit status plus whatever the command printed.
    #[must_use]
    pub fn describe(&self) -> String {
        let status = self
            .exit_code
            .map_or_else(|| String::from("terminated by signal"), |c| format!("exit status {c}"));

        let output = [self.stderr.trim(), self.stdout.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        if output.is_empty() {
            status
        } else {
            format!("{status}: {output}")
        }
    }
}

/// Expands `{{ src }}` and `{{ dest }}` in a command template.
///
/// # Errors
///
/// Returns an error if the command is not a valid template or names a
/// variable other than `src` and `dest`.
pub fn render_command(template: &str, src: &Path, dest: &Path) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(
        template,
        context! {
            src => src.display().to_string(),
            dest => dest.display().to_string(),
        },
    )
}

/// Runs a command line through `sh -c`.
///
/// # Errors
///
/// Returns an error if the shell cannot be spawned.
pub async fn run_command(command: &str) -> std::io::Result<CommandResult> {
    debug!("Running {command:?}");

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .output()
        .await?;

    let result = CommandResult {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    };

    debug!("{command:?} finished: success={}", result.success);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_command() {
        let cmd = render_command(
            "nginx -t -c {{ src }} && echo {{ dest }}",
            Path::new("/etc/nginx/.nginx.conf.1"),
            Path::new("/etc/nginx/nginx.conf"),
        )
        .expect("render failed");
        assert_eq!(cmd, "nginx -t -c /etc/nginx/.nginx.conf.1 && echo /etc/nginx/nginx.conf");
    }

    #[test]
    fn test_render_command_rejects_unknown_variable() {
        let result = render_command(
            "test -s {{ sorce }}",
            Path::new("/etc/.app.conf.1"),
            Path::new("/etc/app.conf"),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let result = run_command("echo out; echo err >&2; exit 3")
            .await
            .expect("spawn failed");

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.describe(), "exit status 3: err\nout");
    }

    #[tokio::test]
    async fn test_run_command_success() {
        let result = run_command("true").await.expect("spawn failed");
        assert!(result.success);
        assert_eq!(result.describe(), "exit status 0");
    }
}
