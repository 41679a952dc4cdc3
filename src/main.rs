//! confweave CLI entrypoint.
//!
//! This is the main entrypoint for the confweave agent.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use confweave::backend::new_store_client;
use confweave::cli::{Cli, Commands, LogFormat, OutputFormatter, RunArgs};
use confweave::config::{AgentConfig, ConfigParser, ConfigValidator, ScheduleMode};
use confweave::error::{ConfigError, Result};
use confweave::resource::{Decryptor, ResourceLoader, ResourceSummary};
use confweave::scheduler::Coordinator;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, &cli.log_level, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error [{}]: {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. Logs go to stderr; stdout carries
/// command output.
fn init_logging(verbose: bool, level: &str, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Run(args) => cmd_run(cli.config.as_ref(), &args, &formatter).await,
        Commands::Validate => cmd_validate(cli.config.as_ref(), &formatter),
        Commands::Resources => cmd_resources(cli.config.as_ref(), &formatter),
        Commands::Encrypt { value } => cmd_encrypt(cli.config.as_ref(), &value, &formatter),
    }
}

/// Loads the agent configuration.
fn load_config(path: Option<&PathBuf>) -> Result<AgentConfig> {
    let config = ConfigParser::load(path.map(PathBuf::as_path))?;
    debug!("Backend {}, mode {}", config.backend.name, config.mode);
    Ok(config)
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", output.trim_end())?;
    Ok(())
}

/// Start the agent.
async fn cmd_run(
    config_path: Option<&PathBuf>,
    args: &RunArgs,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    args.apply(&mut config);

    let validation = ConfigValidator::new().validate(&config)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    let client = new_store_client(&config.backend)?;
    let report = ResourceLoader::from_config(&config)?.load()?;
    if report.skipped > 0 {
        warn!("{} resource definition(s) skipped", report.skipped);
    }

    info!(
        "Starting confweave: mode {}, {} resource(s), backend {}",
        config.mode,
        report.resources.len(),
        client.backend_type()
    );

    let coordinator = Coordinator::new(&config, client, report.resources)?;
    let summary = coordinator.run().await?;

    match summary {
        Some(summary) if config.mode == ScheduleMode::Onetime => {
            emit(&formatter.format_pass(&summary))?;
            Ok(if summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        _ => {
            info!("confweave stopped");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Validate the configuration and the resource definitions.
fn cmd_validate(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let result = ConfigValidator::new().check(&config);

    let report = match ResourceLoader::from_config(&config).and_then(|loader| loader.load()) {
        Ok(report) => report,
        Err(e) => {
            emit(&formatter.error(&e.to_string()))?;
            return Ok(ExitCode::FAILURE);
        }
    };

    emit(&formatter.format_validation(&result, report.resources.len(), report.skipped))?;

    if let Some(last) = &report.last_error {
        emit(&formatter.warning(&format!("Last skipped definition: {last}")))?;
    }

    Ok(if result.errors.is_empty() && report.skipped == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// List the template resources.
fn cmd_resources(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let report = ResourceLoader::from_config(&config)?.load()?;

    let summaries: Vec<ResourceSummary> =
        report.resources.iter().map(ResourceSummary::from).collect();
    emit(&formatter.format_resources(&summaries, report.skipped))?;

    Ok(ExitCode::SUCCESS)
}

/// Encrypt a value for the decrypting template functions.
fn cmd_encrypt(
    config_path: Option<&PathBuf>,
    value: &str,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config = load_config(config_path)?;

    let keyring = config.secret_keyring.as_ref().ok_or_else(|| {
        ConfigError::validation("a keyring is required to encrypt values", "secret_keyring")
    })?;
    let decryptor = Decryptor::from_keyring(keyring)?;

    emit(&formatter.format_encrypted(&decryptor.encrypt(value)?))?;
    Ok(ExitCode::SUCCESS)
}
