//! server-setup - Entry point
//!
//! Parses CLI arguments, sets up logging to stderr and to the run log,
//! loads the settings document and drives one provisioning run.

use std::fs::File;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use owo_colors::OwoColorize;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use server_setup::config::{Args, Config};
use server_setup::error::{Result, SetupError};
use server_setup::firewall;
use server_setup::keys::LocalKeyPair;
use server_setup::orchestrator::{Orchestrator, RunReport};
use server_setup::progress::Progress;
use server_setup::settings::{Settings, SettingsLoad};
use server_setup::ssh::{CommandRunner, RusshConnector};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("{}", e);
        return ExitCode::from(e.exit_code());
    }

    let mut progress = if config.quiet {
        Progress::hidden()
    } else {
        Progress::stdout()
    };

    match run(&config, &mut progress).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Log to stderr (warnings by default, debug with `--verbose`, `RUST_LOG`
/// wins) and everything from debug up to `<instance>/setup.log`.
fn init_logging(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.instance_dir)?;
    let log_file = File::create(config.log_path())?;

    let default_level = if config.verbose { "debug" } else { "warn" };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(log_file))
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SetupError::config(format!("logging already initialised: {}", e)))
}

async fn run(config: &Config, progress: &mut Progress) -> Result<()> {
    progress.line(&format!("{}", "Linux Server Setup".bold()));
    info!("server-setup v{} starting", env!("CARGO_PKG_VERSION"));

    let settings = match Settings::load_or_write_template(&config.settings_path)? {
        SettingsLoad::Loaded(settings) => settings,
        SettingsLoad::TemplateWritten(path) => {
            progress.line(&format!(
                "No settings found. A template was written to {}",
                path.display()
            ));
            progress.line("Fill in the host address and admin credentials, then run again.");
            return Ok(());
        }
    };
    info!(
        "Target {}@{}, ports {:?}",
        settings.host.admin_user,
        settings.host.ip_address,
        settings.sshd_config.candidate_ports()
    );

    let template = firewall::load_template(config.firewall_template.as_deref())?;
    let connector = RusshConnector::new();
    let reporter = std::mem::replace(progress, Progress::hidden());

    let report = Orchestrator::new(
        &settings,
        &connector,
        LocalKeyPair::new(&config.key_path),
        CommandRunner::new(config.command_timeout),
    )
    .with_template(template)
    .with_instance_dir(&config.instance_dir)
    .with_progress(reporter)
    .run()
    .await?;

    print_report(&report, config.quiet);
    Ok(())
}

fn print_report(report: &RunReport, quiet: bool) {
    for failure in report.failures() {
        eprintln!("{} {}", "warning:".yellow().bold(), failure);
    }
    if quiet {
        return;
    }

    let mut out = Progress::stdout();
    out.line(&format!(
        "Host ready on port {} ({} authentication{})",
        report.port,
        report.method,
        if report.hardened { ", hardened this run" } else { "" }
    ));
    for app in &report.apps {
        let status = if app.installed() {
            format!("{}", "installed".green())
        } else {
            format!("{}", "failed".red())
        };
        out.line(&format!("  {:<20} {}", app.name, status));
    }
}
