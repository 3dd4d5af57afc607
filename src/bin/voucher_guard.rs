//! CLI binary for voucher-guard.
//!
//! Drives a single local session: validate a credential, run a single pass,
//! or watch until Ctrl-C and then write the final artifacts.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use voucher_guard::events::EventReceiver;
use voucher_guard::scheduler::Artifacts;
use voucher_guard::{GuardConfig, GuardService, SessionId, WatchEvent, WatchEventKind};

/// voucher-guard: probe voucher codes against the remote cart endpoint.
#[derive(Parser)]
#[command(name = "voucher-guard", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging and per-code verdict logs.
    #[arg(long)]
    debug: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Check that a credential is accepted by the endpoint.
    Validate {
        /// File holding the cookie header or a JSON cookie export.
        #[arg(long)]
        credential: PathBuf,
    },

    /// Run a single pass over a code list.
    Check {
        /// File holding the cookie header or a JSON cookie export.
        #[arg(long)]
        credential: PathBuf,
        /// File with one code per line.
        #[arg(long)]
        codes: PathBuf,
        /// Directory for accepted.txt / rejected.txt.
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Watch a code list until Ctrl-C, then run a final pass.
    Watch {
        /// File holding the cookie header or a JSON cookie export.
        #[arg(long)]
        credential: PathBuf,
        /// File with one code per line.
        #[arg(long)]
        codes: PathBuf,
        /// Directory for accepted.txt / rejected.txt.
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "voucher_guard=debug,reqwest=warn"
    } else {
        "voucher_guard=info,reqwest=warn"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(GuardConfig::default_config_path);

    if let Command::InitConfig { force } = cli.command {
        return init_config(&config_path, force);
    }

    let mut config = load_config(cli.config.as_deref(), &config_path)?;
    config.apply_env_overrides();
    if cli.debug {
        config.debug_verdicts = true;
    }

    let (service, events) = GuardService::from_config(config).context("invalid configuration")?;
    let id = SessionId::from("cli");

    match cli.command {
        Command::Validate { credential } => {
            let check = service
                .set_credential(&id, &read_input(&credential)?)
                .await?;
            println!("credential ok: {}", check.message);
            Ok(())
        }
        Command::Check {
            credential,
            codes,
            out_dir,
        } => run_check(&service, events, &id, &credential, &codes, out_dir).await,
        Command::Watch {
            credential,
            codes,
            out_dir,
        } => run_watch(&service, events, &id, &credential, &codes, &out_dir).await,
        Command::InitConfig { .. } => Ok(()),
    }
}

fn load_config(explicit: Option<&Path>, path: &Path) -> anyhow::Result<GuardConfig> {
    if explicit.is_some() || path.exists() {
        GuardConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))
    } else {
        Ok(GuardConfig::default())
    }
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    GuardConfig::default().save_to_file(path)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn run_check(
    service: &GuardService,
    mut events: EventReceiver,
    id: &SessionId,
    credential: &Path,
    codes: &Path,
    out_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    service
        .set_credential(id, &read_input(credential)?)
        .await?;
    let codes = service.submit_codes(id, &read_input(codes)?)?;
    let outcome = service.check_once(id, &codes).await?;

    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }

    if let Some(dir) = out_dir {
        write_artifacts(&Artifacts::from(&outcome), &dir)?;
    }
    Ok(())
}

async fn run_watch(
    service: &GuardService,
    mut events: EventReceiver,
    id: &SessionId,
    credential: &Path,
    codes: &Path,
    out_dir: &Path,
) -> anyhow::Result<()> {
    service
        .set_credential(id, &read_input(credential)?)
        .await?;
    let codes = service.submit_codes(id, &read_input(codes)?)?;
    service.start_watch(id)?;
    println!(
        "watching {} codes every {}s; press Ctrl-C to stop",
        codes.len(),
        service.config().watch.interval_secs
    );

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut stopping = false;
    loop {
        tokio::select! {
            signal = &mut ctrl_c, if !stopping => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("stop requested, running final pass");
                println!("stopping: running one final pass...");
                service.cancel_watch(id)?;
                stopping = true;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("event stream closed unexpectedly");
                };
                print_event(&event);
                if let WatchEventKind::Stopped(report) = event.kind {
                    write_artifacts(&report.artifacts(), out_dir)?;
                    return Ok(());
                }
            }
        }
    }
}

fn write_artifacts(artifacts: &Artifacts, dir: &Path) -> anyhow::Result<()> {
    let (accepted, rejected) = artifacts
        .write_to_dir(dir)
        .with_context(|| format!("failed to write artifacts to {}", dir.display()))?;
    println!(
        "wrote {} accepted to {} and {} rejected to {}",
        artifacts.accepted.len(),
        accepted.display(),
        artifacts.rejected.len(),
        rejected.display()
    );
    Ok(())
}

fn print_event(event: &WatchEvent) {
    match &event.kind {
        WatchEventKind::Progress(p) => println!(
            "progress {}/{}: {} accepted, {} rejected",
            p.processed, p.total, p.accepted, p.rejected
        ),
        WatchEventKind::CycleCompleted(report) => println!(
            "cycle {} done at {}: {} accepted, {} rejected; next run {}",
            report.cycle,
            report.timestamp.format("%H:%M:%S"),
            report.accepted_count,
            report.rejected_count,
            report.next_run_at.format("%H:%M:%S")
        ),
        WatchEventKind::AuthSuspect {
            cycle,
            auth_error_count,
        } => println!(
            "warning: {auth_error_count} authentication error(s) in cycle {cycle}; refresh the credential"
        ),
        WatchEventKind::IterationError {
            message, retry_at, ..
        } => println!("error: {message}; retrying at {}", retry_at.format("%H:%M:%S")),
        WatchEventKind::Stopped(report) => {
            println!("{}", report.message);
            if let Some(error) = &report.error {
                println!("final pass error: {error}");
            }
        }
        WatchEventKind::CheckFinished(outcome) => {
            println!(
                "check done: {} accepted, {} rejected",
                outcome.accepted.len(),
                outcome.rejected.len()
            );
            if outcome.auth_suspect() {
                println!(
                    "warning: {} authentication error(s); refresh the credential",
                    outcome.auth_error_count
                );
            }
        }
    }
}
