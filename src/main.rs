//! fleet-agent CLI entry point.
//!
//! `run` supervises the applications described by a bundle file until
//! interrupted; `policy` loads the device policy once and prints it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use fleet_agent::config;
use fleet_agent::engine::docker::DockerEngine;
use fleet_agent::logging;
use fleet_agent::models::Bundle;
use fleet_agent::supervisor::{
    ContainerSupervisorFactory, LogReportSink, Supervisor, SupervisorDeps,
};
use fleet_agent::validator::{CustomCommandsValidator, Validator};
use fleet_agent::variables::{FsVariables, PolicySnapshot, Variables};

/// fleet-agent: keeps this device's containers in line with its bundle.
#[derive(Parser)]
#[command(name = "fleet-agent", version, about)]
struct Cli {
    /// Config file (default: ~/.fleet-agent/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Supervise the applications in a bundle file until Ctrl-C.
    Run {
        /// JSON bundle file, re-read and applied on every GC interval.
        #[arg(long)]
        bundle: PathBuf,
    },
    /// Load the device policy once and print it.
    Policy {
        /// Policy directory (overrides the configured one).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config::config_dir()?.join("config.toml"),
    };

    match cli.command {
        Command::Run { bundle } => handle_run(&config_path, &bundle).await,
        Command::Policy { dir } => handle_policy(&config_path, dir),
    }
}

/// Run the supervisor against a bundle file.
async fn handle_run(config_path: &Path, bundle_path: &Path) -> anyhow::Result<()> {
    let config = config::load_or_default(config_path)?;
    let _logging_guard = logging::init_daemon(&config.logs_dir()?, &config.logging)?;

    let variables_dir = config.variables_dir()?;
    std::fs::create_dir_all(&variables_dir)
        .with_context(|| format!("failed to create {}", variables_dir.display()))?;
    let variables = FsVariables::with_poll_interval(variables_dir, config.variables.poll_interval());
    variables
        .start()
        .context("failed to start policy store")?;

    let engine = DockerEngine::connect(config.engine.stop_timeout_secs)
        .context("failed to connect to docker")?;
    if !engine.available().await {
        warn!("docker daemon not responding, continuing");
    }

    let policy: Arc<dyn Variables> = variables.clone();
    let validators: Vec<Arc<dyn Validator>> = vec![Arc::new(CustomCommandsValidator::new(
        Arc::clone(&policy),
    ))];
    let supervisor = Supervisor::with_factory(
        SupervisorDeps {
            engine: Arc::new(engine),
            variables: policy,
            sink: Arc::new(LogReportSink),
            validators,
        },
        config.supervisor.clone(),
        Arc::new(ContainerSupervisorFactory::new(config.application.clone())),
    );

    info!(
        config = %config_path.display(),
        bundle = %bundle_path.display(),
        policy = %variables.dir().display(),
        "fleet-agent started"
    );

    let mut current: Option<Bundle> = None;
    let mut interval = tokio::time::interval(config.supervisor.gc_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => match read_bundle(bundle_path) {
                Ok(bundle) => {
                    if current.as_ref() != Some(&bundle) {
                        info!(
                            applications = bundle.applications.len(),
                            desired_agent_version = %bundle.desired_agent_version,
                            "applying bundle"
                        );
                    }
                    // Pushed every tick; unchanged state is a no-op downstream.
                    supervisor.set(&bundle, &bundle.applications);
                    current = Some(bundle);
                }
                Err(e) => warn!(error = %e, "failed to read bundle"),
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }

    supervisor.shutdown();
    supervisor.join().await;
    variables.stop();
    info!("fleet-agent stopped");
    Ok(())
}

fn read_bundle(path: &Path) -> anyhow::Result<Bundle> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bundle at {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("invalid bundle at {}", path.display()))
}

/// Refresh the policy store once and print every field.
fn handle_policy(config_path: &Path, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let config = config::load_or_default(config_path)?;
    logging::init_cli(&config.logging.level);
    let dir = match dir {
        Some(dir) => dir,
        None => config.variables_dir()?,
    };

    let variables = FsVariables::new(dir);
    let errors = variables.refresh();
    print_snapshot(variables.dir(), &variables.snapshot());

    anyhow::ensure!(
        errors.is_empty(),
        "{} policy field(s) failed to load",
        errors.len()
    );
    Ok(())
}

fn print_snapshot(dir: &Path, snapshot: &PolicySnapshot) {
    fn flag(value: Option<bool>) -> String {
        value.map_or_else(|| "unavailable".to_owned(), |v| v.to_string())
    }
    fn presence(value: Option<&String>) -> &'static str {
        match value {
            Some(v) if !v.is_empty() => "set",
            Some(_) => "unset",
            None => "unavailable",
        }
    }

    println!("policy directory: {}", dir.display());
    println!("disable-ssh: {}", flag(snapshot.disable_ssh));
    match &snapshot.authorized_ssh_keys {
        Some(keys) => {
            println!("authorized-ssh-keys: {}", keys.len());
            for key in keys {
                println!("  {} {} {}", key.algorithm(), key.fingerprint(), key.comment());
            }
        }
        None => println!("authorized-ssh-keys: unavailable"),
    }
    println!(
        "host-signer-key: {}",
        presence(snapshot.host_signer_key.as_ref())
    );
    println!("registry-auth: {}", presence(snapshot.registry_auth.as_ref()));
    match &snapshot.whitelisted_images {
        Some(images) => {
            println!("whitelisted-images: {}", images.len());
            for image in images {
                println!("  {image}");
            }
        }
        None => println!("whitelisted-images: unavailable"),
    }
    println!(
        "disable-custom-commands: {}",
        flag(snapshot.disable_custom_commands)
    );
}
