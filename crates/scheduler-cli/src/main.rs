//! `scheduler` — command-line front end for `scheduler-core`.
//!
//! There is no resident daemon or IPC surface in this exercise, so the
//! subcommands that would mutate a *running* scheduler in a client/server
//! deployment (`lockScheduler`, `addTrigger`, `stopJob`, ...) are instead
//! exposed as behavior of the one long-lived `start` invocation: flags
//! that shape the single process's run rather than separate calls against
//! an already-running instance. See DESIGN.md for the full rationale.

mod config;
mod descriptor_watcher;
mod jobs;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use descriptor_watcher::DescriptorWatcher;
use scheduler_core::Scheduler;

#[derive(Parser)]
#[command(name = "scheduler", about = "weave — in-process job scheduler")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "scheduler.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a descriptor, start the scheduler, and run until killed.
    Start {
        /// Descriptor file to install at startup (overrides the config's
        /// `descriptor_path`).
        #[arg(long)]
        descriptor: Option<PathBuf>,
        /// Start paused; fires nothing until unlocked through the
        /// embedded API.
        #[arg(long)]
        locked: bool,
        /// Run for this many seconds then shut down cleanly, instead of
        /// running until the process is killed. Mainly useful for demos
        /// and integration tests.
        #[arg(long)]
        run_for_secs: Option<u64>,
    },
    /// Parse and validate a descriptor file without running anything.
    Validate {
        descriptor: PathBuf,
    },
    /// List the built-in job types a descriptor's `type` field can name.
    ListJobTypes,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            descriptor,
            locked,
            run_for_secs,
        } => run_start(&cli.config, descriptor, locked, run_for_secs),
        Commands::Validate { descriptor } => run_validate(&descriptor),
        Commands::ListJobTypes => {
            println!("log   - logs its context data and succeeds");
            println!("shell - runs the 'command' context value as a shell command");
            Ok(())
        }
    }
}

fn run_start(
    config_path: &std::path::Path,
    descriptor_override: Option<PathBuf>,
    locked: bool,
    run_for_secs: Option<u64>,
) -> anyhow::Result<()> {
    let config = config::load_config(config_path)?;
    let descriptor_path = descriptor_override.or(config.descriptor_path.clone());

    let scheduler = Arc::new(
        Scheduler::builder()
            .with_worker_pool_size(config.worker_pool_size)
            .with_misfire_threshold_seconds(config.misfire_threshold_seconds)
            .start_locked(locked)
            .build(),
    );
    let registry = jobs::builtin_registry();

    if let Some(path) = &descriptor_path {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read descriptor '{}': {e}", path.display()))?;
        let installed = scheduler
            .load_descriptor(&yaml, &registry)
            .map_err(|e| anyhow::anyhow!("failed to load descriptor '{}': {e}", path.display()))?;
        tracing::info!(path = %path.display(), installed, "descriptor loaded");
    }

    let _watcher = if config.hot_reload {
        let Some(path) = descriptor_path.clone() else {
            anyhow::bail!("hot_reload is enabled but no descriptor_path was configured");
        };
        let watcher_scheduler = scheduler.clone();
        let watcher_registry = registry.clone();
        Some(DescriptorWatcher::start(
            path,
            config.hot_reload_debounce_ms,
            move |yaml| match watcher_scheduler.load_descriptor(&yaml, &watcher_registry) {
                Ok(installed) => {
                    tracing::info!(installed, "descriptor hot-reloaded");
                }
                Err(e) => {
                    // Reload replaces existing jobs/triggers in place, so
                    // an error here is a real problem with the edited
                    // file (bad YAML, unknown job type, a trigger
                    // pointing at a job that no longer exists) — not a
                    // steady-state identity collision. The previous
                    // descriptor stays installed.
                    tracing::warn!(error = %e, "descriptor reload failed; keeping previous descriptor");
                }
            },
        )?)
    } else {
        None
    };

    scheduler.start();
    tracing::info!("scheduler started");

    match run_for_secs {
        Some(secs) => std::thread::sleep(Duration::from_secs(secs)),
        None => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },
    }

    scheduler.shutdown(true);
    tracing::info!("scheduler shut down");
    Ok(())
}

fn run_validate(descriptor: &std::path::Path) -> anyhow::Result<()> {
    let yaml = std::fs::read_to_string(descriptor)
        .map_err(|e| anyhow::anyhow!("failed to read descriptor '{}': {e}", descriptor.display()))?;
    let registry = jobs::builtin_registry();
    let store = scheduler_core::store::JobStore::new();
    let installed = scheduler_core::loader::load_descriptor(&yaml, &registry, &store)
        .map_err(|e| anyhow::anyhow!("descriptor is invalid: {e}"))?;
    println!(
        "valid: {} job(s), {} trigger(s)",
        store.all_job_identities().len(),
        installed - store.all_job_identities().len()
    );
    Ok(())
}
