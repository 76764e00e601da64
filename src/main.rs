//! netrecon - network state reconciliation for hypervisor nodes
//!
//! Watches the node's domain document and keeps network namespaces, NAT and
//! `iptables` rules in line with it.
//!
//! # Usage
//!
//! ```bash
//! netrecon                       # Same as `netrecon watch`
//! netrecon watch                 # Reconcile every interval until Ctrl-C
//! netrecon apply                 # Run one pass with recovery
//! netrecon apply --no-recover    # Run one pass, report failures only
//! netrecon plan                  # Show what a pass would do
//! netrecon status                # Show the persisted applied state
//! netrecon namespaces            # List network namespaces
//! netrecon version               # Build information
//! ```

use clap::{Parser, Subcommand};
use netrecon::audit::AuditLog;
use netrecon::config::{self, AppConfig};
use netrecon::core::desired::DomainSource;
use netrecon::core::kernel::{IptablesKernel, Kernel};
use netrecon::core::plan;
use netrecon::core::reconciler::{Reconciler, ReconcilerOptions};
use netrecon::core::store::SnapshotStore;
use netrecon::core::update::{PassReport, Residual};
use netrecon::init::{self, Startup};
use netrecon::watcher::{FileSource, Watcher};
use netrecon::StateSnapshot;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

shadow_rs::shadow!(build);

/// Exit status of a pass that left failed namespaces behind
const EXIT_PARTIAL: u8 = 2;

#[derive(Parser)]
#[command(name = "netrecon")]
#[command(about = "Network state reconciliation for hypervisor nodes", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Domain document (default: <config dir>/domain.json)
    #[arg(long, global = true, value_name = "PATH")]
    domain: Option<PathBuf>,
    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile periodically until interrupted
    Watch,
    /// Run a single reconciliation pass
    Apply {
        /// Do not run node recovery or reload after failures
        #[arg(long)]
        no_recover: bool,
        /// Print the pass report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the operations a pass would run, without running them
    Plan,
    /// Show the persisted applied state and recent audit events
    Status {
        /// Number of audit events to show
        #[arg(short, long, default_value_t = 10)]
        events: usize,
    },
    /// List network namespaces on this host
    Namespaces,
    /// Show build information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    let file = log_file.map(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
    });

    match file {
        Some(Ok(file)) => subscriber.with_ansi(false).with_writer(file).init(),
        Some(Err(e)) => {
            subscriber.with_writer(std::io::stderr).init();
            warn!("Cannot open log file, logging to stderr: {e}");
        }
        None => subscriber.with_writer(std::io::stderr).init(),
    }
}

async fn handle_cli(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let command = cli.command.unwrap_or(Commands::Watch);

    match command {
        Commands::Watch => {
            let startup = init::run_startup(cli.config).await?;
            let reconciler = build_reconciler(&startup, domain_path(cli.domain)?);
            let watcher = Watcher::new(Arc::new(reconciler), startup.config.watch_interval());

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let handle = tokio::spawn(async move { watcher.run(shutdown_rx).await });

            shutdown_signal().await;
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
            handle.await?;
        }
        Commands::Apply { no_recover, json } => {
            let startup = init::run_startup(cli.config).await?;
            let reconciler = build_reconciler(&startup, domain_path(cli.domain)?);

            let namespaces = reconciler.kernel().list_namespaces().await?;
            let data = reconciler.source().load().await?;
            let report = if no_recover {
                reconciler.update_state(&data, namespaces).await
            } else {
                reconciler.update_state_recover(&data, namespaces).await
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            if !report.is_clean() {
                return Ok(ExitCode::from(EXIT_PARTIAL));
            }
        }
        Commands::Plan => {
            let config = load_config(cli.config).await?;
            let (current, residual) = if config.persist_state {
                SnapshotStore::from_state_dir()?.load_or_empty().await
            } else {
                (StateSnapshot::empty(), Residual::new())
            };

            let data = FileSource::new(domain_path(cli.domain)?).load().await?;
            let desired = data.desired_state(&config.host_interface);

            let kernel = IptablesKernel::new(config.kernel_config());
            let namespaces = match kernel.list_namespaces().await {
                Ok(namespaces) => namespaces,
                Err(e) => {
                    warn!("Cannot list namespaces, assuming those in the applied state: {e}");
                    current.namespaces().into_iter().map(String::from).collect()
                }
            };

            let plan = plan::plan(
                &current,
                &residual,
                &desired,
                namespaces,
                &config.host_interface,
            )
            .await;

            if plan.is_noop() {
                println!("Nothing to do: {} interfaces up to date.", plan.report.unchanged);
            } else {
                println!("Operations:");
                for op in &plan.ops {
                    println!("  {op}");
                }
                println!();
                print!("{}", plan.diff);
            }
        }
        Commands::Status { events } => {
            let config = load_config(cli.config).await?;
            let store = SnapshotStore::from_state_dir()?;
            match store.load().await {
                Ok(stored) => {
                    println!("Applied state: {}", store.path().display());
                    println!("Saved at: {}", stored.saved_at);
                    println!("Interfaces: {}", stored.snapshot.len());
                    println!("Namespaces: {}", stored.snapshot.namespaces().len());
                    if !stored.residual.is_empty() {
                        let failed: Vec<&str> =
                            stored.residual.keys().map(String::as_str).collect();
                        println!("Pending re-apply: {}", failed.join(", "));
                    }
                    if let Ok(checksum) = tokio::fs::read_to_string(store.checksum_path()).await {
                        println!("Checksum: {}", checksum.trim());
                    }
                }
                Err(e) => println!("Applied state unavailable: {e}"),
            }
            println!("Host interface: {}", config.host_interface);

            if config.audit_enabled
                && let Ok(audit) = AuditLog::new()
                && let Ok(recent) = audit.read_recent(events).await
            {
                println!();
                println!("Recent events:");
                for event in recent {
                    let status = if event.success { "ok" } else { "FAILED" };
                    println!(
                        "  {} {:?} {status}{}",
                        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        event.event_type,
                        event.error.map(|e| format!(": {e}")).unwrap_or_default()
                    );
                }
            }
        }
        Commands::Namespaces => {
            let config = load_config(cli.config).await?;
            let kernel = IptablesKernel::new(config.kernel_config());
            for namespace in kernel.list_namespaces().await? {
                println!("{namespace}");
            }
        }
        Commands::Version => {
            println!("netrecon {}", build::PKG_VERSION);
            println!("commit: {}", build::SHORT_COMMIT);
            println!("dirty: {}", !build::GIT_CLEAN);
            println!("built: {}", build::BUILD_TIME);
            println!("rustc: {}", build::RUST_VERSION);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn load_config(path: Option<PathBuf>) -> netrecon::Result<AppConfig> {
    let path = path
        .or_else(config::default_config_path)
        .ok_or_else(|| netrecon::Error::Init("no config directory available".to_string()))?;
    config::load_config(&path).await
}

fn domain_path(path: Option<PathBuf>) -> netrecon::Result<PathBuf> {
    path.or_else(|| netrecon::utils::get_config_dir().map(|dir| dir.join("domain.json")))
        .ok_or_else(|| netrecon::Error::Init("no config directory available".to_string()))
}

fn build_reconciler(startup: &Startup, domain: PathBuf) -> Reconciler<IptablesKernel, FileSource> {
    let config = &startup.config;
    let mut reconciler = Reconciler::new(
        Arc::new(IptablesKernel::new(config.kernel_config())),
        Arc::new(FileSource::new(domain)),
        ReconcilerOptions::from(config),
    )
    .with_initial_state(startup.initial_state.clone())
    .with_residual(startup.residual.clone());

    if config.persist_state {
        match SnapshotStore::from_state_dir() {
            Ok(store) => reconciler = reconciler.with_store(store),
            Err(e) => warn!("Applied state will not be persisted: {e}"),
        }
    }

    if config.audit_enabled {
        match AuditLog::new() {
            Ok(audit) => reconciler = reconciler.with_audit(audit),
            Err(e) => warn!("Audit log disabled: {e}"),
        }
    }

    reconciler
}

fn print_report(report: &PassReport) {
    println!(
        "Applied: {}, removed: {}, unchanged: {}, NAT updated: {}",
        report.applied, report.removed, report.unchanged, report.nat_updated
    );
    if report.is_clean() {
        println!("✓ All namespaces reconciled.");
    } else {
        let failed: Vec<&str> = report.failed.iter().map(String::as_str).collect();
        println!("✗ Failed namespaces: {}", failed.join(", "));
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C, stopping: {e}");
    }
}
