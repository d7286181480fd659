use anyhow::Context;
use clap::Parser;
use gaussnet::cli::{Cli, Commands};
use gaussnet::config::NetConfig;
use gaussnet::coordinator::Coordinator;
use gaussnet::coordinator::launcher::{NoopLauncher, ProcessLauncher, WorkerLauncher};
use gaussnet::coordinator::local;
use gaussnet::csv_writer;
use gaussnet::matrix::solve_sequential;
use gaussnet::metrics::NetworkMetrics;
use gaussnet::reporter;
use gaussnet::requester::{self, Requester};
use gaussnet::transport::{Rdt, Transport};
use gaussnet::worker::Worker;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let outcome = match cli.command {
        Commands::Coordinator {
            config,
            worker_exe,
            no_launch,
        } => run_coordinator(config, worker_exe, no_launch).await,
        Commands::Worker { id, config } => run_worker(id, config).await,
        Commands::Submit {
            size,
            workers,
            timeout_ms,
            json,
            quiet,
            csv,
            config,
        } => run_submit(size, workers, timeout_ms, json, quiet, csv, config).await,
        Commands::Local {
            size,
            block_size,
            json,
        } => run_local(size, block_size, json),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// `RUST_LOG` wins over `--log-level`; output goes to stderr
fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Call `stop` on the first Ctrl-C
fn stop_on_ctrl_c(stop: impl FnOnce() + Send + 'static) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            stop();
        }
    });
}

async fn run_coordinator(
    config_path: Option<PathBuf>,
    worker_exe: Option<PathBuf>,
    no_launch: bool,
) -> anyhow::Result<()> {
    let config = NetConfig::load_or_default(config_path.as_deref())?;
    let metrics = Arc::new(NetworkMetrics::new());
    let addr = config.coordinator_addr();
    let rdt = Rdt::bind(addr, &config, Arc::clone(&metrics))
        .await
        .context(format!("Failed to bind coordinator socket at {}", addr))?;

    let launcher: Box<dyn WorkerLauncher> = if no_launch {
        Box::new(NoopLauncher)
    } else if let Some(exe) = worker_exe {
        Box::new(ProcessLauncher::new(exe, config_path))
    } else {
        Box::new(ProcessLauncher::from_current_exe(config_path)?)
    };

    let coordinator = Arc::new(Coordinator::new(config, Arc::new(rdt), launcher, metrics));
    let handle = Arc::clone(&coordinator);
    stop_on_ctrl_c(move || handle.stop());

    coordinator.run().await;
    Ok(())
}

async fn run_worker(id: usize, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = NetConfig::load_or_default(config_path.as_deref())?;
    let metrics = Arc::new(NetworkMetrics::new());
    let addr = config.worker_addr(id);
    let rdt = Rdt::bind(addr, &config, Arc::clone(&metrics))
        .await
        .context(format!("Failed to bind worker {} socket at {}", id, addr))?;

    let worker = Arc::new(Worker::new(id, config, Arc::new(rdt), metrics));
    let handle = Arc::clone(&worker);
    stop_on_ctrl_c(move || handle.stop());

    worker.run().await;
    Ok(())
}

async fn run_submit(
    size: usize,
    workers: usize,
    timeout_ms: Option<u64>,
    json: bool,
    quiet: bool,
    csv_path: Option<String>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = NetConfig::load_or_default(config_path.as_deref())?;
    let metrics = Arc::new(NetworkMetrics::new());
    let rdt = Rdt::bind(
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        &config,
        Arc::clone(&metrics),
    )
    .await
    .context("Failed to bind requester socket")?;
    info!(addr = %rdt.local_addr()?, "requester bound");

    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.solve_timeout());
    let (matrix, vector) = requester::generate_system(size);
    let transport: Arc<dyn Transport> = Arc::new(rdt);
    let result = Requester::new(config, transport)
        .submit(&matrix, &vector, workers, timeout)
        .await;
    metrics.log_summary("requester");
    let result = result?;

    // Output results
    if json {
        reporter::print_json(&result)?;
    } else if !quiet {
        reporter::print_summary(&result)?;
    }

    if let Some(path) = csv_path {
        csv_writer::export_solution_csv(&result, &path)?;
        if !quiet && !json {
            eprintln!("Solution CSV exported to: {}", path);
        }
    }

    Ok(())
}

fn run_local(size: usize, block_size: Option<usize>, json: bool) -> anyhow::Result<()> {
    let config = NetConfig::default();
    let (matrix, vector) = requester::generate_system(size);

    let mut result = local::solve_in_process(&matrix, &vector, block_size, &config)
        .context("In-process solve failed")?;

    let started = Instant::now();
    match solve_sequential(&matrix, &vector) {
        Ok(_) => result.sequential_ms = Some(started.elapsed().as_millis() as u64),
        Err(e) => warn!(error = %e, "sequential baseline failed"),
    }

    if json {
        reporter::print_json(&result)?;
    } else {
        reporter::print_summary(&result)?;
    }
    Ok(())
}
