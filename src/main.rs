mod cli;
mod config;
mod error;
mod events;
mod group;
mod http;
mod interfaces;
mod memory_guard;
mod ports;
mod process;
mod scheduler;

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use events::EventBus;
use interfaces::{SysinfoProbe, UnsupportedConfigProducer};
use scheduler::Scheduler;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

fn init_tracing(cli_override: Option<&str>, config_log_level: &str) {
    // `LLAMAPOOL_LOG` is parsed the same way as `RUST_LOG`; a bare
    // "release"/"debug" value (for compatibility with simpler deployments)
    // maps onto "info"/"debug" respectively.
    let raw = std::env::var("LLAMAPOOL_LOG")
        .ok()
        .or_else(|| cli_override.map(str::to_string))
        .unwrap_or_else(|| config_log_level.to_string());
    let normalized = match raw.as_str() {
        "release" => "info".to_string(),
        other => other.to_string(),
    };
    let filter = EnvFilter::try_new(&normalized).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

async fn run() -> anyhow::Result<i32> {
    let cli = cli::Cli::parse();

    let home = cli::llamapool_home();
    let folder_list_path = home.join("folders.json");
    let producer = UnsupportedConfigProducer;
    let mut config = match Config::load_with_self_heal(&cli.config, &folder_list_path, &producer).await {
        Ok(c) => c,
        Err(e @ error::SchedulerError::PortRangeExhausted(_)) => {
            eprintln!("{e}");
            return Ok(4);
        }
        Err(e) => {
            eprintln!("config invalid: {e}");
            return Ok(2);
        }
    };

    if let Some(min_free) = cli.min_free_memory_percent {
        config.min_free_memory_percent = min_free;
    }

    init_tracing(cli.log_level.as_deref(), &config.log_level);

    info!(
        config_path = %cli.config.display(),
        models = config.models.len(),
        groups = config.groups.len(),
        "llamapool starting"
    );

    if !home.exists() {
        std::fs::create_dir_all(&home)?;
    }

    let http_client = reqwest::Client::builder()
        .build()
        .expect("reqwest client configuration is static and always valid");
    let events = EventBus::new();
    let scheduler = Scheduler::new(config, http_client.clone(), events.clone());

    let shutdown_notify = Arc::new(tokio::sync::Notify::new());
    let background_cancel = CancellationToken::new();

    if cli.watch_config {
        let shared_config = arc_swap::ArcSwap::from_pointee(scheduler.config().as_ref().clone());
        let shared_config = Arc::new(shared_config);
        let (reload_tx, mut reload_rx) = tokio::sync::mpsc::channel(4);
        let config_path = cli.config.clone();
        tokio::spawn(config::watch_config(config_path, shared_config, reload_tx));

        let scheduler_for_reload = Arc::clone(&scheduler);
        tokio::spawn(async move {
            while let Some(new_config) = reload_rx.recv().await {
                scheduler_for_reload.reload((*new_config).clone()).await;
            }
        });
    }

    {
        let scheduler = Arc::clone(&scheduler);
        let cancel = background_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_SWEEP_INTERVAL) => {
                        scheduler.sweep_idle().await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    {
        let scheduler = Arc::clone(&scheduler);
        let probe: Arc<dyn interfaces::SystemProbe> = Arc::new(SysinfoProbe::new());
        let cancel = background_cancel.clone();
        tokio::spawn(memory_guard::run(scheduler, probe, cancel));
    }

    let app_state = http::AppState {
        scheduler: Arc::clone(&scheduler),
        http: http_client,
        started_at: Instant::now(),
    };

    // Bind before spawning the serve loop so a bind failure is reported
    // with its own exit code instead of leaving the process waiting on a
    // termination signal that will never matter.
    let listener = match http::bind(&cli.listen).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("failed to bind {}: {e}", cli.listen);
            return Ok(3);
        }
    };

    let shutdown_for_server = Arc::clone(&shutdown_notify);
    let mut server = tokio::spawn(http::serve(app_state, listener, shutdown_for_server));

    let signal = async {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
            Ok::<(), std::io::Error>(())
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("received ctrl-c");
            Ok::<(), std::io::Error>(())
        }
    };

    // If the server exits on its own (e.g. an accept-loop error) before a
    // termination signal arrives, don't hang waiting for one.
    tokio::select! {
        result = signal => { result?; }
        joined = &mut server => {
            match joined {
                Ok(Ok(())) => info!("http surface stopped on its own"),
                Ok(Err(e)) => warn!(error = %e, "http surface exited with error"),
                Err(e) => warn!(error = %e, "http surface task panicked"),
            }
            return Ok(1);
        }
    }

    info!("shutting down");
    background_cancel.cancel();
    scheduler.shutdown().await;
    shutdown_notify.notify_waiters();
    let _ = server.await;

    Ok(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            1
        }
    };
    std::process::exit(code);
}
