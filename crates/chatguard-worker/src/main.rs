//! ChatGuard Worker
//!
//! Runs one or all roles of the moderation pipeline: the ingestion API,
//! analysis stages, arbiters and enforcers. Roles in different processes
//! coordinate only through the Redis backend.

use anyhow::{Context, Result};
use chatguard_telemetry::{describe_metrics, PipelineMetrics};
use chatguard_worker::{create_router, AppConfig, AppState, BackendKind, Overrides, Services};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatguard-worker")]
#[command(about = "ChatGuard chat moderation pipeline", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "chatguard.yaml", env = "CHATGUARD_CONFIG")]
    config: String,

    /// Queue and state backend
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    /// Redis connection URL
    #[arg(long, env = "CHATGUARD_REDIS_URL")]
    redis_url: Option<String>,

    /// Listen address of the ingestion API
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Listen port of the ingestion API
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Everything in one process: API, every stage, arbiter and enforcer
    Serve,

    /// Ingestion API only
    Api,

    /// Workers for one analysis stage
    Stage {
        /// Stage name from the config file
        #[arg(short, long)]
        name: String,

        #[arg(short, long, default_value = "1")]
        replicas: usize,
    },

    /// Arbiter workers
    Arbiter {
        #[arg(short, long, default_value = "1")]
        replicas: usize,
    },

    /// Enforcement workers
    Enforcer {
        #[arg(short, long, default_value = "1")]
        replicas: usize,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            backend: self.backend,
            redis_url: self.redis_url.clone(),
            listen: self.listen.clone(),
            port: self.port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.json_logs);
    info!("Starting ChatGuard worker");

    let config = AppConfig::load(&cli.config, &cli.overrides())
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    info!(
        backend = ?config.broker.backend,
        prefix = %config.broker.prefix,
        stages = ?config.stage_names(),
        expected = ?config.arbiter.expected_stages,
        "Configuration loaded"
    );

    if config.broker.backend == BackendKind::Memory && !matches!(cli.command, Command::Serve) {
        anyhow::bail!("the memory backend only works with `serve`; use redis for split roles");
    }

    let metrics_handle = init_metrics()?;
    let metrics = PipelineMetrics::new();
    let services = Services::connect(&config, metrics.clone()).await?;
    info!(backend = services.backend_name(), "Backend ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Workers {
        set: JoinSet::new(),
        shutdown_tx: Arc::new(shutdown_tx),
        shutdown_rx: shutdown_rx.clone(),
    };

    let serve_api = match &cli.command {
        Command::Serve => {
            workers.stages(&services, &config, None, config.stage_worker.replicas)?;
            workers.arbiters(&services, &config, 1);
            workers.enforcers(&services, &config, 1);
            true
        }
        Command::Api => true,
        Command::Stage { name, replicas } => {
            workers.stages(&services, &config, Some(name.as_str()), *replicas)?;
            false
        }
        Command::Arbiter { replicas } => {
            workers.arbiters(&services, &config, *replicas);
            false
        }
        Command::Enforcer { replicas } => {
            workers.enforcers(&services, &config, *replicas);
            false
        }
    };
    info!(workers = workers.set.len(), api = serve_api, "Roles started");

    if serve_api {
        let state = AppState {
            ingestor: Arc::new(services.ingestor(&config)),
            metrics: metrics.clone(),
            metrics_handle,
        };
        let app = create_router(state, config.server.max_concurrent_requests);

        let addr: SocketAddr = format!("{}:{}", config.server.listen, config.server.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Ingestion API listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(stop_requested(shutdown_rx))
            .await?;
    } else {
        stop_requested(shutdown_rx).await;
    }

    warn!("Stopping workers...");
    let failed = workers.stop().await;

    let stats = metrics.snapshot();
    info!(
        ingested = stats.messages_ingested,
        decisions = stats.decisions(),
        violations = stats.decisions_violation,
        "Shutdown complete"
    );

    if failed > 0 {
        anyhow::bail!("{} worker(s) failed", failed);
    }
    Ok(())
}

/// Worker tasks sharing one shutdown flag. A worker that returns an error
/// raises the flag for everyone.
struct Workers {
    set: JoinSet<chatguard_core::Result<()>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Workers {
    fn spawn<F>(&mut self, role: String, run: impl FnOnce(watch::Receiver<bool>) -> F)
    where
        F: Future<Output = chatguard_core::Result<()>> + Send + 'static,
    {
        let fut = run(self.shutdown_rx.clone());
        let shutdown_tx = Arc::clone(&self.shutdown_tx);
        self.set.spawn(async move {
            let result = fut.await;
            if let Err(e) = &result {
                error!(role = %role, error = %e, "Worker failed, requesting shutdown");
                shutdown_tx.send_replace(true);
            }
            result
        });
    }

    fn stages(
        &mut self,
        services: &Services,
        config: &AppConfig,
        only: Option<&str>,
        replicas: usize,
    ) -> Result<()> {
        for stage in services.stage_workers(config, only, replicas)? {
            let role = format!("stage:{}", stage.name());
            self.spawn(role, |shutdown| async move { stage.run(shutdown).await });
        }
        Ok(())
    }

    fn arbiters(&mut self, services: &Services, config: &AppConfig, replicas: usize) {
        for replica in 0..replicas.max(1) {
            let arbiter = services.arbiter_worker(config, replica);
            let role = arbiter.id().to_string();
            self.spawn(role, |shutdown| async move { arbiter.run(shutdown).await });
        }
    }

    fn enforcers(&mut self, services: &Services, config: &AppConfig, replicas: usize) {
        for replica in 0..replicas.max(1) {
            let enforcer = services.enforcement_worker(config, replica);
            self.spawn(format!("enforcer-{}", replica), |shutdown| async move {
                enforcer.run(shutdown).await
            });
        }
    }

    /// Raise the flag and wait for every worker; returns the failure count
    async fn stop(mut self) -> usize {
        self.shutdown_tx.send_replace(true);

        let mut failed = 0;
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(_)) => failed += 1,
                Err(e) => {
                    error!(error = %e, "Worker task panicked");
                    failed += 1;
                }
            }
        }
        failed
    }
}

/// Resolves on SIGTERM/SIGINT or when a worker raised the shutdown flag
async fn stop_requested(shutdown: watch::Receiver<bool>) {
    tokio::select! {
        _ = shutdown_signal() => warn!("Shutdown signal received"),
        _ = flag_raised(shutdown) => warn!("Shutdown requested by a failed worker"),
    }
}

async fn flag_raised(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("chatguard=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatguard=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Initialize metrics exporter and return handle for rendering
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    describe_metrics();

    info!("Metrics exporter initialized");
    Ok(handle)
}
