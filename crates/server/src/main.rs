use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use unitflow_core::{
    create_executor, load_config, validate_config, Config, ExecutionScheduler, LedgerStore,
    OrchestratorError, OrderOrchestrator, PipelineMetrics, SchedulerStats, SqliteLedgerStore,
    TaskFactory, UnitExecutionService, UnitExecutor,
};

use unitflow_server::api::create_router;
use unitflow_server::metrics::REGISTRY;
use unitflow_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("UNITFLOW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        version = VERSION,
        config_hash = &config_hash[..16],
        "Configuration loaded successfully"
    );
    info!("Database path: {:?}", config.database.path);

    // Ledger
    let store: Arc<dyn LedgerStore> = Arc::new(
        SqliteLedgerStore::new(&config.database.path).context("Failed to open ledger store")?,
    );
    info!("Ledger store initialized");

    // Metrics
    let metrics = Arc::new(PipelineMetrics::new().context("Failed to create pipeline metrics")?);
    metrics
        .register(&REGISTRY)
        .context("Failed to register pipeline metrics")?;

    // Executor backend
    let executor: Arc<dyn UnitExecutor> =
        create_executor(&config.executor).context("Failed to create unit executor")?;
    info!(
        "Using {} executor ({} backend)",
        executor.name(),
        config.executor.backend.as_str()
    );

    let orchestrator = Arc::new(OrderOrchestrator::new(
        Arc::clone(&store),
        TaskFactory::new(config.scheduler.max_retries_per_unit),
        config.orders.clone(),
        Arc::clone(&metrics),
    ));

    seed_accounts(&orchestrator, &config)?;

    let service = Arc::new(UnitExecutionService::new(
        Arc::clone(&store),
        executor,
        config.scheduler.clone(),
        Arc::clone(&metrics),
    ));
    let scheduler = Arc::new(ExecutionScheduler::new(
        config.scheduler.clone(),
        Arc::clone(&store),
        service,
        Arc::clone(&orchestrator),
        Arc::new(SchedulerStats::new()),
    ));

    if config.scheduler.enabled {
        scheduler.start().await;
        info!("Execution scheduler started");
    } else {
        info!("Execution scheduler disabled in config");
    }

    // Create app state
    let state = Arc::new(AppState::new(
        config.clone(),
        orchestrator,
        Arc::clone(&scheduler),
    ));

    // Create router
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    if scheduler.is_running() {
        scheduler.stop().await;
    }

    Ok(())
}

/// Open the accounts listed in config. Existing accounts keep their balance.
fn seed_accounts(orchestrator: &OrderOrchestrator, config: &Config) -> Result<()> {
    for seed in &config.accounts {
        match orchestrator.open_account(&seed.id, seed.balance) {
            Ok(account) => info!(
                account_id = %account.id,
                balance = %account.balance,
                "Seeded account"
            ),
            Err(OrchestratorError::AccountExists(_)) => {
                warn!(account_id = %seed.id, "Account already exists, not reseeding")
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to seed account {}", seed.id))
            }
        }
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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
