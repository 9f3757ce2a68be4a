//! Billing Resilience DLQ Worker
//!
//! Drains the webhook dead-letter queue, runs periodic health checks and
//! serves the admin API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use billing_resilience::admin::{admin_router, AdminState};
use billing_resilience::alerts::AlertStore;
use billing_resilience::health::HealthMonitor;
use billing_resilience::postgres::PgStore;
use billing_resilience::subscription::{SubscriptionStore, TransactionalSubscriptionUpdater};
use billing_resilience::webhook::{DlqStore, SubscriptionRedeliverer, WebhookRetryProcessor};
use billing_resilience::{ResilienceConfig, ResilientExecutor};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Billing Resilience DLQ Worker
#[derive(Parser, Debug)]
#[command(name = "dlq-worker")]
#[command(version)]
#[command(about = "Redelivers failed billing webhooks and monitors backend health")]
struct Args {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum pool connections
    #[arg(long, default_value = "10")]
    max_connections: u32,

    /// Seconds between DLQ passes (overrides BILLING_RESILIENCE_DLQ_POLL_INTERVAL_SECS)
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Records claimed per pass (overrides BILLING_RESILIENCE_DLQ_BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Address for the admin API
    #[arg(long, default_value = "127.0.0.1:9090")]
    admin_addr: SocketAddr,

    /// Create tables before starting
    #[arg(long)]
    migrate: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ResilienceConfig::from_env().context("loading configuration")?;
    if let Some(secs) = args.interval_secs {
        config.dlq.poll_interval = Duration::from_secs(secs);
    }
    if let Some(batch_size) = args.batch_size {
        config.dlq.batch_size = batch_size;
    }
    config.validate().context("validating configuration")?;

    info!(
        name = billing_resilience::NAME,
        version = billing_resilience::VERSION,
        admin_addr = %args.admin_addr,
        "DLQ worker starting"
    );

    let store = Arc::new(
        PgStore::connect(&args.database_url, args.max_connections, config.dlq.clone())
            .await
            .context("connecting to PostgreSQL")?,
    );
    if args.migrate {
        store.migrate().await.context("running migrations")?;
    }

    let dlq: Arc<dyn DlqStore> = store.clone();
    let alerts: Arc<dyn AlertStore> = store.clone();
    let subscriptions: Arc<dyn SubscriptionStore> = store.clone();

    let executor = Arc::new(ResilientExecutor::from_config(&config));
    let updater = Arc::new(TransactionalSubscriptionUpdater::new(
        subscriptions,
        config.updater.clone(),
    ));
    let processor = Arc::new(WebhookRetryProcessor::new(
        dlq.clone(),
        alerts.clone(),
        Arc::new(SubscriptionRedeliverer::new(updater)),
        config.dlq.clone(),
    ));
    let health = Arc::new(
        HealthMonitor::new(executor.clone(), alerts.clone(), config.health.clone())
            .with_dlq(dlq.clone()),
    );

    let shutdown = CancellationToken::new();

    let processor_task = tokio::spawn({
        let processor = processor.clone();
        let shutdown = shutdown.clone();
        async move { processor.run(shutdown).await }
    });
    let health_task = tokio::spawn({
        let health = health.clone();
        let shutdown = shutdown.clone();
        async move { health.run(shutdown).await }
    });

    let app = admin_router(AdminState::new(executor, health, dlq, alerts));
    let listener = tokio::net::TcpListener::bind(args.admin_addr)
        .await
        .with_context(|| format!("binding {}", args.admin_addr))?;
    let server_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    let (processor_res, health_res, server_res) =
        tokio::join!(processor_task, health_task, server_task);
    processor_res.context("processor task panicked")?;
    health_res.context("health task panicked")?;
    if let Err(e) = server_res.context("admin server task panicked")? {
        error!(error = %e, "Admin server failed");
    }

    info!("DLQ worker stopped");
    Ok(())
}
