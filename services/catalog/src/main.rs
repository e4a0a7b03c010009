use anyhow::{Context, Result};
use catalog_service::api::{start_api_server, AppState, JwtVerifier};
use catalog_service::config::{Backend, Config};
use catalog_service::dispatch::KafkaDispatcher;
use catalog_service::memory::{MemoryBlobStore, MemoryRecordStore, MemoryUrlSigner};
use catalog_service::metadata_store::MetadataStore;
use catalog_service::perceptual_hash::BlockhashHasher;
use catalog_service::ports::InferenceDispatcher;
use catalog_service::results_consumer::ResultsConsumer;
use catalog_service::s3_store::S3BlobStore;
use catalog_service::{Catalog, CatalogSettings, Collaborators};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        backend = ?config.catalog.backend,
        "Starting catalog service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let collaborators = match config.catalog.backend {
        Backend::Cloud => cloud_collaborators(&config).await?,
        Backend::Memory => memory_collaborators(),
    };

    let catalog = Arc::new(Catalog::new(collaborators, CatalogSettings::from(&config)));
    let shutdown = CancellationToken::new();

    // Spawn results consumer task
    let consumer_handle = match (&config.catalog.backend, &config.kafka) {
        (Backend::Cloud, Some(kafka)) if kafka.results_consumer_enabled => {
            let consumer = ResultsConsumer::new(kafka, catalog.clone())
                .context("Failed to initialize results consumer")?;
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = consumer.run(token).await {
                    error!(error = %e, "Results consumer error");
                }
            }))
        }
        _ => None,
    };

    // Spawn API server task
    let api_state = AppState {
        catalog: catalog.clone(),
        auth: Arc::new(JwtVerifier::from_config(&config.auth)),
    };
    let api_config = config.api.clone();
    let token = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, token).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Catalog service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down catalog service");
    shutdown.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE, api_handle).await.is_err() {
        warn!("API server did not stop within the grace period");
    }
    if let Some(handle) = consumer_handle {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Results consumer did not stop within the grace period");
        }
    }

    info!("Catalog service stopped");

    Ok(())
}

/// PostgreSQL records, S3 images and Kafka dispatch
async fn cloud_collaborators(config: &Config) -> Result<Collaborators> {
    let database = config
        .database
        .as_ref()
        .context("database section is required for the cloud backend")?;
    let s3 = config
        .s3
        .as_ref()
        .context("s3 section is required for the cloud backend")?;

    let metadata_store = MetadataStore::new(database)
        .await
        .context("Failed to initialize metadata store")?;

    // Run migrations if enabled
    if database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = Arc::new(
        S3BlobStore::new(s3)
            .await
            .context("Failed to initialize S3 blob store")?,
    );

    let dispatcher: Option<Arc<dyn InferenceDispatcher>> = match &config.kafka {
        Some(kafka) if kafka.dispatch_enabled => Some(Arc::new(
            KafkaDispatcher::new(kafka).context("Failed to initialize inference dispatcher")?,
        )),
        _ => {
            warn!("Inference dispatch disabled");
            None
        }
    };

    Ok(Collaborators {
        store: Arc::new(metadata_store),
        blobs: blob_store.clone(),
        signer: blob_store,
        hasher: Arc::new(BlockhashHasher::new()),
        dispatcher,
    })
}

/// Everything in-process, for local runs
fn memory_collaborators() -> Collaborators {
    warn!("Using in-memory backend; records are lost on restart");

    Collaborators {
        store: Arc::new(MemoryRecordStore::new()),
        blobs: Arc::new(MemoryBlobStore::new()),
        signer: Arc::new(MemoryUrlSigner::default()),
        hasher: Arc::new(BlockhashHasher::new()),
        dispatcher: None,
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
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
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
