use task_queue_broker::{
    AuditSink, BrokerConfig, QueueMetrics, SqliteAuditStore, TaskQueueServer, TaskQueueService,
};
use task_queue_persistence::open_storage;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use axum::Router;

#[derive(Parser, Debug)]
#[command(name = "tq-broker")]
#[command(about = "Task Queue Broker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "TQ_CONFIG", default_value = "config.yaml")]
    config: String,

    /// Listen host
    #[arg(long, env = "TQ_HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(long, env = "TQ_PORT")]
    port: Option<u16>,

    /// Prometheus exporter port
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn init_tracing(config: &BrokerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.monitoring.log_level));

    if config.monitoring.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_found = std::path::Path::new(&args.config).exists();
    let mut config = if config_found {
        BrokerConfig::from_file(&args.config)?
    } else {
        BrokerConfig::default()
    };

    // Override with CLI args
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(metrics_port) = args.metrics_port {
        config.monitoring.prometheus_port = metrics_port;
    }

    init_tracing(&config);
    if !config_found {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }
    tracing::info!("Starting broker with config: {:?}", config);

    let storage = open_storage(&config.storage)?;
    tracing::info!("Using {} storage backend", storage.backend_name());

    let metrics = Arc::new(QueueMetrics::new()?);
    let mut service = TaskQueueService::new(storage)
        .with_metrics(metrics.clone())
        .with_settings(config.queue_settings());

    if config.audit.enabled {
        if let Some(parent) = config.audit.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let audit: Arc<dyn AuditSink> = Arc::new(SqliteAuditStore::open(&config.audit.path)?);
        service = service.with_audit(audit);
        tracing::info!("Audit events recorded to {}", config.audit.path.display());
    }

    let server = Arc::new(TaskQueueServer::bind(Arc::new(service), &config.listen_addr()).await?);

    // Start metrics server
    let metrics_port = config.monitoring.prometheus_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics, metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C");
            shutdown.notify_one();
        }
    });

    server.run().await?;

    Ok(())
}

async fn start_metrics_server(metrics: Arc<QueueMetrics>, port: u16) -> anyhow::Result<()> {
    use axum::{extract::State, http::StatusCode, routing::get};

    async fn metrics_handler(State(metrics): State<Arc<QueueMetrics>>) -> (StatusCode, String) {
        match metrics.render() {
            Ok(body) => (StatusCode::OK, body),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
