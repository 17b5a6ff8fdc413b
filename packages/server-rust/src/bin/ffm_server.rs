//! `ffm-server`: HTTP provisioning server.
//!
//! Writes are published to the provisioning queue and applied by a supervised
//! coordinator; each HTTP request waits for its own completion signal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ffm_core::SystemClock;
use ffm_server::broker::MemoryBroker;
use ffm_server::network::{ApiBackend, NetworkConfig, NetworkModule, TlsConfig};
use ffm_server::service::provisioning::{build, ProvisioningDeps, Sha256Hasher};
use ffm_server::service::ServerConfig;
use ffm_server::storage::{MemoryStore, RetryPolicy};
use ffm_server::traits::{ContractRepository, MessageBroker, UserRepository};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Runs the provisioning HTTP server.
#[derive(Parser, Debug)]
#[command(name = "ffm-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Bind address
    #[arg(long, env = "FFM_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(long, env = "FFM_PORT", default_value_t = 8080)]
    port: u16,

    /// PostgreSQL / CockroachDB connection string; in-memory store when absent
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Connection pool size
    #[arg(long, env = "FFM_DB_MAX_CONNECTIONS", default_value_t = 10)]
    db_max_connections: u32,

    /// Transaction attempts before giving up (unbounded when omitted)
    #[arg(long, env = "FFM_TX_MAX_ATTEMPTS")]
    tx_max_attempts: Option<u32>,

    /// RabbitMQ connection string; in-process queue when absent
    #[arg(long, env = "AMQP_URL")]
    amqp_url: Option<String>,

    /// Broker queue for provisioning requests
    #[arg(long, env = "FFM_QUEUE", default_value = "provisioning")]
    queue: String,

    /// Deliveries of one request before it is dead-lettered
    #[arg(long, env = "FFM_MAX_DELIVERY_ATTEMPTS", default_value_t = 5)]
    max_delivery_attempts: u32,

    /// How long a request waits for its completion, in milliseconds
    #[arg(long, env = "FFM_SUBMIT_TIMEOUT_MS", default_value_t = 10_000)]
    submit_timeout_ms: u64,

    /// In-flight submissions before requests are shed
    #[arg(long, env = "FFM_MAX_CONCURRENT_SUBMISSIONS", default_value_t = 1000)]
    max_concurrent_submissions: u32,

    /// Secret prepended to passwords before hashing
    #[arg(long, env = "FFM_CREDENTIAL_PEPPER", default_value = "", hide_env_values = true)]
    credential_pepper: String,

    /// TLS certificate (PEM)
    #[arg(long, env = "FFM_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "FFM_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Prometheus exporter listen address
    #[arg(long, env = "FFM_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long, env = "FFM_LOG_JSON")]
    log_json: bool,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

type Repositories = (Arc<dyn UserRepository>, Arc<dyn ContractRepository>);

#[cfg(feature = "postgres")]
async fn open_store(cli: &Cli, policy: RetryPolicy) -> anyhow::Result<Repositories> {
    if let Some(url) = &cli.database_url {
        let store = ffm_server::storage::PgStore::connect(url, cli.db_max_connections, policy)
            .await
            .context("connecting to the database")?;
        store.migrate().await.context("applying the schema")?;
        let store = Arc::new(store);
        return Ok((store.clone(), store));
    }
    warn!("DATABASE_URL not set, using the in-memory store; data is lost on exit");
    let store = Arc::new(MemoryStore::with_policy(policy));
    Ok((store.clone(), store))
}

#[cfg(not(feature = "postgres"))]
async fn open_store(cli: &Cli, policy: RetryPolicy) -> anyhow::Result<Repositories> {
    if cli.database_url.is_some() {
        warn!("built without the postgres feature, ignoring DATABASE_URL");
    } else {
        warn!("DATABASE_URL not set, using the in-memory store; data is lost on exit");
    }
    let store = Arc::new(MemoryStore::with_policy(policy));
    Ok((store.clone(), store))
}

#[cfg(feature = "amqp")]
async fn open_broker(cli: &Cli) -> anyhow::Result<Arc<dyn MessageBroker>> {
    if let Some(url) = &cli.amqp_url {
        let broker = ffm_server::broker::AmqpBroker::connect(url)
            .await
            .context("connecting to RabbitMQ")?;
        return Ok(Arc::new(broker));
    }
    warn!("AMQP_URL not set, using the in-process queue; queued requests are lost on exit");
    Ok(Arc::new(MemoryBroker::new()))
}

#[cfg(not(feature = "amqp"))]
async fn open_broker(cli: &Cli) -> anyhow::Result<Arc<dyn MessageBroker>> {
    if cli.amqp_url.is_some() {
        warn!("built without the amqp feature, ignoring AMQP_URL");
    } else {
        warn!("AMQP_URL not set, using the in-process queue; queued requests are lost on exit");
    }
    Ok(Arc::new(MemoryBroker::new()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Some(addr) = cli.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing the Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }

    let server_config = ServerConfig {
        node_id: uuid::Uuid::new_v4().to_string(),
        queue_name: cli.queue.clone(),
        submit_timeout_ms: cli.submit_timeout_ms,
        max_concurrent_submissions: cli.max_concurrent_submissions,
        max_delivery_attempts: cli.max_delivery_attempts,
        retry: RetryPolicy {
            max_attempts: cli.tx_max_attempts,
            ..RetryPolicy::default()
        },
        ..ServerConfig::default()
    };

    let (users, contracts) = open_store(&cli, server_config.retry.clone()).await?;
    let broker = open_broker(&cli).await?;
    let provisioning = build(
        &server_config,
        ProvisioningDeps {
            broker,
            users: Arc::clone(&users),
            contracts: Arc::clone(&contracts),
            hasher: Arc::new(Sha256Hasher::new(cli.credential_pepper.clone())),
            clock: Arc::new(SystemClock),
        },
    );
    let backend = ApiBackend {
        pipeline: provisioning.pipeline,
        users,
        contracts,
        user_cache: provisioning.user_cache,
        coordinator: provisioning.health,
        pending: provisioning.pending,
    };
    let service = provisioning.service;
    service.start()?;

    let network_config = NetworkConfig {
        host: cli.host.clone(),
        port: cli.port,
        tls: cli.tls_cert.clone().zip(cli.tls_key.clone()).map(|(cert_path, key_path)| TlsConfig {
            cert_path,
            key_path,
        }),
        request_timeout: NetworkConfig::default()
            .request_timeout
            .max(Duration::from_millis(cli.submit_timeout_ms.saturating_add(5_000))),
        ..NetworkConfig::default()
    };
    let mut network = NetworkModule::new(network_config, backend);
    let port = network.start().await?;
    info!(node_id = %server_config.node_id, port, queue = %server_config.queue_name, "ffm-server ready");

    let served = network.serve(shutdown_signal()).await;

    service.stop().await;
    info!("ffm-server stopped");
    served
}
