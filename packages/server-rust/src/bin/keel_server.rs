//! keel-server: serves the ledger operations over HTTP.
//!
//! ```text
//! keel-server --port 8080 --log-format json --metrics-port 9100
//! ```
//!
//! Every flag can also be set through its `KEEL_*` environment variable.
//! Ctrl-C stops accepting connections, drains in-flight operations, then
//! flushes the audit forwarder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use keel_core::{ObservabilitySink, SystemClock, TracingAuditSink, TracingSink};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use keel_server::network::{NetworkConfig, NetworkModule};
use keel_server::service::domain::{Ledger, LedgerService, LogNotifier};
use keel_server::service::{
    build_operation_pipeline, standard_classifier, AuditForwarder, BreakerRegistry, FanoutSink,
    MetricsSink, OperationRouter, OperationWrapper, ResilientExecutor, ServerConfig,
    UnitOfWorkCoordinator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Keel operation server
#[derive(Parser, Debug)]
#[command(name = "keel-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP listener to
    #[arg(long, env = "KEEL_HOST", default_value = "0.0.0.0")]
    host: String,

    /// HTTP port (0 picks an ephemeral port)
    #[arg(long, env = "KEEL_PORT", default_value_t = 8080)]
    port: u16,

    /// Deadline for operations whose caller sends no `x-timeout-ms`
    #[arg(long, env = "KEEL_OPERATION_TIMEOUT_MS", default_value_t = 30_000)]
    operation_timeout_ms: u64,

    /// Concurrent operations admitted before load shedding
    #[arg(long, env = "KEEL_MAX_CONCURRENT", default_value_t = 1000)]
    max_concurrent: u32,

    /// Log output format
    #[arg(long, env = "KEEL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "KEEL_METRICS_PORT")]
    metrics_port: Option<u16>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    if let Some(port) = args.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }

    let network_config = NetworkConfig {
        host: args.host,
        port: args.port,
        ..NetworkConfig::default()
    };
    anyhow::ensure!(
        Duration::from_millis(args.operation_timeout_ms) <= network_config.max_operation_timeout(),
        "operation timeout {}ms exceeds the transport limit of {}ms",
        args.operation_timeout_ms,
        network_config.max_operation_timeout().as_millis()
    );

    let config = ServerConfig {
        default_operation_timeout_ms: args.operation_timeout_ms,
        max_concurrent_operations: args.max_concurrent,
        ..ServerConfig::default()
    };

    let classifier = Arc::new(standard_classifier());
    let telemetry: Arc<dyn ObservabilitySink> = Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(MetricsSink)),
    );
    let clock = Arc::new(SystemClock);

    let breakers = Arc::new(BreakerRegistry::new(
        config.breaker.clone(),
        Arc::clone(&telemetry),
    ));
    let executor = Arc::new(
        ResilientExecutor::new(Arc::clone(&classifier), Arc::clone(&telemetry))
            .with_breakers(breakers),
    );

    let (audit, mut audit_worker) =
        AuditForwarder::spawn(Arc::new(TracingAuditSink), config.audit_channel_capacity);
    let coordinator = Arc::new(UnitOfWorkCoordinator::new(Arc::new(audit), clock.clone()));

    let mut router = OperationRouter::new();
    LedgerService::new(
        Arc::new(Ledger::new()),
        Arc::new(LogNotifier),
        executor,
        coordinator,
        config.retry.clone(),
    )
    .register(&mut router);
    info!(operations = ?router.names(), "Operations registered");

    let wrapper = OperationWrapper::new(
        build_operation_pipeline(router, &config),
        classifier,
        telemetry,
        clock,
    )
    .with_default_timeout(Duration::from_millis(config.default_operation_timeout_ms));

    let mut network = NetworkModule::new(network_config, wrapper);
    let port = network.start().await?;
    info!(port, "keel-server started");

    network
        .serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for Ctrl-C");
            }
        })
        .await?;

    audit_worker.stop().await;
    info!("keel-server stopped");
    Ok(())
}
