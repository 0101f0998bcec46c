//! API server entry point.

use std::sync::Arc;

use api::{AppState, Backend, Config, InMemoryBackend, LogFormat, PostgresBackend, Stores};
use event_bus::InMemoryBroker;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn serve<B: Backend>(stores: Stores<B>, config: Config, metrics_handle: PrometheusHandle) {
    let state: Arc<AppState<B>> = AppState::new(stores, InMemoryBroker::new(), &config)
        .await
        .expect("failed to set up application state");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = api::spawn_workers(&state, &config, shutdown_rx);

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Consumers finish their in-flight deliveries and the relay flushes the outbox.
    let _ = shutdown_tx.send(true);
    for result in futures_util::future::join_all(workers).await {
        if let Err(err) = result {
            tracing::error!(error = %err, "worker panicked during shutdown");
        }
    }

    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("invalid configuration");
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    match config.database_url.clone() {
        Some(url) => {
            let stores = Stores::<PostgresBackend>::connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            serve(stores, config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, running on in-memory stores");
            serve(Stores::<InMemoryBackend>::in_memory(), config, metrics_handle).await;
        }
    }
}
