use std::net::SocketAddr;
use std::sync::Arc;

use bridge::config::Settings;
use bridge::{db, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let settings = match Settings::load() {
        Ok(settings) => Arc::new(settings),
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(settings.app_log_level.clone()))
        .init();

    info!("connecting to database...");
    let pool = db::create_pool(&settings.database_url)
        .await
        .expect("failed to connect to Postgres");
    db::run_migrations(&pool).await.expect("failed to run database migrations");
    info!("migrations applied");

    let state = AppState::build(pool, Arc::clone(&settings)).expect("failed building app state");
    state.manager.start().await;

    let bind_addr = format!("{}:{}", settings.app_host, settings.app_port);
    let router = bridge::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind");
    info!(addr = %bind_addr, "bridge listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    state.manager.stop().await;
    info!("bridge shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
