use gateway::config::{self, GatewayConfig};
use gateway::state::AppState;
use std::env;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn load_config() -> GatewayConfig {
    if let Ok(path) = env::var("GATEWAY_CONFIG") {
        return config::load_config_from_path(Path::new(&path)).expect("failed to load config");
    }
    if Path::new("/etc/channel-gateway/gateway.toml").exists() {
        return config::load_config().expect("failed to load config");
    }
    // No config file: env-only startup needs at least the signing secret.
    let secret = env::var("JWT_SECRET")
        .expect("provide GATEWAY_CONFIG, /etc/channel-gateway/gateway.toml, or JWT_SECRET");
    config::load_config_from_str(&format!("[auth]\njwt_secret = \"{secret}\"\n"))
        .expect("failed to build config from environment")
}

fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = load_config();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.worker_num)
        .enable_all()
        .build()
        .expect("failed to build runtime");
    runtime.block_on(serve(config));
}

async fn serve(config: GatewayConfig) {
    info!("connecting to store...");
    let pool = gateway::db::create_pool(&config.store.database_url)
        .await
        .expect("failed to open store");
    gateway::db::run_migrations(&pool)
        .await
        .expect("failed to run store migrations");
    info!("migrations applied");

    let bind_addr = config.server.bind_addr();
    let registry = gateway::handlers::builtin().expect("builtin handler table");
    let state = AppState::new(config, pool, registry);
    gateway::spawn_background(&state).await;

    let router = gateway::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "gateway listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
