use std::net::SocketAddr;

use duochat::{app, config::Config, db, rooms::{HistoryMaxLimit, RoomRegistry}, AppState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cfg = Config::from_env();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| cfg.log_level.parse::<EnvFilter>())
        .unwrap_or_else(|e| {
            eprintln!("WARN: DUOCHAT_LOG='{}' is not a valid filter ({e}); using 'info'", cfg.log_level);
            EnvFilter::new("info")
        });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "duochat starting");

    let db_pool = db::connect(&cfg.database_url, cfg.max_connections).await?;
    db::init_schema(&db_pool).await?;
    info!(database_url = %cfg.database_url, "database ready");

    let app_state = AppState {
        db_pool,
        rooms: RoomRegistry::new(),
        history_max_limit: HistoryMaxLimit(cfg.history_max_limit.get()),
    };

    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("duochat stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => { s.recv().await; }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutting down");
}
