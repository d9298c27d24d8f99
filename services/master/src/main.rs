use fleet_bus::{BusClient, BusConfig};
use master::config::MasterConfig;
use master::coordinator::{self, Coordinator};
use master::fanout::FanoutPlane;
use master::state::AppState;
use master::{db, sweeper};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cfg = match MasterConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    info!("connecting to database...");
    let pool = db::create_pool(&cfg.database_url).await;
    db::run_migrations(&pool).await;
    info!("migrations applied");

    let fanout = Arc::new(FanoutPlane::new());
    let bus = BusClient::connect(&BusConfig {
        host: cfg.mqtt_host.clone(),
        port: cfg.mqtt_port,
        client_id: format!("master-{}", hex::encode(rand::random::<[u8; 4]>())),
    })
    .await
    .expect("failed to connect to the message bus");

    let coordinator = Arc::new(Coordinator::new(
        pool.clone(),
        Arc::new(bus.clone()),
        fanout.clone(),
        cfg.secret_key.clone(),
    ));

    // No agent can be live until it heartbeats after our restart; clear
    // whatever an unclean shutdown left behind before accepting traffic.
    coordinator
        .startup_recovery()
        .await
        .expect("failed to clear stale state");

    coordinator::attach_bus_handlers(&bus, coordinator.clone())
        .await
        .expect("failed to subscribe bus handlers");

    let sweeper_handle = sweeper::spawn(coordinator.clone());

    let state = AppState {
        pool: pool.clone(),
        fanout,
        coordinator,
    };
    let router = master::build_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %cfg.bind_addr, "master listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    sweeper_handle.abort();
    bus.disconnect().await;
    pool.close().await;
    info!("master shut down gracefully");
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
