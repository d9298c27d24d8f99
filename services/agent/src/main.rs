use agent::config::AgentConfig;
use std::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cfg = match AgentConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };
    info!(node_name = %cfg.node_name, "agent starting");

    // Registration denial and ack timeout both land here and exit non-zero.
    if let Err(e) = agent::run(cfg).await {
        error!(error = %e, "agent terminated");
        std::process::exit(1);
    }
}
