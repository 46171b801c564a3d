//! `almanacd`: the dataset node server binary.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use almanac_api::serve;
use almanac_core::{Config, Instance};

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = load_config();
    let listen = config.api.listen.clone();

    let instance = Arc::new(Instance::open(config).expect("opening instance"));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .expect("failed to bind");

    // Shut the instance down on SIGINT/SIGTERM; serve() follows the root
    // token.
    let shutdown_instance = instance.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_instance.shutdown().await;
    });

    serve(instance.clone(), listener).await.expect("server error");
    instance.shutdown().await;
    instance.done().await;
    info!("almanacd shut down gracefully");
}

fn load_config() -> Config {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var("ALMANAC_CONFIG").ok().map(PathBuf::from));
    match path {
        Some(path) => Config::load(&path).expect("loading config"),
        None => {
            info!("no config file given, using defaults");
            Config::default()
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
