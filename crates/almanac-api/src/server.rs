//! Serving: the router plus trace/timeout layers and graceful shutdown
//! wired to the instance's root token.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use almanac_core::{Error, Instance};

use crate::http::{self, router};

/// Serve the HTTP and WebSocket front-ends until the instance's root token
/// is cancelled.
pub async fn serve(instance: Arc<Instance>, listener: TcpListener) -> Result<(), Error> {
    let timeout = Duration::from_secs(instance.subsystems().config.api.timeout_seconds);
    let app = router(instance.clone())
        .fallback(http::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout));

    let addr = listener
        .local_addr()
        .map_err(|e| Error::internal(format!("reading listener address: {e}")))?;
    info!(addr = %addr, "api listening");

    let shutdown = {
        let instance = instance.clone();
        async move { instance.root_token().cancelled().await }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::internal(format!("serving api: {e}")))
}
