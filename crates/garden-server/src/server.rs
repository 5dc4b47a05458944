//! Serving the API and running background maintenance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use garden_runtime::engine::Garden;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::api::create_router;
use crate::handlers::AppState;

/// Serves the API on `listener` until `shutdown` completes.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve<F>(listener: TcpListener, garden: Arc<Garden>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let router = create_router(AppState { garden });
    tracing::info!(addr = %addr, "garden.started");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Periodically destroys containers whose grace time has expired.
#[must_use]
pub fn spawn_reaper(garden: Arc<Garden>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let _ = ticker.tick().await;
            let reaped = garden.reap_expired().await;
            if reaped > 0 {
                tracing::debug!(reaped, "reaper pass finished");
            }
        }
    })
}
