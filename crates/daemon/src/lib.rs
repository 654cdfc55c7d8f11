mod assets;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portkeeper::{Allocator, CleanupOptions};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time;

pub use routes::router;

pub const DEFAULT_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    3030,
);
pub const ENV_ADDR: &str = "PORTKEEPER_ADDR";
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub allocator: Arc<Allocator>,
}

impl AppState {
    pub fn new(allocator: Allocator) -> Self {
        Self {
            allocator: Arc::new(allocator),
        }
    }
}

/// Serve the dashboard API on an already-bound listener until it fails.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

/// Periodically evict allocations whose owning process has exited.
pub fn spawn_cleaner(state: AppState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;

            let allocator = state.allocator.clone();
            let result =
                tokio::task::spawn_blocking(move || allocator.cleanup(CleanupOptions::default()))
                    .await;
            match result {
                Ok(Ok(report)) if !report.removed.is_empty() => {
                    tracing::info!("Released stale port(s): {:?}", report.removed);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!("Stale cleanup failed: {}", e),
                Err(e) => tracing::warn!("Stale cleanup task panicked: {}", e),
            }
        }
    })
}
