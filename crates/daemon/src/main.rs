use std::net::SocketAddr;

use portkeeper::{inspect, Allocator, CleanupOptions, Config};
use portkeeper_daemon::{serve, spawn_cleaner, AppState, CLEANUP_INTERVAL, DEFAULT_ADDR, ENV_ADDR};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!("Using registry: {}", config.registry_path.display());

    let allocator = Allocator::from_config(&config, inspect::system());

    let existing = allocator.list_allocations()?.len();
    if existing > 0 {
        tracing::info!("Loaded {} existing allocation(s)", existing);
    }

    // Clean up stale allocations immediately
    match allocator.cleanup(CleanupOptions::default()) {
        Ok(report) if !report.removed.is_empty() => {
            tracing::info!(
                "Cleaned up {} stale allocation(s) on startup",
                report.removed.len()
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to clean up stale allocations on startup: {}", e),
    }

    let state = AppState::new(allocator);
    spawn_cleaner(state.clone(), CLEANUP_INTERVAL);

    let addr: SocketAddr = match std::env::var(ENV_ADDR) {
        Ok(raw) if !raw.is_empty() => raw.parse()?,
        _ => DEFAULT_ADDR,
    };
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Dashboard listening on http://{}", addr);
    serve(listener, state).await?;
    Ok(())
}
