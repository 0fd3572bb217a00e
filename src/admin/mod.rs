//! Admin server exposing election state over HTTP

pub mod http;

pub use http::{create_router, AdminState};

use crate::common::Result;
use std::future::Future;
use std::net::SocketAddr;

/// Serve the admin API on `bind_addr` until `shutdown` resolves
pub async fn serve(
    bind_addr: SocketAddr,
    state: AdminState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Admin API listening on {}", listener.local_addr()?);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
