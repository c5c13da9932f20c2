use std::net::SocketAddr;

use axum::Router;
use tracing::info;

mod latest;
mod request_id;

pub use latest::{ApiBuilder, RouterState};
pub use request_id::{CorrelationLayer, RequestId};

pub async fn serve(router: Router, address: SocketAddr) {
    info!(%address, "binding to and listening at address");

    axum::Server::bind(&address)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to address: {}", address));
}
