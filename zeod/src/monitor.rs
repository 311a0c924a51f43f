use crate::registry::StorageServer;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use axum::Server;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

async fn endpoint_status(State(server): State<Arc<StorageServer>>) -> String {
  server.status_report()
}

pub fn monitor_router(server: Arc<StorageServer>) -> Router {
  Router::new()
    .route("/", get(endpoint_status))
    .layer(TraceLayer::new_for_http())
    .with_state(server)
}

pub async fn start_monitor_server_loop(interface: Ipv4Addr, port: u16, server: Arc<StorageServer>) {
  let app = monitor_router(server);

  let addr = SocketAddr::from((interface, port));
  info!(interface = interface.to_string(), port, "starting monitor");

  Server::bind(&addr)
    .tcp_nodelay(true)
    .serve(app.into_make_service())
    .await
    .unwrap();
}
