use axum::Router as AxumRouter;
use context::ServerContext;
use log::info;
use marquee_cluster::Cluster;
use std::{
    io,
    net::{Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

mod context;
mod errors;
pub mod logging;
mod rpc;
mod ws;

type Router = AxumRouter<ServerContext>;

/// Binds both listeners and serves until the process is told to stop.
///
/// The client link lives on the node's client port at `/ws`; peers reach
/// `/rpc` and `/health` on the rpc port.
pub async fn run_server(cluster: Arc<Cluster>) -> io::Result<()> {
    let local = cluster.context.config.local().clone();
    let context = ServerContext { cluster };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let client_router = ws::router().with_state(context.clone()).layer(cors);
    let rpc_router = rpc::router().with_state(context);

    let client_addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, local.client_port).into();
    let rpc_addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, local.rpc_port).into();

    let client_listener = TcpListener::bind(&client_addr).await?;
    let rpc_listener = TcpListener::bind(&rpc_addr).await?;

    info!("Client link listening on {} at /ws", client_addr);
    info!("Peer link listening on {} at /rpc", rpc_addr);

    let client = axum::serve(client_listener, client_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    let rpc = axum::serve(rpc_listener, rpc_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(client, rpc)?;

    info!("Shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
