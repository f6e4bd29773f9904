use std::process::exit;
use std::sync::Arc;

use log::{error, info};
use marquee_cluster::{Cluster, ClusterConfig, CLUSTER_ENV, NODE_ID_ENV};
use marquee_core::Config;
use marquee_server::{logging, run_server};

#[tokio::main]
async fn main() {
    logging::init_logger();

    let config = match ClusterConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!("Could not read the cluster configuration: {}", error);
            error!("Set {} and {}, then try again.", CLUSTER_ENV, NODE_ID_ENV);
            exit(1);
        }
    };

    info!(
        "Starting node {} ({} nodes in the cluster)...",
        config.local_id,
        config.nodes.len()
    );

    let cluster = Arc::new(Cluster::new(config, Config::default()));
    cluster.run();

    if let Err(error) = run_server(cluster).await {
        error!("Server stopped unexpectedly: {}", error);
        exit(1);
    }
}
