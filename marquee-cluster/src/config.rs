use std::env;

use marquee_core::NodeId;
use thiserror::Error;

/// The variable enumerating every node as `nodeId:host:clientPort:rpcPort`,
/// comma separated.
pub const CLUSTER_ENV: &str = "MARQUEE_CLUSTER";
/// The variable naming the node this process runs as.
pub const NODE_ID_ENV: &str = "MARQUEE_NODE_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    MissingVar(&'static str),
    #[error("malformed cluster entry {entry:?}: {reason}")]
    MalformedEntry { entry: String, reason: String },
    #[error("node {0} appears twice in the cluster")]
    DuplicateNode(NodeId),
    #[error("this node's id {0:?} is not part of the cluster")]
    UnknownLocalId(String),
}

/// One node of the cluster topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: NodeId,
    pub host: String,
    pub client_port: u16,
    pub rpc_port: u16,
}

impl NodeSpec {
    /// The base url peers use to reach this node's rpc listener.
    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}", self.host, self.rpc_port)
    }
}

/// The parsed cluster topology plus the identity of this node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeSpec>,
    pub local_id: NodeId,
}

impl ClusterConfig {
    /// Reads the topology from the environment. Any failure here is
    /// fatal for the process.
    pub fn from_env() -> Result<Self, ConfigError> {
        let topology =
            env::var(CLUSTER_ENV).map_err(|_| ConfigError::MissingVar(CLUSTER_ENV))?;
        let local_id = env::var(NODE_ID_ENV).map_err(|_| ConfigError::MissingVar(NODE_ID_ENV))?;

        Self::parse(&topology, &local_id)
    }

    pub fn parse(topology: &str, local_id: &str) -> Result<Self, ConfigError> {
        let mut nodes = Vec::new();

        for entry in topology.split(',') {
            let entry = entry.trim();

            if entry.is_empty() {
                continue;
            }

            let node = parse_entry(entry)?;

            if nodes.iter().any(|existing: &NodeSpec| existing.id == node.id) {
                return Err(ConfigError::DuplicateNode(node.id));
            }

            nodes.push(node);
        }

        let known = nodes.iter().any(|node| node.id == local_id);

        if !known {
            return Err(ConfigError::UnknownLocalId(local_id.to_string()));
        }

        Ok(Self {
            nodes,
            local_id: local_id.to_string(),
        })
    }

    /// The node this process runs as.
    pub fn local(&self) -> &NodeSpec {
        self.nodes
            .iter()
            .find(|node| node.id == self.local_id)
            .expect("local id was validated at parse time")
    }

    /// Every node except this one.
    pub fn peers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|node| node.id != self.local_id)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers().map(|node| node.id.clone()).collect()
    }
}

fn parse_entry(entry: &str) -> Result<NodeSpec, ConfigError> {
    let malformed = |reason: &str| ConfigError::MalformedEntry {
        entry: entry.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = entry.split(':').collect();

    let (id, host, client_port, rpc_port) = match parts[..] {
        [id, host, client_port, rpc_port] => (id, host, client_port, rpc_port),
        _ => return Err(malformed("expected nodeId:host:clientPort:rpcPort")),
    };

    if id.is_empty() || host.is_empty() {
        return Err(malformed("node id and host may not be empty"));
    }

    let client_port = client_port
        .parse()
        .map_err(|_| malformed("client port is not a number"))?;
    let rpc_port = rpc_port
        .parse()
        .map_err(|_| malformed("rpc port is not a number"))?;

    Ok(NodeSpec {
        id: id.to_string(),
        host: host.to_string(),
        client_port,
        rpc_port,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const TOPOLOGY: &str = "n1:alpha.local:9000:9100,n2:beta.local:9000:9100,n3:gamma.local:9001:9101";

    #[test]
    fn parses_a_three_node_cluster() {
        let config = ClusterConfig::parse(TOPOLOGY, "n2").expect("parses");

        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.local().host, "beta.local");
        assert_eq!(config.local().client_port, 9000);
        assert_eq!(config.peer_ids(), vec!["n1".to_string(), "n3".to_string()]);
        assert_eq!(config.nodes[2].rpc_url(), "http://gamma.local:9101");
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(matches!(
            ClusterConfig::parse("n1:alpha.local:9000", "n1"),
            Err(ConfigError::MalformedEntry { .. })
        ));

        assert!(matches!(
            ClusterConfig::parse("n1:alpha.local:banana:9100", "n1"),
            Err(ConfigError::MalformedEntry { .. })
        ));

        assert!(matches!(
            ClusterConfig::parse(":alpha.local:9000:9100", "n1"),
            Err(ConfigError::MalformedEntry { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let doubled = "n1:a:1:2,n1:b:3:4";

        assert!(matches!(
            ClusterConfig::parse(doubled, "n1"),
            Err(ConfigError::DuplicateNode(_))
        ));
    }

    #[test]
    fn rejects_an_unknown_local_id() {
        assert!(matches!(
            ClusterConfig::parse(TOPOLOGY, "n9"),
            Err(ConfigError::UnknownLocalId(_))
        ));
    }

    #[test]
    fn a_single_node_cluster_has_no_peers() {
        let config = ClusterConfig::parse("n1:localhost:9000:9100", "n1").expect("parses");

        assert_eq!(config.peer_ids(), Vec::<String>::new());
    }
}
