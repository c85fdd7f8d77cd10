//! Node sources
//!
//! A [`NodeSource`] supplies the current cluster nodes and decides which of
//! them are excluded from load balancing. Exclusion is the union of an
//! explicit name set and well-known node labels.

pub mod addresses;
pub mod informer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::error::{Error, Result};

pub use addresses::{AddressResolver, IpFamily, NodeIpCache, NodePrivateIps, PrivateIpCache};
pub use informer::NodeInformer;

/// Nodes carrying this label never receive load balancer traffic
pub const EXCLUDE_FROM_LB_LABEL: &str = "node.kubernetes.io/exclude-from-external-load-balancers";
/// Nodes labelled `false` here are not managed by the cloud provider
pub const MANAGED_BY_CLOUD_LABEL: &str = "kubernetes.azure.com/managed";

/// True if the node's labels take it out of load balancer backends
pub fn excluded_by_labels(node: &Node) -> bool {
    let labels = node.labels();
    labels.contains_key(EXCLUDE_FROM_LB_LABEL)
        || labels
            .get(MANAGED_BY_CLOUD_LABEL)
            .is_some_and(|v| v.eq_ignore_ascii_case("false"))
}

pub trait NodeSource: Send + Sync {
    fn list(&self) -> Vec<Arc<Node>>;

    fn get(&self, name: &str) -> Option<Arc<Node>>;

    /// Whether the initial node list has been observed
    fn is_synced(&self) -> bool;

    /// Exclusion decision without the sync check
    fn is_excluded(&self, node_name: &str) -> bool;

    /// Exclusion decision, refused until the source has synced
    fn should_exclude_from_load_balancer(&self, node_name: &str) -> Result<bool> {
        if !self.is_synced() {
            return Err(Error::NodeInformerNotSynced(format!(
                "checking whether node {} should be excluded from load balancers",
                node_name
            )));
        }
        Ok(self.is_excluded(node_name))
    }
}

/// A fixed snapshot of nodes
#[derive(Debug, Default)]
pub struct StaticNodeSource {
    nodes: Vec<Arc<Node>>,
    by_name: HashMap<String, usize>,
    excluded: HashSet<String>,
}

impl StaticNodeSource {
    pub fn new(nodes: Vec<Node>, excluded: HashSet<String>) -> Self {
        let nodes: Vec<Arc<Node>> = nodes.into_iter().map(Arc::new).collect();
        let by_name = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name_any(), i))
            .collect();
        Self {
            nodes,
            by_name,
            excluded,
        }
    }
}

impl NodeSource for StaticNodeSource {
    fn list(&self) -> Vec<Arc<Node>> {
        self.nodes.clone()
    }

    fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.by_name.get(name).map(|&i| self.nodes[i].clone())
    }

    fn is_synced(&self) -> bool {
        true
    }

    fn is_excluded(&self, node_name: &str) -> bool {
        self.excluded.contains(node_name)
            || self.get(node_name).is_some_and(|n| excluded_by_labels(&n))
    }
}
