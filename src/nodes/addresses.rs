//! Address Resolver
//!
//! Turns node objects into private IPv4/IPv6 addresses and keeps a
//! process-wide cache of node name -> known private IPs. The cache is only a
//! fallback for when the node object is momentarily stale; an address read
//! from the node itself always wins and refreshes the cache.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use tracing::debug;

const NODE_INTERNAL_IP: &str = "InternalIP";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &str) -> Option<IpFamily> {
        match ip.parse::<IpAddr>().ok()? {
            IpAddr::V4(_) => Some(IpFamily::V4),
            IpAddr::V6(_) => Some(IpFamily::V6),
        }
    }
}

/// IP families a service is served on, IPv4 when unspecified
pub fn service_ip_families(service: &Service) -> Vec<IpFamily> {
    let families: Vec<IpFamily> = service
        .spec
        .as_ref()
        .and_then(|s| s.ip_families.as_ref())
        .map(|fams| {
            fams.iter()
                .filter_map(|f| match f.as_str() {
                    "IPv4" => Some(IpFamily::V4),
                    "IPv6" => Some(IpFamily::V6),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    if families.is_empty() {
        vec![IpFamily::V4]
    } else {
        families
    }
}

/// True for single-stack IPv6 services
pub fn is_ipv6_service(service: &Service) -> bool {
    service_ip_families(service) == vec![IpFamily::V6]
}

/// Private addresses of a node split by family, in status order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodePrivateIps {
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

impl NodePrivateIps {
    pub fn first(&self, family: IpFamily) -> Option<&str> {
        match family {
            IpFamily::V4 => self.ipv4.first(),
            IpFamily::V6 => self.ipv6.first(),
        }
        .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }

    pub fn all(&self) -> BTreeSet<String> {
        self.ipv4.iter().chain(self.ipv6.iter()).cloned().collect()
    }

    fn push(&mut self, ip: &str) {
        let list = match IpFamily::of(ip) {
            Some(IpFamily::V4) => &mut self.ipv4,
            Some(IpFamily::V6) => &mut self.ipv6,
            None => return,
        };
        if !list.iter().any(|known| known == ip) {
            list.push(ip.to_string());
        }
    }
}

/// Read the InternalIP addresses straight from a node object
pub fn node_private_ips(node: &Node) -> NodePrivateIps {
    let mut ips = NodePrivateIps::default();
    let addresses = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for address in addresses {
        if address.type_ == NODE_INTERNAL_IP {
            ips.push(&address.address);
        }
    }
    ips
}

/// Split a set of addresses by family
pub fn split_by_family<'a>(ips: impl IntoIterator<Item = &'a String>) -> NodePrivateIps {
    let mut split = NodePrivateIps::default();
    for ip in ips {
        split.push(ip);
    }
    split
}

/// Node name -> private IPs, shared by concurrent reconciliations
pub trait PrivateIpCache: Send + Sync {
    fn get(&self, node_name: &str) -> Option<BTreeSet<String>>;
    fn set(&self, node_name: &str, ips: BTreeSet<String>);
    fn remove(&self, node_name: &str);
    /// Reverse lookup of the node owning an address
    fn node_name_by_ip(&self, ip: &str) -> Option<String>;
}

/// [`PrivateIpCache`] backed by a sharded concurrent map
///
/// Readers and writers for different nodes never contend; a reverse lookup
/// walks the shards without holding more than one at a time.
#[derive(Debug, Default)]
pub struct NodeIpCache {
    inner: DashMap<String, BTreeSet<String>>,
}

impl NodeIpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl PrivateIpCache for NodeIpCache {
    fn get(&self, node_name: &str) -> Option<BTreeSet<String>> {
        self.inner.get(node_name).map(|ips| ips.value().clone())
    }

    fn set(&self, node_name: &str, ips: BTreeSet<String>) {
        if ips.is_empty() {
            self.inner.remove(node_name);
        } else {
            self.inner.insert(node_name.to_string(), ips);
        }
    }

    fn remove(&self, node_name: &str) {
        self.inner.remove(node_name);
    }

    fn node_name_by_ip(&self, ip: &str) -> Option<String> {
        self.inner
            .iter()
            .find(|entry| entry.value().contains(ip))
            .map(|entry| entry.key().clone())
    }
}

/// Resolves node addresses, preferring the node object over the cache
#[derive(Clone)]
pub struct AddressResolver {
    cache: Arc<dyn PrivateIpCache>,
}

impl AddressResolver {
    pub fn new(cache: Arc<dyn PrivateIpCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<dyn PrivateIpCache> {
        &self.cache
    }

    /// Record the node's current addresses in the cache
    pub fn observe(&self, node: &Node) {
        let fresh = node_private_ips(node);
        if !fresh.is_empty() {
            self.cache.set(&node.name_any(), fresh.all());
        }
    }

    pub fn forget(&self, node_name: &str) {
        self.cache.remove(node_name);
    }

    /// Private IPs of a node, falling back to the cache when the node object
    /// carries none
    pub fn private_ips(&self, node: &Node) -> NodePrivateIps {
        let fresh = node_private_ips(node);
        if !fresh.is_empty() {
            self.cache.set(&node.name_any(), fresh.all());
            return fresh;
        }
        match self.cache.get(&node.name_any()) {
            Some(cached) => {
                debug!("Using cached private IPs for node {}", node.name_any());
                split_by_family(cached.iter())
            }
            None => NodePrivateIps::default(),
        }
    }

    /// Cached private IPs of a node by name
    pub fn cached_private_ips(&self, node_name: &str) -> NodePrivateIps {
        self.cache
            .get(node_name)
            .map(|ips| split_by_family(ips.iter()))
            .unwrap_or_default()
    }

    pub fn node_name_by_ip(&self, ip: &str) -> Option<String> {
        self.cache.node_name_by_ip(ip)
    }
}
