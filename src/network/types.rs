//! Load balancer data model
//!
//! A trimmed-down view of the network resource provider's load balancer
//! objects: only what backend pool reconciliation reads or writes.
//!
//! - [`LoadBalancer`] owns an ordered list of [`BackendAddressPool`]s
//! - a pool holds either [`InterfaceIpConfiguration`] references
//!   (IP-configuration mode) or [`LoadBalancerBackendAddress`] entries
//!   (node-IP mode), never both once reconciled

use serde::{Deserialize, Serialize};

/// Reference to another cloud resource by ID
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubResource {
    pub id: String,
}

impl SubResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A NIC IP configuration attached to a backend pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceIpConfiguration {
    pub id: String,
}

impl InterfaceIpConfiguration {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A raw IP address member of a backend pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerBackendAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_network: Option<SubResource>,
}

impl LoadBalancerBackendAddress {
    pub fn new(name: Option<String>, ip_address: impl Into<String>) -> Self {
        Self {
            name,
            ip_address: ip_address.into(),
            virtual_network: None,
        }
    }
}

/// Which addressing field of a pool is populated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolShape {
    Empty,
    IpConfigurations,
    Addresses,
    /// Both fields populated; never valid after reconciliation
    Mixed,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendAddressPool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_ip_configurations: Vec<InterfaceIpConfiguration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_backend_addresses: Vec<LoadBalancerBackendAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_network: Option<SubResource>,
}

impl BackendAddressPool {
    /// An empty pool with no members in either mode
    pub fn empty(name: impl Into<String>, id: Option<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn shape(&self) -> PoolShape {
        match (
            self.backend_ip_configurations.is_empty(),
            self.load_balancer_backend_addresses.is_empty(),
        ) {
            (true, true) => PoolShape::Empty,
            (false, true) => PoolShape::IpConfigurations,
            (true, false) => PoolShape::Addresses,
            (false, false) => PoolShape::Mixed,
        }
    }

    /// Number of members in whichever mode the pool is in
    pub fn member_count(&self) -> usize {
        self.backend_ip_configurations.len() + self.load_balancer_backend_addresses.len()
    }

    /// Addresses of the IP entries, skipping entries with no address
    pub fn ip_addresses(&self) -> impl Iterator<Item = &str> {
        self.load_balancer_backend_addresses
            .iter()
            .map(|a| a.ip_address.as_str())
            .filter(|ip| !ip.is_empty())
    }

    pub fn has_ip_address(&self, ip: &str) -> bool {
        self.load_balancer_backend_addresses
            .iter()
            .any(|a| a.ip_address == ip)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub backend_address_pools: Vec<BackendAddressPool>,
}

impl LoadBalancer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Position of the pool with the given name (case-insensitive)
    pub fn pool_index(&self, pool_name: &str) -> Option<usize> {
        self.backend_address_pools
            .iter()
            .position(|bp| bp.name.eq_ignore_ascii_case(pool_name))
    }

    pub fn pool(&self, pool_name: &str) -> Option<&BackendAddressPool> {
        self.pool_index(pool_name)
            .map(|i| &self.backend_address_pools[i])
    }

    pub fn pool_mut(&mut self, pool_name: &str) -> Option<&mut BackendAddressPool> {
        self.pool_index(pool_name)
            .map(move |i| &mut self.backend_address_pools[i])
    }

    /// Replace the pool with the same name, or append it
    pub fn upsert_pool(&mut self, pool: BackendAddressPool) {
        match self.pool_index(&pool.name) {
            Some(i) => self.backend_address_pools[i] = pool,
            None => self.backend_address_pools.push(pool),
        }
    }
}
