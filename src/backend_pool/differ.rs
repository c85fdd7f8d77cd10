//! Pool-membership differ
//!
//! Pure functions deciding which pool members go and which desired members
//! are missing. Two emptiness guards live here and are deliberately not the
//! same rule:
//! - node-IP removal never empties a pool unless the caller asks for it
//! - IP-configuration removal drops excluded members first, but references
//!   to nodes that no longer exist are always removed, even to emptiness

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info};

use crate::config::BackendPoolType;
use crate::network::{BackendAddressPool, InterfaceIpConfiguration, PoolShape};

/// Remove entries whose address is in `unwanted_ips`
///
/// Unless `remove_all` is set, nothing is removed when the removal would
/// leave the pool without any entry. Entries without an address are never
/// removed. Returns whether the pool changed.
pub fn remove_node_ip_addresses_from_backend_pool<S: AsRef<str>>(
    pool: &mut BackendAddressPool,
    unwanted_ips: &[S],
    remove_all: bool,
) -> bool {
    let unwanted: HashSet<&str> = unwanted_ips.iter().map(AsRef::as_ref).collect();
    let remaining: Vec<_> = pool
        .load_balancer_backend_addresses
        .iter()
        .filter(|a| a.ip_address.is_empty() || !unwanted.contains(a.ip_address.as_str()))
        .cloned()
        .collect();

    let removed = pool.load_balancer_backend_addresses.len() - remaining.len();
    if removed == 0 {
        return false;
    }
    if remaining.is_empty() && !remove_all {
        info!(
            "Backend pool {} would be empty after removing {} addresses, skipping the removal",
            pool.name, removed
        );
        return false;
    }

    debug!("Removing {} addresses from backend pool {}", removed, pool.name);
    pool.load_balancer_backend_addresses = remaining;
    true
}

/// IP configurations to detach from a pool
///
/// The candidates are the union of `not_found` and `excluded`. If removing
/// the union would empty the pool, the excluded entries are dropped and only
/// the not-found ones are returned; a reference to a deleted node is invalid
/// and always goes.
pub fn backend_ip_configurations_to_be_deleted(
    pool: &BackendAddressPool,
    not_found: &[InterfaceIpConfiguration],
    excluded: &[InterfaceIpConfiguration],
) -> Vec<InterfaceIpConfiguration> {
    if pool.backend_ip_configurations.is_empty() {
        return Vec::new();
    }

    let candidates: HashSet<&str> = not_found
        .iter()
        .chain(excluded.iter())
        .map(|c| c.id.as_str())
        .collect();
    let removed = pool
        .backend_ip_configurations
        .iter()
        .filter(|c| candidates.contains(c.id.as_str()))
        .count();

    let mut seen = HashSet::new();
    if removed == pool.backend_ip_configurations.len() {
        info!(
            "Backend pool {} would be empty after removing excluded IP configurations, removing only those of deleted nodes",
            pool.name
        );
        return not_found
            .iter()
            .filter(|c| seen.insert(c.id.clone()))
            .cloned()
            .collect();
    }

    not_found
        .iter()
        .chain(excluded.iter())
        .filter(|c| seen.insert(c.id.clone()))
        .cloned()
        .collect()
}

/// Addresses to add and to remove to turn `current` into `desired`
///
/// `to_add` keeps the order of `desired`; `to_remove` is sorted.
pub fn diff_addresses<'a>(
    current: impl IntoIterator<Item = &'a str>,
    desired: &[String],
) -> (Vec<String>, Vec<String>) {
    let current: BTreeSet<&str> = current.into_iter().collect();
    let wanted: HashSet<&str> = desired.iter().map(String::as_str).collect();

    let mut seen = HashSet::new();
    let to_add = desired
        .iter()
        .filter(|ip| !current.contains(ip.as_str()) && seen.insert(ip.as_str()))
        .cloned()
        .collect();
    let to_remove = current
        .iter()
        .filter(|ip| !wanted.contains(*ip))
        .map(|ip| ip.to_string())
        .collect();
    (to_add, to_remove)
}

/// True if the pool holds any member of the other mode than `configured`
pub fn migration_required(configured: BackendPoolType, pool: &BackendAddressPool) -> bool {
    matches!(
        (configured, pool.shape()),
        (
            BackendPoolType::NodeIpConfiguration,
            PoolShape::Addresses | PoolShape::Mixed
        ) | (
            BackendPoolType::NodeIp,
            PoolShape::IpConfigurations | PoolShape::Mixed
        )
    )
}
