//! IP-configuration mode
//!
//! Pool members are references to NIC IP configurations. Members are added
//! when a node's NIC is attached to the pool during provisioning, so the
//! reconciliation path here only removes stale and excluded members and
//! converts pools that are still in node-IP mode.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use tracing::{debug, info, instrument, warn};

use super::differ::backend_ip_configurations_to_be_deleted;
use super::{
    backend_pool_name, service_name, BackendPool, CloudContext, ReconcileOutcome, VmSetPredicate,
};
use crate::error::Result;
use crate::network::{BackendAddressPool, InterfaceIpConfiguration, LoadBalancer, PoolShape};

pub struct NodeIpConfigBackendPool {
    ctx: Arc<CloudContext>,
}

impl NodeIpConfigBackendPool {
    pub fn new(ctx: Arc<CloudContext>) -> Self {
        Self { ctx }
    }

    /// Detach IP configurations from their VM sets, one adapter call per VM
    /// set. Stops at the first adapter error. Returns whether any call
    /// reported a cloud-side change.
    async fn detach_by_vm_set(
        &self,
        service: &Service,
        pool_name: &str,
        pool_id: &str,
        groups: BTreeMap<String, Vec<InterfaceIpConfiguration>>,
        delete_from_vm_set: bool,
    ) -> Result<bool> {
        let mut cloud_changed = false;
        for (vm_set_name, ip_configurations) in groups {
            info!(
                "Decoupling {} IP configurations of VM set {} from backend pool {}",
                ip_configurations.len(),
                vm_set_name,
                pool_name
            );
            let to_detach = BackendAddressPool {
                id: Some(pool_id.to_string()),
                name: pool_name.to_string(),
                backend_ip_configurations: ip_configurations,
                ..Default::default()
            };
            let updated = self
                .ctx
                .vm_set
                .ensure_backend_pool_deleted(
                    service,
                    pool_id,
                    &vm_set_name,
                    std::slice::from_ref(&to_detach),
                    delete_from_vm_set,
                )
                .await?;
            cloud_changed |= updated;
        }
        Ok(cloud_changed)
    }

    /// Strip detached entries from the in-memory pool, then re-read the load
    /// balancer if the detach changed cloud state
    async fn apply_detach(
        &self,
        lb: &mut LoadBalancer,
        pool_name: &str,
        removed: &HashSet<String>,
        cloud_changed: bool,
    ) -> Result<()> {
        if let Some(bp) = lb.pool_mut(pool_name) {
            bp.backend_ip_configurations
                .retain(|c| !removed.contains(&c.id));
        }
        if cloud_changed {
            let lb_name = lb.name.clone();
            *lb = self.ctx.refresh_load_balancer(&lb_name).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BackendPool for NodeIpConfigBackendPool {
    async fn ensure_hosts_in_pool(
        &self,
        _service: &Service,
        nodes: &[Arc<Node>],
        _ignored_vm_set_name: &str,
        _vnet_subnet_id: &str,
        _cluster_name: &str,
        lb_name: &str,
        pool: &mut BackendAddressPool,
    ) -> Result<()> {
        // NICs join the pool when their VM is provisioned
        debug!(
            "Skipping host registration of {} nodes in backend pool {} of {}",
            nodes.len(),
            pool.name,
            lb_name
        );
        Ok(())
    }

    #[instrument(skip_all, fields(lb = %lb.name, service = %service_name(service)))]
    async fn cleanup_vm_set_from_backend_pool_by_condition(
        &self,
        lb: &mut LoadBalancer,
        service: &Service,
        _nodes: &[Arc<Node>],
        cluster_name: &str,
        should_remove: VmSetPredicate<'_>,
    ) -> Result<()> {
        let pool_name = backend_pool_name(cluster_name, service);
        let pool_id = self.ctx.backend_pool_id(&lb.name, &pool_name);
        let Some(pool) = lb.pool(&pool_name) else {
            return Ok(());
        };

        let default_vm_set = self
            .ctx
            .map_load_balancer_name_to_vm_set(&lb.name, cluster_name);
        let mut groups: BTreeMap<String, Vec<InterfaceIpConfiguration>> = BTreeMap::new();
        for ip_configuration in &pool.backend_ip_configurations {
            let vm_set_name = match self
                .ctx
                .vm_set
                .get_node_name_by_ip_configuration_id(&ip_configuration.id)
                .await
            {
                Ok((_, vm_set_name)) => vm_set_name,
                Err(e) if e.is_instance_not_found() => String::new(),
                Err(e) => return Err(e),
            };
            if !should_remove(vm_set_name.as_str()) {
                continue;
            }
            debug!(
                "Removing IP configuration {} of VM set {}",
                ip_configuration.id, vm_set_name
            );
            let detach_from = if vm_set_name.is_empty() {
                default_vm_set.clone()
            } else {
                vm_set_name
            };
            groups
                .entry(detach_from)
                .or_default()
                .push(ip_configuration.clone());
        }

        if groups.is_empty() {
            return Ok(());
        }

        let removed: HashSet<String> = groups
            .values()
            .flatten()
            .map(|c| c.id.clone())
            .collect();
        let cloud_changed = self
            .detach_by_vm_set(service, &pool_name, &pool_id, groups, true)
            .await?;
        self.apply_detach(lb, &pool_name, &removed, cloud_changed)
            .await
    }

    #[instrument(skip_all, fields(lb = %lb.name, service = %service_name(service)))]
    async fn reconcile_backend_pools(
        &self,
        cluster_name: &str,
        service: &Service,
        lb: &mut LoadBalancer,
    ) -> Result<ReconcileOutcome> {
        if self.ctx.is_backend_pool_pre_configured(service) {
            info!("Backend pool of {} is pre-configured, leaving it untouched", lb.name);
            return Ok(ReconcileOutcome::pre_configured());
        }

        let lb_name = lb.name.clone();
        let pool_name = backend_pool_name(cluster_name, service);
        let pool_id = self.ctx.backend_pool_id(&lb_name, &pool_name);

        let Some(pool) = lb.pool(&pool_name) else {
            info!("Backend pool {} not found on {}, creating it", pool_name, lb_name);
            let bp = BackendAddressPool::empty(&pool_name, Some(pool_id));
            self.ctx.create_or_update_backend_pool(&lb_name, &bp).await?;
            lb.upsert_pool(bp);
            return Ok(ReconcileOutcome::changed(true));
        };

        if matches!(pool.shape(), PoolShape::Addresses | PoolShape::Mixed) {
            info!(
                "Backend pool {} holds node IP addresses, rebuilding it with IP configurations",
                pool_name
            );
            let mut bp = pool.clone();
            bp.id = bp.id.or(Some(pool_id));
            bp.etag = None;
            bp.load_balancer_backend_addresses.clear();
            self.ctx.create_or_update_backend_pool(&lb_name, &bp).await?;
            lb.upsert_pool(bp);
            return Ok(ReconcileOutcome::changed(true));
        }

        let mut not_found = Vec::new();
        let mut excluded = Vec::new();
        let mut owners: HashMap<String, String> = HashMap::new();
        for ip_configuration in &pool.backend_ip_configurations {
            let (node_name, vm_set_name) = match self
                .ctx
                .vm_set
                .get_node_name_by_ip_configuration_id(&ip_configuration.id)
                .await
            {
                Ok(owner) => owner,
                Err(e) if e.is_instance_not_found() => {
                    info!(
                        "Found IP configuration {} of a deleted node, decoupling it from {}",
                        ip_configuration.id, lb_name
                    );
                    not_found.push(ip_configuration.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !vm_set_name.is_empty() {
                owners.insert(ip_configuration.id.clone(), vm_set_name.clone());
            }
            if node_name.is_empty()
                || !self.ctx.nodes.should_exclude_from_load_balancer(&node_name)?
            {
                continue;
            }
            if self.ctx.is_primary_vm_set(&vm_set_name) {
                warn!(
                    "Node {} is excluded from load balancers but belongs to the primary VM set {}, keeping it",
                    node_name, vm_set_name
                );
                continue;
            }
            info!(
                "Found unwanted node {}, decoupling it from {}",
                node_name, lb_name
            );
            excluded.push(ip_configuration.clone());
        }

        let to_delete = backend_ip_configurations_to_be_deleted(pool, &not_found, &excluded);
        if to_delete.is_empty() {
            return Ok(ReconcileOutcome::changed(false));
        }

        let default_vm_set = self
            .ctx
            .map_load_balancer_name_to_vm_set(&lb_name, cluster_name);
        let mut groups: BTreeMap<String, Vec<InterfaceIpConfiguration>> = BTreeMap::new();
        for ip_configuration in &to_delete {
            let vm_set_name = owners
                .get(&ip_configuration.id)
                .cloned()
                .unwrap_or_else(|| default_vm_set.clone());
            groups
                .entry(vm_set_name)
                .or_default()
                .push(ip_configuration.clone());
        }

        let removed: HashSet<String> = to_delete.into_iter().map(|c| c.id).collect();
        let cloud_changed = self
            .detach_by_vm_set(service, &pool_name, &pool_id, groups, false)
            .await?;
        self.apply_detach(lb, &pool_name, &removed, cloud_changed)
            .await?;
        Ok(ReconcileOutcome::changed(true))
    }

    #[instrument(skip_all, fields(lb = %lb.name, service = %service_name(service)))]
    async fn get_backend_private_ips(
        &self,
        cluster_name: &str,
        service: &Service,
        lb: &LoadBalancer,
    ) -> (Vec<String>, Vec<String>) {
        let mut ipv4 = Vec::new();
        let mut ipv6 = Vec::new();
        let Some(pool) = lb.pool(&backend_pool_name(cluster_name, service)) else {
            return (ipv4, ipv6);
        };

        for ip_configuration in &pool.backend_ip_configurations {
            let node_name = match self
                .ctx
                .vm_set
                .get_node_name_by_ip_configuration_id(&ip_configuration.id)
                .await
            {
                Ok((node_name, _)) => node_name,
                Err(e) => {
                    warn!(
                        "Failed to resolve the node of IP configuration {}: {}",
                        ip_configuration.id, e
                    );
                    continue;
                }
            };

            let ips = match self.ctx.nodes.get(&node_name) {
                Some(node) => self.ctx.addresses.private_ips(&node),
                None => self.ctx.addresses.cached_private_ips(&node_name),
            };
            if ips.is_empty() {
                warn!("No private IPs known for node {}", node_name);
                continue;
            }
            ipv4.extend(ips.ipv4);
            ipv6.extend(ips.ipv6);
        }
        (ipv4, ipv6)
    }
}
