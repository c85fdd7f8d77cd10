//! Node-IP mode
//!
//! Pool members are raw private IP addresses. The desired membership is the
//! current node list minus excluded nodes, each mapped to the first private
//! address of every IP family the service is served on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::differ::{diff_addresses, remove_node_ip_addresses_from_backend_pool};
use super::{
    backend_pool_name, service_name, BackendPool, CloudContext, ReconcileOutcome, VmSetPredicate,
};
use crate::error::{Error, Result};
use crate::network::{BackendAddressPool, LoadBalancer, LoadBalancerBackendAddress, SubResource};
use crate::nodes::addresses::{service_ip_families, IpFamily};
use crate::nodes::excluded_by_labels;

const SUBNETS_SEGMENT: &str = "/subnets/";

/// One address the pool should hold
struct DesiredAddress {
    node: Arc<Node>,
    family: IpFamily,
    ip: String,
}

pub struct NodeIpBackendPool {
    ctx: Arc<CloudContext>,
}

impl NodeIpBackendPool {
    pub fn new(ctx: Arc<CloudContext>) -> Self {
        Self { ctx }
    }

    /// Addresses of every eligible node, in node list order
    async fn desired_backend_addresses(&self, service: &Service) -> Result<Vec<DesiredAddress>> {
        if !self.ctx.nodes.is_synced() {
            return Err(Error::NodeInformerNotSynced(
                "listing the desired backend addresses".to_string(),
            ));
        }

        let families = service_ip_families(service);
        let mut desired = Vec::new();
        for node in self.ctx.nodes.list() {
            let node_name = node.name_any();
            if self.ctx.nodes.should_exclude_from_load_balancer(&node_name)? {
                debug!("Node {} is excluded from load balancers", node_name);
                continue;
            }
            let ips = self.ctx.addresses.private_ips(&node);
            if ips.is_empty() {
                debug!("Node {} has no private IP yet, skipping it", node_name);
                continue;
            }
            for &family in &families {
                if let Some(ip) = ips.first(family) {
                    desired.push(DesiredAddress {
                        node: node.clone(),
                        family,
                        ip: ip.to_string(),
                    });
                }
            }
        }
        Ok(desired)
    }

    /// A pool entry for `ip`, named after the node unless it belongs to the
    /// primary VM set
    async fn backend_address(
        &self,
        node: &Node,
        family: IpFamily,
        ip: &str,
    ) -> Result<LoadBalancerBackendAddress> {
        let vm_set_name = self.ctx.vm_set.get_node_vm_set_name(node).await?;
        Ok(LoadBalancerBackendAddress::new(
            self.entry_name(&node.name_any(), &vm_set_name, family),
            ip,
        ))
    }

    fn entry_name(&self, node_name: &str, vm_set_name: &str, family: IpFamily) -> Option<String> {
        if vm_set_name.is_empty() || self.ctx.is_primary_vm_set(vm_set_name) {
            return None;
        }
        Some(match family {
            IpFamily::V4 => node_name.to_string(),
            IpFamily::V6 => format!("{}-ipv6", node_name),
        })
    }

    /// Attach the cluster virtual network to a pool that gained addresses
    fn attach_virtual_network(&self, pool: &mut BackendAddressPool, vnet_subnet_id: &str) {
        if pool.virtual_network.is_some() {
            return;
        }
        let vnet_id = vnet_subnet_id
            .split_once(SUBNETS_SEGMENT)
            .map(|(vnet, _)| vnet.to_string())
            .or_else(|| self.ctx.config.vnet_id());
        if let Some(id) = vnet_id {
            pool.virtual_network = Some(SubResource::new(id));
        }
    }
}

/// Move per-entry virtual network references up to the pool
pub(crate) fn hoist_virtual_network(pool: &mut BackendAddressPool) {
    for address in &mut pool.load_balancer_backend_addresses {
        if let Some(vnet) = address.virtual_network.take() {
            pool.virtual_network.get_or_insert(vnet);
        }
    }
}

#[async_trait]
impl BackendPool for NodeIpBackendPool {
    #[instrument(skip_all, fields(lb = %lb_name, pool = %pool.name))]
    async fn ensure_hosts_in_pool(
        &self,
        service: &Service,
        nodes: &[Arc<Node>],
        ignored_vm_set_name: &str,
        vnet_subnet_id: &str,
        _cluster_name: &str,
        lb_name: &str,
        pool: &mut BackendAddressPool,
    ) -> Result<()> {
        let families = service_ip_families(service);
        let mut added = 0;
        for node in nodes {
            let node_name = node.name_any();
            if excluded_by_labels(node)
                || self.ctx.nodes.should_exclude_from_load_balancer(&node_name)?
            {
                debug!("Node {} is excluded from load balancers", node_name);
                continue;
            }

            let vm_set_name = self.ctx.vm_set.get_node_vm_set_name(node).await?;
            if !ignored_vm_set_name.is_empty()
                && vm_set_name.eq_ignore_ascii_case(ignored_vm_set_name)
            {
                debug!("Node {} belongs to ignored VM set {}", node_name, vm_set_name);
                continue;
            }

            let ips = self.ctx.addresses.private_ips(node);
            if ips.is_empty() {
                info!("Node {} is not ready, no private IP found", node_name);
                continue;
            }
            for &family in &families {
                let Some(ip) = ips.first(family) else {
                    continue;
                };
                if pool.has_ip_address(ip) {
                    continue;
                }
                debug!("Adding {} of node {} to backend pool {}", ip, node_name, pool.name);
                pool.load_balancer_backend_addresses
                    .push(LoadBalancerBackendAddress::new(
                        self.entry_name(&node_name, &vm_set_name, family),
                        ip,
                    ));
                added += 1;
            }
        }

        if added == 0 {
            return Ok(());
        }
        self.attach_virtual_network(pool, vnet_subnet_id);
        info!("Adding {} addresses to backend pool {}", added, pool.name);
        self.ctx.create_or_update_backend_pool(lb_name, pool).await
    }

    #[instrument(skip_all, fields(lb = %lb.name, service = %service_name(service)))]
    async fn cleanup_vm_set_from_backend_pool_by_condition(
        &self,
        lb: &mut LoadBalancer,
        service: &Service,
        nodes: &[Arc<Node>],
        cluster_name: &str,
        should_remove: VmSetPredicate<'_>,
    ) -> Result<()> {
        let pool_name = backend_pool_name(cluster_name, service);
        let Some(mut bp) = lb.pool(&pool_name).cloned() else {
            return Ok(());
        };

        let mut owners: HashMap<String, Arc<Node>> = HashMap::new();
        for node in nodes {
            for ip in self.ctx.addresses.private_ips(node).all() {
                owners.insert(ip, node.clone());
            }
        }

        let ips: Vec<String> = bp.ip_addresses().map(str::to_string).collect();
        let mut unwanted = Vec::new();
        for ip in ips {
            let owner = owners.get(&ip).cloned().or_else(|| {
                self.ctx
                    .addresses
                    .node_name_by_ip(&ip)
                    .and_then(|name| self.ctx.nodes.get(&name))
            });
            let Some(node) = owner else {
                debug!("No node owns address {}", ip);
                continue;
            };
            let vm_set_name = self.ctx.vm_set.get_node_vm_set_name(&node).await?;
            if should_remove(vm_set_name.as_str()) {
                debug!(
                    "Removing {} of node {} in VM set {}",
                    ip,
                    node.name_any(),
                    vm_set_name
                );
                unwanted.push(ip);
            }
        }

        if !remove_node_ip_addresses_from_backend_pool(&mut bp, &unwanted, true) {
            return Ok(());
        }
        self.ctx.create_or_update_backend_pool(&lb.name, &bp).await?;
        lb.upsert_pool(bp);
        Ok(())
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

        let mut rebuilt = false;
        let mut bp = match lb.pool(&pool_name) {
            None => {
                info!("Backend pool {} not found on {}, creating it", pool_name, lb_name);
                rebuilt = true;
                BackendAddressPool::empty(&pool_name, Some(pool_id.clone()))
            }
            Some(pool) if !pool.backend_ip_configurations.is_empty() => {
                info!(
                    "Backend pool {} holds IP configurations, rebuilding it with node IPs",
                    pool_name
                );
                let vm_set_name = self
                    .ctx
                    .map_load_balancer_name_to_vm_set(&lb_name, cluster_name);
                self.ctx
                    .vm_set
                    .ensure_backend_pool_deleted(
                        service,
                        &pool_id,
                        &vm_set_name,
                        std::slice::from_ref(pool),
                        true,
                    )
                    .await?;
                rebuilt = true;
                BackendAddressPool::empty(&pool.name, pool.id.clone().or(Some(pool_id.clone())))
            }
            Some(pool) => pool.clone(),
        };

        let desired = self.desired_backend_addresses(service).await?;
        let desired_ips: Vec<String> = desired.iter().map(|d| d.ip.clone()).collect();
        let (to_add, to_remove) = diff_addresses(bp.ip_addresses(), &desired_ips);

        for ip in &to_add {
            let Some(d) = desired.iter().find(|d| &d.ip == ip) else {
                continue;
            };
            info!("Adding {} of node {} to {}", ip, d.node.name_any(), pool_name);
            let address = self.backend_address(&d.node, d.family, ip).await?;
            bp.load_balancer_backend_addresses.push(address);
        }

        let removed = !to_remove.is_empty()
            && remove_node_ip_addresses_from_backend_pool(&mut bp, &to_remove, false);
        if removed {
            info!("Removed {} stale addresses from {}", to_remove.len(), pool_name);
        } else if !to_remove.is_empty() {
            warn!(
                "Keeping {} stale addresses in {} to avoid an empty pool",
                to_remove.len(),
                pool_name
            );
        }

        if to_add.is_empty() && !removed && !rebuilt {
            return Ok(ReconcileOutcome::changed(false));
        }

        hoist_virtual_network(&mut bp);
        if !to_add.is_empty() {
            self.attach_virtual_network(&mut bp, "");
        }
        self.ctx.create_or_update_backend_pool(&lb_name, &bp).await?;
        lb.upsert_pool(bp);
        Ok(ReconcileOutcome::changed(true))
    }

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
        for ip in pool.ip_addresses() {
            match IpFamily::of(ip) {
                Some(IpFamily::V4) => ipv4.push(ip.to_string()),
                Some(IpFamily::V6) => ipv6.push(ip.to_string()),
                None => warn!("Backend pool {} holds an invalid address {}", pool.name, ip),
            }
        }
        (ipv4, ipv6)
    }
}
