//! Backend pool reconciliation engine
//!
//! Two strategies implement [`BackendPool`], one per addressing mode:
//! - [`NodeIpConfigBackendPool`] - members are NIC IP-configuration references
//! - [`NodeIpBackendPool`] - members are raw node private IP addresses
//!
//! [`BackendPoolReconciler`] selects the configured strategy once and is the
//! entry point callers use. Pool-membership arithmetic lives in [`differ`].

pub mod differ;
pub mod node_ip;
pub mod node_ip_config;
pub mod reconciler;

#[cfg(test)]
mod differ_test;
#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::CloudConfig;
use crate::error::{Error, Result};
use crate::network::{BackendAddressPool, LoadBalancer, LoadBalancerClient};
use crate::nodes::addresses::{is_ipv6_service, AddressResolver};
use crate::nodes::NodeSource;
use crate::vmset::VmSet;

pub use node_ip::NodeIpBackendPool;
pub use node_ip_config::NodeIpConfigBackendPool;
pub use reconciler::BackendPoolReconciler;

/// Annotation marking a service as needing an internal load balancer
pub const INTERNAL_LB_ANNOTATION: &str = "service.beta.kubernetes.io/azure-load-balancer-internal";
/// Suffix distinguishing a cluster's internal load balancer
pub const INTERNAL_LB_NAME_SUFFIX: &str = "-internal";
/// Suffix of the IPv6 backend pool of a cluster
pub const IPV6_POOL_SUFFIX: &str = "-IPv6";

/// Result of one reconciliation pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    /// The pool is managed outside this engine and was left untouched
    pub pre_configured: bool,
    /// A write was issued or the pool's contents changed
    pub changed: bool,
}

impl ReconcileOutcome {
    pub fn pre_configured() -> Self {
        Self {
            pre_configured: true,
            changed: false,
        }
    }

    pub fn changed(changed: bool) -> Self {
        Self {
            pre_configured: false,
            changed,
        }
    }
}

/// Predicate over VM set names used by cleanup
pub type VmSetPredicate<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// Capability shared by both addressing modes
#[async_trait]
pub trait BackendPool: Send + Sync {
    /// Add the nodes' addresses to `pool`, writing it if anything changed
    #[allow(clippy::too_many_arguments)]
    async fn ensure_hosts_in_pool(
        &self,
        service: &Service,
        nodes: &[Arc<Node>],
        ignored_vm_set_name: &str,
        vnet_subnet_id: &str,
        cluster_name: &str,
        lb_name: &str,
        pool: &mut BackendAddressPool,
    ) -> Result<()>;

    /// Remove members whose VM set matches `should_remove` from the
    /// cluster's pool of `lb`
    async fn cleanup_vm_set_from_backend_pool_by_condition(
        &self,
        lb: &mut LoadBalancer,
        service: &Service,
        nodes: &[Arc<Node>],
        cluster_name: &str,
        should_remove: VmSetPredicate<'_>,
    ) -> Result<()>;

    /// Bring the cluster's pool of `lb` in line with the desired membership
    async fn reconcile_backend_pools(
        &self,
        cluster_name: &str,
        service: &Service,
        lb: &mut LoadBalancer,
    ) -> Result<ReconcileOutcome>;

    /// IPv4 and IPv6 private addresses of the pool's members
    async fn get_backend_private_ips(
        &self,
        cluster_name: &str,
        service: &Service,
        lb: &LoadBalancer,
    ) -> (Vec<String>, Vec<String>);
}

/// Collaborators and settings shared by the strategies
pub struct CloudContext {
    pub config: CloudConfig,
    pub vm_set: Arc<dyn VmSet>,
    pub lb_client: Arc<dyn LoadBalancerClient>,
    pub nodes: Arc<dyn NodeSource>,
    pub addresses: AddressResolver,
}

impl CloudContext {
    pub fn backend_pool_id(&self, lb_name: &str, pool_name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/loadBalancers/{}/backendAddressPools/{}",
            self.config.subscription_id,
            self.config.load_balancer_resource_group(),
            lb_name,
            pool_name
        )
    }

    /// VM set whose NICs back the given load balancer
    pub fn map_load_balancer_name_to_vm_set(&self, lb_name: &str, cluster_name: &str) -> String {
        let vm_set_name = lb_name
            .strip_suffix(INTERNAL_LB_NAME_SUFFIX)
            .unwrap_or(lb_name);
        if vm_set_name.eq_ignore_ascii_case(cluster_name) {
            self.vm_set.get_primary_vm_set_name()
        } else {
            vm_set_name.to_string()
        }
    }

    pub fn is_backend_pool_pre_configured(&self, service: &Service) -> bool {
        self.config
            .pre_configured_backend_pool_load_balancer_types
            .covers(requires_internal_load_balancer(service))
    }

    pub fn is_primary_vm_set(&self, vm_set_name: &str) -> bool {
        !vm_set_name.is_empty()
            && vm_set_name.eq_ignore_ascii_case(&self.vm_set.get_primary_vm_set_name())
    }

    /// Write one pool, wrapping failures with the pool and LB names
    pub async fn create_or_update_backend_pool(
        &self,
        lb_name: &str,
        pool: &BackendAddressPool,
    ) -> Result<()> {
        debug!("Writing backend pool {} of load balancer {}", pool.name, lb_name);
        self.lb_client
            .create_or_update_backend_pools(
                self.config.load_balancer_resource_group(),
                lb_name,
                &pool.name,
                pool,
                pool.etag.as_deref(),
            )
            .await
            .map_err(|e| Error::BackendPoolUpdate {
                pool: pool.name.clone(),
                load_balancer: lb_name.to_string(),
                source: Box::new(e),
            })
    }

    /// Re-read a load balancer from the cloud
    pub async fn refresh_load_balancer(&self, lb_name: &str) -> Result<LoadBalancer> {
        info!("Refreshing load balancer {}", lb_name);
        self.lb_client
            .get(self.config.load_balancer_resource_group(), lb_name, None)
            .await
            .map_err(|e| Error::LoadBalancerRefresh {
                load_balancer: lb_name.to_string(),
                source: Box::new(e),
            })
    }
}

/// Name of the cluster's backend pool serving `service`
pub fn backend_pool_name(cluster_name: &str, service: &Service) -> String {
    if is_ipv6_service(service) {
        format!("{}{}", cluster_name, IPV6_POOL_SUFFIX)
    } else {
        cluster_name.to_string()
    }
}

/// True for LoadBalancer services annotated as internal
pub fn requires_internal_load_balancer(service: &Service) -> bool {
    let is_lb = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "LoadBalancer");
    is_lb
        && service
            .annotations()
            .get(INTERNAL_LB_ANNOTATION)
            .is_some_and(|v| v == "true")
}

/// `namespace/name` of a service, for logs
pub fn service_name(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_else(|| "default".to_string()),
        service.name_any()
    )
}
