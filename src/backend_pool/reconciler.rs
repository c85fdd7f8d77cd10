//! Reconciliation orchestrator
//!
//! Picks the addressing strategy from configuration once, then runs every
//! pass through it. A pool populated in the other mode is migrated by the
//! target strategy itself; the orchestrator only detects and reports it.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Service};
use tracing::{info, instrument};

use super::differ::migration_required;
use super::{
    backend_pool_name, service_name, BackendPool, CloudContext, NodeIpBackendPool,
    NodeIpConfigBackendPool, ReconcileOutcome,
};
use crate::config::BackendPoolType;
use crate::error::Result;
use crate::network::{BackendAddressPool, LoadBalancer};

pub struct BackendPoolReconciler {
    ctx: Arc<CloudContext>,
    strategy: Box<dyn BackendPool>,
}

impl BackendPoolReconciler {
    pub fn new(ctx: Arc<CloudContext>) -> Self {
        let strategy: Box<dyn BackendPool> =
            match ctx.config.load_balancer_backend_pool_configuration_type {
                BackendPoolType::NodeIpConfiguration => {
                    Box::new(NodeIpConfigBackendPool::new(ctx.clone()))
                }
                BackendPoolType::NodeIp => Box::new(NodeIpBackendPool::new(ctx.clone())),
            };
        Self { ctx, strategy }
    }

    pub fn mode(&self) -> BackendPoolType {
        self.ctx.config.load_balancer_backend_pool_configuration_type
    }

    pub fn strategy(&self) -> &dyn BackendPool {
        self.strategy.as_ref()
    }

    pub fn context(&self) -> &Arc<CloudContext> {
        &self.ctx
    }

    /// One reconciliation pass of the service's pool on `lb`
    #[instrument(skip_all, fields(lb = %lb.name, service = %service_name(service), mode = %self.mode()))]
    pub async fn reconcile(
        &self,
        cluster_name: &str,
        service: &Service,
        lb: &mut LoadBalancer,
    ) -> Result<ReconcileOutcome> {
        let pool_name = backend_pool_name(cluster_name, service);
        let before = lb.pool(&pool_name).cloned();
        if let Some(pool) = &before {
            if migration_required(self.mode(), pool) {
                info!("Backend pool {} will be migrated to {} mode", pool_name, self.mode());
            }
        }

        let outcome = self
            .strategy
            .reconcile_backend_pools(cluster_name, service, lb)
            .await?;
        if outcome.pre_configured {
            return Ok(outcome);
        }

        let changed = outcome.changed || lb.pool(&pool_name) != before.as_ref();
        info!("Reconciled backend pool {}, changed: {}", pool_name, changed);
        Ok(ReconcileOutcome::changed(changed))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn ensure_hosts_in_pool(
        &self,
        service: &Service,
        nodes: &[Arc<Node>],
        ignored_vm_set_name: &str,
        vnet_subnet_id: &str,
        cluster_name: &str,
        lb_name: &str,
        pool: &mut BackendAddressPool,
    ) -> Result<()> {
        self.strategy
            .ensure_hosts_in_pool(
                service,
                nodes,
                ignored_vm_set_name,
                vnet_subnet_id,
                cluster_name,
                lb_name,
                pool,
            )
            .await
    }

    /// IPv4 and IPv6 private addresses currently in the service's pool
    pub async fn backend_private_ips(
        &self,
        cluster_name: &str,
        service: &Service,
        lb: &LoadBalancer,
    ) -> (Vec<String>, Vec<String>) {
        self.strategy
            .get_backend_private_ips(cluster_name, service, lb)
            .await
    }

    /// Remove members of every VM set other than the primary one
    pub async fn cleanup_non_primary_vm_sets(
        &self,
        lb: &mut LoadBalancer,
        service: &Service,
        nodes: &[Arc<Node>],
        cluster_name: &str,
    ) -> Result<()> {
        let primary = self.ctx.vm_set.get_primary_vm_set_name();
        let should_remove =
            move |name: &str| !name.is_empty() && !name.eq_ignore_ascii_case(&primary);
        self.strategy
            .cleanup_vm_set_from_backend_pool_by_condition(
                lb,
                service,
                nodes,
                cluster_name,
                &should_remove,
            )
            .await
    }
}
