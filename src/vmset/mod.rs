//! VM set adapter
//!
//! A VM set is the cloud grouping (availability set or scale set) a node's
//! virtual machine belongs to. The engine only needs four things from it:
//! mapping a NIC IP configuration back to its node, naming a node's VM set,
//! naming the primary VM set, and detaching a pool from a VM set's NICs.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::network::BackendAddressPool;

#[async_trait]
pub trait VmSet: Send + Sync {
    /// Resolve a NIC IP configuration ID to `(node name, VM set name)`
    ///
    /// Returns [`Error::InstanceNotFound`] when the owning VM is gone.
    async fn get_node_name_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<(String, String)>;

    fn get_primary_vm_set_name(&self) -> String;

    async fn get_node_vm_set_name(&self, node: &Node) -> Result<String>;

    /// Detach the given pools' IP configurations from the NICs of a VM set
    ///
    /// Returns whether any cloud resource was changed.
    async fn ensure_backend_pool_deleted(
        &self,
        service: &Service,
        backend_pool_id: &str,
        vm_set_name: &str,
        backend_pools: &[BackendAddressPool],
        delete_from_vm_set: bool,
    ) -> Result<bool>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfigurationOwner {
    pub node_name: String,
    #[serde(default)]
    pub vm_set_name: String,
}

/// VM set inventory snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSetInventory {
    pub primary_vm_set_name: String,
    #[serde(default)]
    pub ip_configurations: BTreeMap<String, IpConfigurationOwner>,
    #[serde(default)]
    pub node_vm_sets: BTreeMap<String, String>,
}

/// A detach request recorded by [`StaticVmSet`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachRequest {
    pub backend_pool_id: String,
    pub vm_set_name: String,
    pub ip_configuration_ids: Vec<String>,
    pub delete_from_vm_set: bool,
}

/// VM set adapter answering from a fixed inventory
///
/// Detach requests are recorded rather than applied, so the adapter always
/// reports that no cloud state changed.
pub struct StaticVmSet {
    inventory: VmSetInventory,
    detached: Mutex<Vec<DetachRequest>>,
}

impl StaticVmSet {
    pub fn new(inventory: VmSetInventory) -> Self {
        Self {
            inventory,
            detached: Mutex::new(Vec::new()),
        }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let inventory: VmSetInventory = serde_json::from_str(&raw)?;
        if inventory.primary_vm_set_name.is_empty() {
            return Err(Error::ConfigError(
                "VM set inventory has no primaryVmSetName".to_string(),
            ));
        }
        Ok(Self::new(inventory))
    }

    pub async fn detach_requests(&self) -> Vec<DetachRequest> {
        self.detached.lock().await.clone()
    }
}

#[async_trait]
impl VmSet for StaticVmSet {
    async fn get_node_name_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<(String, String)> {
        self.inventory
            .ip_configurations
            .get(ip_configuration_id)
            .map(|owner| (owner.node_name.clone(), owner.vm_set_name.clone()))
            .ok_or_else(|| Error::InstanceNotFound(ip_configuration_id.to_string()))
    }

    fn get_primary_vm_set_name(&self) -> String {
        self.inventory.primary_vm_set_name.clone()
    }

    async fn get_node_vm_set_name(&self, node: &Node) -> Result<String> {
        let name = node.name_any();
        Ok(self
            .inventory
            .node_vm_sets
            .get(&name)
            .cloned()
            .unwrap_or_else(|| {
                debug!("Node {} not in inventory, assuming the primary VM set", name);
                self.inventory.primary_vm_set_name.clone()
            }))
    }

    async fn ensure_backend_pool_deleted(
        &self,
        _service: &Service,
        backend_pool_id: &str,
        vm_set_name: &str,
        backend_pools: &[BackendAddressPool],
        delete_from_vm_set: bool,
    ) -> Result<bool> {
        let ip_configuration_ids: Vec<String> = backend_pools
            .iter()
            .flat_map(|bp| bp.backend_ip_configurations.iter().map(|c| c.id.clone()))
            .collect();
        info!(
            "Recording detach of {} IP configurations of VM set {} from {}",
            ip_configuration_ids.len(),
            vm_set_name,
            backend_pool_id
        );
        self.detached.lock().await.push(DetachRequest {
            backend_pool_id: backend_pool_id.to_string(),
            vm_set_name: vm_set_name.to_string(),
            ip_configuration_ids,
            delete_from_vm_set,
        });
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InterfaceIpConfiguration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn inventory() -> VmSetInventory {
        serde_json::from_str(
            r#"{
                "primaryVmSetName": "agentpool1-availabilitySet-00000000",
                "ipConfigurations": {
                    "ipconfig1": {"nodeName": "k8s-agentpool1-00000000", "vmSetName": "agentpool1-availabilitySet-00000000"}
                },
                "nodeVmSets": {"k8s-agentpool2-00000000": "agentpool2-availabilitySet-00000000"}
            }"#,
        )
        .unwrap()
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_ip_configuration_is_not_found() {
        let vm_set = StaticVmSet::new(inventory());
        let (node, set) = vm_set
            .get_node_name_by_ip_configuration_id("ipconfig1")
            .await
            .unwrap();
        assert_eq!(node, "k8s-agentpool1-00000000");
        assert_eq!(set, "agentpool1-availabilitySet-00000000");

        let err = vm_set
            .get_node_name_by_ip_configuration_id("ipconfig9")
            .await
            .unwrap_err();
        assert!(err.is_instance_not_found());
    }

    #[tokio::test]
    async fn test_node_vm_set_falls_back_to_primary() {
        let vm_set = StaticVmSet::new(inventory());
        assert_eq!(
            vm_set
                .get_node_vm_set_name(&node("k8s-agentpool2-00000000"))
                .await
                .unwrap(),
            "agentpool2-availabilitySet-00000000"
        );
        assert_eq!(
            vm_set.get_node_vm_set_name(&node("unknown")).await.unwrap(),
            "agentpool1-availabilitySet-00000000"
        );
    }

    #[tokio::test]
    async fn test_detach_is_recorded() {
        let vm_set = StaticVmSet::new(inventory());
        let mut bp = BackendAddressPool::empty("kubernetes", None);
        bp.backend_ip_configurations
            .push(InterfaceIpConfiguration::new("ipconfig1"));
        let changed = vm_set
            .ensure_backend_pool_deleted(&Service::default(), "pool-id", "set", &[bp], false)
            .await
            .unwrap();
        assert!(!changed);
        let requests = vm_set.detach_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].ip_configuration_ids, vec!["ipconfig1".to_string()]);
    }
}
