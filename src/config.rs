//! Cloud configuration
//!
//! The cloud configuration is a JSON document with camelCase keys, the same
//! shape the cloud provider's own config file uses. Only the settings the
//! backend pool engine consumes are modelled here.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How backend pool membership is expressed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendPoolType {
    /// Members are references to NIC IP configurations
    #[default]
    #[serde(rename = "nodeIPConfiguration")]
    NodeIpConfiguration,
    /// Members are raw node private IP addresses
    #[serde(rename = "nodeIP")]
    NodeIp,
}

impl std::fmt::Display for BackendPoolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendPoolType::NodeIpConfiguration => write!(f, "nodeIPConfiguration"),
            BackendPoolType::NodeIp => write!(f, "nodeIP"),
        }
    }
}

/// Which load balancers have externally managed backend pools
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PreConfiguredLoadBalancerTypes {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "internal")]
    Internal,
    #[serde(rename = "external")]
    External,
    #[serde(rename = "all")]
    All,
}

impl PreConfiguredLoadBalancerTypes {
    /// Whether a load balancer of the given kind has a pre-configured pool
    pub fn covers(&self, internal: bool) -> bool {
        match self {
            PreConfiguredLoadBalancerTypes::None => false,
            PreConfiguredLoadBalancerTypes::All => true,
            PreConfiguredLoadBalancerTypes::Internal => internal,
            PreConfiguredLoadBalancerTypes::External => !internal,
        }
    }
}

/// Settings shared by both backend pool strategies
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    pub subscription_id: String,
    pub resource_group: String,

    /// Resource group of the load balancers; defaults to `resource_group`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_resource_group: Option<String>,

    #[serde(default)]
    pub vnet_name: String,

    /// Resource group of the virtual network; defaults to `resource_group`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnet_resource_group: Option<String>,

    #[serde(default)]
    pub load_balancer_backend_pool_configuration_type: BackendPoolType,

    #[serde(default)]
    pub pre_configured_backend_pool_load_balancer_types: PreConfiguredLoadBalancerTypes,
}

impl CloudConfig {
    /// Read and validate a cloud config file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: CloudConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.subscription_id.trim().is_empty() {
            return Err(Error::ConfigError("subscriptionId must be set".to_string()));
        }
        if self.resource_group.trim().is_empty() {
            return Err(Error::ConfigError("resourceGroup must be set".to_string()));
        }
        Ok(())
    }

    pub fn load_balancer_resource_group(&self) -> &str {
        self.load_balancer_resource_group
            .as_deref()
            .filter(|rg| !rg.is_empty())
            .unwrap_or(&self.resource_group)
    }

    /// Resource ID of the cluster virtual network, if one is configured
    pub fn vnet_id(&self) -> Option<String> {
        if self.vnet_name.is_empty() {
            return None;
        }
        let rg = self
            .vnet_resource_group
            .as_deref()
            .filter(|rg| !rg.is_empty())
            .unwrap_or(&self.resource_group);
        Some(format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}",
            self.subscription_id, rg, self.vnet_name
        ))
    }
}
