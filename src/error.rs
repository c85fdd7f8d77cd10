//! Error types for backend pool reconciliation

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The node behind a backend entry no longer exists
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// VM set adapter failure, carried with the adapter's own message
    #[error("{0}")]
    VmSetError(String),

    /// Load balancer API failure
    #[error("{0}")]
    LoadBalancerClientError(String),

    /// Writing a backend pool failed
    #[error("failed to update backend pool {pool} of load balancer {load_balancer}: {source}")]
    BackendPoolUpdate {
        pool: String,
        load_balancer: String,
        #[source]
        source: Box<Error>,
    },

    /// Re-reading the load balancer after a NIC detach failed
    #[error("failed to refresh load balancer {load_balancer}: {source}")]
    LoadBalancerRefresh {
        load_balancer: String,
        #[source]
        source: Box<Error>,
    },

    /// The load balancer snapshot does not match the requested name
    #[error("load balancer {0} not found")]
    LoadBalancerNotFound(String),

    /// Node membership cannot be decided before the node cache has synced
    #[error("node informer is not synced when {0}")]
    NodeInformerNotSynced(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// True for the "node no longer exists" signal
    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, Error::InstanceNotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
