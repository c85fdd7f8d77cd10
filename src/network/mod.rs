//! Load balancer resources and the client used to read and write them

pub mod client;
pub mod types;

pub use client::{FileLoadBalancerClient, LoadBalancerClient};
pub use types::{
    BackendAddressPool, InterfaceIpConfiguration, LoadBalancer, LoadBalancerBackendAddress,
    PoolShape, SubResource,
};
