//! Recording fakes and fixtures shared by the backend pool tests

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeStatus, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::CloudContext;
use crate::config::{BackendPoolType, CloudConfig, PreConfiguredLoadBalancerTypes};
use crate::error::{Error, Result};
use crate::network::{
    BackendAddressPool, InterfaceIpConfiguration, LoadBalancer, LoadBalancerBackendAddress,
    LoadBalancerClient,
};
use crate::nodes::addresses::{AddressResolver, NodeIpCache, PrivateIpCache};
use crate::nodes::StaticNodeSource;
use crate::vmset::VmSet;

pub const TEST_CLUSTER: &str = "testCluster";

pub fn ip_config_id(agent_pool: &str) -> String {
    format!(
        "/subscriptions/subscription/resourceGroups/rg/providers/Microsoft.Network/networkInterfaces/k8s-{}-00000000-nic-1/ipConfigurations/ipconfig1",
        agent_pool
    )
}

#[derive(Clone)]
pub enum Lookup {
    Found(String, String),
    NotFound,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetachCall {
    pub backend_pool_id: String,
    pub vm_set_name: String,
    pub ip_configuration_ids: Vec<String>,
    pub delete_from_vm_set: bool,
}

pub struct FakeVmSet {
    pub primary: String,
    lookups: Mutex<HashMap<String, Lookup>>,
    node_vm_sets: Mutex<HashMap<String, String>>,
    detach_results: Mutex<VecDeque<Result<bool>>>,
    pub detach_calls: Mutex<Vec<DetachCall>>,
    pub lookup_calls: AtomicUsize,
}

impl FakeVmSet {
    pub fn new(primary: &str) -> Self {
        Self {
            primary: primary.to_string(),
            lookups: Mutex::new(HashMap::new()),
            node_vm_sets: Mutex::new(HashMap::new()),
            detach_results: Mutex::new(VecDeque::new()),
            detach_calls: Mutex::new(Vec::new()),
            lookup_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_ip_config(self, id: &str, node: &str, vm_set: &str) -> Self {
        self.set_lookup(id, Lookup::Found(node.to_string(), vm_set.to_string()));
        self
    }

    pub fn with_missing_ip_config(self, id: &str) -> Self {
        self.set_lookup(id, Lookup::NotFound);
        self
    }

    pub fn with_node_vm_set(self, node: &str, vm_set: &str) -> Self {
        self.node_vm_sets
            .lock()
            .unwrap()
            .insert(node.to_string(), vm_set.to_string());
        self
    }

    pub fn set_lookup(&self, id: &str, lookup: Lookup) {
        self.lookups.lock().unwrap().insert(id.to_string(), lookup);
    }

    /// Queue the result of the next detach call; unqueued calls return `Ok(false)`
    pub fn push_detach_result(&self, result: Result<bool>) {
        self.detach_results.lock().unwrap().push_back(result);
    }

    pub fn detach_calls(&self) -> Vec<DetachCall> {
        self.detach_calls.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VmSet for FakeVmSet {
    async fn get_node_name_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<(String, String)> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        let lookup = self
            .lookups
            .lock()
            .unwrap()
            .get(ip_configuration_id)
            .cloned()
            .unwrap_or(Lookup::NotFound);
        match lookup {
            Lookup::Found(node, vm_set) => Ok((node, vm_set)),
            Lookup::NotFound => Err(Error::InstanceNotFound(ip_configuration_id.to_string())),
            Lookup::Failed(msg) => Err(Error::VmSetError(msg)),
        }
    }

    fn get_primary_vm_set_name(&self) -> String {
        self.primary.clone()
    }

    async fn get_node_vm_set_name(&self, node: &Node) -> Result<String> {
        Ok(self
            .node_vm_sets
            .lock()
            .unwrap()
            .get(&node.name_any())
            .cloned()
            .unwrap_or_else(|| self.primary.clone()))
    }

    async fn ensure_backend_pool_deleted(
        &self,
        _service: &Service,
        backend_pool_id: &str,
        vm_set_name: &str,
        backend_pools: &[BackendAddressPool],
        delete_from_vm_set: bool,
    ) -> Result<bool> {
        self.detach_calls.lock().unwrap().push(DetachCall {
            backend_pool_id: backend_pool_id.to_string(),
            vm_set_name: vm_set_name.to_string(),
            ip_configuration_ids: backend_pools
                .iter()
                .flat_map(|bp| bp.backend_ip_configurations.iter().map(|c| c.id.clone()))
                .collect(),
            delete_from_vm_set,
        });
        self.detach_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(false))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoolWrite {
    pub lb_name: String,
    pub pool: BackendAddressPool,
    pub etag: Option<String>,
}

#[derive(Default)]
pub struct FakeLoadBalancerClient {
    write_errors: Mutex<VecDeque<String>>,
    pub writes: Mutex<Vec<PoolWrite>>,
    get_result: Mutex<Option<LoadBalancer>>,
    pub get_calls: AtomicUsize,
}

impl FakeLoadBalancerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_write(&self, msg: &str) {
        self.write_errors.lock().unwrap().push_back(msg.to_string());
    }

    pub fn set_get_result(&self, lb: LoadBalancer) {
        *self.get_result.lock().unwrap() = Some(lb);
    }

    pub fn writes(&self) -> Vec<PoolWrite> {
        self.writes.lock().unwrap().clone()
    }

    pub fn gets(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoadBalancerClient for FakeLoadBalancerClient {
    async fn create_or_update_backend_pools(
        &self,
        _resource_group: &str,
        lb_name: &str,
        _pool_name: &str,
        pool: &BackendAddressPool,
        etag: Option<&str>,
    ) -> Result<()> {
        if let Some(msg) = self.write_errors.lock().unwrap().pop_front() {
            return Err(Error::LoadBalancerClientError(msg));
        }
        self.writes.lock().unwrap().push(PoolWrite {
            lb_name: lb_name.to_string(),
            pool: pool.clone(),
            etag: etag.map(str::to_string),
        });
        Ok(())
    }

    async fn get(
        &self,
        _resource_group: &str,
        lb_name: &str,
        _expand: Option<&str>,
    ) -> Result<LoadBalancer> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.get_result
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::LoadBalancerNotFound(lb_name.to_string()))
    }
}

pub struct Fixture {
    pub vm_set: Arc<FakeVmSet>,
    pub lb_client: Arc<FakeLoadBalancerClient>,
    pub cache: Arc<NodeIpCache>,
    pub ctx: Arc<CloudContext>,
}

pub fn cloud_config(mode: BackendPoolType) -> CloudConfig {
    CloudConfig {
        subscription_id: "subscription".to_string(),
        resource_group: "rg".to_string(),
        vnet_name: "vnet".to_string(),
        load_balancer_backend_pool_configuration_type: mode,
        ..Default::default()
    }
}

pub fn fixture(config: CloudConfig, vm_set: FakeVmSet, nodes: Vec<Node>, excluded: &[&str]) -> Fixture {
    let vm_set = Arc::new(vm_set);
    let lb_client = Arc::new(FakeLoadBalancerClient::new());
    let cache = Arc::new(NodeIpCache::new());
    let excluded: HashSet<String> = excluded.iter().map(|s| s.to_string()).collect();
    let ctx = Arc::new(CloudContext {
        config,
        vm_set: vm_set.clone(),
        lb_client: lb_client.clone(),
        nodes: Arc::new(StaticNodeSource::new(nodes, excluded)),
        addresses: AddressResolver::new(cache.clone()),
    });
    Fixture {
        vm_set,
        lb_client,
        cache,
        ctx,
    }
}

pub fn pre_configured(mut config: CloudConfig) -> CloudConfig {
    config.pre_configured_backend_pool_load_balancer_types = PreConfiguredLoadBalancerTypes::All;
    config
}

impl Fixture {
    pub fn cache_ips(&self, node: &str, ips: &[&str]) {
        self.cache
            .set(node, ips.iter().map(|s| s.to_string()).collect());
    }
}

pub fn node(name: &str, internal_ips: &[&str]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::new()),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            addresses: Some(
                internal_ips
                    .iter()
                    .map(|ip| NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: ip.to_string(),
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
    }
}

pub fn service(name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn dual_stack_service(name: &str) -> Service {
    let mut svc = service(name);
    if let Some(spec) = svc.spec.as_mut() {
        spec.ip_families = Some(vec!["IPv4".to_string(), "IPv6".to_string()]);
    }
    svc
}

pub fn pool_with_ip_configs(name: &str, ids: &[String]) -> BackendAddressPool {
    let mut bp = BackendAddressPool::empty(name, None);
    bp.backend_ip_configurations = ids
        .iter()
        .map(|id| InterfaceIpConfiguration::new(id.clone()))
        .collect();
    bp
}

pub fn pool_with_ips(name: &str, ips: &[&str]) -> BackendAddressPool {
    let mut bp = BackendAddressPool::empty(name, None);
    bp.load_balancer_backend_addresses = ips
        .iter()
        .map(|ip| LoadBalancerBackendAddress::new(None, *ip))
        .collect();
    bp
}

pub fn lb_with_ip_configs(cluster: &str, ids: &[String]) -> LoadBalancer {
    let mut lb = LoadBalancer::new(cluster);
    lb.upsert_pool(pool_with_ip_configs(cluster, ids));
    lb
}

pub fn lb_with_ips(cluster: &str, ips: &[&str]) -> LoadBalancer {
    let mut lb = LoadBalancer::new(cluster);
    lb.upsert_pool(pool_with_ips(cluster, ips));
    lb
}

pub fn ip_config_ids(pool: &BackendAddressPool) -> Vec<String> {
    pool.backend_ip_configurations
        .iter()
        .map(|c| c.id.clone())
        .collect()
}

pub fn pool_ips(pool: &BackendAddressPool) -> Vec<String> {
    pool.load_balancer_backend_addresses
        .iter()
        .map(|a| a.ip_address.clone())
        .collect()
}
