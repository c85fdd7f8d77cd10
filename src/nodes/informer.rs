//! Live node source backed by a kube reflector
//!
//! The informer watches all cluster nodes, mirrors them into a reflector
//! store and keeps the private-IP cache current as nodes change or go away.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use super::addresses::AddressResolver;
use super::{excluded_by_labels, NodeSource};
use crate::error::{Error, Result};

pub struct NodeInformer {
    store: Store<Node>,
    synced: AtomicBool,
    excluded: HashSet<String>,
    resolver: AddressResolver,
}

impl NodeInformer {
    fn new(store: Store<Node>, resolver: AddressResolver, excluded: HashSet<String>) -> Self {
        Self {
            store,
            synced: AtomicBool::new(false),
            excluded,
            resolver,
        }
    }

    /// Start watching nodes in the background
    pub fn spawn(client: Client, resolver: AddressResolver, excluded: HashSet<String>) -> Arc<Self> {
        let api: Api<Node> = Api::all(client);
        let (reader, writer) = reflector::store();
        let informer = Arc::new(Self::new(reader, resolver, excluded));

        let handle = Arc::clone(&informer);
        tokio::spawn(async move {
            reflector(writer, watcher(api, watcher::Config::default()))
                .default_backoff()
                .for_each(|event| {
                    handle.observe(event);
                    futures::future::ready(())
                })
                .await;
            warn!("Node watch stream ended");
        });

        info!("Node informer started");
        informer
    }

    /// Wait until the initial node list has been stored
    pub async fn wait_until_synced(&self) -> Result<()> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|e| {
                Error::NodeInformerNotSynced(format!("waiting for the initial node list: {}", e))
            })?;
        self.synced.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn observe(&self, event: std::result::Result<watcher::Event<Node>, watcher::Error>) {
        match event {
            Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
                debug!("Observed node {}", node.name_any());
                self.resolver.observe(&node);
            }
            Ok(watcher::Event::Delete(node)) => {
                debug!("Node {} deleted", node.name_any());
                self.resolver.forget(&node.name_any());
            }
            Ok(watcher::Event::InitDone) => {
                info!("Node informer synced");
                self.synced.store(true, Ordering::Relaxed);
            }
            Ok(watcher::Event::Init) => {}
            Err(e) => warn!("Node watch error: {}", e),
        }
    }
}

impl NodeSource for NodeInformer {
    fn list(&self) -> Vec<Arc<Node>> {
        self.store.state()
    }

    fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.store.get(&ObjectRef::new(name))
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    fn is_excluded(&self, node_name: &str) -> bool {
        self.excluded.contains(node_name)
            || self.get(node_name).is_some_and(|n| excluded_by_labels(&n))
    }
}
