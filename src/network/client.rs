//! Load balancer management API
//!
//! [`LoadBalancerClient`] is the seam to the cloud's load balancer API. Retry
//! and backoff belong to implementations; callers treat every error as final
//! for the current pass.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::types::{BackendAddressPool, LoadBalancer};
use crate::error::{Error, Result};

#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    /// Create or replace one backend pool of a load balancer
    async fn create_or_update_backend_pools(
        &self,
        resource_group: &str,
        lb_name: &str,
        pool_name: &str,
        pool: &BackendAddressPool,
        etag: Option<&str>,
    ) -> Result<()>;

    async fn get(
        &self,
        resource_group: &str,
        lb_name: &str,
        expand: Option<&str>,
    ) -> Result<LoadBalancer>;
}

/// Load balancer client backed by a JSON snapshot on disk
///
/// Pool writes replace the named pool, check and bump its etag, and are
/// persisted back to the file unless the client is in dry-run mode.
pub struct FileLoadBalancerClient {
    path: PathBuf,
    dry_run: bool,
    state: Mutex<LoadBalancer>,
    writes: AtomicU64,
}

impl FileLoadBalancerClient {
    pub async fn open(path: impl Into<PathBuf>, dry_run: bool) -> Result<Self> {
        let path = path.into();
        let raw = tokio::fs::read_to_string(&path).await?;
        let lb: LoadBalancer = serde_json::from_str(&raw)?;
        Ok(Self {
            path,
            dry_run,
            state: Mutex::new(lb),
            writes: AtomicU64::new(0),
        })
    }

    /// Number of pool writes accepted so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> LoadBalancer {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl LoadBalancerClient for FileLoadBalancerClient {
    #[instrument(skip(self, pool, etag), fields(path = %self.path.display()))]
    async fn create_or_update_backend_pools(
        &self,
        resource_group: &str,
        lb_name: &str,
        pool_name: &str,
        pool: &BackendAddressPool,
        etag: Option<&str>,
    ) -> Result<()> {
        let mut lb = self.state.lock().await;
        if !lb.name.eq_ignore_ascii_case(lb_name) {
            return Err(Error::LoadBalancerNotFound(lb_name.to_string()));
        }

        let current_etag = lb.pool(pool_name).and_then(|bp| bp.etag.clone());
        if let (Some(expected), Some(current)) = (etag, current_etag.as_deref()) {
            if expected != current {
                return Err(Error::LoadBalancerClientError(format!(
                    "precondition failed: backend pool {} has etag {}, request carried {}",
                    pool_name, current, expected
                )));
            }
        }

        let generation = current_etag
            .as_deref()
            .and_then(|e| e.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let mut stored = pool.clone();
        stored.name = pool_name.to_string();
        stored.etag = Some(generation.to_string());
        lb.upsert_pool(stored);
        self.writes.fetch_add(1, Ordering::Relaxed);

        if self.dry_run {
            info!("Dry run: backend pool {} not persisted", pool_name);
            return Ok(());
        }

        let raw = serde_json::to_string_pretty(&*lb)?;
        tokio::fs::write(&self.path, raw).await?;
        debug!("Persisted backend pool {} of {}", pool_name, lb_name);
        Ok(())
    }

    async fn get(
        &self,
        _resource_group: &str,
        lb_name: &str,
        _expand: Option<&str>,
    ) -> Result<LoadBalancer> {
        let lb = self.state.lock().await;
        if !lb.name.eq_ignore_ascii_case(lb_name) {
            return Err(Error::LoadBalancerNotFound(lb_name.to_string()));
        }
        Ok(lb.clone())
    }
}
