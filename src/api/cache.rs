use super::{ApiError, Cluster, FleetApi, Instance, LogFile, LogPortion};
use crate::config::CacheTtls;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Read-through cache in front of the rate-limited listing calls.
///
/// The cache is a best-effort accelerator: a missing backend, a decode
/// failure, or an unreachable store all fall through to the live API.
pub struct CachedFleetApi {
    inner: Arc<dyn FleetApi>,
    cache: Option<ConnectionManager>,
    ttls: CacheTtls,
}

impl CachedFleetApi {
    pub fn new(inner: Arc<dyn FleetApi>, cache: Option<ConnectionManager>, ttls: CacheTtls) -> Self {
        Self { inner, cache, ttls }
    }

    /// Connect to the cache endpoint, tolerating its absence.
    pub async fn connect(url: &str) -> Option<ConnectionManager> {
        let url = if url.contains("://") {
            url.to_string()
        } else {
            format!("redis://{url}")
        };

        let client = match redis::Client::open(url.as_str()) {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "invalid cache url, operating without cache");
                return None;
            }
        };

        match client.get_connection_manager().await {
            Ok(manager) => Some(manager),
            Err(err) => {
                warn!(error = %err, "cache not available, operating without cache");
                None
            }
        }
    }

    async fn get_cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.cache.clone()?;
        match conn.get::<_, Option<Vec<u8>>>(key).await {
            Ok(Some(data)) => match serde_json::from_slice(&data) {
                Ok(value) => {
                    debug!(key, "api cache hit");
                    Some(value)
                }
                Err(err) => {
                    debug!(key, error = %err, "api cache decode failure");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                debug!(key, error = %err, "api cache error");
                None
            }
        }
    }

    async fn set_cached<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(mut conn) = self.cache.clone() else {
            return;
        };
        let data = match serde_json::to_vec(value) {
            Ok(data) => data,
            Err(err) => {
                debug!(key, error = %err, "failed to encode for cache");
                return;
            }
        };
        if let Err(err) = conn.set_ex::<_, _, ()>(key, data, ttl.as_secs()).await {
            debug!(key, error = %err, "failed to set cache");
        }
    }
}

#[async_trait]
impl FleetApi for CachedFleetApi {
    async fn list_clusters(&self) -> Result<Vec<Cluster>, ApiError> {
        let key = "api:clusters:list";
        if let Some(clusters) = self.get_cached::<Vec<Cluster>>(key).await {
            return Ok(clusters);
        }

        debug!(key, "api cache miss");
        let clusters = self.inner.list_clusters().await?;
        if !clusters.is_empty() {
            self.set_cached(key, &clusters, self.ttls.clusters).await;
        }
        Ok(clusters)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Instance, ApiError> {
        let key = format!("api:instance:{instance_id}");
        if let Some(instance) = self.get_cached::<Instance>(&key).await {
            return Ok(instance);
        }

        debug!(key, "api cache miss");
        let instance = self.inner.describe_instance(instance_id).await?;
        self.set_cached(&key, &instance, self.ttls.instances).await;
        Ok(instance)
    }

    async fn list_log_files(&self, instance_id: &str) -> Result<Vec<LogFile>, ApiError> {
        let key = format!("api:logfiles:{instance_id}");
        if let Some(files) = self.get_cached::<Vec<LogFile>>(&key).await {
            return Ok(files);
        }

        debug!(key, "api cache miss");
        let files = self.inner.list_log_files(instance_id).await?;
        if !files.is_empty() {
            self.set_cached(&key, &files, self.ttls.log_files).await;
        }
        Ok(files)
    }

    async fn download_portion(
        &self,
        instance_id: &str,
        file_name: &str,
        marker: &str,
        portion_lines: i32,
    ) -> Result<LogPortion, ApiError> {
        self.inner
            .download_portion(instance_id, file_name, marker, portion_lines)
            .await
    }
}
