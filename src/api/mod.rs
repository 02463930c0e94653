mod cache;
mod client;

pub use cache::CachedFleetApi;
pub use client::RdsFleetApi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("fleet api error: {0}")]
    Api(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),
}

/// A logical group of database instances, as reported by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: String,
    pub engine: String,
    pub status: String,
    pub endpoint: String,
    pub members: Vec<ClusterMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    pub instance_id: String,
    pub is_writer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub instance_class: String,
    pub status: String,
}

/// A remote log file visible on one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFile {
    pub name: String,
    pub last_written: i64,
    pub size: i64,
}

/// One bounded slice of a remote log stream.
#[derive(Debug, Clone)]
pub struct LogPortion {
    pub data: String,
    pub marker: Option<String>,
    pub additional_data_pending: bool,
}

/// Fleet listing and log download operations.
///
/// The listing calls are wrapped by [`CachedFleetApi`]; `download_portion`
/// always goes to the live API.
#[async_trait]
pub trait FleetApi: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<Cluster>, ApiError>;

    async fn describe_instance(&self, instance_id: &str) -> Result<Instance, ApiError>;

    async fn list_log_files(&self, instance_id: &str) -> Result<Vec<LogFile>, ApiError>;

    async fn download_portion(
        &self,
        instance_id: &str,
        file_name: &str,
        marker: &str,
        portion_lines: i32,
    ) -> Result<LogPortion, ApiError>;
}
