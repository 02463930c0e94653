use super::{ApiError, Cluster, ClusterMember, FleetApi, Instance, LogFile, LogPortion};
use async_trait::async_trait;
use aws_sdk_rds::config::Region;

/// Live fleet API backed by the managed-database control plane.
pub struct RdsFleetApi {
    client: aws_sdk_rds::Client,
}

impl RdsFleetApi {
    pub async fn new(region: &str) -> Self {
        let config = aws_config::from_env()
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: aws_sdk_rds::Client::new(&config),
        }
    }
}

#[async_trait]
impl FleetApi for RdsFleetApi {
    async fn list_clusters(&self) -> Result<Vec<Cluster>, ApiError> {
        let mut clusters = Vec::new();
        let mut pages = self.client.describe_db_clusters().into_paginator().send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| ApiError::Api(format!("describe clusters: {e}")))?;
            for cluster in page.db_clusters() {
                clusters.push(Cluster {
                    cluster_id: cluster.db_cluster_identifier().unwrap_or_default().to_string(),
                    engine: cluster.engine().unwrap_or_default().to_string(),
                    status: cluster.status().unwrap_or_default().to_string(),
                    endpoint: cluster.endpoint().unwrap_or_default().to_string(),
                    members: cluster
                        .db_cluster_members()
                        .iter()
                        .map(|member| ClusterMember {
                            instance_id: member
                                .db_instance_identifier()
                                .unwrap_or_default()
                                .to_string(),
                            is_writer: member.is_cluster_writer().unwrap_or(false),
                        })
                        .collect(),
                });
            }
        }

        Ok(clusters)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Instance, ApiError> {
        let output = self
            .client
            .describe_db_instances()
            .db_instance_identifier(instance_id)
            .send()
            .await
            .map_err(|e| ApiError::Api(format!("describe instance {instance_id}: {e}")))?;

        let instance = output
            .db_instances()
            .first()
            .ok_or_else(|| ApiError::InstanceNotFound(instance_id.to_string()))?;

        Ok(Instance {
            instance_id: instance
                .db_instance_identifier()
                .unwrap_or(instance_id)
                .to_string(),
            instance_class: instance.db_instance_class().unwrap_or_default().to_string(),
            status: instance.db_instance_status().unwrap_or_default().to_string(),
        })
    }

    async fn list_log_files(&self, instance_id: &str) -> Result<Vec<LogFile>, ApiError> {
        let mut files = Vec::new();
        let mut pages = self
            .client
            .describe_db_log_files()
            .db_instance_identifier(instance_id)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page =
                page.map_err(|e| ApiError::Api(format!("describe log files {instance_id}: {e}")))?;
            for detail in page.describe_db_log_files() {
                files.push(LogFile {
                    name: detail.log_file_name().unwrap_or_default().to_string(),
                    last_written: detail.last_written().unwrap_or(0),
                    size: detail.size().unwrap_or(0),
                });
            }
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
        let output = self
            .client
            .download_db_log_file_portion()
            .db_instance_identifier(instance_id)
            .log_file_name(file_name)
            .marker(marker)
            .number_of_lines(portion_lines)
            .send()
            .await
            .map_err(|e| {
                ApiError::Api(format!("download portion {instance_id}/{file_name}: {e}"))
            })?;

        Ok(LogPortion {
            data: output.log_file_data().unwrap_or_default().to_string(),
            marker: output.marker().map(str::to_string),
            additional_data_pending: output.additional_data_pending().unwrap_or(false),
        })
    }
}
