use super::StoreError;
use crate::api::{Cluster, Instance};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::Utc;

/// Fleet metadata rows refreshed on every discovery sweep.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn save_cluster(&self, cluster: &Cluster) -> Result<(), StoreError>;

    async fn save_instance(
        &self,
        instance: &Instance,
        cluster_id: &str,
        is_writer: bool,
    ) -> Result<(), StoreError>;
}

pub struct DynamoInstanceRegistry {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoInstanceRegistry {
    pub fn new(client: aws_sdk_dynamodb::Client, table: String) -> Self {
        Self { client, table }
    }
}

#[async_trait]
impl InstanceRegistry for DynamoInstanceRegistry {
    async fn save_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("cluster_id", AttributeValue::S(cluster.cluster_id.clone()))
            .item("engine", AttributeValue::S(cluster.engine.clone()))
            .item("status", AttributeValue::S(cluster.status.clone()))
            .item("endpoint", AttributeValue::S(cluster.endpoint.clone()))
            .item("updated_at", AttributeValue::N(Utc::now().timestamp().to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Store(format!("registry cluster put: {e}")))?;
        Ok(())
    }

    async fn save_instance(
        &self,
        instance: &Instance,
        cluster_id: &str,
        is_writer: bool,
    ) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("instance_id", AttributeValue::S(instance.instance_id.clone()))
            .item("cluster_id", AttributeValue::S(cluster_id.to_string()))
            .item("instance_class", AttributeValue::S(instance.instance_class.clone()))
            .item("is_cluster_writer", AttributeValue::Bool(is_writer))
            .item("status", AttributeValue::S(instance.status.clone()))
            .item("updated_at", AttributeValue::N(Utc::now().timestamp().to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Store(format!("registry instance put: {e}")))?;
        Ok(())
    }
}
