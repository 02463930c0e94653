use super::StoreError;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::Utc;

/// Resumable position inside one remote file.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub marker: String,
    pub line_count: u64,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(
        &self,
        instance_id: &str,
        file_name: &str,
    ) -> Result<Option<Checkpoint>, StoreError>;

    async fn save(
        &self,
        instance_id: &str,
        file_name: &str,
        marker: &str,
        line_count: u64,
    ) -> Result<(), StoreError>;

    async fn delete(&self, instance_id: &str, file_name: &str) -> Result<(), StoreError>;
}

pub struct DynamoCheckpointStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoCheckpointStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table: String) -> Self {
        Self { client, table }
    }
}

#[async_trait]
impl CheckpointStore for DynamoCheckpointStore {
    async fn load(
        &self,
        instance_id: &str,
        file_name: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("instance_id", AttributeValue::S(instance_id.to_string()))
            .key("log_file_name", AttributeValue::S(file_name.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Store(format!("checkpoint get: {e}")))?;

        let Some(item) = output.item() else {
            return Ok(None);
        };
        let Some(marker) = item.get("marker").and_then(|v| v.as_s().ok()) else {
            return Ok(None);
        };
        let line_count = item
            .get("line_count")
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);

        Ok(Some(Checkpoint {
            marker: marker.clone(),
            line_count,
        }))
    }

    async fn save(
        &self,
        instance_id: &str,
        file_name: &str,
        marker: &str,
        line_count: u64,
    ) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("instance_id", AttributeValue::S(instance_id.to_string()))
            .item("log_file_name", AttributeValue::S(file_name.to_string()))
            .item("marker", AttributeValue::S(marker.to_string()))
            .item("line_count", AttributeValue::N(line_count.to_string()))
            .item("updated_at", AttributeValue::N(Utc::now().timestamp().to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Store(format!("checkpoint put: {e}")))?;
        Ok(())
    }

    async fn delete(&self, instance_id: &str, file_name: &str) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("instance_id", AttributeValue::S(instance_id.to_string()))
            .key("log_file_name", AttributeValue::S(file_name.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Store(format!("checkpoint delete: {e}")))?;
        Ok(())
    }
}
