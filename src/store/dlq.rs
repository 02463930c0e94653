use super::StoreError;
use crate::bus::{BusMessage, WorkItem};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::Utc;

/// Quarantined item that exhausted its retry budget, with the original
/// bytes so an operator can replay it.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub message_id: String,
    pub instance_id: String,
    pub cluster_id: String,
    pub log_file_name: String,
    pub log_type: String,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: i64,
    pub partition: i32,
    pub offset: i64,
    pub original_message: String,
}

impl DlqEntry {
    pub fn new(item: &WorkItem, message: &BusMessage, error: &str, retry_count: u32) -> Self {
        let now = Utc::now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
        Self {
            message_id: format!("{}-{}-{}", item.instance_id, item.log_file_name, nanos),
            instance_id: item.instance_id.clone(),
            cluster_id: item.cluster_id.clone(),
            log_file_name: item.log_file_name.clone(),
            log_type: item.log_type.as_str().to_string(),
            error: error.to_string(),
            retry_count,
            failed_at: now.timestamp(),
            partition: message.partition,
            offset: message.offset,
            original_message: String::from_utf8_lossy(&message.payload).into_owned(),
        }
    }
}

#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn push(&self, entry: &DlqEntry) -> Result<(), StoreError>;
}

pub struct DynamoDlqStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoDlqStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table: String) -> Self {
        Self { client, table }
    }
}

#[async_trait]
impl DlqStore for DynamoDlqStore {
    async fn push(&self, entry: &DlqEntry) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("message_id", AttributeValue::S(entry.message_id.clone()))
            .item("instance_id", AttributeValue::S(entry.instance_id.clone()))
            .item("log_file_name", AttributeValue::S(entry.log_file_name.clone()))
            .item("cluster_id", AttributeValue::S(entry.cluster_id.clone()))
            .item("log_type", AttributeValue::S(entry.log_type.clone()))
            .item("error", AttributeValue::S(entry.error.clone()))
            .item("retry_count", AttributeValue::N(entry.retry_count.to_string()))
            .item("failed_at", AttributeValue::N(entry.failed_at.to_string()))
            .item("kafka_partition", AttributeValue::N(entry.partition.to_string()))
            .item("kafka_offset", AttributeValue::N(entry.offset.to_string()))
            .item(
                "original_message",
                AttributeValue::S(entry.original_message.clone()),
            )
            .send()
            .await
            .map_err(|e| StoreError::Store(format!("dlq put: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LogType;

    #[test]
    fn test_entry_carries_bus_coordinates() {
        let item = WorkItem {
            instance_id: "db-1".to_string(),
            cluster_id: "cluster-1".to_string(),
            engine: "aurora-mysql".to_string(),
            log_type: LogType::Slowquery,
            log_file_name: "slowquery/mysql-slowquery.log".to_string(),
            last_written: 1,
            size: 10,
            enqueue_time: Utc::now(),
        };
        let message = BusMessage {
            topic: "logs-slowquery".to_string(),
            partition: 3,
            offset: 42,
            payload: b"{\"instance_id\":\"db-1\"}".to_vec(),
        };

        let entry = DlqEntry::new(&item, &message, "download failed", 3);
        assert!(entry
            .message_id
            .starts_with("db-1-slowquery/mysql-slowquery.log-"));
        assert_eq!(entry.partition, 3);
        assert_eq!(entry.offset, 42);
        assert_eq!(entry.retry_count, 3);
        assert_eq!(entry.original_message, "{\"instance_id\":\"db-1\"}");
        assert_eq!(entry.log_type, "slowquery");
    }
}
