use super::StoreError;
use crate::bus::WorkItem;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::Utc;

const MAX_ERROR_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    Discovered,
    Processing,
    Completed,
    Failed,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Discovered => "discovered",
            TrackingStatus::Processing => "processing",
            TrackingStatus::Completed => "completed",
            TrackingStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discovered" => Some(TrackingStatus::Discovered),
            "processing" => Some(TrackingStatus::Processing),
            "completed" => Some(TrackingStatus::Completed),
            "failed" => Some(TrackingStatus::Failed),
            _ => None,
        }
    }
}

/// Durable processing state for one (instance, file).
#[derive(Debug, Clone)]
pub struct TrackingRecord {
    pub status: TrackingStatus,
    pub last_written: i64,
    pub file_size: i64,
    pub lines_processed: u64,
}

/// Terminal and in-flight transitions driven by the processor.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Processing,
    Completed { lines_processed: u64 },
    Failed { error_message: String },
}

#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn get(
        &self,
        instance_id: &str,
        file_name: &str,
    ) -> Result<Option<TrackingRecord>, StoreError>;

    /// First sighting of a file: write the full record with `discovered`.
    async fn create_discovered(&self, item: &WorkItem) -> Result<(), StoreError>;

    /// Re-admission of a known file (modified or previously failed).
    async fn refresh_discovered(&self, item: &WorkItem) -> Result<(), StoreError>;

    async fn update_status(
        &self,
        instance_id: &str,
        file_name: &str,
        update: StatusUpdate,
    ) -> Result<(), StoreError>;
}

pub struct DynamoTrackingStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoTrackingStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table: String) -> Self {
        Self { client, table }
    }

    fn key(instance_id: &str, file_name: &str) -> [(&'static str, AttributeValue); 2] {
        [
            ("instance_id", AttributeValue::S(instance_id.to_string())),
            ("log_file_name", AttributeValue::S(file_name.to_string())),
        ]
    }
}

fn number(value: impl ToString) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn parse_n(attr: Option<&AttributeValue>) -> i64 {
    attr.and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[async_trait]
impl TrackingStore for DynamoTrackingStore {
    async fn get(
        &self,
        instance_id: &str,
        file_name: &str,
    ) -> Result<Option<TrackingRecord>, StoreError> {
        let mut request = self.client.get_item().table_name(&self.table);
        for (name, value) in Self::key(instance_id, file_name) {
            request = request.key(name, value);
        }
        let output = request
            .send()
            .await
            .map_err(|e| StoreError::Store(format!("tracking get: {e}")))?;

        let Some(item) = output.item() else {
            return Ok(None);
        };
        let Some(status) = item
            .get("status")
            .and_then(|v| v.as_s().ok())
            .and_then(|s| TrackingStatus::parse(s))
        else {
            return Ok(None);
        };

        Ok(Some(TrackingRecord {
            status,
            last_written: parse_n(item.get("last_written")),
            file_size: parse_n(item.get("file_size")),
            lines_processed: parse_n(item.get("lines_processed")) as u64,
        }))
    }

    async fn create_discovered(&self, item: &WorkItem) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("instance_id", AttributeValue::S(item.instance_id.clone()))
            .item("log_file_name", AttributeValue::S(item.log_file_name.clone()))
            .item("cluster_id", AttributeValue::S(item.cluster_id.clone()))
            .item("log_type", AttributeValue::S(item.log_type.as_str().to_string()))
            .item("status", AttributeValue::S("discovered".to_string()))
            .item("discovered_at", number(Utc::now().timestamp()))
            .item("last_written", number(item.last_written))
            .item("file_size", number(item.size))
            .send()
            .await
            .map_err(|e| StoreError::Store(format!("tracking put: {e}")))?;
        Ok(())
    }

    async fn refresh_discovered(&self, item: &WorkItem) -> Result<(), StoreError> {
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table)
            .update_expression(
                "SET #status = :status, discovered_at = :discovered_at, \
                 last_written = :last_written, file_size = :file_size",
            )
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(":status", AttributeValue::S("discovered".to_string()))
            .expression_attribute_values(":discovered_at", number(Utc::now().timestamp()))
            .expression_attribute_values(":last_written", number(item.last_written))
            .expression_attribute_values(":file_size", number(item.size));
        for (name, value) in Self::key(&item.instance_id, &item.log_file_name) {
            request = request.key(name, value);
        }
        request
            .send()
            .await
            .map_err(|e| StoreError::Store(format!("tracking refresh: {e}")))?;
        Ok(())
    }

    async fn update_status(
        &self,
        instance_id: &str,
        file_name: &str,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        let now = number(Utc::now().timestamp());
        let mut expression = String::from("SET #status = :status, #updated_at = :updated_at");
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table)
            .expression_attribute_names("#status", "status")
            .expression_attribute_names("#updated_at", "updated_at")
            .expression_attribute_values(":updated_at", now.clone());

        match &update {
            StatusUpdate::Processing => {
                expression.push_str(", processing_started_at = :processing_started_at");
                request = request
                    .expression_attribute_values(":status", AttributeValue::S("processing".into()))
                    .expression_attribute_values(":processing_started_at", now);
            }
            StatusUpdate::Completed { lines_processed } => {
                expression.push_str(
                    ", processing_completed_at = :processing_completed_at, \
                     lines_processed = :lines_processed",
                );
                request = request
                    .expression_attribute_values(":status", AttributeValue::S("completed".into()))
                    .expression_attribute_values(":processing_completed_at", now)
                    .expression_attribute_values(":lines_processed", number(*lines_processed));
            }
            StatusUpdate::Failed { error_message } => {
                expression.push_str(
                    ", error_message = :error_message, processing_failed_at = :processing_failed_at",
                );
                request = request
                    .expression_attribute_values(":status", AttributeValue::S("failed".into()))
                    .expression_attribute_values(
                        ":error_message",
                        AttributeValue::S(truncate_error(error_message)),
                    )
                    .expression_attribute_values(":processing_failed_at", now);
            }
        }

        for (name, value) in Self::key(instance_id, file_name) {
            request = request.key(name, value);
        }
        request
            .update_expression(expression)
            .send()
            .await
            .map_err(|e| StoreError::Store(format!("tracking update: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TrackingStatus::Discovered,
            TrackingStatus::Processing,
            TrackingStatus::Completed,
            TrackingStatus::Failed,
        ] {
            assert_eq!(TrackingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TrackingStatus::parse("unknown"), None);
    }

    #[test]
    fn test_error_truncation() {
        let short = "download failed";
        assert_eq!(truncate_error(short), short);

        let long = "x".repeat(MAX_ERROR_LEN + 100);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
    }

    #[test]
    fn test_error_truncation_respects_char_boundary() {
        let mut long = "y".repeat(MAX_ERROR_LEN - 1);
        long.push('é');
        long.push_str(&"z".repeat(50));
        let truncated = truncate_error(&long);
        assert!(truncated.len() <= MAX_ERROR_LEN);
        assert!(truncated.is_char_boundary(truncated.len()));
    }
}
