mod consumer;
mod producer;

pub use consumer::KafkaWorkSource;
pub use producer::WorkItemProducer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Kind of log file, derived from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Error,
    Slowquery,
    Other,
}

impl LogType {
    /// Substring classification; `Other` files are never processed.
    pub fn classify(file_name: &str) -> Self {
        if file_name.contains("error") {
            LogType::Error
        } else if file_name.contains("slowquery") || file_name.contains("slow") {
            LogType::Slowquery
        } else {
            LogType::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Error => "error",
            LogType::Slowquery => "slowquery",
            LogType::Other => "other",
        }
    }

    pub fn topic(&self) -> String {
        format!("logs-{}", self.as_str())
    }
}

/// Bus payload describing one (instance, file) to process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub instance_id: String,
    pub cluster_id: String,
    pub engine: String,
    pub log_type: LogType,
    pub log_file_name: String,
    pub last_written: i64,
    pub size: i64,
    pub enqueue_time: DateTime<Utc>,
}

/// One message as fetched from the bus, with enough coordinates to commit
/// it or quarantine it later.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Producer side of the bus.
#[async_trait]
pub trait WorkPublisher: Send + Sync {
    async fn publish(&self, item: &WorkItem) -> Result<(), BusError>;
}

/// Consumer side of the bus: fetch one message, commit after it is fully
/// handled.
#[async_trait]
pub trait WorkSource: Send + Sync {
    async fn fetch(&self) -> Result<BusMessage, BusError>;

    async fn commit(&self, message: &BusMessage) -> Result<(), BusError>;
}
