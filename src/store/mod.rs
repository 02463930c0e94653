mod checkpoint;
mod dlq;
mod registry;
mod tracking;

pub use checkpoint::{Checkpoint, CheckpointStore, DynamoCheckpointStore};
pub use dlq::{DlqEntry, DlqStore, DynamoDlqStore};
pub use registry::{DynamoInstanceRegistry, InstanceRegistry};
pub use tracking::{
    DynamoTrackingStore, StatusUpdate, TrackingRecord, TrackingStatus, TrackingStore,
};

use aws_sdk_dynamodb::config::Region;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Store(String),
}

/// Build the shared key/value store client for the configured region.
pub async fn dynamo_client(region: &str) -> aws_sdk_dynamodb::Client {
    let config = aws_config::from_env()
        .region(Region::new(region.to_string()))
        .load()
        .await;
    aws_sdk_dynamodb::Client::new(&config)
}
