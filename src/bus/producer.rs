use super::{BusError, WorkItem, WorkPublisher};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::debug;

/// Publishes work items onto the per-log-type topics, keyed by instance id
/// so per-instance ordering survives partitioning.
pub struct WorkItemProducer {
    producer: FutureProducer,
}

impl WorkItemProducer {
    pub fn new(brokers: &[String]) -> Result<Self, BusError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("compression.type", "snappy")
            .set("acks", "1")
            .set("batch.num.messages", "100")
            .set("queue.buffering.max.ms", "1000")
            .set("message.timeout.ms", "30000")
            .create()?;

        Ok(Self { producer })
    }

    async fn send_item(&self, item: &WorkItem) -> Result<(), BusError> {
        let topic = item.log_type.topic();
        let payload = serde_json::to_vec(item)?;

        let record = FutureRecord::to(&topic)
            .key(&item.instance_id)
            .payload(&payload);

        self.producer
            .send(record, Duration::from_secs(10))
            .await
            .map_err(|(err, _)| BusError::Kafka(err))?;

        debug!(
            topic,
            instance_id = %item.instance_id,
            file = %item.log_file_name,
            "published work item"
        );
        Ok(())
    }
}

#[async_trait]
impl WorkPublisher for WorkItemProducer {
    async fn publish(&self, item: &WorkItem) -> Result<(), BusError> {
        self.send_item(item).await
    }
}
