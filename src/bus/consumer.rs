use super::{BusError, BusMessage, WorkSource};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};

/// Bus consumer over both log topics in one consumer group.
///
/// Offsets are committed explicitly by the processor once an item has been
/// fully handled; auto-commit stays off.
pub struct KafkaWorkSource {
    consumer: StreamConsumer,
}

impl KafkaWorkSource {
    pub fn new(brokers: &[String], group: &str, topics: &[&str]) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("fetch.min.bytes", "10000")
            .create()?;

        consumer.subscribe(topics)?;
        Ok(Self { consumer })
    }
}

#[async_trait]
impl WorkSource for KafkaWorkSource {
    async fn fetch(&self) -> Result<BusMessage, BusError> {
        let message = self.consumer.recv().await?;
        Ok(BusMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().unwrap_or_default().to_vec(),
        })
    }

    async fn commit(&self, message: &BusMessage) -> Result<(), BusError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}
