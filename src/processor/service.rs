use super::parse::{enrich, parser_for, passthrough_entry, ParsedEntry};
use super::sink::Sink;
use super::stream::open_log_stream;
use crate::api::FleetApi;
use crate::breaker::{BreakerError, CircuitBreaker};
use crate::bus::{BusMessage, WorkItem, WorkSource};
use crate::config::{ParsingMode, ProcessorConfig};
use crate::metrics::Metrics;
use crate::store::{CheckpointStore, DlqEntry, DlqStore, StatusUpdate, TrackingStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Entries buffered before a sink flush.
const SINK_BATCH_SIZE: usize = 1000;
/// Lines scanned between checkpoint saves.
const CHECKPOINT_EVERY_LINES: u64 = 10_000;

/// Only download/read failures propagate to the retry loop; sink and
/// checkpoint trouble merely costs re-work on resume.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("read error: {0}")]
    Read(#[from] std::io::Error),
}

struct QueuedItem {
    message: BusMessage,
    item: WorkItem,
}

/// Consumes work items, streams each remote file from its saved marker,
/// parses and ships the lines, and records resumable progress.
pub struct Processor {
    config: ProcessorConfig,
    api: Arc<dyn FleetApi>,
    tracking: Arc<dyn TrackingStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    dlq: Arc<dyn DlqStore>,
    source: Arc<dyn WorkSource>,
    sink: Arc<dyn Sink>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProcessorConfig,
        api: Arc<dyn FleetApi>,
        tracking: Arc<dyn TrackingStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        dlq: Arc<dyn DlqStore>,
        source: Arc<dyn WorkSource>,
        sink: Arc<dyn Sink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_max_failures,
            config.breaker_reset_timeout,
        ));
        Self {
            config,
            api,
            tracking,
            checkpoints,
            dlq,
            source,
            sink,
            breaker,
            metrics,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            workers = self.config.max_concurrency,
            batch_size = self.config.batch_size,
            "processor started"
        );

        let (queue_tx, queue_rx) = mpsc::channel::<QueuedItem>(self.config.batch_size * 2);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.max_concurrency {
            let processor = Arc::clone(&self);
            let queue = Arc::clone(&queue_rx);
            let cancel = cancel.clone();
            workers.spawn(async move {
                processor.worker(worker_id, queue, cancel).await;
            });
        }

        self.collect(queue_tx, &cancel).await;

        // Queue sender dropped above: workers drain what is left and exit.
        while workers.join_next().await.is_some() {}
        info!("processor shutdown complete");
    }

    /// Fetch messages one at a time and hand them to the workers in
    /// size- or time-bounded batches.
    async fn collect(&self, queue: mpsc::Sender<QueuedItem>, cancel: &CancellationToken) {
        let mut batch: Vec<QueuedItem> = Vec::with_capacity(self.config.batch_size);
        let mut ticker = tokio::time::interval(self.config.batch_timeout);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.dispatch(&mut batch, &queue).await;
                    info!("collector stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.dispatch(&mut batch, &queue).await;
                }
                fetched = self.source.fetch() => {
                    let message = match fetched {
                        Ok(message) => message,
                        Err(err) => {
                            error!(error = %err, "failed to fetch message");
                            continue;
                        }
                    };

                    let item = match serde_json::from_slice::<WorkItem>(&message.payload) {
                        Ok(item) => item,
                        Err(err) => {
                            // Permanent input failure: commit and drop.
                            error!(error = %err, "failed to decode work item");
                            self.metrics.increment("malformed_messages", 1);
                            if let Err(err) = self.source.commit(&message).await {
                                error!(error = %err, "failed to commit malformed message");
                            }
                            continue;
                        }
                    };

                    batch.push(QueuedItem { message, item });
                    if batch.len() >= self.config.batch_size {
                        self.dispatch(&mut batch, &queue).await;
                    }
                }
            }
        }
    }

    /// Group the batch by instance, then feed items to the worker queue.
    /// Grouping keeps per-instance locality available without reordering
    /// any single item's work.
    async fn dispatch(&self, batch: &mut Vec<QueuedItem>, queue: &mpsc::Sender<QueuedItem>) {
        if batch.is_empty() {
            return;
        }

        let mut grouped: HashMap<String, Vec<QueuedItem>> = HashMap::new();
        for queued in batch.drain(..) {
            grouped
                .entry(queued.item.instance_id.clone())
                .or_default()
                .push(queued);
        }

        info!(
            total_items = grouped.values().map(Vec::len).sum::<usize>(),
            instances = grouped.len(),
            "dispatching batch"
        );

        for (_, items) in grouped {
            for queued in items {
                if queue.send(queued).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn worker(
        &self,
        worker_id: usize,
        queue: Arc<Mutex<mpsc::Receiver<QueuedItem>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = {
                let mut receiver = queue.lock().await;
                receiver.recv().await
            };
            let Some(queued) = next else {
                return;
            };
            self.handle_item(worker_id, queued, &cancel).await;
        }
    }

    /// Retry loop around one item: breaker-gated attempts with linear
    /// backoff, then DLQ. The bus offset is always committed on a terminal
    /// outcome so a poison item can never wedge the partition.
    async fn handle_item(&self, worker_id: usize, queued: QueuedItem, cancel: &CancellationToken) {
        let QueuedItem { message, item } = queued;
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            let result = self.breaker.call(|| self.process_item(&item, cancel)).await;

            match result {
                Ok(()) => {
                    if let Err(err) = self.source.commit(&message).await {
                        error!(error = %err, "failed to commit message");
                    }
                    return;
                }
                Err(BreakerError::Open) => {
                    last_error = "circuit breaker is open".to_string();
                }
                Err(BreakerError::Inner(err)) => {
                    last_error = err.to_string();
                }
            }

            if attempt < self.config.max_retries {
                warn!(
                    worker = worker_id,
                    instance_id = %item.instance_id,
                    file = %item.log_file_name,
                    retry = attempt + 1,
                    error = %last_error,
                    "retrying failed log processing"
                );
                let backoff = self.config.retry_backoff * (attempt + 1);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }

        error!(
            worker = worker_id,
            instance_id = %item.instance_id,
            file = %item.log_file_name,
            retries = self.config.max_retries,
            error = %last_error,
            "failed to process log after retries"
        );
        self.metrics.increment("processing_failed_all_retries", 1);

        let entry = DlqEntry::new(&item, &message, &last_error, self.config.max_retries);
        if let Err(err) = self.dlq.push(&entry).await {
            error!(error = %err, "failed to write dlq entry");
        }
        if let Err(err) = self.source.commit(&message).await {
            error!(error = %err, "failed to commit quarantined message");
        }
    }

    async fn process_item(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError> {
        let start = Instant::now();
        info!(
            instance_id = %item.instance_id,
            file = %item.log_file_name,
            size = item.size,
            "processing log file"
        );

        let checkpoint = match self
            .checkpoints
            .load(&item.instance_id, &item.log_file_name)
            .await
        {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(error = %err, "failed to load checkpoint");
                None
            }
        };
        let start_marker = checkpoint
            .as_ref()
            .map(|c| c.marker.clone())
            .unwrap_or_default();
        let resumed_lines = checkpoint.map(|c| c.line_count).unwrap_or(0);
        if !start_marker.is_empty() {
            info!(marker = %start_marker, lines = resumed_lines, "resuming from checkpoint");
        }

        if let Err(err) = self
            .tracking
            .update_status(
                &item.instance_id,
                &item.log_file_name,
                StatusUpdate::Processing,
            )
            .await
        {
            error!(error = %err, "failed to update status to processing");
        }

        match self
            .scan_stream(item, &start_marker, resumed_lines, cancel)
            .await
        {
            Ok(lines_processed) => {
                if let Err(err) = self
                    .checkpoints
                    .delete(&item.instance_id, &item.log_file_name)
                    .await
                {
                    warn!(error = %err, "failed to delete checkpoint");
                }
                if let Err(err) = self
                    .tracking
                    .update_status(
                        &item.instance_id,
                        &item.log_file_name,
                        StatusUpdate::Completed { lines_processed },
                    )
                    .await
                {
                    error!(error = %err, "failed to update status to completed");
                }
                info!(
                    instance_id = %item.instance_id,
                    file = %item.log_file_name,
                    total_lines = lines_processed,
                    log_type = item.log_type.as_str(),
                    "processing completed"
                );
                self.metrics
                    .record_duration("log_processing_duration", start.elapsed());
                Ok(())
            }
            Err(err) => {
                if let Err(status_err) = self
                    .tracking
                    .update_status(
                        &item.instance_id,
                        &item.log_file_name,
                        StatusUpdate::Failed {
                            error_message: err.to_string(),
                        },
                    )
                    .await
                {
                    error!(error = %status_err, "failed to update status to failed");
                }
                Err(err)
            }
        }
    }

    /// Stream the file from `start_marker`, parse line by line, flush sink
    /// batches, and persist the newest marker every checkpoint interval.
    async fn scan_stream(
        &self,
        item: &WorkItem,
        start_marker: &str,
        resumed_lines: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, ProcessError> {
        let (reader, mut markers) = open_log_stream(
            Arc::clone(&self.api),
            item,
            start_marker,
            cancel.clone(),
        );
        let mut lines = reader.lines();

        let parser = parser_for(item.log_type);
        let mut batch: Vec<ParsedEntry> = Vec::with_capacity(SINK_BATCH_SIZE);
        let mut line_count = resumed_lines;
        let mut parsed_count: u64 = 0;
        let mut skipped_count: u64 = 0;
        let mut last_checkpoint_lines = resumed_lines;
        let mut current_marker = if start_marker.is_empty() {
            None
        } else {
            Some(start_marker.to_string())
        };

        while let Some(line) = lines.next_line().await? {
            line_count += 1;

            // Latest marker emitted by the downloader, read without blocking.
            while let Ok(marker) = markers.try_recv() {
                current_marker = Some(marker);
            }

            let entry = match self.config.parsing_mode {
                ParsingMode::Full => parser(&line),
                ParsingMode::Passthrough => passthrough_entry(&line, line_count),
            };
            match entry {
                None => skipped_count += 1,
                Some(entry) => {
                    batch.push(enrich(entry, item, Utc::now()));
                    parsed_count += 1;
                    if batch.len() >= SINK_BATCH_SIZE {
                        self.flush(item, &mut batch).await;
                    }
                }
            }

            if line_count - last_checkpoint_lines >= CHECKPOINT_EVERY_LINES {
                if let Some(marker) = &current_marker {
                    if let Err(err) = self
                        .checkpoints
                        .save(&item.instance_id, &item.log_file_name, marker, line_count)
                        .await
                    {
                        warn!(error = %err, "failed to save checkpoint");
                    }
                    last_checkpoint_lines = line_count;
                }
            }
        }

        self.flush(item, &mut batch).await;
        self.metrics.verify_line_counts(
            item.log_type.as_str(),
            &item.log_file_name,
            line_count - resumed_lines,
            parsed_count + skipped_count,
        );
        Ok(line_count)
    }

    async fn flush(&self, item: &WorkItem, batch: &mut Vec<ParsedEntry>) {
        if batch.is_empty() {
            return;
        }
        if let Err(err) = self.sink.send_batch(item.log_type, batch).await {
            warn!(
                error = %err,
                file = %item.log_file_name,
                entries = batch.len(),
                "failed to send batch"
            );
            self.metrics.increment("send_failed", 1);
        }
        batch.clear();
    }
}
