use super::shard::should_process;
use crate::api::{ApiError, Cluster, ClusterMember, FleetApi, LogFile};
use crate::bus::{LogType, WorkItem, WorkPublisher};
use crate::config::DiscoveryConfig;
use crate::limit::{LimitError, RateLimiter};
use crate::metrics::Metrics;
use crate::store::{InstanceRegistry, StoreError, TrackingStatus, TrackingStore};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Bounded fan-out across clusters within one sweep.
const CLUSTER_CONCURRENCY: usize = 10;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("rate limit: {0}")]
    Limit(#[from] LimitError),

    #[error("api: {0}")]
    Api(#[from] ApiError),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of the tracking admission check for one observed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Never seen before: create the tracking record, then publish.
    New,
    /// Known file needing re-processing: refresh the record, then publish.
    Refresh,
    /// Tracking store unreachable: publish without touching the record
    /// rather than silently dropping data.
    FailOpen,
    Skip,
}

/// Periodically sweeps the fleet and publishes exactly the files that need
/// processing since the last observation.
pub struct Discovery {
    config: DiscoveryConfig,
    api: Arc<dyn FleetApi>,
    tracking: Arc<dyn TrackingStore>,
    registry: Arc<dyn InstanceRegistry>,
    publisher: Arc<dyn WorkPublisher>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
}

impl Discovery {
    pub fn new(
        config: DiscoveryConfig,
        api: Arc<dyn FleetApi>,
        tracking: Arc<dyn TrackingStore>,
        registry: Arc<dyn InstanceRegistry>,
        publisher: Arc<dyn WorkPublisher>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            api,
            tracking,
            registry,
            publisher,
            limiter,
            metrics,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            shard_id = self.config.shard_id,
            total_shards = self.config.total_shards,
            interval_secs = self.config.discovery_interval.as_secs(),
            "discovery service started"
        );

        self.sweep(&cancel).await;

        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("discovery service stopping");
                    return;
                }
                _ = ticker.tick() => self.sweep(&cancel).await,
            }
        }
    }

    /// One pass over every owned cluster. Never fails the loop: cluster and
    /// file errors are recorded and the sweep moves on.
    pub async fn sweep(&self, cancel: &CancellationToken) {
        let start = Instant::now();

        if self.limiter.acquire(cancel).await.is_err() {
            error!("rate limiter wait cancelled, aborting sweep");
            return;
        }

        let clusters = match self.api.list_clusters().await {
            Ok(clusters) => clusters,
            Err(err) => {
                error!(error = %err, "failed to list clusters");
                self.metrics.increment("discovery_errors", 1);
                return;
            }
        };

        info!(count = clusters.len(), "discovered clusters");
        self.metrics
            .increment("clusters_discovered", clusters.len() as i64);

        let owned: Vec<Cluster> = clusters
            .into_iter()
            .filter(|cluster| {
                cluster.engine.starts_with(&self.config.engine_family)
                    && should_process(
                        &cluster.cluster_id,
                        self.config.shard_id,
                        self.config.total_shards,
                    )
            })
            .collect();

        futures::stream::iter(owned)
            .for_each_concurrent(CLUSTER_CONCURRENCY, |cluster| async move {
                self.process_cluster(&cluster, cancel).await;
            })
            .await;

        self.metrics
            .record_duration("discovery_duration_seconds", start.elapsed());
    }

    async fn process_cluster(&self, cluster: &Cluster, cancel: &CancellationToken) {
        if let Err(err) = self.registry.save_cluster(cluster).await {
            error!(error = %err, cluster_id = %cluster.cluster_id, "failed to save cluster details");
        }

        for member in &cluster.members {
            if let Err(err) = self.process_instance(cluster, member, cancel).await {
                error!(
                    error = %err,
                    instance_id = %member.instance_id,
                    "failed to process instance"
                );
            }
        }
    }

    async fn process_instance(
        &self,
        cluster: &Cluster,
        member: &ClusterMember,
        cancel: &CancellationToken,
    ) -> Result<(), DiscoveryError> {
        self.limiter.acquire(cancel).await?;

        let files = self.api.list_log_files(&member.instance_id).await?;
        debug!(
            instance_id = %member.instance_id,
            count = files.len(),
            "found log files"
        );

        for file in &files {
            let log_type = LogType::classify(&file.name);
            if log_type == LogType::Other {
                continue;
            }

            let item = work_item(cluster, &member.instance_id, file, log_type);
            self.admit_and_publish(&item).await;
        }

        self.limiter.acquire(cancel).await?;
        let instance = self.api.describe_instance(&member.instance_id).await?;
        self.registry
            .save_instance(&instance, &cluster.cluster_id, member.is_writer)
            .await?;
        Ok(())
    }

    async fn admit_and_publish(&self, item: &WorkItem) {
        let admission = self.admission(item).await;
        if admission == Admission::Skip {
            return;
        }

        let record_written = match admission {
            Admission::New => self.tracking.create_discovered(item).await,
            Admission::Refresh => self.tracking.refresh_discovered(item).await,
            Admission::FailOpen | Admission::Skip => Ok(()),
        };
        if let Err(err) = record_written {
            error!(error = %err, file = %item.log_file_name, "failed to write tracking entry");
        }

        if let Err(err) = self.publisher.publish(item).await {
            error!(error = %err, file = %item.log_file_name, "failed to publish work item");
            self.metrics.increment("discovery_errors", 1);
        } else {
            debug!(
                instance_id = %item.instance_id,
                file = %item.log_file_name,
                log_type = item.log_type.as_str(),
                "work item published"
            );
        }
    }

    async fn admission(&self, item: &WorkItem) -> Admission {
        let record = match self
            .tracking
            .get(&item.instance_id, &item.log_file_name)
            .await
        {
            Ok(record) => record,
            Err(err) => {
                error!(error = %err, "failed to check tracking table");
                return Admission::FailOpen;
            }
        };

        match record {
            None => Admission::New,
            Some(record) => match record.status {
                TrackingStatus::Completed if item.last_written > record.last_written => {
                    Admission::Refresh
                }
                TrackingStatus::Completed => Admission::Skip,
                TrackingStatus::Discovered | TrackingStatus::Processing => Admission::Skip,
                TrackingStatus::Failed => Admission::Refresh,
            },
        }
    }
}

fn work_item(cluster: &Cluster, instance_id: &str, file: &LogFile, log_type: LogType) -> WorkItem {
    WorkItem {
        instance_id: instance_id.to_string(),
        cluster_id: cluster.cluster_id.clone(),
        engine: cluster.engine.clone(),
        log_type,
        log_file_name: file.name.clone(),
        last_written: file.last_written,
        size: file.size,
        enqueue_time: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Instance, LogPortion};
    use crate::bus::BusError;
    use crate::store::{StatusUpdate, TrackingRecord};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FleetFixture {
        clusters: Vec<Cluster>,
        files: HashMap<String, Vec<LogFile>>,
        fail_listing: bool,
    }

    #[async_trait]
    impl FleetApi for FleetFixture {
        async fn list_clusters(&self) -> Result<Vec<Cluster>, ApiError> {
            if self.fail_listing {
                return Err(ApiError::Api("throttled".to_string()));
            }
            Ok(self.clusters.clone())
        }

        async fn describe_instance(&self, instance_id: &str) -> Result<Instance, ApiError> {
            Ok(Instance {
                instance_id: instance_id.to_string(),
                instance_class: "db.r6g.large".to_string(),
                status: "available".to_string(),
            })
        }

        async fn list_log_files(&self, instance_id: &str) -> Result<Vec<LogFile>, ApiError> {
            Ok(self.files.get(instance_id).cloned().unwrap_or_default())
        }

        async fn download_portion(
            &self,
            _instance_id: &str,
            _file_name: &str,
            _marker: &str,
            _portion_lines: i32,
        ) -> Result<LogPortion, ApiError> {
            unreachable!("discovery never downloads")
        }
    }

    #[derive(Default)]
    struct MemoryTracking {
        records: Mutex<HashMap<(String, String), TrackingRecord>>,
        fail_get: bool,
    }

    #[async_trait]
    impl TrackingStore for MemoryTracking {
        async fn get(
            &self,
            instance_id: &str,
            file_name: &str,
        ) -> Result<Option<TrackingRecord>, StoreError> {
            if self.fail_get {
                return Err(StoreError::Store("unreachable".to_string()));
            }
            Ok(self
                .records
                .lock()
                .unwrap()
                .get(&(instance_id.to_string(), file_name.to_string()))
                .cloned())
        }

        async fn create_discovered(&self, item: &WorkItem) -> Result<(), StoreError> {
            self.records.lock().unwrap().insert(
                (item.instance_id.clone(), item.log_file_name.clone()),
                TrackingRecord {
                    status: TrackingStatus::Discovered,
                    last_written: item.last_written,
                    file_size: item.size,
                    lines_processed: 0,
                },
            );
            Ok(())
        }

        async fn refresh_discovered(&self, item: &WorkItem) -> Result<(), StoreError> {
            self.create_discovered(item).await
        }

        async fn update_status(
            &self,
            _instance_id: &str,
            _file_name: &str,
            _update: StatusUpdate,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct NullRegistry;

    #[async_trait]
    impl InstanceRegistry for NullRegistry {
        async fn save_cluster(&self, _cluster: &Cluster) -> Result<(), StoreError> {
            Ok(())
        }

        async fn save_instance(
            &self,
            _instance: &Instance,
            _cluster_id: &str,
            _is_writer: bool,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CapturingPublisher {
        published: Mutex<Vec<WorkItem>>,
    }

    #[async_trait]
    impl WorkPublisher for CapturingPublisher {
        async fn publish(&self, item: &WorkItem) -> Result<(), BusError> {
            self.published.lock().unwrap().push(item.clone());
            Ok(())
        }
    }

    fn cluster(id: &str, engine: &str, instances: &[&str]) -> Cluster {
        Cluster {
            cluster_id: id.to_string(),
            engine: engine.to_string(),
            status: "available".to_string(),
            endpoint: format!("{id}.cluster.local"),
            members: instances
                .iter()
                .enumerate()
                .map(|(i, instance_id)| ClusterMember {
                    instance_id: instance_id.to_string(),
                    is_writer: i == 0,
                })
                .collect(),
        }
    }

    fn config(shard_id: i64, total_shards: i64) -> DiscoveryConfig {
        DiscoveryConfig::from_lookup(|key| match key {
            "SHARD_ID" => Some(shard_id.to_string()),
            "TOTAL_SHARDS" => Some(total_shards.to_string()),
            "RATE_LIMIT_PER_SEC" => Some("1000".to_string()),
            _ => None,
        })
    }

    struct Harness {
        discovery: Discovery,
        tracking: Arc<MemoryTracking>,
        publisher: Arc<CapturingPublisher>,
        metrics: Arc<Metrics>,
    }

    fn harness(api: FleetFixture, tracking: MemoryTracking, cfg: DiscoveryConfig) -> Harness {
        let tracking = Arc::new(tracking);
        let publisher = Arc::new(CapturingPublisher::default());
        let metrics = Arc::new(Metrics::new());
        let limiter = Arc::new(RateLimiter::new(
            cfg.rate_limit_per_sec,
            cfg.rate_limit_per_sec,
        ));
        let discovery = Discovery::new(
            cfg,
            Arc::new(api),
            tracking.clone(),
            Arc::new(NullRegistry),
            publisher.clone(),
            limiter,
            metrics.clone(),
        );
        Harness {
            discovery,
            tracking,
            publisher,
            metrics,
        }
    }

    fn logfile(name: &str, last_written: i64) -> LogFile {
        LogFile {
            name: name.to_string(),
            last_written,
            size: 100,
        }
    }

    #[tokio::test]
    async fn test_fresh_files_are_published_with_records() {
        let api = FleetFixture {
            clusters: vec![cluster("c1", "aurora-mysql", &["db-1"])],
            files: HashMap::from([(
                "db-1".to_string(),
                vec![
                    logfile("error/mysql-error.log", 100),
                    logfile("slowquery/mysql-slowquery.log", 100),
                    logfile("general/mysql-general.log", 100),
                ],
            )]),
            fail_listing: false,
        };
        let h = harness(api, MemoryTracking::default(), config(0, 1));

        h.discovery.sweep(&CancellationToken::new()).await;

        let published = h.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 2, "general log must be skipped");
        assert!(published.iter().all(|item| item.instance_id == "db-1"));

        let records = h.tracking.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records
            .values()
            .all(|rec| rec.status == TrackingStatus::Discovered));
        assert_eq!(h.metrics.get("clusters_discovered"), 1);
    }

    #[tokio::test]
    async fn test_in_flight_records_block_republish() {
        let api = FleetFixture {
            clusters: vec![cluster("c1", "aurora-mysql", &["db-1"])],
            files: HashMap::from([(
                "db-1".to_string(),
                vec![
                    logfile("error/a.log", 100),
                    logfile("error/b.log", 100),
                ],
            )]),
            fail_listing: false,
        };
        let tracking = MemoryTracking::default();
        tracking.records.lock().unwrap().insert(
            ("db-1".to_string(), "error/a.log".to_string()),
            TrackingRecord {
                status: TrackingStatus::Processing,
                last_written: 50,
                file_size: 10,
                lines_processed: 0,
            },
        );
        tracking.records.lock().unwrap().insert(
            ("db-1".to_string(), "error/b.log".to_string()),
            TrackingRecord {
                status: TrackingStatus::Discovered,
                last_written: 50,
                file_size: 10,
                lines_processed: 0,
            },
        );

        let h = harness(api, tracking, config(0, 1));
        h.discovery.sweep(&CancellationToken::new()).await;

        assert!(h.publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completed_readmitted_only_when_modified() {
        let api = FleetFixture {
            clusters: vec![cluster("c1", "aurora-mysql", &["db-1"])],
            files: HashMap::from([(
                "db-1".to_string(),
                vec![
                    logfile("error/stale.log", 100),
                    logfile("error/grown.log", 200),
                ],
            )]),
            fail_listing: false,
        };
        let tracking = MemoryTracking::default();
        for name in ["error/stale.log", "error/grown.log"] {
            tracking.records.lock().unwrap().insert(
                ("db-1".to_string(), name.to_string()),
                TrackingRecord {
                    status: TrackingStatus::Completed,
                    last_written: 100,
                    file_size: 10,
                    lines_processed: 5,
                },
            );
        }

        let h = harness(api, tracking, config(0, 1));
        h.discovery.sweep(&CancellationToken::new()).await;

        let published = h.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].log_file_name, "error/grown.log");

        let records = h.tracking.records.lock().unwrap();
        let grown = records
            .get(&("db-1".to_string(), "error/grown.log".to_string()))
            .unwrap();
        assert_eq!(grown.status, TrackingStatus::Discovered);
    }

    #[tokio::test]
    async fn test_failed_records_are_readmitted() {
        let api = FleetFixture {
            clusters: vec![cluster("c1", "aurora-mysql", &["db-1"])],
            files: HashMap::from([(
                "db-1".to_string(),
                vec![logfile("error/a.log", 100)],
            )]),
            fail_listing: false,
        };
        let tracking = MemoryTracking::default();
        tracking.records.lock().unwrap().insert(
            ("db-1".to_string(), "error/a.log".to_string()),
            TrackingRecord {
                status: TrackingStatus::Failed,
                last_written: 100,
                file_size: 10,
                lines_processed: 0,
            },
        );

        let h = harness(api, tracking, config(0, 1));
        h.discovery.sweep(&CancellationToken::new()).await;

        assert_eq!(h.publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tracking_failure_fails_open() {
        let api = FleetFixture {
            clusters: vec![cluster("c1", "aurora-mysql", &["db-1"])],
            files: HashMap::from([(
                "db-1".to_string(),
                vec![logfile("error/a.log", 100)],
            )]),
            fail_listing: false,
        };
        let tracking = MemoryTracking {
            fail_get: true,
            ..Default::default()
        };

        let h = harness(api, tracking, config(0, 1));
        h.discovery.sweep(&CancellationToken::new()).await;

        assert_eq!(h.publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_engine_family_filter() {
        let api = FleetFixture {
            clusters: vec![
                cluster("c1", "aurora-mysql", &["db-1"]),
                cluster("c2", "postgres", &["db-2"]),
            ],
            files: HashMap::from([
                ("db-1".to_string(), vec![logfile("error/a.log", 100)]),
                ("db-2".to_string(), vec![logfile("error/b.log", 100)]),
            ]),
            fail_listing: false,
        };
        let h = harness(api, MemoryTracking::default(), config(0, 1));

        h.discovery.sweep(&CancellationToken::new()).await;

        let published = h.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].cluster_id, "c1");
    }

    #[tokio::test]
    async fn test_shards_partition_clusters() {
        let ids = ["c1", "c2", "c3", "c4"];
        let total = 3;
        let mut seen: Vec<String> = Vec::new();

        for shard in 0..total {
            let api = FleetFixture {
                clusters: ids
                    .iter()
                    .map(|id| {
                        let db = format!("{id}-db");
                        cluster(id, "aurora-mysql", &[db.as_str()])
                    })
                    .collect(),
                files: ids
                    .iter()
                    .map(|id| {
                        (
                            format!("{id}-db"),
                            vec![logfile("error/mysql-error.log", 100)],
                        )
                    })
                    .collect(),
                fail_listing: false,
            };
            let h = harness(api, MemoryTracking::default(), config(shard, total));
            h.discovery.sweep(&CancellationToken::new()).await;

            seen.extend(
                h.publisher
                    .published
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|item| item.cluster_id.clone()),
            );
        }

        seen.sort();
        assert_eq!(seen, vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_listing_failure_ends_sweep() {
        let api = FleetFixture {
            clusters: vec![],
            files: HashMap::new(),
            fail_listing: true,
        };
        let h = harness(api, MemoryTracking::default(), config(0, 1));

        h.discovery.sweep(&CancellationToken::new()).await;

        assert!(h.publisher.published.lock().unwrap().is_empty());
        assert_eq!(h.metrics.get("discovery_errors"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_publishes_nothing() {
        let api = FleetFixture {
            clusters: vec![cluster("c1", "aurora-mysql", &["db-1"])],
            files: HashMap::from([(
                "db-1".to_string(),
                vec![logfile("error/a.log", 100)],
            )]),
            fail_listing: false,
        };
        let h = harness(api, MemoryTracking::default(), config(0, 1));

        let cancel = CancellationToken::new();
        cancel.cancel();
        h.discovery.sweep(&cancel).await;

        assert!(h.publisher.published.lock().unwrap().is_empty());
    }
}
