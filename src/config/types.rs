use std::time::Duration;

/// Per-operation TTLs for the read-through API cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub clusters: Duration,
    pub instances: Duration,
    pub log_files: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            clusters: Duration::from_secs(300),
            instances: Duration::from_secs(300),
            log_files: Duration::from_secs(60),
        }
    }
}

/// Configuration for the discovery service, read from the environment.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub kafka_brokers: Vec<String>,
    pub instance_table: String,
    pub tracking_table: String,
    pub valkey_url: Option<String>,
    pub region: String,
    pub engine_family: String,
    pub shard_id: i64,
    pub total_shards: i64,
    pub discovery_interval: Duration,
    pub rate_limit_per_sec: u32,
    pub cache_ttls: CacheTtls,
}

impl DiscoveryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Tests inject variables here
    /// instead of mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            kafka_brokers: csv(&get_or(&lookup, "KAFKA_BROKERS", "")),
            instance_table: get_or(&lookup, "INSTANCE_TABLE", ""),
            tracking_table: get_or(&lookup, "TRACKING_TABLE", ""),
            valkey_url: lookup("VALKEY_URL").filter(|v| !v.is_empty()),
            region: get_or(&lookup, "REGION", ""),
            engine_family: get_or(&lookup, "ENGINE_FAMILY", "aurora"),
            shard_id: get_int(&lookup, "SHARD_ID", 0),
            total_shards: get_int(&lookup, "TOTAL_SHARDS", 1).max(1),
            discovery_interval: Duration::from_secs(
                get_int(&lookup, "DISCOVERY_INTERVAL_MIN", 5).max(1) as u64 * 60,
            ),
            rate_limit_per_sec: get_int(&lookup, "RATE_LIMIT_PER_SEC", 10).max(1) as u32,
            cache_ttls: cache_ttls(&lookup),
        }
    }
}

/// How far the processor takes each log line before shipping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsingMode {
    Full,
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub openobserve_url: String,
    pub openobserve_user: String,
    pub openobserve_pass: String,
    pub openobserve_stream: String,
    pub forward_enabled: bool,
    pub forward_host: String,
    pub forward_port: u16,
}

/// Configuration for the processor service, read from the environment.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub kafka_brokers: Vec<String>,
    pub tracking_table: String,
    pub checkpoint_table: String,
    pub dlq_table: String,
    pub consumer_group: String,
    pub region: String,
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub breaker_max_failures: u32,
    pub breaker_reset_timeout: Duration,
    pub connection_pool_size: usize,
    pub connection_timeout: Duration,
    pub parsing_mode: ParsingMode,
    pub sink: SinkConfig,
}

impl ProcessorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            kafka_brokers: csv(&get_or(&lookup, "KAFKA_BROKERS", "")),
            tracking_table: get_or(&lookup, "TRACKING_TABLE", ""),
            checkpoint_table: get_or(&lookup, "CHECKPOINT_TABLE", "log-checkpoints"),
            dlq_table: get_or(&lookup, "DLQ_TABLE", "log-dlq"),
            consumer_group: get_or(&lookup, "CONSUMER_GROUP", "log-processor-group"),
            region: get_or(&lookup, "REGION", ""),
            max_concurrency: get_int(&lookup, "MAX_CONCURRENCY", 10).max(1) as usize,
            batch_size: get_int(&lookup, "BATCH_SIZE", 100).max(1) as usize,
            batch_timeout: Duration::from_secs(get_int(&lookup, "BATCH_TIMEOUT_SEC", 5).max(1) as u64),
            max_retries: get_int(&lookup, "MAX_RETRIES", 3).max(0) as u32,
            retry_backoff: Duration::from_secs(get_int(&lookup, "RETRY_BACKOFF_SEC", 5).max(1) as u64),
            breaker_max_failures: get_int(&lookup, "CIRCUIT_BREAKER_MAX_FAILURES", 5).max(1) as u32,
            breaker_reset_timeout: Duration::from_secs(
                get_int(&lookup, "CIRCUIT_BREAKER_TIMEOUT_SEC", 30).max(1) as u64,
            ),
            connection_pool_size: get_int(&lookup, "CONNECTION_POOL_SIZE", 100).max(1) as usize,
            connection_timeout: Duration::from_secs(
                get_int(&lookup, "CONNECTION_TIMEOUT_SEC", 30).max(1) as u64,
            ),
            parsing_mode: match get_or(&lookup, "PARSING_MODE", "full").as_str() {
                "passthrough" => ParsingMode::Passthrough,
                _ => ParsingMode::Full,
            },
            sink: SinkConfig {
                openobserve_url: get_or(&lookup, "OPENOBSERVE_URL", ""),
                openobserve_user: get_or(&lookup, "OPENOBSERVE_USER", ""),
                openobserve_pass: get_or(&lookup, "OPENOBSERVE_PASS", ""),
                openobserve_stream: get_or(&lookup, "OPENOBSERVE_STREAM", "aurora_logs"),
                forward_enabled: get_or(&lookup, "LOG_FORWARD_ENABLED", "") == "true",
                forward_host: get_or(&lookup, "LOG_FORWARD_HOST", "localhost"),
                forward_port: get_int(&lookup, "LOG_FORWARD_PORT", 24224) as u16,
            },
        }
    }
}

fn cache_ttls<F>(lookup: &F) -> CacheTtls
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = CacheTtls::default();
    CacheTtls {
        clusters: Duration::from_secs(
            get_int(lookup, "CACHE_TTL_CLUSTERS", defaults.clusters.as_secs() as i64).max(1) as u64,
        ),
        instances: Duration::from_secs(
            get_int(lookup, "CACHE_TTL_INSTANCES", defaults.instances.as_secs() as i64).max(1) as u64,
        ),
        log_files: Duration::from_secs(
            get_int(lookup, "CACHE_TTL_LOGFILES", defaults.log_files.as_secs() as i64).max(1) as u64,
        ),
    }
}

fn get_or<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) if !val.is_empty() => val,
        _ => default.to_string(),
    }
}

fn get_int<F>(lookup: &F, key: &str, default: i64) -> i64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|val| val.trim().parse().ok())
        .unwrap_or(default)
}

fn csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_discovery_defaults() {
        let cfg = DiscoveryConfig::from_lookup(lookup_from(&[]));
        assert!(cfg.kafka_brokers.is_empty());
        assert_eq!(cfg.shard_id, 0);
        assert_eq!(cfg.total_shards, 1);
        assert_eq!(cfg.engine_family, "aurora");
        assert_eq!(cfg.discovery_interval, Duration::from_secs(300));
        assert_eq!(cfg.rate_limit_per_sec, 10);
        assert_eq!(cfg.cache_ttls.clusters, Duration::from_secs(300));
        assert_eq!(cfg.cache_ttls.log_files, Duration::from_secs(60));
        assert!(cfg.valkey_url.is_none());
    }

    #[test]
    fn test_discovery_from_lookup() {
        let vars = [
            ("KAFKA_BROKERS", "k1:9092, k2:9092"),
            ("TRACKING_TABLE", "tracking"),
            ("SHARD_ID", "2"),
            ("TOTAL_SHARDS", "3"),
            ("DISCOVERY_INTERVAL_MIN", "1"),
            ("RATE_LIMIT_PER_SEC", "25"),
            ("CACHE_TTL_LOGFILES", "30"),
            ("VALKEY_URL", "redis://cache:6379"),
        ];
        let cfg = DiscoveryConfig::from_lookup(lookup_from(&vars));
        assert_eq!(cfg.kafka_brokers, vec!["k1:9092", "k2:9092"]);
        assert_eq!(cfg.tracking_table, "tracking");
        assert_eq!(cfg.shard_id, 2);
        assert_eq!(cfg.total_shards, 3);
        assert_eq!(cfg.discovery_interval, Duration::from_secs(60));
        assert_eq!(cfg.rate_limit_per_sec, 25);
        assert_eq!(cfg.cache_ttls.log_files, Duration::from_secs(30));
        assert_eq!(cfg.valkey_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn test_processor_defaults() {
        let cfg = ProcessorConfig::from_lookup(lookup_from(&[]));
        assert_eq!(cfg.max_concurrency, 10);
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.batch_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_backoff, Duration::from_secs(5));
        assert_eq!(cfg.breaker_max_failures, 5);
        assert_eq!(cfg.breaker_reset_timeout, Duration::from_secs(30));
        assert_eq!(cfg.connection_pool_size, 100);
        assert_eq!(cfg.parsing_mode, ParsingMode::Full);
        assert_eq!(cfg.checkpoint_table, "log-checkpoints");
        assert_eq!(cfg.dlq_table, "log-dlq");
        assert!(!cfg.sink.forward_enabled);
        assert_eq!(cfg.sink.forward_port, 24224);
        assert_eq!(cfg.sink.openobserve_stream, "aurora_logs");
    }

    #[test]
    fn test_processor_passthrough_mode() {
        let vars = [
            ("PARSING_MODE", "passthrough"),
            ("LOG_FORWARD_ENABLED", "true"),
            ("LOG_FORWARD_HOST", "fluent"),
            ("LOG_FORWARD_PORT", "34224"),
        ];
        let cfg = ProcessorConfig::from_lookup(lookup_from(&vars));
        assert_eq!(cfg.parsing_mode, ParsingMode::Passthrough);
        assert!(cfg.sink.forward_enabled);
        assert_eq!(cfg.sink.forward_host, "fluent");
        assert_eq!(cfg.sink.forward_port, 34224);
    }

    #[test]
    fn test_invalid_int_falls_back() {
        let vars = [("BATCH_SIZE", "not-a-number")];
        let cfg = ProcessorConfig::from_lookup(lookup_from(&vars));
        assert_eq!(cfg.batch_size, 100);
    }
}
