use super::parse::ParsedEntry;
use crate::bus::LogType;
use crate::config::SinkConfig;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

const WRITE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("http status {0}")]
    Status(u16),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("write deadline exceeded")]
    Deadline,
}

/// Downstream destination for parsed entries. Failures are counted by the
/// caller but never fail the item.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send_batch(&self, log_type: LogType, entries: &[ParsedEntry])
        -> Result<(), SinkError>;
}

/// Fixed-size pool of preconfigured HTTP clients; one client serves one
/// batch at a time.
struct ClientPool {
    tx: mpsc::Sender<reqwest::Client>,
    rx: Mutex<mpsc::Receiver<reqwest::Client>>,
}

impl ClientPool {
    fn new(size: usize, timeout: Duration) -> Result<Self, SinkError> {
        let (tx, rx) = mpsc::channel(size);
        for _ in 0..size {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .pool_idle_timeout(Duration::from_secs(90))
                .pool_max_idle_per_host(10)
                .build()?;
            tx.try_send(client).ok();
        }
        Ok(Self {
            tx,
            rx: Mutex::new(rx),
        })
    }

    async fn acquire(&self) -> reqwest::Client {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(client) => client,
            // The pool keeps its sender alive, so this never fires; fall
            // back to a fresh client rather than poisoning the batch.
            None => reqwest::Client::new(),
        }
    }

    fn put_back(&self, client: reqwest::Client) {
        let _ = self.tx.try_send(client);
    }
}

/// Batched JSON POSTs to the log store, one stream per log kind.
pub struct HttpSink {
    pool: ClientPool,
    base_url: String,
    user: String,
    pass: String,
    default_stream: String,
}

impl HttpSink {
    pub fn new(config: &SinkConfig, pool_size: usize, timeout: Duration) -> Result<Self, SinkError> {
        Ok(Self {
            pool: ClientPool::new(pool_size, timeout)?,
            base_url: config.openobserve_url.trim_end_matches('/').to_string(),
            user: config.openobserve_user.clone(),
            pass: config.openobserve_pass.clone(),
            default_stream: config.openobserve_stream.clone(),
        })
    }

    fn stream_for(&self, log_type: LogType) -> &str {
        match log_type {
            LogType::Error => "aurora_error_logs",
            LogType::Slowquery => "aurora_slowquery_logs",
            LogType::Other => &self.default_stream,
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send_batch(
        &self,
        log_type: LogType,
        entries: &[ParsedEntry],
    ) -> Result<(), SinkError> {
        let url = format!(
            "{}/api/default/{}/_json",
            self.base_url,
            self.stream_for(log_type)
        );

        let client = self.pool.acquire().await;
        let result = client
            .post(&url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(entries)
            .send()
            .await;
        self.pool.put_back(client);

        let response = result?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(SinkError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Frame one record for the forward protocol: `[<tag>, [[<unix_ts>, <record>]]]`.
fn frame(tag: &str, unix_ts: i64, record: &ParsedEntry) -> Result<Vec<u8>, SinkError> {
    let mut data = serde_json::to_vec(&json!([tag, [[unix_ts, record]]]))?;
    data.push(b'\n');
    Ok(data)
}

/// Persistent TCP forward to a log-shipper. The connection is established
/// lazily and dropped on any write failure; the next write reconnects.
pub struct ForwardSink {
    address: String,
    conn: Mutex<Option<TcpStream>>,
}

impl ForwardSink {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            address: format!("{host}:{port}"),
            conn: Mutex::new(None),
        }
    }

    async fn write_frame(&self, data: &[u8]) -> Result<(), SinkError> {
        let mut guard = self.conn.lock().await;

        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => {
                let stream = tokio::time::timeout(WRITE_DEADLINE, TcpStream::connect(&self.address))
                    .await
                    .map_err(|_| SinkError::Deadline)??;
                info!(address = %self.address, "connected to log forwarder");
                stream
            }
        };

        match tokio::time::timeout(WRITE_DEADLINE, stream.write_all(data)).await {
            Ok(Ok(())) => {
                *guard = Some(stream);
                Ok(())
            }
            Ok(Err(err)) => Err(SinkError::Io(err)),
            Err(_) => Err(SinkError::Deadline),
        }
    }
}

#[async_trait]
impl Sink for ForwardSink {
    async fn send_batch(
        &self,
        log_type: LogType,
        entries: &[ParsedEntry],
    ) -> Result<(), SinkError> {
        let tag = format!("aurora.{}", log_type.as_str());
        let mut sent = 0usize;

        for entry in entries {
            let unix_ts = entry
                .get("_timestamp")
                .and_then(Value::as_i64)
                .map(|millis| millis / 1000)
                .unwrap_or_else(|| Utc::now().timestamp());

            let data = frame(&tag, unix_ts, entry)?;
            if let Err(err) = self.write_frame(&data).await {
                warn!(error = %err, sent, total = entries.len(), "forward write failed");
                return Err(err);
            }
            sent += 1;
        }
        Ok(())
    }
}
