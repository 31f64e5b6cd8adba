use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use domain::cloud::CloudApi;
use domain::log::{LogBackend, LogMessage};

use crate::cloud::Backoff;

#[derive(Debug, Clone)]
pub struct CloudLogConfig {
    /// Flush at least this often while logs are pending.
    pub flush_interval: Duration,
    /// Flush immediately once the serialized buffer reaches this size.
    pub max_buffer_bytes: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for CloudLogConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            max_buffer_bytes: 256 * 1024,
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(300),
        }
    }
}

/// Buffers logs and flushes them as NDJSON to the cloud. On failure the
/// batch goes back to the front of the buffer (no loss, no reordering)
/// and the next attempt waits out an exponential backoff.
pub struct CloudLogBackend {
    tx: mpsc::Sender<LogMessage>,
}

impl CloudLogBackend {
    pub fn new(api: Arc<dyn CloudApi>, uuid: String, config: CloudLogConfig) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(flush_loop(api, uuid, config, rx));
        Self { tx }
    }
}

#[async_trait]
impl LogBackend for CloudLogBackend {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn log(&self, message: LogMessage) {
        if self.tx.try_send(message).is_err() {
            debug!("Cloud log queue full, dropping record");
        }
    }
}

async fn flush_loop(
    api: Arc<dyn CloudApi>,
    uuid: String,
    config: CloudLogConfig,
    mut rx: mpsc::Receiver<LogMessage>,
) {
    let mut buffer: VecDeque<LogMessage> = VecDeque::new();
    let mut buffered_bytes = 0usize;
    let mut backoff = Backoff::new(config.retry_base, config.retry_max);
    // While a flush is failing, the buffer keeps accumulating and the
    // next attempt is gated on this instant.
    let mut next_attempt = Instant::now();
    let mut interval = tokio::time::interval(config.flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(message) => {
                        buffered_bytes += estimate_size(&message);
                        buffer.push_back(message);
                        if buffered_bytes >= config.max_buffer_bytes && Instant::now() >= next_attempt {
                            try_flush(&api, &uuid, &mut buffer, &mut buffered_bytes, &mut backoff, &mut next_attempt).await;
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            try_flush(&api, &uuid, &mut buffer, &mut buffered_bytes, &mut backoff, &mut next_attempt).await;
                        }
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                if !buffer.is_empty() && Instant::now() >= next_attempt {
                    try_flush(&api, &uuid, &mut buffer, &mut buffered_bytes, &mut backoff, &mut next_attempt).await;
                }
            }
        }
    }
}

async fn try_flush(
    api: &Arc<dyn CloudApi>,
    uuid: &str,
    buffer: &mut VecDeque<LogMessage>,
    buffered_bytes: &mut usize,
    backoff: &mut Backoff,
    next_attempt: &mut Instant,
) {
    let batch: Vec<LogMessage> = buffer.drain(..).collect();
    *buffered_bytes = 0;

    let mut ndjson = Vec::new();
    for message in &batch {
        match serde_json::to_vec(message) {
            Ok(line) => {
                ndjson.extend_from_slice(&line);
                ndjson.push(b'\n');
            }
            Err(e) => warn!("Failed to serialize log record: {}", e),
        }
    }

    match api.upload_logs(uuid, ndjson).await {
        Ok(()) => {
            info!(lines = batch.len(), "Uploaded log batch");
            backoff.reset();
            *next_attempt = Instant::now();
        }
        Err(e) => {
            let delay = backoff.next_delay();
            warn!(retry_in = ?delay, "Log upload failed: {}", e);
            // Restore in order to the front of the buffer
            for message in batch.into_iter().rev() {
                *buffered_bytes += estimate_size(&message);
                buffer.push_front(message);
            }
            *next_attempt = Instant::now() + delay;
        }
    }
}

fn estimate_size(message: &LogMessage) -> usize {
    // Close enough for the flush threshold: payload plus envelope
    message.message.len() + 128
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::cloud::{
        CloudError, DeviceReport, ProvisioningRequest, ProvisioningResponse, TargetFetch,
    };
    use domain::log::{LogLevel, LogSource};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockCloud {
        uploads: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl MockCloud {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                uploads: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl CloudApi for MockCloud {
        async fn register(
            &self,
            _request: &ProvisioningRequest,
        ) -> Result<ProvisioningResponse, CloudError> {
            unimplemented!("not used by the log backend")
        }

        async fn fetch_target_state(
            &self,
            _uuid: &str,
            _etag: Option<&str>,
        ) -> Result<TargetFetch, CloudError> {
            unimplemented!("not used by the log backend")
        }

        async fn patch_device_state(
            &self,
            _uuid: &str,
            _report: &DeviceReport,
        ) -> Result<(), CloudError> {
            unimplemented!("not used by the log backend")
        }

        async fn upload_logs(&self, _uuid: &str, ndjson: Vec<u8>) -> Result<(), CloudError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(CloudError::Transient("cloud down".into()));
            }
            self.uploads.lock().unwrap().push(ndjson);
            Ok(())
        }
    }

    fn message(i: i64) -> LogMessage {
        LogMessage {
            id: None,
            message: format!("line {i}"),
            timestamp: i,
            level: LogLevel::Info,
            source: LogSource::Container,
            service_id: None,
            service_name: None,
            container_id: None,
            is_std_err: None,
            is_system: None,
        }
    }

    fn lines(ndjson: &[u8]) -> Vec<LogMessage> {
        std::str::from_utf8(ndjson)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_flushes_on_interval() {
        let cloud = MockCloud::new();
        let backend = CloudLogBackend::new(
            cloud.clone(),
            "dev-1".into(),
            CloudLogConfig {
                flush_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );

        backend.log(message(1)).await;
        backend.log(message(2)).await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        let uploads = cloud.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        let batch = lines(&uploads[0]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].timestamp, 1);
        assert_eq!(batch[1].timestamp, 2);
    }

    #[tokio::test]
    async fn test_failure_restores_order_and_retries() {
        let cloud = MockCloud::new();
        cloud.fail.store(true, Ordering::Relaxed);

        let backend = CloudLogBackend::new(
            cloud.clone(),
            "dev-1".into(),
            CloudLogConfig {
                flush_interval: Duration::from_millis(20),
                retry_base: Duration::from_millis(500),
                retry_max: Duration::from_secs(1),
                ..Default::default()
            },
        );

        backend.log(message(1)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Still failing; more logs arrive behind the stuck batch
        backend.log(message(2)).await;
        backend.log(message(3)).await;

        cloud.fail.store(false, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(800)).await;

        let uploads = cloud.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1, "one recovery batch, no duplicates");
        let batch = lines(&uploads[0]);
        let timestamps: Vec<i64> = batch.iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3], "order preserved on recovery");
    }
}
