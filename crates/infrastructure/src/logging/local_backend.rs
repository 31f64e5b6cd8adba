use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use domain::log::{LogBackend, LogFilter, LogMessage};

#[derive(Debug, Clone)]
pub struct LocalLogConfig {
    /// Ring buffer capacity, FIFO eviction.
    pub max_logs: usize,
    /// Entries older than this (milliseconds) are evicted periodically.
    pub max_age_ms: u64,
    pub file_persistence: Option<FilePersistenceConfig>,
}

#[derive(Debug, Clone)]
pub struct FilePersistenceConfig {
    pub dir: PathBuf,
    /// Rotate when the active NDJSON file would exceed this many bytes.
    pub max_file_size: u64,
}

impl Default for LocalLogConfig {
    fn default() -> Self {
        Self {
            max_logs: 10_000,
            max_age_ms: 24 * 60 * 60 * 1000,
            file_persistence: None,
        }
    }
}

/// In-memory ring buffer with optional NDJSON file persistence. Queries
/// from the device-local API run against the ring only.
pub struct LocalLogBackend {
    buffer: Arc<Mutex<VecDeque<LogMessage>>>,
    config: LocalLogConfig,
    writer: Option<Arc<tokio::sync::Mutex<NdjsonWriter>>>,
}

impl LocalLogBackend {
    pub fn new(config: LocalLogConfig) -> Arc<Self> {
        let writer = config
            .file_persistence
            .as_ref()
            .map(|fp| Arc::new(tokio::sync::Mutex::new(NdjsonWriter::new(fp.clone()))));

        let backend = Arc::new(Self {
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            config,
            writer,
        });
        backend.clone().start_eviction();
        backend
    }

    /// Periodic eviction of aged entries and rotated files.
    fn start_eviction(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await; // immediate first tick is a no-op
            loop {
                interval.tick().await;
                let cutoff = Utc::now().timestamp_millis() - self.config.max_age_ms as i64;
                let evicted = {
                    let mut buffer = self.buffer.lock().unwrap();
                    let before = buffer.len();
                    while buffer.front().is_some_and(|m| m.timestamp < cutoff) {
                        buffer.pop_front();
                    }
                    before - buffer.len()
                };
                if evicted > 0 {
                    debug!(evicted, "Evicted aged log entries");
                }
                if let Some(writer) = &self.writer {
                    writer.lock().await.remove_aged_files(cutoff).await;
                }
            }
        });
    }

    /// Filtered query over the in-memory buffer, capture order preserved,
    /// `limit` keeping the most recent matches.
    pub fn query(&self, filter: &LogFilter) -> Vec<LogMessage> {
        let buffer = self.buffer.lock().unwrap();
        let mut matches: Vec<LogMessage> = buffer
            .iter()
            .filter(|message| filter.matches(message))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            if matches.len() > limit {
                matches.drain(..matches.len() - limit);
            }
        }
        matches
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LogBackend for LocalLogBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn log(&self, message: LogMessage) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push_back(message.clone());
            while buffer.len() > self.config.max_logs {
                buffer.pop_front();
            }
        }
        if let Some(writer) = &self.writer {
            writer.lock().await.append(&message).await;
        }
    }
}

/// NDJSON files named by creation timestamp, rotated by size.
struct NdjsonWriter {
    config: FilePersistenceConfig,
    current: Option<(PathBuf, u64)>,
    sequence: u64,
    name_pattern: Regex,
}

impl NdjsonWriter {
    fn new(config: FilePersistenceConfig) -> Self {
        Self {
            config,
            current: None,
            sequence: 0,
            // logs-20240601T102233123-0001.ndjson; the sequence keeps
            // rotations within one millisecond from colliding
            name_pattern: Regex::new(r"^logs-(\d{8}T\d{9})-\d+\.ndjson$").unwrap(),
        }
    }

    fn new_file_path(&mut self) -> PathBuf {
        self.sequence += 1;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        self.config
            .dir
            .join(format!("logs-{stamp}-{:04}.ndjson", self.sequence))
    }

    async fn append(&mut self, message: &LogMessage) {
        let line = match serde_json::to_vec(message) {
            Ok(mut line) => {
                line.push(b'\n');
                line
            }
            Err(e) => {
                error!("Failed to serialize log record: {}", e);
                return;
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.config.dir).await {
            warn!("Log dir unavailable: {}", e);
            return;
        }

        let rotate = match &self.current {
            Some((_, written)) => written + line.len() as u64 > self.config.max_file_size,
            None => true,
        };
        if rotate {
            let path = self.new_file_path();
            info!(path = %path.display(), "Rotating local log file");
            self.current = Some((path, 0));
        }

        let (path, written) = self.current.as_mut().unwrap();
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        match result {
            Ok(mut file) => {
                if let Err(e) = file.write_all(&line).await {
                    warn!("Failed to append log line: {}", e);
                } else {
                    *written += line.len() as u64;
                }
            }
            Err(e) => warn!(path = %path.display(), "Failed to open log file: {}", e),
        }
    }

    async fn remove_aged_files(&mut self, cutoff_ms: i64) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(captures) = self.name_pattern.captures(name) else {
                continue;
            };
            if let Some(stamp) = parse_file_stamp(&captures[1]) {
                let active = self
                    .current
                    .as_ref()
                    .is_some_and(|(path, _)| path == &entry.path());
                if stamp < cutoff_ms && !active {
                    debug!(file = %name, "Removing aged log file");
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
    }
}

fn parse_file_stamp(stamp: &str) -> Option<i64> {
    chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%S%3f")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::log::{LogLevel, LogSource};

    fn message(timestamp: i64, level: LogLevel) -> LogMessage {
        LogMessage {
            id: None,
            message: format!("line at {timestamp}"),
            timestamp,
            level,
            source: LogSource::Container,
            service_id: Some(1001001),
            service_name: Some("nginx".into()),
            container_id: Some("c1".into()),
            is_std_err: Some(false),
            is_system: None,
        }
    }

    #[tokio::test]
    async fn test_ring_evicts_fifo() {
        let backend = LocalLogBackend::new(LocalLogConfig {
            max_logs: 3,
            ..Default::default()
        });
        for i in 0..5 {
            backend.log(message(i, LogLevel::Info)).await;
        }
        let all = backend.query(&LogFilter::default());
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, 2);
        assert_eq!(all[2].timestamp, 4);
    }

    #[tokio::test]
    async fn test_query_filters_and_limit() {
        let backend = LocalLogBackend::new(LocalLogConfig::default());
        for i in 0..10 {
            let level = if i % 2 == 0 {
                LogLevel::Info
            } else {
                LogLevel::Error
            };
            backend.log(message(i, level)).await;
        }

        let errors = backend.query(&LogFilter {
            level: Some(LogLevel::Error),
            ..Default::default()
        });
        assert_eq!(errors.len(), 5);

        let limited = backend.query(&LogFilter {
            level: Some(LogLevel::Error),
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(limited.len(), 2);
        // Limit keeps the newest matches, order preserved
        assert_eq!(limited[0].timestamp, 7);
        assert_eq!(limited[1].timestamp, 9);
    }

    #[tokio::test]
    async fn test_file_persistence_writes_ndjson_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalLogBackend::new(LocalLogConfig {
            max_logs: 100,
            max_age_ms: 60_000,
            file_persistence: Some(FilePersistenceConfig {
                dir: dir.path().to_path_buf(),
                max_file_size: 200,
            }),
        });

        for i in 0..5 {
            backend.log(message(i, LogLevel::Info)).await;
        }

        let mut files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        files.sort();
        // 200-byte cap forces more than one file for five records
        assert!(files.len() > 1, "expected rotation, got {files:?}");

        let content = std::fs::read_to_string(&files[0]).unwrap();
        let first_line: LogMessage =
            serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first_line.timestamp, 0);
    }

    #[test]
    fn test_file_stamp_parse() {
        assert!(parse_file_stamp("20240601T102233123").is_some());
        assert!(parse_file_stamp("not-a-stamp").is_none());
    }
}
