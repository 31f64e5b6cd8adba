use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use tokio_util::sync::CancellationToken;

use application::LogMonitor;
use domain::log::{LogBackend, LogLevel, LogMessage};
use domain::runtime::{
    ContainerRuntime, ContainerSpec, LogChunk, LogStream, ManagedContainer, ManagedNetwork,
    RuntimeError, StreamKind,
};
use domain::state::{ServiceConfig, status};

// 1. Runtime with one running container and a scripted log stream
struct ScriptedRuntime {
    container: ManagedContainer,
    chunks: Mutex<Option<Vec<LogChunk>>>,
}

impl ScriptedRuntime {
    fn new(chunks: Vec<LogChunk>) -> Arc<Self> {
        Arc::new(Self {
            container: ManagedContainer {
                container_id: "c1".into(),
                app_id: 1001,
                app_name: "web".into(),
                service_id: 2,
                service_name: "nginx".into(),
                status: status::RUNNING.into(),
                created_at: None,
                started_at: None,
                config: ServiceConfig::default(),
            },
            chunks: Mutex::new(Some(chunks)),
        })
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        Ok(vec![self.container.clone()])
    }

    async fn create_container(&self, _spec: &ContainerSpec) -> Result<String, RuntimeError> {
        unimplemented!("not exercised by the monitor")
    }

    async fn start_container(&self, _container_id: &str) -> Result<(), RuntimeError> {
        unimplemented!("not exercised by the monitor")
    }

    async fn stop_container(
        &self,
        _container_id: &str,
        _timeout_secs: i64,
    ) -> Result<(), RuntimeError> {
        unimplemented!("not exercised by the monitor")
    }

    async fn remove_container(
        &self,
        _container_id: &str,
        _force: bool,
    ) -> Result<(), RuntimeError> {
        unimplemented!("not exercised by the monitor")
    }

    async fn restart_container(&self, _container_id: &str) -> Result<(), RuntimeError> {
        unimplemented!("not exercised by the monitor")
    }

    async fn pull_image(&self, _reference: &str) -> Result<(), RuntimeError> {
        unimplemented!("not exercised by the monitor")
    }

    async fn list_networks(&self) -> Result<Vec<ManagedNetwork>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn create_network(&self, _app_id: i64, _name: &str) -> Result<String, RuntimeError> {
        unimplemented!("not exercised by the monitor")
    }

    async fn remove_network(&self, _app_id: i64, _name: &str) -> Result<(), RuntimeError> {
        unimplemented!("not exercised by the monitor")
    }

    fn attach_log_stream(&self, _container_id: &str) -> LogStream {
        // One attach per test: replay the scripted chunks, then end
        let chunks = self.chunks.lock().unwrap().take().unwrap_or_default();
        Box::pin(stream::iter(chunks.into_iter().map(Ok)))
    }
}

// 2. Recording backend
#[derive(Default)]
struct RecordingBackend {
    records: Mutex<Vec<LogMessage>>,
}

#[async_trait]
impl LogBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn log(&self, message: LogMessage) {
        self.records.lock().unwrap().push(message);
    }
}

fn typed(kind: StreamKind, payload: &str) -> LogChunk {
    LogChunk::Typed {
        kind,
        payload: Bytes::copy_from_slice(payload.as_bytes()),
    }
}

fn frame(stream_type: u8, payload: &str) -> Vec<u8> {
    let mut out = vec![stream_type, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload.as_bytes());
    out
}

async fn capture(chunks: Vec<LogChunk>) -> Vec<LogMessage> {
    let runtime = ScriptedRuntime::new(chunks);
    let backend = Arc::new(RecordingBackend::default());
    let monitor = LogMonitor::new(runtime, vec![backend.clone()]);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(monitor.run(cancel.clone()));
    // First sweep attaches and drains the scripted stream
    tokio::time::sleep(Duration::from_secs(6)).await;
    cancel.cancel();
    let _ = handle.await;

    let records = backend.records.lock().unwrap().clone();
    records
}

// 3. The tests

#[tokio::test(start_paused = true)]
async fn test_typed_chunks_classified_by_marker_and_stream() {
    let records = capture(vec![
        typed(StreamKind::Stdout, "[ERROR] db connection lost\n"),
        typed(StreamKind::Stdout, "request served\n"),
        typed(StreamKind::Stderr, "slow query\n"),
        typed(StreamKind::Stderr, "\n"),
    ])
    .await;

    assert_eq!(records.len(), 3, "empty line dropped");
    assert_eq!(records[0].level, LogLevel::Error);
    assert_eq!(records[1].level, LogLevel::Info);
    assert_eq!(records[2].level, LogLevel::Warn);
    assert_eq!(records[2].is_std_err, Some(true));

    assert_eq!(records[0].service_id, Some(1001002));
    assert_eq!(records[0].service_name.as_deref(), Some("nginx"));
    assert_eq!(records[0].container_id.as_deref(), Some("c1"));
}

#[tokio::test(start_paused = true)]
async fn test_raw_multiplexed_chunks_are_demultiplexed() {
    // stdout and stderr frames interleaved in one raw byte stream, the
    // second frame split across two chunks
    let mut first = frame(1, "out line\n");
    let second_full = frame(2, "err line\n");
    let (head, tail) = second_full.split_at(6);
    first.extend_from_slice(head);

    let records = capture(vec![
        LogChunk::Raw(Bytes::from(first)),
        LogChunk::Raw(Bytes::copy_from_slice(tail)),
    ])
    .await;

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].message, "out line");
    assert_eq!(records[0].is_std_err, Some(false));
    assert_eq!(records[1].message, "err line");
    assert_eq!(records[1].level, LogLevel::Warn);
}

#[tokio::test(start_paused = true)]
async fn test_raw_tty_stream_passes_through() {
    let records = capture(vec![
        LogChunk::Raw(Bytes::from_static(b"plain tty output\n")),
        LogChunk::Raw(Bytes::from_static(b"WARN: pressure high\n")),
    ])
    .await;

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].level, LogLevel::Info);
    assert_eq!(records[1].level, LogLevel::Warn);
}

#[tokio::test(start_paused = true)]
async fn test_partial_lines_accumulate_until_newline() {
    let records = capture(vec![
        typed(StreamKind::Stdout, "a long line "),
        typed(StreamKind::Stdout, "assembled in pieces\nnext"),
        typed(StreamKind::Stdout, " line\n"),
    ])
    .await;

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].message, "a long line assembled in pieces");
    assert_eq!(records[1].message, "next line");
}
