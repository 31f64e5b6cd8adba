//! Log monitor: one task per attached container stream, decoding,
//! classifying and fanning out to every configured backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use domain::log::{LogBackend, LogLevel, LogMessage, LogSource, classify, service_log_id};
use domain::runtime::{ContainerRuntime, LogChunk, ManagedContainer, StreamKind};
use domain::state::status;
use infrastructure::docker::demux::{FrameDecoder, looks_multiplexed};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Attaches to every running managed container and owns the map
/// `containerId -> task handle` (single writer).
pub struct LogMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    backends: Vec<Arc<dyn LogBackend>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LogMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, backends: Vec<Arc<dyn LogBackend>>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            backends,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Periodically sweep the runtime: attach to new running containers,
    /// drop tasks whose containers are gone.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Log monitor shutting down");
                    let mut tasks = self.tasks.lock().await;
                    for (_, handle) in tasks.drain() {
                        handle.abort();
                    }
                    return;
                }
                _ = interval.tick() => {}
            }

            let containers = match self.runtime.list_containers().await {
                Ok(containers) => containers,
                Err(e) => {
                    debug!("Log monitor sweep failed: {}", e);
                    continue;
                }
            };

            let mut tasks = self.tasks.lock().await;

            // Reap tasks for departed or finished streams
            tasks.retain(|container_id, handle| {
                let alive = containers
                    .iter()
                    .any(|c| &c.container_id == container_id && c.status == status::RUNNING);
                if !alive {
                    handle.abort();
                }
                alive && !handle.is_finished()
            });

            for container in containers {
                if container.status != status::RUNNING
                    || tasks.contains_key(&container.container_id)
                {
                    continue;
                }
                debug!(
                    container_id = %container.container_id,
                    service = %container.service_name,
                    "Attaching log stream"
                );
                let handle = tokio::spawn(
                    StreamWorker::new(self.clone(), container.clone()).run(),
                );
                tasks.insert(container.container_id, handle);
            }
        }
    }

    /// Agent-internal log record, same pipeline as container output.
    pub async fn emit_system(&self, level: LogLevel, message: impl Into<String>) {
        let record = LogMessage {
            id: None,
            message: message.into(),
            timestamp: Utc::now().timestamp_millis(),
            level,
            source: LogSource::Manager,
            service_id: None,
            service_name: None,
            container_id: None,
            is_std_err: None,
            is_system: Some(true),
        };
        self.emit(record).await;
    }

    /// Fire-and-forget delivery to every backend; a slow or failing
    /// backend cannot affect the others.
    async fn emit(&self, record: LogMessage) {
        for backend in &self.backends {
            backend.log(record.clone()).await;
        }
    }
}

/// How raw (untyped) chunks of one stream are interpreted: decided on
/// the first chunk, then sticky for the stream's lifetime.
enum RawMode {
    Undecided,
    Multiplexed(FrameDecoder),
    Passthrough,
}

struct StreamWorker {
    monitor: Arc<LogMonitor>,
    container: ManagedContainer,
    raw_mode: RawMode,
    stdout_tail: String,
    stderr_tail: String,
}

impl StreamWorker {
    fn new(monitor: Arc<LogMonitor>, container: ManagedContainer) -> Self {
        Self {
            monitor,
            container,
            raw_mode: RawMode::Undecided,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
        }
    }

    async fn run(mut self) {
        let mut stream = self
            .monitor
            .runtime
            .attach_log_stream(&self.container.container_id);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogChunk::Typed { kind, payload }) => {
                    self.handle_payload(kind, &payload).await;
                }
                Ok(LogChunk::Raw(payload)) => {
                    if matches!(self.raw_mode, RawMode::Undecided) {
                        self.raw_mode = if looks_multiplexed(&payload) {
                            RawMode::Multiplexed(FrameDecoder::new())
                        } else {
                            RawMode::Passthrough
                        };
                    }
                    match &mut self.raw_mode {
                        RawMode::Multiplexed(decoder) => {
                            let frames = decoder.push(&payload);
                            for frame in frames {
                                self.handle_payload(frame.kind, &frame.payload).await;
                            }
                        }
                        _ => self.handle_payload(StreamKind::Stdout, &payload).await,
                    }
                }
                Err(e) => {
                    warn!(
                        container_id = %self.container.container_id,
                        "Log stream error: {}", e
                    );
                    break;
                }
            }
        }
        // The sweep re-attaches if the container is still running
        debug!(container_id = %self.container.container_id, "Log stream ended");
    }

    /// Accumulate into per-stream line buffers and emit complete lines.
    async fn handle_payload(&mut self, kind: StreamKind, payload: &[u8]) {
        let is_std_err = kind == StreamKind::Stderr;
        let text = String::from_utf8_lossy(payload);

        let tail = if is_std_err {
            &mut self.stderr_tail
        } else {
            &mut self.stdout_tail
        };
        tail.push_str(&text);

        let mut lines: Vec<String> = Vec::new();
        while let Some(newline) = tail.find('\n') {
            let line: String = tail.drain(..=newline).collect();
            lines.push(line);
        }

        for line in lines {
            let Some((level, message)) = classify(&line, is_std_err) else {
                continue;
            };
            let record = LogMessage {
                id: None,
                message,
                timestamp: Utc::now().timestamp_millis(),
                level,
                source: LogSource::Container,
                service_id: Some(service_log_id(
                    self.container.app_id,
                    self.container.service_id,
                )),
                service_name: Some(self.container.service_name.clone()),
                container_id: Some(self.container.container_id.clone()),
                is_std_err: Some(is_std_err),
                is_system: None,
            };
            self.monitor.emit(record).await;
        }
    }
}
