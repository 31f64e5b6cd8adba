//! Port to the local container runtime. The adapter in the infrastructure
//! layer translates these calls into Docker API requests and extracts a
//! normalized view of managed containers and networks.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

use crate::state::ServiceConfig;

#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Transient runtime error: {0}")]
    Transient(String),

    #[error("Container runtime unreachable: {0}")]
    Unreachable(String),

    #[error("Runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    /// Transient failures are retried on the next reconciliation cycle
    /// without marking the service degraded.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unreachable(_))
    }
}

/// A platform-managed container, as extracted from the runtime. Ownership
/// and identity come from the labels the agent applies at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub container_id: String,
    pub app_id: i64,
    pub app_name: String,
    pub service_id: i64,
    pub service_name: String,
    /// Lowercased runtime status (`running`, `exited`, ...).
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// Normalized configuration extracted from the inspect response.
    pub config: ServiceConfig,
}

/// A platform-managed network. `name` is the bare name; the runtime-side
/// name is `"{app_id}_{name}"`.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedNetwork {
    pub id: String,
    pub app_id: i64,
    pub name: String,
}

/// Everything the adapter needs to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub app_id: i64,
    pub app_name: String,
    pub service_id: i64,
    pub service_name: String,
    pub config: ServiceConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One chunk of container stdio. Runtimes that type their frames deliver
/// `Typed`; raw multiplexed transports deliver `Raw`, which the log
/// monitor pushes through the frame decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum LogChunk {
    Typed { kind: StreamKind, payload: Bytes },
    Raw(Bytes),
}

pub type LogStream = BoxStream<'static, Result<LogChunk, RuntimeError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Liveness check against the runtime socket.
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn list_containers(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;

    /// Create a container for the spec and return its id. The adapter
    /// applies ownership labels and joins the configured networks.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, container_id: &str, timeout_secs: i64)
    -> Result<(), RuntimeError>;

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn restart_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;

    async fn list_networks(&self) -> Result<Vec<ManagedNetwork>, RuntimeError>;

    async fn create_network(&self, app_id: i64, name: &str) -> Result<String, RuntimeError>;

    async fn remove_network(&self, app_id: i64, name: &str) -> Result<(), RuntimeError>;

    /// Follow a container's stdio from now on.
    fn attach_log_stream(&self, container_id: &str) -> LogStream;
}

/// Runtime name of a managed network.
pub fn network_runtime_name(app_id: i64, name: &str) -> String {
    format!("{app_id}_{name}")
}
