//! Domain layer - Pure business logic with no external dependencies
//!
//! This crate contains:
//! - Entities (TargetState, CurrentState, DeviceIdentity, LogMessage)
//! - Value Objects (Step, ShadowPhase, LogLevel)
//! - Ports (ContainerRuntime, CloudApi, LogBackend, repositories)
//!
//! Principles:
//! - No dependencies on infrastructure
//! - Normalization and diffing rules enforced at domain level
//! - Testable in isolation

pub mod cloud;
pub mod device;
pub mod error;
pub mod log;
pub mod plan;
pub mod runtime;
pub mod shadow;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use error::DomainError;
pub use plan::Step;
pub use state::{App, CurrentState, Service, ServiceConfig, TargetState};
