//! Application layer - Use cases and long-running loops

pub mod binder;
pub mod monitor;
pub mod reconciler;
pub mod shadow;

pub use binder::ApiBinder;
pub use monitor::LogMonitor;
pub use reconciler::ContainerManager;
pub use shadow::ShadowEngine;
