//! Log capture model: the message record every backend receives, level
//! classification of raw container output, and the backend port.

mod backend;
mod classify;
mod message;

pub use backend::LogBackend;
pub use classify::classify;
pub use message::{LogFilter, LogLevel, LogMessage, LogSource, service_log_id};
