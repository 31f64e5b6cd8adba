use async_trait::async_trait;

use super::LogMessage;

/// A log sink. Emission is fire-and-forget: implementations handle their
/// own failures (drop, buffer-retry or rotate) and never propagate them
/// to the capture path.
#[async_trait]
pub trait LogBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn log(&self, message: LogMessage);

    async fn log_batch(&self, messages: Vec<LogMessage>) {
        for message in messages {
            self.log(message).await;
        }
    }
}
