use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use infrastructure::messaging::{BrokerSettings, MqttConnection, MqttMessage};

/// What the shadow engine needs from the broker connection. Tests
/// substitute an in-memory implementation that plays the cloud side.
#[async_trait]
pub trait ShadowTransport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;

    fn messages(&self) -> broadcast::Receiver<MqttMessage>;

    /// QoS 1 publish.
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()>;

    /// Disconnect cleanly and reconnect with new endpoint/credentials,
    /// keeping subscriptions and message receivers.
    async fn migrate(&self, settings: &BrokerSettings) -> Result<()>;
}

#[async_trait]
impl ShadowTransport for MqttConnection {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        MqttConnection::subscribe(self, topic).await
    }

    fn messages(&self) -> broadcast::Receiver<MqttMessage> {
        self.subscribe_messages()
    }

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        MqttConnection::publish(self, topic, payload, retain).await
    }

    async fn migrate(&self, settings: &BrokerSettings) -> Result<()> {
        MqttConnection::migrate(self, settings).await
    }
}
