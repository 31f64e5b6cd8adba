use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use domain::log::{LogBackend, LogMessage};

use crate::messaging::MqttPublisherClient;

#[derive(Debug, Clone)]
pub struct MqttLogConfig {
    pub qos: QoS,
    /// Flush accumulated logs at least this often.
    pub batch_interval: Duration,
    /// Flush when this many logs have accumulated.
    pub batch_size: usize,
}

impl Default for MqttLogConfig {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            batch_interval: Duration::from_secs(1),
            batch_size: 50,
        }
    }
}

/// Topic for one log record:
/// `container-manager/logs/{appId}/{serviceName}/{level}`. Agent-internal
/// records (no service) publish under app id 0 and `system`.
pub fn log_topic(message: &LogMessage) -> String {
    let app_id = message.service_id.map(|id| id / 1000).unwrap_or(0);
    let service = message.service_name.as_deref().unwrap_or("system");
    format!(
        "container-manager/logs/{}/{}/{}",
        app_id,
        service,
        message.level.as_str()
    )
}

/// Publishes logs to hierarchical MQTT topics. When the connection is
/// down logs are dropped silently; durability is the local backend's job.
pub struct MqttLogBackend {
    tx: mpsc::Sender<LogMessage>,
}

impl MqttLogBackend {
    pub fn new(client: Arc<dyn MqttPublisherClient>, config: MqttLogConfig) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(batch_loop(client, config, rx));
        Self { tx }
    }
}

#[async_trait]
impl LogBackend for MqttLogBackend {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn log(&self, message: LogMessage) {
        // Fire-and-forget: a full queue drops, it never blocks capture
        if self.tx.try_send(message).is_err() {
            debug!("MQTT log queue full, dropping record");
        }
    }
}

async fn batch_loop(
    client: Arc<dyn MqttPublisherClient>,
    config: MqttLogConfig,
    mut rx: mpsc::Receiver<LogMessage>,
) {
    let mut pending: Vec<LogMessage> = Vec::new();
    let mut interval = tokio::time::interval(config.batch_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(message) => {
                        pending.push(message);
                        if pending.len() >= config.batch_size {
                            flush(&client, config.qos, &mut pending).await;
                        }
                    }
                    None => {
                        flush(&client, config.qos, &mut pending).await;
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush(&client, config.qos, &mut pending).await;
            }
        }
    }
}

async fn flush(client: &Arc<dyn MqttPublisherClient>, qos: QoS, pending: &mut Vec<LogMessage>) {
    if pending.is_empty() {
        return;
    }
    if !client.is_connected().await {
        // Drop silently; the local backend keeps the history
        pending.clear();
        return;
    }

    let mut by_topic: BTreeMap<String, Vec<LogMessage>> = BTreeMap::new();
    for message in pending.drain(..) {
        by_topic.entry(log_topic(&message)).or_default().push(message);
    }

    for (topic, group) in by_topic {
        let (topic, payload) = if group.len() == 1 {
            (topic, serde_json::to_vec(&group[0]))
        } else {
            (format!("{topic}/batch"), serde_json::to_vec(&group))
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize log batch: {}", e);
                continue;
            }
        };
        if let Err(e) = client.publish_bytes(&topic, &payload, qos, false).await {
            debug!(topic = %topic, "Dropping log batch: {}", e);
        }
    }
}
