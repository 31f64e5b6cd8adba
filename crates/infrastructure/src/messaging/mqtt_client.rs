use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use anyhow::{Result, anyhow};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, Transport};
use tokio::sync::broadcast;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

const KEEP_ALIVE: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait::async_trait]
pub trait MqttPublisherClient: Send + Sync {
    async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()>;

    async fn is_connected(&self) -> bool;
}

/// Broker endpoint and credentials, as provisioned or as delivered by a
/// shadow `mqtt` delta.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// `mqtt://host:1883` or `mqtts://host:8883`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub last_will: Option<LastWill>,
}

impl BrokerSettings {
    fn to_mqtt_options(&self) -> Result<MqttOptions> {
        let url = Url::parse(&self.url)
            .map_err(|e| anyhow!("Invalid broker url '{}': {}", self.url, e))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("Broker url '{}' has no host", self.url))?;
        let secure = matches!(url.scheme(), "mqtts" | "ssl");
        let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

        let mut options = MqttOptions::new(&self.client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(false); // Persistent session for shadow deltas
        if secure {
            options.set_transport(Transport::tls_with_default_config());
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        if let Some(will) = &self.last_will {
            options.set_last_will(will.clone());
        }
        Ok(options)
    }
}

/// One broker session: rumqttc client plus its event-loop task. Inbound
/// publishes fan out over the shared broadcast sender so consumers keep
/// their receivers across broker migrations.
pub struct MqttClient {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl MqttClient {
    pub async fn connect(
        settings: &BrokerSettings,
        tx: broadcast::Sender<MqttMessage>,
        subscriptions: Arc<std::sync::RwLock<Vec<String>>>,
    ) -> Result<Self> {
        let options = settings.to_mqtt_options()?;
        let (client, mut eventloop) = AsyncClient::new(options, 100);

        let connected = Arc::new(AtomicBool::new(false));
        let connected_clone = connected.clone();
        let client_clone = client.clone();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        // Spawn a task to handle the event loop
        task::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        connected_clone.store(false, Ordering::Relaxed);
                        break;
                    }
                    notification = eventloop.poll() => match notification {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let msg = MqttMessage {
                                topic: publish.topic,
                                payload: publish.payload.to_vec(),
                            };
                            // Send errors just mean nobody is listening yet
                            let _ = tx.send(msg);
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("MQTT connected");
                            connected_clone.store(true, Ordering::Relaxed);

                            // Re-subscribe to all topics
                            let subs = subscriptions.read().unwrap().clone();
                            for topic in subs {
                                if let Err(e) =
                                    client_clone.subscribe(&topic, QoS::AtLeastOnce).await
                                {
                                    error!("Failed to re-subscribe to {}: {}", topic, e);
                                }
                            }
                        }
                        Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                            connected_clone.store(false, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {:?}", e);
                            connected_clone.store(false, Ordering::Relaxed);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        let this = Self {
            client,
            connected,
            cancel,
        };
        this.wait_connected(CONNECT_TIMEOUT).await?;
        Ok(this)
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                self.cancel.cancel();
                return Err(anyhow!("MQTT connect timed out after {:?}", timeout));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| anyhow!("Failed to publish MQTT message: {}", e))
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| anyhow!("Failed to subscribe to topic {}: {}", topic, e))
    }

    /// Clean disconnect: send DISCONNECT, then stop the event-loop task.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("MQTT disconnect failed: {}", e);
        }
        self.cancel.cancel();
        self.connected.store(false, Ordering::Relaxed);
    }
}

/// Broker connection shared by the shadow engine and the MQTT log
/// backend. Holds the subscription list and the broadcast fan-out so a
/// broker migration swaps the session underneath without consumers
/// losing their receivers.
pub struct MqttConnection {
    tx: broadcast::Sender<MqttMessage>,
    subscriptions: Arc<std::sync::RwLock<Vec<String>>>,
    inner: tokio::sync::RwLock<MqttClient>,
}

impl MqttConnection {
    pub async fn connect(settings: &BrokerSettings) -> Result<Arc<Self>> {
        let (tx, _) = broadcast::channel(250);
        let subscriptions = Arc::new(std::sync::RwLock::new(Vec::new()));
        let client = MqttClient::connect(settings, tx.clone(), subscriptions.clone()).await?;
        Ok(Arc::new(Self {
            tx,
            subscriptions,
            inner: tokio::sync::RwLock::new(client),
        }))
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MqttMessage> {
        self.tx.subscribe()
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        {
            let mut subs = self.subscriptions.write().unwrap();
            if !subs.contains(&topic.to_string()) {
                subs.push(topic.to_string());
            }
        }
        self.inner.read().await.subscribe(topic).await
    }

    pub async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        self.inner
            .read()
            .await
            .publish_bytes(topic, payload.as_bytes(), QoS::AtLeastOnce, retain)
            .await
    }

    /// Broker migration: disconnect cleanly, connect with the new
    /// endpoint and credentials, keep subscriptions and consumers.
    pub async fn migrate(&self, settings: &BrokerSettings) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.disconnect().await;
        let client =
            MqttClient::connect(settings, self.tx.clone(), self.subscriptions.clone()).await?;
        // Fresh session: subscriptions must be re-issued, not just replayed
        // on ConnAck, because the ConnAck may already have been processed.
        let subs = self.subscriptions.read().unwrap().clone();
        for topic in &subs {
            client.subscribe(topic).await?;
        }
        *guard = client;
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.inner.read().await.disconnect().await;
    }
}

#[async_trait::async_trait]
impl MqttPublisherClient for MqttConnection {
    async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.inner
            .read()
            .await
            .publish_bytes(topic, payload, qos, retain)
            .await
    }

    async fn is_connected(&self) -> bool {
        self.inner.read().await.is_connected()
    }
}
