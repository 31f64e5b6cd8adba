use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use rumqttc::{LastWill, QoS};
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use domain::device::{DeviceIdentity, DeviceRepository};
use domain::shadow::{
    ShadowAccepted, ShadowDelta, ShadowDocument, ShadowEvent, ShadowPhase, ShadowRejected,
    ShadowUpdate, merge_fields, topics,
};
use infrastructure::messaging::BrokerSettings;

use super::handlers::{MqttDeltaSection, SensorPublishConfig};
use super::transport::ShadowTransport;

#[derive(Debug, Clone)]
pub struct ShadowConfig {
    pub shadow_name: String,
    /// Acknowledge applied delta sections by reporting them back.
    pub sync_on_delta: bool,
    /// Cadence of the periodic connectivity report.
    pub publish_interval: Duration,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            shadow_name: domain::shadow::DEFAULT_SHADOW_NAME.to_string(),
            sync_on_delta: true,
            publish_interval: Duration::from_secs(60),
        }
    }
}

/// Retained device status topic (online/offline via last will).
pub fn status_topic(uuid: &str) -> String {
    format!("$iot/device/{uuid}/status")
}

/// Broker session settings for a device identity, last will included.
pub fn broker_settings(identity: &DeviceIdentity) -> BrokerSettings {
    let last_will = LastWill::new(
        status_topic(&identity.uuid),
        json!({ "status": "offline" }).to_string(),
        QoS::AtLeastOnce,
        true,
    );
    BrokerSettings {
        url: identity.mqtt_broker_url.clone(),
        username: (!identity.mqtt_username.is_empty()).then(|| identity.mqtt_username.clone()),
        password: (!identity.mqtt_password.is_empty()).then(|| identity.mqtt_password.clone()),
        client_id: format!("device-{}", identity.uuid),
        last_will: Some(last_will),
    }
}

struct PendingUpdate {
    token: String,
    /// Fields published in this update, for retry after a rejection.
    fields: Map<String, Value>,
    /// Reported snapshot before the optimistic merge, for revert.
    previous: Map<String, Value>,
}

#[derive(Default)]
struct EngineState {
    reported: Map<String, Value>,
    queued: Map<String, Value>,
    pending: Option<PendingUpdate>,
}

/// One engine instance per named shadow. Strictly sequential updates: at
/// most one in flight, queued writes coalesce last-writer-wins.
pub struct ShadowEngine {
    uuid: String,
    config: ShadowConfig,
    transport: Arc<dyn ShadowTransport>,
    devices: Arc<dyn DeviceRepository>,
    identity: tokio::sync::Mutex<DeviceIdentity>,
    phase: Mutex<ShadowPhase>,
    version: Mutex<i64>,
    state: tokio::sync::Mutex<EngineState>,
    events: broadcast::Sender<ShadowEvent>,
    sensors: Arc<RwLock<SensorPublishConfig>>,
    features: Arc<RwLock<Map<String, Value>>>,
    log_level_handler: Option<Box<dyn Fn(&str) + Send + Sync>>,
    started: Instant,
}

impl ShadowEngine {
    pub fn new(
        identity: DeviceIdentity,
        transport: Arc<dyn ShadowTransport>,
        devices: Arc<dyn DeviceRepository>,
        config: ShadowConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            uuid: identity.uuid.clone(),
            config,
            transport,
            devices,
            identity: tokio::sync::Mutex::new(identity),
            phase: Mutex::new(ShadowPhase::Disconnected),
            version: Mutex::new(0),
            state: tokio::sync::Mutex::new(EngineState::default()),
            events,
            sensors: Arc::new(RwLock::new(SensorPublishConfig::default())),
            features: Arc::new(RwLock::new(Map::new())),
            log_level_handler: None,
            started: Instant::now(),
        }
    }

    /// Install the callback the `logging` delta section drives.
    pub fn with_log_level_handler(
        mut self,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.log_level_handler = Some(Box::new(handler));
        self
    }

    pub fn events(&self) -> broadcast::Receiver<ShadowEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> ShadowPhase {
        *self.phase.lock().unwrap()
    }

    pub fn version(&self) -> i64 {
        *self.version.lock().unwrap()
    }

    pub fn sensors(&self) -> Arc<RwLock<SensorPublishConfig>> {
        self.sensors.clone()
    }

    pub fn features(&self) -> Arc<RwLock<Map<String, Value>>> {
        self.features.clone()
    }

    /// Latest reported snapshot (optimistic: includes in-flight fields).
    pub async fn reported(&self) -> Map<String, Value> {
        self.state.lock().await.reported.clone()
    }

    /// Merge fields into the queued reported-state write. Coalesces with
    /// anything not yet published, last writer wins per field.
    pub async fn queue_reported(&self, fields: Map<String, Value>) {
        let mut state = self.state.lock().await;
        merge_fields(&mut state.queued, fields);
    }

    /// Engine main loop: subscribe first, announce online, fetch the
    /// current document, then serve events until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let shadow = &self.config.shadow_name;
        let t_accepted = topics::update_accepted(&self.uuid, shadow);
        let t_rejected = topics::update_rejected(&self.uuid, shadow);
        let t_delta = topics::update_delta(&self.uuid, shadow);
        let t_get_accepted = topics::get_accepted(&self.uuid, shadow);

        // Grab the internal receiver before subscribing so retained
        // messages arriving right after SUBACK are not lost.
        let mut rx = self.transport.messages();

        self.set_phase(ShadowPhase::Connecting);
        for topic in [&t_accepted, &t_rejected, &t_delta, &t_get_accepted] {
            if let Err(e) = self.transport.subscribe(topic).await {
                warn!(topic = %topic, "Shadow subscription failed: {}", e);
            }
        }
        self.set_phase(ShadowPhase::Connected);
        info!(shadow = %shadow, "🔄 Shadow engine listening");

        // Announce presence, then ask for the current document.
        let online = json!({ "status": "online" }).to_string();
        if let Err(e) = self
            .transport
            .publish(&status_topic(&self.uuid), &online, true)
            .await
        {
            warn!("Failed to publish online status: {}", e);
        }
        let get_request = json!({ "clientToken": Uuid::new_v4().to_string() }).to_string();
        if let Err(e) = self
            .transport
            .publish(&topics::get(&self.uuid, shadow), &get_request, false)
            .await
        {
            warn!("Failed to request shadow document: {}", e);
        }

        let mut flush = tokio::time::interval(Duration::from_secs(1));
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut periodic = tokio::time::interval(self.config.publish_interval);
        periodic.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        periodic.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shadow engine shutting down");
                    let _ = self.events.send(ShadowEvent::Stopped);
                    self.set_phase(ShadowPhase::Disconnected);
                    return;
                }
                message = rx.recv() => match message {
                    Ok(message) => {
                        if message.topic == t_accepted {
                            self.on_accepted(&message.payload).await;
                        } else if message.topic == t_rejected {
                            self.on_rejected(&message.payload).await;
                        } else if message.topic == t_delta {
                            self.on_delta(&message.payload).await;
                        } else if message.topic == t_get_accepted {
                            self.on_document(&message.payload).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Shadow event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Shadow message channel closed");
                        let _ = self.events.send(ShadowEvent::Stopped);
                        return;
                    }
                },
                _ = flush.tick() => self.try_flush().await,
                _ = periodic.tick() => {
                    let mut fields = Map::new();
                    fields.insert("connectivity".into(), json!({
                        "status": "connected",
                        "uptimeSecs": self.started.elapsed().as_secs(),
                    }));
                    self.queue_reported(fields).await;
                }
            }
        }
    }

    /// Publish the coalesced queue if nothing is in flight.
    async fn try_flush(&self) {
        if !self.phase().can_update() {
            return;
        }
        let (token, fields) = {
            let mut state = self.state.lock().await;
            if state.pending.is_some() || state.queued.is_empty() {
                return;
            }
            let fields = std::mem::take(&mut state.queued);
            let token = Uuid::new_v4().to_string();
            let previous = state.reported.clone();
            merge_fields(&mut state.reported, fields.clone());
            state.pending = Some(PendingUpdate {
                token: token.clone(),
                fields: fields.clone(),
                previous,
            });
            (token, fields)
        };

        let update = ShadowUpdate::reported(fields, token);
        let topic = topics::update(&self.uuid, &self.config.shadow_name);
        let payload = match serde_json::to_string(&update) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize shadow update: {}", e);
                self.abort_pending().await;
                return;
            }
        };

        match self.transport.publish(&topic, &payload, false).await {
            Ok(()) => {
                if let Ok(next) = self.phase().to_updating() {
                    self.set_phase(next);
                }
            }
            Err(e) => {
                warn!("Shadow update publish failed: {}", e);
                self.abort_pending().await;
            }
        }
    }

    /// Undo the optimistic merge and requeue the fields for retry.
    async fn abort_pending(&self) {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.take() {
            state.reported = pending.previous;
            let mut retry = pending.fields;
            merge_fields(&mut retry, std::mem::take(&mut state.queued));
            state.queued = retry;
        }
    }

    async fn on_accepted(&self, payload: &[u8]) {
        let Ok(accepted) = serde_json::from_slice::<ShadowAccepted>(payload) else {
            warn!("Unparseable shadow accepted payload");
            return;
        };
        {
            let mut state = self.state.lock().await;
            match (&state.pending, &accepted.client_token) {
                (Some(pending), Some(token)) if &pending.token == token => {
                    state.pending = None;
                }
                _ => debug!("Accepted update without matching pending token"),
            }
        }
        *self.version.lock().unwrap() = accepted.version;
        if let Ok(next) = self.phase().to_connected() {
            self.set_phase(next);
        }
        let _ = self.events.send(ShadowEvent::Accepted(accepted));
    }

    async fn on_rejected(&self, payload: &[u8]) {
        let Ok(rejected) = serde_json::from_slice::<ShadowRejected>(payload) else {
            warn!("Unparseable shadow rejected payload");
            return;
        };
        warn!(
            code = rejected.code,
            message = %rejected.message,
            "Shadow update rejected, reverting reported state"
        );
        self.abort_pending().await;
        if let Ok(next) = self.phase().to_connected() {
            self.set_phase(next);
        }
        let _ = self.events.send(ShadowEvent::Rejected(rejected));
    }

    async fn on_delta(&self, payload: &[u8]) {
        let Ok(delta) = serde_json::from_slice::<ShadowDelta>(payload) else {
            warn!("Unparseable shadow delta payload");
            return;
        };
        *self.version.lock().unwrap() = delta.version;
        self.handle_delta(delta.state.clone()).await;
        let _ = self.events.send(ShadowEvent::Delta(delta));
    }

    async fn on_document(&self, payload: &[u8]) {
        let Ok(document) = serde_json::from_slice::<ShadowDocument>(payload) else {
            warn!("Unparseable shadow document payload");
            return;
        };
        *self.version.lock().unwrap() = document.version;
        if self.config.sync_on_delta && !document.state.delta.is_empty() {
            info!("Applying delta carried by the shadow document");
            self.handle_delta(document.state.delta.clone()).await;
        }
        let _ = self.events.send(ShadowEvent::Documents(document));
    }

    /// Dispatch delta sections to their handlers, then acknowledge the
    /// applied sections through the reported state.
    async fn handle_delta(&self, sections: Map<String, Value>) {
        if let Ok(next) = self.phase().to_delta_handling() {
            self.set_phase(next);
        }

        let mut ack = Map::new();
        for (section, value) in sections {
            match section.as_str() {
                "mqtt" => self.handle_broker_migration(&value).await,
                "sensors" => {
                    self.sensors.write().unwrap().apply(&value);
                    info!("Sensor publishing configuration updated");
                    ack.insert(section, value);
                }
                "logging" => {
                    if let Some(level) = value.get("level").and_then(Value::as_str) {
                        if let Some(handler) = &self.log_level_handler {
                            handler(level);
                            info!(level = %level, "Log level changed by shadow");
                        }
                    }
                    ack.insert(section, value);
                }
                "features" => {
                    if let Value::Object(flags) = &value {
                        let mut features = self.features.write().unwrap();
                        merge_fields(&mut features, flags.clone());
                    }
                    ack.insert(section, value);
                }
                other => warn!(section = %other, "Unhandled delta section"),
            }
        }

        if self.config.sync_on_delta && !ack.is_empty() {
            self.queue_reported(ack).await;
        }
        if let Ok(next) = self.phase().to_connected() {
            self.set_phase(next);
        }
    }

    /// The `mqtt` delta section: migrate to a new broker, acknowledging
    /// progress through `reported.mqtt`.
    async fn handle_broker_migration(&self, value: &Value) {
        let Some(section) = MqttDeltaSection::parse(value) else {
            warn!("Invalid mqtt delta section");
            self.queue_reported(mqtt_status(json!({
                "status": "error",
                "error": "invalid mqtt delta section",
            })))
            .await;
            return;
        };

        if let Ok(next) = self.phase().to_migrating() {
            self.set_phase(next);
        }
        let previous = self.identity.lock().await.clone();
        info!(
            from = %previous.mqtt_broker_url,
            to = %section.broker,
            "🔀 Starting broker migration"
        );

        // Announce before the session drops; this update is fire-and
        // -forget, anything in flight is resynthesized afterwards.
        let announce = ShadowUpdate::reported(
            mqtt_status(json!({
                "status": "migrating",
                "previousBroker": previous.mqtt_broker_url,
            })),
            Uuid::new_v4().to_string(),
        );
        if let Ok(payload) = serde_json::to_string(&announce) {
            let topic = topics::update(&self.uuid, &self.config.shadow_name);
            if let Err(e) = self.transport.publish(&topic, &payload, false).await {
                warn!("Failed to announce migration: {}", e);
            }
        }

        let migrated = previous.with_broker(
            &section.broker,
            section
                .username
                .clone()
                .unwrap_or_else(|| previous.mqtt_username.clone()),
            section
                .password
                .clone()
                .unwrap_or_else(|| previous.mqtt_password.clone()),
        );

        match self.transport.migrate(&broker_settings(&migrated)).await {
            Ok(()) => {
                info!(broker = %migrated.mqtt_broker_url, "✅ Broker migration complete");
                if let Err(e) = self.devices.save(&migrated).await {
                    error!("Failed to persist migrated credentials: {}", e);
                }
                *self.identity.lock().await = migrated.clone();

                // Resynthesize: drop the pending token and rebuild the
                // queue from the latest reported snapshot.
                {
                    let mut state = self.state.lock().await;
                    state.pending = None;
                    let mut resynthesized = state.reported.clone();
                    merge_fields(&mut resynthesized, std::mem::take(&mut state.queued));
                    state.queued = resynthesized;
                }

                let online = json!({ "status": "online" }).to_string();
                let _ = self
                    .transport
                    .publish(&status_topic(&self.uuid), &online, true)
                    .await;

                self.queue_reported(mqtt_status(json!({
                    "brokerId": migrated.mqtt_broker_url,
                    "status": "connected",
                    "migratedAt": Utc::now().timestamp_millis(),
                })))
                .await;
                if let Ok(next) = self.phase().to_connected() {
                    self.set_phase(next);
                }
            }
            Err(e) => {
                error!("Broker migration failed: {}", e);
                self.set_phase(ShadowPhase::Error);
                // Fall back to the previous broker so the error report
                // can still be delivered.
                match self.transport.migrate(&broker_settings(&previous)).await {
                    Ok(()) => {
                        self.set_phase(ShadowPhase::Connected);
                        self.queue_reported(mqtt_status(json!({
                            "status": "error",
                            "error": e.to_string(),
                        })))
                        .await;
                    }
                    Err(revert_error) => {
                        error!("Revert to previous broker failed: {}", revert_error);
                    }
                }
            }
        }
    }

    fn set_phase(&self, phase: ShadowPhase) {
        *self.phase.lock().unwrap() = phase;
    }
}

fn mqtt_status(value: Value) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("mqtt".to_string(), value);
    fields
}
