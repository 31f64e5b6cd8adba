pub mod mqtt_client;

pub use mqtt_client::{BrokerSettings, MqttClient, MqttConnection, MqttMessage, MqttPublisherClient};
