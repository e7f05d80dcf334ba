//! Transport plumbing for outbound alert delivery.

mod mqtt;

pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};
