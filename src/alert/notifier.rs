//! Out-of-band alert delivery.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::MqttSettings;
use crate::evidence::FallEvent;
use crate::transport::{parse_mqtt_endpoint, TlsMaterials};

pub const ALERT_SUBJECT: &str = "Fall Alert";

/// How long a publish may wait for the broker's PUBACK.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const LINK_EVENT_DEPTH: usize = 16;

/// A rendered alert, ready for any transport.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
    pub event: FallEvent,
}

impl AlertMessage {
    pub fn from_event(event: &FallEvent) -> Self {
        let body = format!(
            "FALL DETECTED!\n\n\
             Time: {}\n\
             Source IP: {}\n\
             Location: {}\n\
             Confidence: {:.3}\n\
             Saved Image: {}\n",
            event.timestamp, event.source, event.location, event.confidence, event.image_path
        );
        Self {
            subject: ALERT_SUBJECT.to_string(),
            body,
            event: event.clone(),
        }
    }

    pub fn json_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize alert payload")
    }
}

/// Delivers alerts. Implementations may block; they always run off the stream path.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn notify(&self, message: &AlertMessage) -> Result<()>;
}

/// Writes alerts to the log. Used when no transport is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, message: &AlertMessage) -> Result<()> {
        log::warn!(
            "{}: {} from {} at {} (confidence {:.3}, image {})",
            message.subject,
            message.event.timestamp,
            message.event.source,
            message.event.location,
            message.event.confidence,
            message.event.image_path
        );
        Ok(())
    }
}

/// What the connection thread saw on the broker link.
#[derive(Debug)]
enum LinkEvent {
    Acked,
    Failed(String),
}

/// Publishes alerts as JSON (QoS 1) to an MQTT topic.
///
/// An alert counts as delivered only once the broker acknowledges it; a
/// connection error or a missing PUBACK within the delivery timeout fails it.
pub struct MqttNotifier {
    client: Client,
    topic: String,
    closing: Arc<AtomicBool>,
    /// Held for the whole publish-and-wait, so acknowledgements are not shared
    /// between concurrent deliveries.
    link: Mutex<Receiver<LinkEvent>>,
    delivery_timeout: Duration,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttNotifier {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker, settings.use_tls)?;
        let tls = TlsMaterials::load(settings.ca_path.as_deref())?;

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        options.set_transport(endpoint.build_transport(&tls)?);

        let (client, connection) = Client::new(options, 10);
        let closing = Arc::new(AtomicBool::new(false));
        let (link_tx, link_rx) = bounded(LINK_EVENT_DEPTH);
        let handle = spawn_connection_loop(connection, Arc::clone(&closing), link_tx);
        log::info!(
            "MQTT notifier ready: {}:{} topic {} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            settings.topic,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            topic: settings.topic.clone(),
            closing,
            link: Mutex::new(link_rx),
            delivery_timeout: DELIVERY_TIMEOUT,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn disconnect(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        let handle = self
            .connection_handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

// rumqttc reconnects on the next poll after an error, so only a requested
// disconnect ends the loop.
fn spawn_connection_loop(
    mut connection: Connection,
    closing: Arc<AtomicBool>,
    link: Sender<LinkEvent>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Incoming::PubAck(_))) => {
                    let _ = link.try_send(LinkEvent::Acked);
                }
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(_) if closing.load(Ordering::SeqCst) => break,
                Err(e) => {
                    log::warn!("MQTT connection error: {}", e);
                    let _ = link.try_send(LinkEvent::Failed(e.to_string()));
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    })
}

impl Notifier for MqttNotifier {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn notify(&self, message: &AlertMessage) -> Result<()> {
        let payload = message.json_payload()?;
        let link = self
            .link
            .lock()
            .map_err(|_| anyhow!("MQTT delivery lock poisoned"))?;
        // Drop what happened on the link before this publish.
        while link.try_recv().is_ok() {}

        self.client
            .try_publish(self.topic.clone(), QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("publish alert to {}", self.topic))?;
        match link.recv_timeout(self.delivery_timeout) {
            Ok(LinkEvent::Acked) => Ok(()),
            Ok(LinkEvent::Failed(err)) => Err(anyhow!(
                "alert to {} not delivered: broker connection failed: {}",
                self.topic,
                err
            )),
            Err(RecvTimeoutError::Timeout) => Err(anyhow!(
                "alert to {} not acknowledged within {}s",
                self.topic,
                self.delivery_timeout.as_secs()
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("MQTT connection closed before delivery"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> FallEvent {
        FallEvent {
            timestamp: "2024-05-01 10:00:00".into(),
            source: "192.168.1.20".into(),
            location: "Unknown".into(),
            confidence: 0.87,
            image_path: "static/falls/FALL_2024-05-01_10-00-00_0.jpg".into(),
        }
    }

    #[test]
    fn message_lists_event_fields() {
        let message = AlertMessage::from_event(&event());
        assert_eq!(message.subject, "Fall Alert");
        assert!(message.body.starts_with("FALL DETECTED!"));
        assert!(message.body.contains("Source IP: 192.168.1.20"));
        assert!(message.body.contains("Confidence: 0.870"));
        assert!(message
            .body
            .contains("Saved Image: static/falls/FALL_2024-05-01_10-00-00_0.jpg"));
    }

    #[test]
    fn json_payload_carries_event() -> Result<()> {
        let payload = AlertMessage::from_event(&event()).json_payload()?;
        let value: serde_json::Value = serde_json::from_slice(&payload)?;
        assert_eq!(value["subject"], "Fall Alert");
        assert_eq!(value["event"]["ip"], "192.168.1.20");
        Ok(())
    }

    #[test]
    fn log_notifier_always_succeeds() -> Result<()> {
        LogNotifier.notify(&AlertMessage::from_event(&event()))
    }

    #[test]
    fn unreachable_broker_fails_delivery() -> Result<()> {
        let settings = MqttSettings {
            broker: "127.0.0.1:1".into(),
            topic: "fallwatch/alerts".into(),
            client_id: "fallwatch-test".into(),
            username: None,
            password: None,
            use_tls: false,
            ca_path: None,
        };
        let notifier = Arc::new(
            MqttNotifier::connect(&settings)?.with_delivery_timeout(Duration::from_secs(3)),
        );
        let dispatcher = crate::alert::AlertDispatcher::new(notifier.clone(), Duration::ZERO);

        let started = std::time::Instant::now();
        assert_eq!(
            dispatcher.dispatch_blocking(&event()),
            crate::alert::DispatchOutcome::Failed
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(dispatcher.stats().failed, 1);
        assert_eq!(dispatcher.stats().sent, 0);
        let _ = notifier.disconnect();
        Ok(())
    }
}
