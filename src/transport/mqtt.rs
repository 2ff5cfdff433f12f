use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use super::tls::{parse_mqtt_endpoint, TlsMaterials};
use super::{DetectionPayload, EventPublisher, DEFAULT_LOCATION};
use crate::pipeline::DetectionEvent;

const REQUEST_CAPACITY: usize = 10;
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct MqttSettings {
    /// `[mqtt|mqtts]://host[:port]`
    pub broker: String,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub location: String,
    pub tls_ca: Option<PathBuf>,
    pub tls_client_cert: Option<PathBuf>,
    pub tls_client_key: Option<PathBuf>,
    pub keep_alive: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker: "mqtt://127.0.0.1:1883".to_string(),
            topic: "facewatch/detections".to_string(),
            client_id: "facewatch".to_string(),
            username: None,
            password: None,
            location: DEFAULT_LOCATION.to_string(),
            tls_ca: None,
            tls_client_cert: None,
            tls_client_key: None,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Publishes detection payloads to an MQTT v5 broker with QoS 1.
///
/// The event loop runs on its own thread and keeps reconnecting until the
/// publisher is shut down. `publish` never blocks: when the request queue is full
/// the event is rejected.
pub struct MqttPublisher {
    client: Client,
    topic: String,
    location: String,
    running: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker)?;
        let tls = TlsMaterials::load(
            settings.tls_ca.as_deref(),
            settings.tls_client_cert.as_deref(),
            settings.tls_client_key.as_deref(),
        )?;

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        options.set_transport(tls.build_transport(&endpoint)?);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_event_loop(connection, running.clone())?;
        log::info!(
            "MQTT publisher for {}:{} (TLS: {}, auth: {}, topic: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some(),
            settings.topic
        );
        Ok(Self {
            client,
            topic: settings.topic.clone(),
            location: settings.location.clone(),
            running,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    /// Disconnect and stop the event loop thread.
    pub fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.client.disconnect();
        if let Some(handle) = self
            .connection_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if handle.join().is_err() {
                log::error!("MQTT event loop panicked");
            }
        }
        result.map_err(|err| anyhow!("MQTT disconnect: {}", err))
    }
}

fn spawn_event_loop(mut connection: Connection, running: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("facewatch-mqtt".into())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!("MQTT connection error: {}", e);
                        std::thread::sleep(RECONNECT_PAUSE);
                    }
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
        })
        .context("spawn MQTT event loop")
}

impl EventPublisher for MqttPublisher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn publish(&self, event: &DetectionEvent) -> Result<()> {
        let payload = DetectionPayload::from_event(event, &self.location).to_json()?;
        self.client
            .try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .map_err(|err| anyhow!("MQTT publish to '{}': {}", self.topic, err))
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::debug!("{:#}", err);
        }
    }
}
