//! Detection event delivery.
//!
//! The pipeline hands each event to an [`EventPublisher`] exactly once. Delivery
//! is best-effort: a failed publish is logged by the caller and never retried.

mod mqtt;
mod tls;

pub use mqtt::{MqttPublisher, MqttSettings};
pub use tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};

use anyhow::Result;
use serde::Serialize;

use crate::pipeline::DetectionEvent;

pub const EVENT_TYPE: &str = "motion_face_detection";
pub const DEFAULT_LOCATION: &str = "rtsp_camera";

pub trait EventPublisher: Send + Sync {
    fn name(&self) -> &'static str;

    fn publish(&self, event: &DetectionEvent) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    High,
    Medium,
}

/// Message-bus payload for one detection event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionPayload {
    pub event_type: &'static str,
    pub timestamp: String,
    pub location: String,
    pub person_detected: bool,
    pub confidence: f32,
    pub alert_level: AlertLevel,
    pub message: String,
}

impl DetectionPayload {
    pub fn from_event(event: &DetectionEvent, location: &str) -> Self {
        let unknown = event.results.iter().filter(|r| !r.is_known).count();
        let alert_level = if unknown > 0 {
            AlertLevel::High
        } else {
            AlertLevel::Medium
        };
        Self {
            event_type: EVENT_TYPE,
            timestamp: event.timestamp.to_rfc3339(),
            location: location.to_string(),
            person_detected: event.person_detected(),
            confidence: event.max_confidence(),
            alert_level,
            message: summarize(event, unknown),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn summarize(event: &DetectionEvent, unknown: usize) -> String {
    if event.results.is_empty() {
        return "motion detected, no face found".to_string();
    }
    let known: Vec<String> = event
        .results
        .iter()
        .filter(|r| r.is_known)
        .map(|r| format!("{} ({:.2})", r.name, r.confidence))
        .collect();
    match (known.is_empty(), unknown) {
        (false, 0) => format!("known: {}", known.join(", ")),
        (true, n) => format!("{} unknown face(s) detected", n),
        (false, n) => format!("known: {}; {} unknown face(s)", known.join(", "), n),
    }
}

/// Writes events to the log instead of a broker.
#[derive(Clone, Debug)]
pub struct LogPublisher {
    location: String,
}

impl LogPublisher {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

impl Default for LogPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_LOCATION)
    }
}

impl EventPublisher for LogPublisher {
    fn name(&self) -> &'static str {
        "log"
    }

    fn publish(&self, event: &DetectionEvent) -> Result<()> {
        let payload = DetectionPayload::from_event(event, &self.location);
        log::info!("detection event: {}", serde_json::to_string(&payload)?);
        Ok(())
    }
}
