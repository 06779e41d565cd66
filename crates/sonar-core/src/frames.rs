//! JSON frames exchanged over the `/ws` socket.
//!
//! Inbound frames carry an `action` field, outbound frames a `type` field.
//! Inbound parsing is deliberately lenient: unknown fields are ignored and
//! non-string entries in `deviceNames` are skipped.

use serde::Serialize;
use serde_json::Value;

use crate::artifact::ArtifactEvent;
use crate::device::DeviceName;
use crate::ids::ConnectionId;

/// A control frame sent by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Subscribe { device_names: Vec<String> },
    Unsubscribe { device_names: Vec<String> },
    Ping,
}

/// Why an inbound frame could not be turned into a [`ClientFrame`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON")]
    InvalidJson,
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
}

impl ClientFrame {
    /// Parse a text frame. The `action` name is matched case-insensitively.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|_| FrameError::InvalidJson)?;
        let Value::Object(map) = value else {
            return Err(FrameError::InvalidJson);
        };

        let action = map
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        match action.as_str() {
            "subscribe" => Ok(Self::Subscribe {
                device_names: string_list(map.get("deviceNames")),
            }),
            "unsubscribe" => Ok(Self::Unsubscribe {
                device_names: string_list(map.get("deviceNames")),
            }),
            "ping" => Ok(Self::Ping),
            _ => Err(FrameError::UnsupportedAction(action)),
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

/// A frame sent by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Welcome { user_id: ConnectionId, ts: String },
    #[serde(rename_all = "camelCase")]
    Subscribed { device_names: Vec<DeviceName> },
    Pong { ts: String },
    Error { message: String },
    #[serde(rename_all = "camelCase")]
    NewAudio {
        device_name: String,
        timestamp: String,
        filename: String,
        size: u64,
        url_path: String,
        latitude: String,
        longitude: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The notification pushed to subscribers of the event's device.
    pub fn new_audio(event: &ArtifactEvent) -> Self {
        Self::NewAudio {
            device_name: event.device_name.clone(),
            timestamp: event.timestamp.clone(),
            filename: event.filename.clone(),
            size: event.size,
            url_path: event.url_path.clone(),
            latitude: event.latitude.clone().unwrap_or_default(),
            longitude: event.longitude.clone().unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
