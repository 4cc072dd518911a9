//! Shared data model, wire frames and error type for the rover bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of the single persistent connection to the coordination server.
///
/// Owned by the connection manager; only `Identified` allows telemetry to be
/// sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The server acknowledged the handshake and assigned a rover ID.
    Identified,
}

impl ConnectionState {
    /// `true` while a socket is open (handshake pending or complete).
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Identified)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Identified => write!(f, "identified"),
        }
    }
}

/// Who this rover is: the configured identifier plus the numeric ID the
/// server hands out on every successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoverIdentity {
    pub identifier: String,
    /// Cleared on every disconnect.
    pub assigned_id: Option<i64>,
}

impl RoverIdentity {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            assigned_id: None,
        }
    }
}

/// A point in the rover's map frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Latest known value of every reported sensor.
///
/// Serialises to the `sensorData` object of a `TELEMETRY` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSnapshot {
    pub temperature: f64,
    pub speed: f64,
    pub battery_level: f64,
    pub signal_strength: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub distance_traveled: f64,
    pub trips: u64,
    /// `None` until the first position report arrives.
    pub current_position: Option<Position>,
}

impl Default for SensorSnapshot {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            speed: 0.0,
            battery_level: 100.0,
            signal_strength: 0.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            distance_traveled: 0.0,
            trips: 0,
            current_position: None,
        }
    }
}

/// Outcome of an operator command as reported back to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Failed,
}

/// Liveness status carried by `STATUS_UPDATE` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoverStatus {
    Active,
}

/// Every frame the bridge sends upstream.
///
/// The rover ID is not part of the variant; it is attached by
/// [`OutboundMessage::encode`] from the current identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundMessage {
    #[serde(rename = "CONNECT")]
    Connect {
        #[serde(rename = "type")]
        client_type: String,
        identifier: String,
    },
    #[serde(rename = "TELEMETRY")]
    Telemetry {
        #[serde(rename = "sensorData")]
        sensor_data: SensorSnapshot,
    },
    #[serde(rename = "STATUS_UPDATE")]
    StatusUpdate { status: RoverStatus },
    #[serde(rename = "COMMAND")]
    CommandResponse {
        #[serde(rename = "commandId")]
        command_id: i64,
        status: CommandStatus,
        response: String,
    },
}

impl OutboundMessage {
    /// Handshake frame announcing this process as a rover.
    pub fn connect(identifier: impl Into<String>) -> Self {
        OutboundMessage::Connect {
            client_type: "rover".to_string(),
            identifier: identifier.into(),
        }
    }

    /// Wire name of the frame, e.g. `"TELEMETRY"`.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Connect { .. } => "CONNECT",
            OutboundMessage::Telemetry { .. } => "TELEMETRY",
            OutboundMessage::StatusUpdate { .. } => "STATUS_UPDATE",
            OutboundMessage::CommandResponse { .. } => "COMMAND",
        }
    }

    /// Serialise into a JSON text frame, adding `roverId` when the rover has
    /// been identified.
    pub fn encode(&self, rover_id: Option<i64>) -> Result<String, BridgeError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| BridgeError::Serialization(e.to_string()))?;
        if let (Some(id), Some(object)) = (rover_id, value.as_object_mut()) {
            object.insert("roverId".to_string(), id.into());
        }
        serde_json::to_string(&value).map_err(|e| BridgeError::Serialization(e.to_string()))
    }
}

/// Payload of an inbound `CONNECT` acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectAck {
    #[serde(default)]
    pub success: bool,
    #[serde(rename = "roverId", default)]
    pub rover_id: Option<i64>,
}

/// Payload of an inbound `COMMAND` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "commandId")]
    pub command_id: i64,
    #[serde(rename = "command")]
    pub command_text: String,
}

/// Every frame kind the bridge understands from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Connect(ConnectAck),
    Command(CommandEnvelope),
    Error(serde_json::Value),
}

impl InboundMessage {
    /// Decode a JSON text frame.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::Decode`] – the text is not JSON, lacks a `type`, or
    ///   the payload does not match the announced type.
    /// * [`BridgeError::UnknownMessage`] – a well-formed frame of a type the
    ///   bridge does not handle.
    pub fn decode(text: &str) -> Result<Self, BridgeError> {
        #[derive(Deserialize)]
        struct RawFrame {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            payload: serde_json::Value,
        }

        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| BridgeError::Decode(e.to_string()))?;
        let decode_payload = |e: serde_json::Error| {
            BridgeError::Decode(format!("invalid {} payload: {e}", raw.kind))
        };
        match raw.kind.as_str() {
            "CONNECT" => serde_json::from_value(raw.payload.clone())
                .map(InboundMessage::Connect)
                .map_err(decode_payload),
            "COMMAND" => serde_json::from_value(raw.payload.clone())
                .map(InboundMessage::Command)
                .map_err(decode_payload),
            "ERROR" => Ok(InboundMessage::Error(raw.payload)),
            other => Err(BridgeError::UnknownMessage(other.to_string())),
        }
    }
}

/// A single message travelling over the actuator/sensor bus.
///
/// `data` holds the ROS message body as JSON (rosbridge encoding), e.g.
/// `{"data": "move north 5"}` for a `std_msgs/msg/String`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"/battery_state"`
    pub topic: String,
    /// e.g. `"sensor_msgs/msg/BatteryState"`
    pub msg_type: String,
    pub data: serde_json::Value,
}

impl BusMessage {
    pub fn new(
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            topic: topic.into(),
            msg_type: msg_type.into(),
            data,
        }
    }
}

/// Global error type spanning transport failures, malformed frames and bus
/// outages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Decode Error: {0}")]
    Decode(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Unknown message type: {0}")]
    UnknownMessage(String),

    #[error("Actuator bus is not available")]
    BusUnavailable,

    #[error("Bus Error on {topic}: {details}")]
    Bus { topic: String, details: String },
}
