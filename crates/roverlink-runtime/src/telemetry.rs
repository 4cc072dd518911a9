//! [`TelemetryPublisher`] – turns the sensor snapshot into upstream frames.
//!
//! On every telemetry tick the connection manager asks the publisher for the
//! frames to send.  While the rover is identified that is one `TELEMETRY`
//! frame carrying a copy of the snapshot, followed by one `STATUS_UPDATE`
//! marking the rover active.  In any other state the tick is skipped.

use roverlink_middleware::SharedSnapshot;
use roverlink_types::{ConnectionState, OutboundMessage, RoverStatus};
use tracing::debug;

pub struct TelemetryPublisher {
    snapshot: SharedSnapshot,
}

impl TelemetryPublisher {
    pub fn new(snapshot: SharedSnapshot) -> Self {
        Self { snapshot }
    }

    /// Frames to send for one tick, in wire order.  Empty unless `state` is
    /// [`ConnectionState::Identified`].
    pub fn tick(&self, state: ConnectionState) -> Vec<OutboundMessage> {
        if state != ConnectionState::Identified {
            debug!(state = %state, "skipping telemetry tick: rover not identified");
            return Vec::new();
        }
        vec![
            OutboundMessage::Telemetry {
                sensor_data: self.snapshot.read(),
            },
            OutboundMessage::StatusUpdate {
                status: RoverStatus::Active,
            },
        ]
    }
}
