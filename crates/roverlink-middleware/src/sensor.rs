//! Sensor Bus Adapter.
//!
//! Subscribes one handler per sensor topic and folds each update into the
//! shared [`SensorSnapshot`].  Topics update independently; a field that has
//! never been reported keeps its default value.
//!
//! | Topic | ROS type | Snapshot field |
//! |---|---|---|
//! | `/temperature` | `sensor_msgs/msg/Temperature` | `temperature` |
//! | `/rover_velocity` | `geometry_msgs/msg/Twist` | `speed` (`linear.x`) |
//! | `/battery_state` | `sensor_msgs/msg/BatteryState` | `battery_level` (`percentage × 100`) |
//! | `/signal_strength` | `std_msgs/msg/Float32` | `signal_strength` |
//! | `/cpu_usage` | `std_msgs/msg/Float32MultiArray` | `cpu_usage` (`data[0]`) |
//! | `/memory_usage` | `std_msgs/msg/Float32` | `memory_usage` |
//! | `/location_on_map` | `geometry_msgs/msg/Point` | `current_position` |

use std::sync::Arc;

use parking_lot::RwLock;
use roverlink_types::{BusMessage, Position, SensorSnapshot};
use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::{RobotBus, Subscription};

/// Shared, lock-protected [`SensorSnapshot`].  Clone it cheaply – all clones
/// refer to the same snapshot.
///
/// Every read returns a consistent copy of the whole struct; a writer never
/// exposes a half-updated snapshot.
#[derive(Clone, Debug, Default)]
pub struct SharedSnapshot(Arc<RwLock<SensorSnapshot>>);

impl SharedSnapshot {
    pub fn new(initial: SensorSnapshot) -> Self {
        Self(Arc::new(RwLock::new(initial)))
    }

    /// Copy of the current snapshot.
    pub fn read(&self) -> SensorSnapshot {
        self.0.read().clone()
    }

    /// Mutate the snapshot under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut SensorSnapshot) -> R) -> R {
        f(&mut self.0.write())
    }
}

/// The sensor topics the rover publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorTopic {
    Temperature,
    Velocity,
    Battery,
    Signal,
    Cpu,
    Memory,
    Position,
}

impl SensorTopic {
    pub const ALL: [SensorTopic; 7] = [
        SensorTopic::Temperature,
        SensorTopic::Velocity,
        SensorTopic::Battery,
        SensorTopic::Signal,
        SensorTopic::Cpu,
        SensorTopic::Memory,
        SensorTopic::Position,
    ];

    pub fn topic(self) -> &'static str {
        match self {
            SensorTopic::Temperature => "/temperature",
            SensorTopic::Velocity => "/rover_velocity",
            SensorTopic::Battery => "/battery_state",
            SensorTopic::Signal => "/signal_strength",
            SensorTopic::Cpu => "/cpu_usage",
            SensorTopic::Memory => "/memory_usage",
            SensorTopic::Position => "/location_on_map",
        }
    }

    pub fn msg_type(self) -> &'static str {
        match self {
            SensorTopic::Temperature => "sensor_msgs/msg/Temperature",
            SensorTopic::Velocity => "geometry_msgs/msg/Twist",
            SensorTopic::Battery => "sensor_msgs/msg/BatteryState",
            SensorTopic::Signal | SensorTopic::Memory => "std_msgs/msg/Float32",
            SensorTopic::Cpu => "std_msgs/msg/Float32MultiArray",
            SensorTopic::Position => "geometry_msgs/msg/Point",
        }
    }

    /// Fold one message of this topic into `snapshot`.
    ///
    /// Missing or non-numeric values become `0`.  A position message without
    /// all three coordinates is ignored so an unknown position stays `None`.
    pub fn apply(self, snapshot: &mut SensorSnapshot, msg: &Value) {
        match self {
            SensorTopic::Temperature => snapshot.temperature = number(msg.get("temperature")),
            SensorTopic::Velocity => {
                snapshot.speed = number(msg.get("linear").and_then(|l| l.get("x")))
            }
            SensorTopic::Battery => {
                snapshot.battery_level = number(msg.get("percentage")) * 100.0
            }
            SensorTopic::Signal => snapshot.signal_strength = number(msg.get("data")),
            SensorTopic::Cpu => {
                snapshot.cpu_usage = number(msg.get("data").and_then(|d| d.get(0)))
            }
            SensorTopic::Memory => snapshot.memory_usage = number(msg.get("data")),
            SensorTopic::Position => {
                let coordinate = |axis: &str| msg.get(axis).and_then(Value::as_f64);
                let (Some(x), Some(y), Some(z)) =
                    (coordinate("x"), coordinate("y"), coordinate("z"))
                else {
                    debug!("position message without x/y/z ignored");
                    return;
                };
                let next = Position { x, y, z };
                if let Some(previous) = snapshot.current_position {
                    let step = previous.distance_to(&next);
                    if step.is_finite() {
                        snapshot.distance_traveled += step;
                    }
                }
                snapshot.current_position = Some(next);
            }
        }
    }
}

fn number(value: Option<&Value>) -> f64 {
    value
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite())
        .unwrap_or(0.0)
}

/// Keeps the shared snapshot in sync with the sensor topics of a
/// [`RobotBus`].
pub struct SensorBusAdapter {
    snapshot: SharedSnapshot,
}

impl SensorBusAdapter {
    pub fn new(snapshot: SharedSnapshot) -> Self {
        Self { snapshot }
    }

    /// Subscribe to every [`SensorTopic`].
    ///
    /// A topic that cannot be subscribed is logged and skipped; the others
    /// still attach.  The handlers stay active as long as the returned
    /// subscriptions are alive.
    pub fn attach(&self, bus: &dyn RobotBus) -> Vec<Subscription> {
        SensorTopic::ALL
            .iter()
            .filter_map(|&sensor| {
                let snapshot = self.snapshot.clone();
                let handler = Arc::new(move |message: &BusMessage| {
                    snapshot.update(|s| sensor.apply(s, &message.data));
                });
                match bus.subscribe(sensor.topic(), sensor.msg_type(), handler) {
                    Ok(subscription) => Some(subscription),
                    Err(e) => {
                        warn!(topic = sensor.topic(), error = %e, "sensor subscription failed");
                        None
                    }
                }
            })
            .collect()
    }
}
