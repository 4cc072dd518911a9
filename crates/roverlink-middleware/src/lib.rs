//! `roverlink-middleware` – the rover's side of the robotics middleware.
//!
//! Everything the bridge needs from ROS 2 goes through the narrow
//! [`RobotBus`] trait, so the bridge itself never depends on a particular
//! middleware transport.
//!
//! # Modules
//!
//! - [`bus`] – the [`RobotBus`] trait, RAII [`Subscription`]s, and the
//!   in-process [`EventBus`] built on Tokio broadcast channels.
//! - [`rosbridge`] – [`RosbridgeBus`], a rosbridge v2 WebSocket client that
//!   reaches a real ROS 2 graph.
//! - [`sensor`] – the Sensor Bus Adapter that keeps a [`SharedSnapshot`] in
//!   sync with the sensor topics.

pub mod bus;
pub mod rosbridge;
pub mod sensor;

pub use bus::{BusHandler, EventBus, RobotBus, Subscription};
pub use rosbridge::RosbridgeBus;
pub use sensor::{SensorBusAdapter, SensorTopic, SharedSnapshot};
