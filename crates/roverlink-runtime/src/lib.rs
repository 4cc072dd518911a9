//! `roverlink-runtime` – the rover-side bridge.
//!
//! # Modules
//!
//! - [`bridge`] – [`RoverBridge`] and its [`BridgeHandle`]: builds the
//!   components below, spawns the connection manager and runs the shutdown
//!   sequence.
//! - [`connection`] – [`ConnectionManager`]: the socket, the
//!   `Disconnected → Connecting → Connected → Identified` state machine, the
//!   fixed-interval reconnect timer and the telemetry timer.
//! - [`router`] – [`MessageRouter`]: decodes inbound frames and dispatches
//!   them by `type`.
//! - [`executor`] – [`CommandExecutor`]: parses operator commands,
//!   publishes them on the actuator bus and deduplicates by command ID.
//! - [`telemetry`] – [`TelemetryPublisher`]: snapshot to `TELEMETRY` +
//!   `STATUS_UPDATE` on every tick while identified.
//! - [`transport`] – the [`Connector`] seam and its WebSocket implementation.
//! - [`observability`] – [`init_tracing`]: `tracing` subscriber with an
//!   optional OTLP span exporter.

pub mod bridge;
pub mod connection;
pub mod executor;
pub mod observability;
pub mod router;
pub mod telemetry;
pub mod transport;

pub use bridge::{BridgeConfig, BridgeHandle, RoverBridge};
pub use connection::ConnectionManager;
pub use executor::{CommandError, CommandExecutor, CommandOutcome};
pub use observability::{TracerProviderGuard, init_tracing};
pub use router::{MessageRouter, RouteAction};
pub use telemetry::TelemetryPublisher;
pub use transport::{Connector, FrameSink, FrameStream, WsConnector};
