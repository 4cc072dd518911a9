//! [`RoverBridge`] – wires the components together and owns their lifecycle.
//!
//! ```text
//!  RobotBus ──▶ SensorBusAdapter ──▶ SharedSnapshot ──▶ TelemetryPublisher ─┐
//!     ▲                                                                      ▼
//!     └──── CommandExecutor ◀── MessageRouter ◀──────────── ConnectionManager ◀──▶ server
//! ```
//!
//! [`RoverBridge::start`] spawns the connection manager on the current Tokio
//! runtime and returns a [`BridgeHandle`].  [`BridgeHandle::stop`] runs the
//! shutdown sequence: timers, then the server socket, then the sensor bus.

use std::sync::Arc;
use std::time::Duration;

use roverlink_middleware::{RobotBus, SensorBusAdapter, SharedSnapshot};
use roverlink_types::{ConnectionState, SensorSnapshot};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::executor::CommandExecutor;
use crate::router::MessageRouter;
use crate::telemetry::TelemetryPublisher;
use crate::transport::Connector;

/// Default server endpoint.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:5000/ws";
/// Default rover identifier sent in the `CONNECT` handshake.
pub const DEFAULT_ROVER_IDENTIFIER: &str = "R_002";
/// Bus topic actuator commands are published on.
pub const DEFAULT_COMMAND_TOPIC: &str = "rover_commands";

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub server_url: String,
    pub rover_identifier: String,
    /// Fixed delay between reconnection attempts.  No backoff.
    pub reconnect_interval: Duration,
    /// Telemetry cadence while identified.
    pub telemetry_interval: Duration,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    pub command_topic: String,
}

impl BridgeConfig {
    pub fn new(server_url: impl Into<String>, rover_identifier: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            rover_identifier: rover_identifier.into(),
            ..Self::default()
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            rover_identifier: DEFAULT_ROVER_IDENTIFIER.to_string(),
            reconnect_interval: Duration::from_secs(5),
            telemetry_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            command_topic: DEFAULT_COMMAND_TOPIC.to_string(),
        }
    }
}

/// The rover-side bridge before it is started.
pub struct RoverBridge {
    config: BridgeConfig,
    connector: Arc<dyn Connector>,
    bus: Option<Arc<dyn RobotBus>>,
    snapshot: SharedSnapshot,
}

impl RoverBridge {
    /// `bus` is `None` when no robotics middleware is reachable.  The bridge
    /// still connects and reports telemetry; commands fail.
    pub fn new(
        config: BridgeConfig,
        connector: Arc<dyn Connector>,
        bus: Option<Arc<dyn RobotBus>>,
    ) -> Self {
        Self {
            config,
            connector,
            bus,
            snapshot: SharedSnapshot::new(SensorSnapshot::default()),
        }
    }

    /// Shared sensor snapshot.  Persists across reconnects.
    pub fn snapshot(&self) -> SharedSnapshot {
        self.snapshot.clone()
    }

    /// Attach the sensor adapter and spawn the connection manager.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> BridgeHandle {
        let RoverBridge {
            config,
            connector,
            bus,
            snapshot,
        } = self;

        let subscriptions = match &bus {
            Some(bus) => SensorBusAdapter::new(snapshot.clone()).attach(bus.as_ref()),
            None => {
                warn!("no actuator/sensor bus: telemetry reports defaults, commands will fail");
                Vec::new()
            }
        };

        let executor = CommandExecutor::new(bus.clone(), config.command_topic.clone());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = ConnectionManager::new(
            &config,
            connector,
            MessageRouter::new(executor),
            TelemetryPublisher::new(snapshot.clone()),
            state_tx,
        );

        info!(
            url = %config.server_url,
            identifier = %config.rover_identifier,
            sensor_topics = subscriptions.len(),
            "starting rover bridge"
        );

        let task = tokio::spawn(async move {
            manager.run(shutdown_rx).await;
            drop(subscriptions);
            if let Some(bus) = bus {
                if let Err(e) = bus.shutdown() {
                    warn!(error = %e, "sensor bus shutdown failed");
                }
            }
            info!("rover bridge stopped");
        });

        BridgeHandle {
            state: state_rx,
            shutdown: shutdown_tx,
            snapshot,
            task,
        }
    }
}

/// Handle to a running [`RoverBridge`].
///
/// Dropping the handle without calling [`stop`](Self::stop) also shuts the
/// bridge down, without waiting for it.
pub struct BridgeHandle {
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    snapshot: SharedSnapshot,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for awaiting state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> SharedSnapshot {
        self.snapshot.clone()
    }

    /// Stop the bridge and wait for the shutdown sequence to finish.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "bridge task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnector, MockSession};
    use roverlink_middleware::EventBus;
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    struct Harness {
        handle: BridgeHandle,
        sessions: mpsc::UnboundedReceiver<MockSession>,
        attempts: Arc<std::sync::atomic::AtomicUsize>,
        refuse: Arc<std::sync::atomic::AtomicBool>,
        bus: Arc<EventBus>,
    }

    fn start(refuse_first: bool) -> Harness {
        let (connector, sessions) = MockConnector::new();
        let attempts = connector.attempts();
        let refuse = connector.refuse();
        refuse.store(refuse_first, Ordering::SeqCst);
        let bus = Arc::new(EventBus::default());
        let bridge = RoverBridge::new(
            BridgeConfig::new("ws://test/ws", "R_002"),
            Arc::new(connector),
            Some(bus.clone() as Arc<dyn RobotBus>),
        );
        Harness {
            handle: bridge.start(),
            sessions,
            attempts,
            refuse,
            bus,
        }
    }

    async fn wait_for_state(handle: &BridgeHandle, wanted: ConnectionState) {
        let mut rx = handle.subscribe_state();
        rx.wait_for(|s| *s == wanted).await.unwrap();
    }

    /// Accept the next session, consume its CONNECT and acknowledge it.
    async fn identified_session(h: &mut Harness, rover_id: i64) -> MockSession {
        let mut session = h.sessions.recv().await.unwrap();
        let hello = session.recv_json().await.unwrap();
        assert_eq!(hello["type"], "CONNECT");
        session.ack(rover_id);
        wait_for_state(&h.handle, ConnectionState::Identified).await;
        session
    }

    fn command(id: i64, text: &str) -> String {
        serde_json::json!({"type": "COMMAND", "payload": {"command": text, "commandId": id}})
            .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn identified_rover_tags_every_message() {
        let mut h = start(false);
        let mut session = identified_session(&mut h, 42).await;

        session.send(command(1, "move north 5"));
        let response = session.recv_json().await.unwrap();
        assert_eq!(response["type"], "COMMAND");
        assert_eq!(response["roverId"], 42);
        assert_eq!(response["payload"]["commandId"], 1);
        assert_eq!(response["payload"]["status"], "success");
        assert_eq!(response["payload"]["response"], "Moving north 5 units");

        let telemetry = session.recv_json().await.unwrap();
        assert_eq!(telemetry["type"], "TELEMETRY");
        assert_eq!(telemetry["roverId"], 42);
        let status = session.recv_json().await.unwrap();
        assert_eq!(status["type"], "STATUS_UPDATE");
        assert_eq!(status["roverId"], 42);

        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_tick_reports_snapshot_then_status() {
        let mut h = start(false);
        h.handle.snapshot().update(|s| {
            s.temperature = 22.5;
            s.speed = 0.4;
            s.battery_level = 91.0;
        });
        let mut session = identified_session(&mut h, 7).await;

        let started = tokio::time::Instant::now();
        let telemetry = session.recv_json().await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_millis(5_010));
        assert_eq!(telemetry["type"], "TELEMETRY");
        let data = &telemetry["payload"]["sensorData"];
        assert_eq!(data["temperature"], 22.5);
        assert_eq!(data["speed"], 0.4);
        assert_eq!(data["batteryLevel"], 91.0);
        assert_eq!(data["currentPosition"], Value::Null);

        let status = session.recv_json().await.unwrap();
        assert_eq!(status["type"], "STATUS_UPDATE");
        assert_eq!(status["payload"]["status"], "active");

        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_triggers_exactly_one_reconnect_per_interval() {
        let mut h = start(false);
        let mut session = identified_session(&mut h, 42).await;

        session.close();
        wait_for_state(&h.handle, ConnectionState::Disconnected).await;
        // The old socket is gone: nothing more arrives on it.
        assert!(session.recv_json().await.is_none());

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 2);

        // The new connection re-handshakes without the old rover ID.
        let mut session = h.sessions.recv().await.unwrap();
        let hello = session.recv_json().await.unwrap();
        assert_eq!(hello["type"], "CONNECT");
        assert!(hello.get("roverId").is_none());

        // Connected but not identified: no telemetry, no further attempts.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(session.try_recv_json().is_none());
        assert_eq!(h.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.handle.state(), ConnectionState::Connected);

        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_retries_on_fixed_interval() {
        let mut h = start(true);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 3);

        h.refuse.store(false, Ordering::SeqCst);
        let _session = identified_session(&mut h, 9).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 4);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 4);

        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_does_not_close_connection() {
        let mut h = start(false);
        let mut session = identified_session(&mut h, 42).await;

        session.send("{this is not json");
        session.send(r#"{"type":"NOT_A_TYPE","payload":{}}"#);
        session.send(command(5, "stop"));

        let response = session.recv_json().await.unwrap();
        assert_eq!(response["payload"]["commandId"], 5);
        assert_eq!(response["payload"]["status"], "success");
        assert_eq!(response["payload"]["response"], "Emergency stop engaged");
        assert_eq!(h.handle.state(), ConnectionState::Identified);

        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_command_is_answered_once() {
        let mut h = start(false);
        let mut rx = h.bus.receiver("rover_commands").unwrap();
        let mut session = identified_session(&mut h, 42).await;

        session.send(command(7, "camera tilt"));
        session.send(command(7, "camera tilt"));
        session.send(command(8, "camera tilt"));

        let first = session.recv_json().await.unwrap();
        let second = session.recv_json().await.unwrap();
        assert_eq!(first["payload"]["commandId"], 7);
        assert_eq!(first["payload"]["response"], "Camera tilt command executed");
        assert_eq!(second["payload"]["commandId"], 8);

        assert_eq!(rx.recv().await.unwrap().data["data"], "camera tilt");
        assert_eq!(rx.recv().await.unwrap().data["data"], "camera tilt");
        assert!(rx.try_recv().is_err());

        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_move_fails_without_publishing() {
        let mut h = start(false);
        let mut rx = h.bus.receiver("rover_commands").unwrap();
        let mut session = identified_session(&mut h, 42).await;

        session.send(command(1, "move north abc"));
        let response = session.recv_json().await.unwrap();
        assert_eq!(response["payload"]["status"], "failed");
        assert_eq!(
            response["payload"]["response"],
            "Error executing command: Invalid distance value for move command."
        );
        assert!(rx.try_recv().is_err());

        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn socket_error_is_handled_like_close() {
        let mut h = start(false);
        let session = identified_session(&mut h, 42).await;

        session.fail("connection reset by peer");
        wait_for_state(&h.handle, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 2);

        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_updates_flow_into_telemetry() {
        let mut h = start(false);
        h.bus
            .publish(roverlink_types::BusMessage::new(
                "/temperature",
                "sensor_msgs/msg/Temperature",
                serde_json::json!({"temperature": 31.0}),
            ))
            .unwrap();
        let mut session = identified_session(&mut h, 3).await;

        let telemetry = session.recv_json().await.unwrap();
        assert_eq!(telemetry["payload"]["sensorData"]["temperature"], 31.0);

        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_socket_and_bus() {
        let mut h = start(false);
        let mut session = identified_session(&mut h, 42).await;
        let snapshot = h.handle.snapshot();
        let mut state = h.handle.subscribe_state();

        h.handle.stop().await;

        assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);
        assert!(session.recv_json().await.is_none());
        assert!(!h.bus.is_open());
        // Snapshot outlives the bridge.
        assert_eq!(snapshot.read().battery_level, 100.0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 1);
    }

    /// A server that accepts TCP but never finishes the handshake.
    struct HangingConnector;

    #[async_trait::async_trait]
    impl Connector for HangingConnector {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<(crate::transport::FrameSink, crate::transport::FrameStream), roverlink_types::BridgeError>
        {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_connection_attempt_in_flight() {
        let handle = RoverBridge::new(
            BridgeConfig::new("ws://test/ws", "R_002"),
            Arc::new(HangingConnector),
            None,
        )
        .start();
        wait_for_state(&handle, ConnectionState::Connecting).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut state = handle.subscribe_state();

        let started = tokio::time::Instant::now();
        handle.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_without_bus_fails_commands() {
        let (connector, mut sessions) = MockConnector::new();
        let handle = RoverBridge::new(BridgeConfig::default(), Arc::new(connector), None).start();

        let mut session = sessions.recv().await.unwrap();
        session.recv_json().await.unwrap();
        session.ack(1);
        wait_for_state(&handle, ConnectionState::Identified).await;

        session.send(command(1, "stop"));
        let response = session.recv_json().await.unwrap();
        assert_eq!(response["payload"]["status"], "failed");
        assert_eq!(response["payload"]["response"], "Actuator bus is not available.");

        handle.stop().await;
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.rover_identifier, "R_002");
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.telemetry_interval, Duration::from_secs(5));
        assert_eq!(config.command_topic, "rover_commands");
    }
}
