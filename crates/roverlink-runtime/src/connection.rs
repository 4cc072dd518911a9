//! [`ConnectionManager`] – owns the server socket and the connection state
//! machine.
//!
//! ```text
//!                connect()            socket open            CONNECT ack
//! Disconnected ───────────▶ Connecting ──────────▶ Connected ───────────▶ Identified
//!      ▲                        │                      │                      │
//!      └────────────────────────┴──── close / error ───┴──────────────────────┘
//! ```
//!
//! The manager is driven by a single `select!` loop, so it is the only writer
//! on the socket and frames hit the wire in the order they were submitted.
//! Two optional timers hang off the state:
//!
//! * the **reconnect** timer exists only while `Disconnected` and fires every
//!   `reconnect_interval` until a connection succeeds;
//! * the **telemetry** timer exists only while `Identified`.
//!
//! Leaving a state drops the timer that belonged to it.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use roverlink_types::{BridgeError, ConnectionState, OutboundMessage, RoverIdentity};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bridge::BridgeConfig;
use crate::router::{MessageRouter, RouteAction};
use crate::telemetry::TelemetryPublisher;
use crate::transport::{Connector, FrameSink, FrameStream};

/// Upper bound on the close handshake during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound on a single frame write.  A peer that stops reading is
/// treated as gone.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ConnectionManager {
    server_url: String,
    reconnect_interval: Duration,
    telemetry_interval: Duration,
    connect_timeout: Duration,
    connector: Arc<dyn Connector>,
    identity: RoverIdentity,
    state: watch::Sender<ConnectionState>,
    router: MessageRouter,
    telemetry: TelemetryPublisher,
    writer: Option<FrameSink>,
    reader: Option<FrameStream>,
    reconnect_timer: Option<Interval>,
    telemetry_timer: Option<Interval>,
    stop_signal: Option<watch::Receiver<bool>>,
}

impl ConnectionManager {
    pub fn new(
        config: &BridgeConfig,
        connector: Arc<dyn Connector>,
        router: MessageRouter,
        telemetry: TelemetryPublisher,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            server_url: config.server_url.clone(),
            reconnect_interval: config.reconnect_interval,
            telemetry_interval: config.telemetry_interval,
            connect_timeout: config.connect_timeout,
            connector,
            identity: RoverIdentity::new(config.rover_identifier.clone()),
            state,
            router,
            telemetry,
            writer: None,
            reader: None,
            reconnect_timer: None,
            telemetry_timer: None,
            stop_signal: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn identity(&self) -> &RoverIdentity {
        &self.identity
    }

    /// Connect, then serve the socket and both timers until `shutdown` turns
    /// `true` or its sender is dropped.  Runs the shutdown sequence before
    /// returning.  A connection attempt in flight is abandoned on shutdown.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        self.stop_signal = Some(shutdown);
        self.connect().await;

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_signal) => break,
                frame = next_frame(&mut self.reader) => self.on_frame(frame).await,
                _ = tick(&mut self.telemetry_timer) => self.on_telemetry_tick().await,
                _ = tick(&mut self.reconnect_timer) => {
                    debug!("reconnect timer fired");
                    self.connect().await;
                }
            }
        }

        self.shutdown().await;
    }

    /// Open the socket and send the `CONNECT` handshake.
    ///
    /// A no-op unless `Disconnected`.  A failed attempt leaves the manager
    /// `Disconnected` with the reconnect timer armed.
    pub async fn connect(&mut self) {
        let state = self.state();
        if state != ConnectionState::Disconnected {
            debug!(state = %state, "connect ignored: connection already in progress or open");
            return;
        }

        self.set_state(ConnectionState::Connecting);
        info!(url = %self.server_url, identifier = %self.identity.identifier, "connecting to server");

        let attempt = tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop_signal) => {
                info!(url = %self.server_url, "connection attempt abandoned for shutdown");
                self.set_state(ConnectionState::Disconnected);
                return;
            }
            attempt = tokio::time::timeout(
                self.connect_timeout,
                self.connector.connect(&self.server_url),
            ) => attempt,
        };

        match attempt {
            Ok(Ok((writer, reader))) => {
                self.writer = Some(writer);
                self.reader = Some(reader);
                self.reconnect_timer = None;
                self.set_state(ConnectionState::Connected);
                info!(url = %self.server_url, "connected to server");
                self.send(OutboundMessage::connect(self.identity.identifier.clone()))
                    .await;
            }
            Ok(Err(e)) => {
                warn!(url = %self.server_url, error = %e, "connection attempt failed");
                self.handle_disconnect();
            }
            Err(_) => {
                warn!(
                    url = %self.server_url,
                    timeout_secs = self.connect_timeout.as_secs_f64(),
                    "connection attempt timed out"
                );
                self.handle_disconnect();
            }
        }
    }

    /// Write `message` if the socket is open.
    ///
    /// Nothing is queued: with no socket the message is dropped and a
    /// reconnect attempt is triggered.  A failed write is handled like a
    /// close.
    pub async fn send(&mut self, message: OutboundMessage) {
        let Some(writer) = self.writer.as_mut() else {
            warn!(kind = message.kind(), state = %self.state(), "socket not open, message dropped");
            self.trigger_reconnect();
            return;
        };

        let frame = match message.encode(self.identity.assigned_id) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to encode outbound message");
                return;
            }
        };

        debug!(kind = message.kind(), rover_id = ?self.identity.assigned_id, "sending frame");
        let written = tokio::time::timeout(WRITE_TIMEOUT, writer.send(frame)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "socket write failed");
                self.handle_disconnect();
            }
            Err(_) => {
                warn!(timeout_secs = WRITE_TIMEOUT.as_secs_f64(), "socket write timed out");
                self.handle_disconnect();
            }
        }
    }

    async fn on_frame(&mut self, frame: Option<Result<String, BridgeError>>) {
        match frame {
            Some(Ok(text)) => match self.router.route(&text) {
                Some(RouteAction::Identified(rover_id)) => self.identify(rover_id),
                Some(RouteAction::Respond(message)) => self.send(message).await,
                None => {}
            },
            Some(Err(BridgeError::Decode(details))) => {
                warn!(details = %details, "undecodable frame dropped");
            }
            Some(Err(e)) => {
                warn!(error = %e, "socket error");
                self.handle_disconnect();
            }
            None => {
                info!("server closed the connection");
                self.handle_disconnect();
            }
        }
    }

    fn identify(&mut self, rover_id: i64) {
        let state = self.state();
        if !state.is_open() {
            warn!(rover_id, state = %state, "acknowledgment without open socket ignored");
            return;
        }
        self.identity.assigned_id = Some(rover_id);
        self.set_state(ConnectionState::Identified);
        self.telemetry_timer = Some(fixed_interval(
            Instant::now() + self.telemetry_interval,
            self.telemetry_interval,
        ));
        info!(rover_id, "rover identified, telemetry started");
    }

    async fn on_telemetry_tick(&mut self) {
        for message in self.telemetry.tick(self.state()) {
            if self.writer.is_none() {
                break;
            }
            self.send(message).await;
        }
    }

    /// Drop the socket and identity, stop telemetry and arm the reconnect
    /// timer unless one is already running.
    fn handle_disconnect(&mut self) {
        let previous = self.state();
        self.writer = None;
        self.reader = None;
        self.telemetry_timer = None;
        self.identity.assigned_id = None;
        self.set_state(ConnectionState::Disconnected);

        // A failed attempt never had a socket; it is logged where it failed.
        if previous.is_open() {
            info!(previous = %previous, "disconnected from server");
        }
        if self.reconnect_timer.is_none() {
            info!(
                interval_secs = self.reconnect_interval.as_secs_f64(),
                "scheduling reconnection"
            );
            self.reconnect_timer = Some(fixed_interval(
                Instant::now() + self.reconnect_interval,
                self.reconnect_interval,
            ));
        }
    }

    /// Arm the reconnect timer to fire right away, unless one is already
    /// armed.
    fn trigger_reconnect(&mut self) {
        if self.reconnect_timer.is_none() && self.state() == ConnectionState::Disconnected {
            self.reconnect_timer = Some(fixed_interval(Instant::now(), self.reconnect_interval));
        }
    }

    /// Stop timers, then close the socket.  Best-effort.
    async fn shutdown(&mut self) {
        self.reconnect_timer = None;
        self.telemetry_timer = None;

        if let Some(mut writer) = self.writer.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
                Ok(Ok(())) => debug!("socket closed"),
                Ok(Err(e)) => debug!(error = %e, "socket close failed"),
                Err(_) => debug!("socket close timed out"),
            }
        }
        self.reader = None;
        self.identity.assigned_id = None;
        self.set_state(ConnectionState::Disconnected);
        info!("connection manager stopped");
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "connection state changed");
        }
    }
}

fn fixed_interval(start: Instant, period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_frame(reader: &mut Option<FrameStream>) -> Option<Result<String, BridgeError>> {
    match reader {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

/// Resolves once shutdown is requested or its sender is gone.  Never
/// resolves without a signal.
async fn stop_requested(signal: &mut Option<watch::Receiver<bool>>) {
    match signal {
        Some(rx) => {
            let _ = rx.wait_for(|stop| *stop).await.map(|_| ());
        }
        None => future::pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
