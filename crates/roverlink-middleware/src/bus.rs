//! The actuator/sensor bus seam.
//!
//! The bridge never speaks directly to ROS 2.  Everything it needs from the
//! robotics middleware goes through the narrow [`RobotBus`] trait:
//! callback-style `subscribe` for sensor topics and a synchronous `publish`
//! for actuator commands.
//!
//! Two implementations ship with the crate:
//!
//! | Implementation | Use |
//! |---|---|
//! | [`EventBus`] | In-process topic bus built on Tokio broadcast channels (loopback mode, tests). |
//! | [`RosbridgeBus`][crate::rosbridge::RosbridgeBus] | A rosbridge v2 WebSocket connection to a real ROS 2 graph. |

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use roverlink_types::{BridgeError, BusMessage};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered messages per topic before old
/// ones are dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Callback invoked for every message delivered on a subscribed topic.
///
/// Handlers must be fast and must not block: they run on the bus's delivery
/// task.
pub type BusHandler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// Topic-based publish/subscribe capability provided by the robotics
/// middleware.
///
/// # Contract
///
/// * `subscribe` – registers `handler` for every message on `topic`.  The
///   handler stays attached until the returned [`Subscription`] is dropped.
/// * `publish` – hands `message` to the bus without waiting for delivery.
///   Returns the number of local receivers that were handed the message
///   (remote buses report `1` once the frame is queued).
/// * `shutdown` – releases the connection to the middleware.  Afterwards
///   every call fails with [`BridgeError::BusUnavailable`].
pub trait RobotBus: Send + Sync {
    fn subscribe(
        &self,
        topic: &str,
        msg_type: &str,
        handler: BusHandler,
    ) -> Result<Subscription, BridgeError>;

    fn publish(&self, message: BusMessage) -> Result<usize, BridgeError>;

    fn shutdown(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// RAII handle for an attached [`BusHandler`].  Dropping it detaches the
/// handler.
pub struct Subscription {
    topic: String,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            topic: topic.into(),
            detach: Some(Box::new(detach)),
        }
    }

    /// The topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

/// In-process topic bus.  Clone it cheaply – all clones share the same
/// underlying broadcast channels.
///
/// Topics are created lazily on first use.  Each subscription spawns one
/// delivery task on the current Tokio runtime that invokes its handler for
/// every message, so a slow handler only ever delays its own topic lane.
#[derive(Clone, Debug)]
pub struct EventBus {
    capacity: usize,
    // `None` once the bus has been shut down.
    channels: Arc<RwLock<Option<HashMap<String, broadcast::Sender<BusMessage>>>>>,
}

impl EventBus {
    /// Create a new bus with the given per-topic channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Arc::new(RwLock::new(Some(HashMap::new()))),
        }
    }

    /// Subscribe to a topic and receive messages directly instead of through
    /// a handler.
    pub fn receiver(&self, topic: &str) -> Result<broadcast::Receiver<BusMessage>, BridgeError> {
        let mut guard = self.channels.write();
        let channels = guard.as_mut().ok_or(BridgeError::BusUnavailable)?;
        let sender = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.subscribe())
    }

    /// `true` until [`RobotBus::shutdown`] has been called.
    pub fn is_open(&self) -> bool {
        self.channels.read().is_some()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RobotBus for EventBus {
    fn subscribe(
        &self,
        topic: &str,
        _msg_type: &str,
        handler: BusHandler,
    ) -> Result<Subscription, BridgeError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| BridgeError::Bus {
            topic: topic.to_string(),
            details: format!("no async runtime for delivery task: {e}"),
        })?;
        let mut receiver = self.receiver(topic)?;
        let topic_name = topic.to_string();

        let task = runtime.spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => handler(&message),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(topic = %topic_name, lagged_by = n, "bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(topic, move || task.abort()))
    }

    /// Publish `message` on its topic.
    ///
    /// Returns `Ok(0)` when nobody is listening on the topic (a normal
    /// condition, not an error).
    fn publish(&self, message: BusMessage) -> Result<usize, BridgeError> {
        let guard = self.channels.read();
        let channels = guard.as_ref().ok_or(BridgeError::BusUnavailable)?;
        Ok(channels
            .get(&message.topic)
            .and_then(|sender| sender.send(message).ok())
            .unwrap_or(0))
    }

    /// Drop every topic channel.  Delivery tasks observe the closed channel
    /// and exit.
    fn shutdown(&self) -> Result<(), BridgeError> {
        self.channels.write().take();
        Ok(())
    }
}
