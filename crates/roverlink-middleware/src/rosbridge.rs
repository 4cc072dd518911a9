//! rosbridge v2 client.
//!
//! [`RosbridgeBus`] implements [`RobotBus`] on top of a
//! `rosbridge_server`-compatible WebSocket:
//!
//! * **Inbound (sensors)** – `subscribe` sends an `{"op":"subscribe"}` frame;
//!   every `{"op":"publish"}` frame the server pushes for that topic is
//!   converted into a [`BusMessage`] and handed to the registered handlers.
//!
//! * **Outbound (actuators)** – `publish` advertises the topic once and then
//!   sends `{"op":"publish","msg":…}` frames through a single writer task so
//!   frames leave in submission order.
//!
//! The client does not reconnect.  Once the socket is gone every publish
//! fails with [`BridgeError::BusUnavailable`], which the command executor
//! reports upstream as a failed command.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use roverlink_types::{BridgeError, BusMessage};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bus::{BusHandler, RobotBus, Subscription};

struct TopicHandlers {
    msg_type: String,
    handlers: Vec<(u64, BusHandler)>,
}

type HandlerRegistry = Arc<Mutex<HashMap<String, TopicHandlers>>>;

/// A [`RobotBus`] backed by a rosbridge WebSocket connection.
pub struct RosbridgeBus {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    handlers: HandlerRegistry,
    advertised: Mutex<HashSet<String>>,
    next_handler_id: AtomicU64,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RosbridgeBus {
    /// Connect to the rosbridge server at `url` (e.g. `"ws://localhost:9090"`).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the WebSocket handshake fails.
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| BridgeError::Transport(format!("rosbridge connect to {url}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let connected = Arc::new(AtomicBool::new(true));
        let handlers: HandlerRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        // Writer: the only task that touches the sink.
        let writer_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if let Err(e) = ws_tx.send(frame).await {
                    warn!(error = %e, "rosbridge write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        // Reader: dispatches inbound publishes to handlers.
        let reader_connected = Arc::clone(&connected);
        let reader_handlers = Arc::clone(&handlers);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch_frame(&reader_handlers, text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "rosbridge read failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            info!("rosbridge connection closed");
        });

        info!(url = %url, "connected to rosbridge");
        Ok(Self {
            url: url.to_string(),
            outbound,
            handlers,
            advertised: Mutex::new(HashSet::new()),
            next_handler_id: AtomicU64::new(0),
            connected,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// The rosbridge URL this bus is connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// `true` while the WebSocket is open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn build_subscribe_frame(topic: &str, msg_type: &str) -> String {
        json!({ "op": "subscribe", "topic": topic, "type": msg_type }).to_string()
    }

    pub fn build_unsubscribe_frame(topic: &str) -> String {
        json!({ "op": "unsubscribe", "topic": topic }).to_string()
    }

    pub fn build_advertise_frame(topic: &str, msg_type: &str) -> String {
        json!({ "op": "advertise", "topic": topic, "type": msg_type }).to_string()
    }

    pub fn build_unadvertise_frame(topic: &str) -> String {
        json!({ "op": "unadvertise", "topic": topic }).to_string()
    }

    pub fn build_publish_frame(topic: &str, msg: &Value) -> String {
        json!({ "op": "publish", "topic": topic, "msg": msg }).to_string()
    }

    fn send_text(&self, frame: String) -> Result<(), BridgeError> {
        self.outbound
            .send(Message::Text(frame.into()))
            .map_err(|_| BridgeError::BusUnavailable)
    }
}

impl RobotBus for RosbridgeBus {
    fn subscribe(
        &self,
        topic: &str,
        msg_type: &str,
        handler: BusHandler,
    ) -> Result<Subscription, BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::BusUnavailable);
        }
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let first_for_topic = {
            let mut registry = self.handlers.lock();
            let entry = registry
                .entry(topic.to_string())
                .or_insert_with(|| TopicHandlers {
                    msg_type: msg_type.to_string(),
                    handlers: Vec::new(),
                });
            entry.handlers.push((id, handler));
            entry.handlers.len() == 1
        };
        if first_for_topic {
            if let Err(e) = self.send_text(Self::build_subscribe_frame(topic, msg_type)) {
                remove_handler(&self.handlers, topic, id);
                return Err(e);
            }
        }

        let handlers = Arc::clone(&self.handlers);
        let outbound = self.outbound.clone();
        let topic_name = topic.to_string();
        Ok(Subscription::new(topic, move || {
            if remove_handler(&handlers, &topic_name, id) {
                let frame = RosbridgeBus::build_unsubscribe_frame(&topic_name);
                let _ = outbound.send(Message::Text(frame.into()));
            }
        }))
    }

    fn publish(&self, message: BusMessage) -> Result<usize, BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::BusUnavailable);
        }
        if self.advertised.lock().insert(message.topic.clone()) {
            self.send_text(Self::build_advertise_frame(&message.topic, &message.msg_type))?;
        }
        self.send_text(Self::build_publish_frame(&message.topic, &message.data))?;
        debug!(topic = %message.topic, "published to rosbridge");
        Ok(1)
    }

    /// Best-effort teardown: unsubscribe, unadvertise, close the socket.
    fn shutdown(&self) -> Result<(), BridgeError> {
        let topics: Vec<String> = self.handlers.lock().drain().map(|(topic, _)| topic).collect();
        for topic in topics {
            let _ = self.send_text(Self::build_unsubscribe_frame(&topic));
        }
        let advertised: Vec<String> = self.advertised.lock().drain().collect();
        for topic in advertised {
            let _ = self.send_text(Self::build_unadvertise_frame(&topic));
        }
        let _ = self.outbound.send(Message::Close(None));
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        info!(url = %self.url, "rosbridge connection released");
        Ok(())
    }
}

/// Drop handler `id` from `topic`.  Returns `true` when that was the topic's
/// last handler and the topic entry was removed.
fn remove_handler(handlers: &HandlerRegistry, topic: &str, id: u64) -> bool {
    let mut registry = handlers.lock();
    let now_empty = match registry.get_mut(topic) {
        Some(entry) => {
            entry.handlers.retain(|(handler_id, _)| *handler_id != id);
            entry.handlers.is_empty()
        }
        None => false,
    };
    if now_empty {
        registry.remove(topic);
    }
    now_empty
}

/// Route one inbound rosbridge frame to the handlers of its topic.
///
/// Anything other than a well-formed `publish` for a subscribed topic is
/// ignored.
fn dispatch_frame(handlers: &HandlerRegistry, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        debug!("ignoring non-JSON rosbridge frame");
        return;
    };
    if frame.get("op").and_then(Value::as_str) != Some("publish") {
        return;
    }
    let Some(topic) = frame.get("topic").and_then(Value::as_str) else {
        return;
    };

    // Clone the handler list so callbacks run without the registry lock.
    let (msg_type, targets) = {
        let registry = handlers.lock();
        match registry.get(topic) {
            Some(entry) => (
                entry.msg_type.clone(),
                entry.handlers.iter().map(|(_, h)| Arc::clone(h)).collect::<Vec<_>>(),
            ),
            None => return,
        }
    };

    let message = BusMessage::new(
        topic,
        msg_type,
        frame.get("msg").cloned().unwrap_or(Value::Null),
    );
    for handler in targets {
        handler(&message);
    }
}
