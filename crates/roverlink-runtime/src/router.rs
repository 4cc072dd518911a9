//! [`MessageRouter`] – decodes inbound frames and decides what they mean for
//! the connection.
//!
//! The router never touches the socket.  It turns each text frame into at
//! most one [`RouteAction`] that the connection manager applies:
//!
//! | Frame | Action |
//! |---|---|
//! | `CONNECT` with `success: true` and a `roverId` | [`RouteAction::Identified`] |
//! | `COMMAND` (new ID) | [`RouteAction::Respond`] with the command response |
//! | `COMMAND` (duplicate ID) | none |
//! | `ERROR` | none (logged) |
//! | anything else, malformed JSON | none (logged and dropped) |

use roverlink_types::{BridgeError, InboundMessage, OutboundMessage};
use tracing::{debug, error, info, warn};

use crate::executor::CommandExecutor;

/// What the connection manager must do in response to a routed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    /// The server accepted the handshake and assigned this rover ID.
    Identified(i64),
    /// Send this message back to the server.
    Respond(OutboundMessage),
}

/// Dispatches inbound frames by their `type` discriminator.
pub struct MessageRouter {
    executor: CommandExecutor,
}

impl MessageRouter {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    /// Route one inbound text frame.
    ///
    /// Decoding failures are logged here and never reach the caller, so a
    /// malformed frame cannot tear down the connection.
    pub fn route(&mut self, text: &str) -> Option<RouteAction> {
        let message = match InboundMessage::decode(text) {
            Ok(message) => message,
            Err(BridgeError::UnknownMessage(kind)) => {
                warn!(kind = %kind, "ignoring unsupported message type");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "failed to decode inbound frame");
                return None;
            }
        };

        match message {
            InboundMessage::Connect(ack) => match (ack.success, ack.rover_id) {
                (true, Some(rover_id)) => {
                    info!(rover_id, "connection acknowledged by server");
                    Some(RouteAction::Identified(rover_id))
                }
                (true, None) => {
                    warn!("connection acknowledgment without rover ID ignored");
                    None
                }
                (false, _) => {
                    warn!("server rejected connection handshake");
                    None
                }
            },
            InboundMessage::Command(envelope) => {
                debug!(command_id = envelope.command_id, "routing command");
                self.executor
                    .execute(envelope.command_id, &envelope.command_text)
                    .map(|outcome| RouteAction::Respond(outcome.into()))
            }
            InboundMessage::Error(payload) => {
                error!(payload = %payload, "server error");
                None
            }
        }
    }
}
