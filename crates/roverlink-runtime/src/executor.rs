//! [`CommandExecutor`] – validates and runs operator commands.
//!
//! Commands arrive as free text (`"move north 5"`, `"stop"`,
//! `"camera snapshot"`).  The first whitespace-separated token selects the
//! action, case-insensitively.  A command that passes validation is published
//! verbatim on the actuator command topic; everything else is reported back
//! as a failed command.
//!
//! # De-duplication
//!
//! Only the most recently processed command ID is remembered.  A command that
//! repeats that exact ID is dropped without a response; any other ID is
//! executed, even if it repeats an ID seen further back.
//!
//! ```rust
//! use roverlink_runtime::executor::CommandExecutor;
//! use roverlink_types::CommandStatus;
//!
//! // Without a bus every command fails, but it still gets a response.
//! let mut executor = CommandExecutor::new(None, "rover_commands");
//! let outcome = executor.execute(1, "stop").expect("first delivery");
//! assert_eq!(outcome.status, CommandStatus::Failed);
//! assert!(executor.execute(1, "stop").is_none()); // duplicate
//! ```

use std::sync::Arc;

use roverlink_middleware::RobotBus;
use roverlink_types::{BridgeError, BusMessage, CommandStatus, OutboundMessage};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

/// ROS message type used for the actuator command topic.
const COMMAND_MSG_TYPE: &str = "std_msgs/msg/String";

/// Reasons a command does not execute.
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("{action} command format is incorrect. Expected: {usage}")]
    InvalidFormat {
        action: &'static str,
        usage: &'static str,
    },

    #[error("Invalid distance value for move command.")]
    InvalidDistance,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Actuator bus is not available.")]
    BusUnavailable,

    #[error("{0}")]
    Publish(BridgeError),
}

impl CommandError {
    /// Text reported to the operator in the failed command response.
    pub fn response_text(&self) -> String {
        match self {
            CommandError::UnknownCommand(_) | CommandError::BusUnavailable => self.to_string(),
            other => format!("Error executing command: {other}"),
        }
    }
}

/// The single response produced for an executed command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub command_id: i64,
    pub status: CommandStatus,
    pub response: String,
}

impl From<CommandOutcome> for OutboundMessage {
    fn from(outcome: CommandOutcome) -> Self {
        OutboundMessage::CommandResponse {
            command_id: outcome.command_id,
            status: outcome.status,
            response: outcome.response,
        }
    }
}

/// Executes operator commands against the actuator bus.
pub struct CommandExecutor {
    bus: Option<Arc<dyn RobotBus>>,
    command_topic: String,
    last_command_id: Option<i64>,
}

impl CommandExecutor {
    /// `bus` is `None` when the process runs without a robotics middleware;
    /// every command then fails with "Actuator bus is not available."
    pub fn new(bus: Option<Arc<dyn RobotBus>>, command_topic: impl Into<String>) -> Self {
        Self {
            bus,
            command_topic: command_topic.into(),
            last_command_id: None,
        }
    }

    /// The ID of the most recently processed command.
    pub fn last_command_id(&self) -> Option<i64> {
        self.last_command_id
    }

    /// Execute `command_text` once for `command_id`.
    ///
    /// Returns `None` for a duplicate of the last processed ID, otherwise
    /// exactly one [`CommandOutcome`].  Never fails: every error is folded
    /// into a [`CommandStatus::Failed`] outcome.
    pub fn execute(&mut self, command_id: i64, command_text: &str) -> Option<CommandOutcome> {
        if self.last_command_id == Some(command_id) {
            info!(command_id, command = %command_text, "duplicate command ignored");
            return None;
        }
        // Recorded before running so a redelivery after a failure is still
        // suppressed.
        self.last_command_id = Some(command_id);
        info!(command_id, command = %command_text, "received command");

        let outcome = match self.run(command_text) {
            Ok(response) => {
                info!(command_id, response = %response, "command executed");
                CommandOutcome {
                    command_id,
                    status: CommandStatus::Success,
                    response,
                }
            }
            Err(e) => {
                warn!(command_id, error = %e, "command failed");
                CommandOutcome {
                    command_id,
                    status: CommandStatus::Failed,
                    response: e.response_text(),
                }
            }
        };
        Some(outcome)
    }

    fn run(&self, command_text: &str) -> Result<String, CommandError> {
        let bus = self.bus.as_ref().ok_or(CommandError::BusUnavailable)?;

        let tokens: Vec<&str> = command_text.split_whitespace().collect();
        let action = tokens.first().copied().unwrap_or_default().to_lowercase();

        let response = match action.as_str() {
            "move" => {
                let &[_, direction, distance] = tokens.as_slice() else {
                    return Err(CommandError::InvalidFormat {
                        action: "Move",
                        usage: "move <direction> <distance>",
                    });
                };
                let distance = distance
                    .parse::<f64>()
                    .ok()
                    .filter(|d| d.is_finite())
                    .ok_or(CommandError::InvalidDistance)?;
                format!("Moving {direction} {distance} units")
            }
            "stop" => "Emergency stop engaged".to_string(),
            "camera" => {
                let &[_, camera_action] = tokens.as_slice() else {
                    return Err(CommandError::InvalidFormat {
                        action: "Camera",
                        usage: "camera <action>",
                    });
                };
                format!("Camera {camera_action} command executed")
            }
            _ => return Err(CommandError::UnknownCommand(action)),
        };

        let message = BusMessage::new(
            self.command_topic.as_str(),
            COMMAND_MSG_TYPE,
            json!({ "data": command_text }),
        );
        bus.publish(message).map_err(|e| match e {
            BridgeError::BusUnavailable => CommandError::BusUnavailable,
            other => CommandError::Publish(other),
        })?;
        debug!(topic = %self.command_topic, command = %command_text, "published command");

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roverlink_middleware::{EventBus, Subscription};
    use tokio::sync::broadcast::Receiver;

    fn executor_with_bus() -> (CommandExecutor, EventBus, Receiver<BusMessage>) {
        let bus = EventBus::default();
        let rx = bus.receiver("rover_commands").unwrap();
        let executor = CommandExecutor::new(Some(Arc::new(bus.clone())), "rover_commands");
        (executor, bus, rx)
    }

    struct FailingBus;

    impl RobotBus for FailingBus {
        fn subscribe(
            &self,
            topic: &str,
            _msg_type: &str,
            _handler: roverlink_middleware::BusHandler,
        ) -> Result<Subscription, BridgeError> {
            Ok(Subscription::new(topic, || {}))
        }

        fn publish(&self, message: BusMessage) -> Result<usize, BridgeError> {
            Err(BridgeError::Bus {
                topic: message.topic,
                details: "queue full".to_string(),
            })
        }
    }

    #[test]
    fn same_id_twice_yields_one_response() {
        let (mut executor, _bus, _rx) = executor_with_bus();
        assert!(executor.execute(5, "stop").is_some());
        assert!(executor.execute(5, "stop").is_none());
        assert_eq!(executor.last_command_id(), Some(5));
    }

    #[test]
    fn different_ids_with_same_text_both_run() {
        let (mut executor, _bus, mut rx) = executor_with_bus();
        let first = executor.execute(1, "move north 5").unwrap();
        let second = executor.execute(2, "move north 5").unwrap();
        assert_eq!(first.command_id, 1);
        assert_eq!(second.command_id, 2);
        assert_eq!(first.status, CommandStatus::Success);
        assert_eq!(second.status, CommandStatus::Success);
        assert_eq!(rx.try_recv().unwrap().data["data"], "move north 5");
        assert_eq!(rx.try_recv().unwrap().data["data"], "move north 5");
    }

    #[test]
    fn dedup_window_is_a_single_slot() {
        let (mut executor, _bus, _rx) = executor_with_bus();
        assert!(executor.execute(1, "stop").is_some());
        assert!(executor.execute(2, "stop").is_some());
        // ID 1 is no longer the last one, so it runs again.
        assert!(executor.execute(1, "stop").is_some());
    }

    #[test]
    fn failed_command_still_consumes_its_id() {
        let (mut executor, _bus, _rx) = executor_with_bus();
        let outcome = executor.execute(9, "move north abc").unwrap();
        assert_eq!(outcome.status, CommandStatus::Failed);
        assert!(executor.execute(9, "move north 5").is_none());
    }

    #[test]
    fn move_validation() {
        let (mut executor, _bus, mut rx) = executor_with_bus();

        let ok = executor.execute(1, "move north 5").unwrap();
        assert_eq!(ok.status, CommandStatus::Success);
        assert_eq!(ok.response, "Moving north 5 units");
        assert_eq!(rx.try_recv().unwrap().data["data"], "move north 5");

        let bad_distance = executor.execute(2, "move north abc").unwrap();
        assert_eq!(bad_distance.status, CommandStatus::Failed);
        assert_eq!(
            bad_distance.response,
            "Error executing command: Invalid distance value for move command."
        );

        for (id, text) in [(3, "move north"), (4, "move"), (5, "move north 5 fast")] {
            let outcome = executor.execute(id, text).unwrap();
            assert_eq!(outcome.status, CommandStatus::Failed, "{text}");
            assert_eq!(
                outcome.response,
                "Error executing command: Move command format is incorrect. Expected: move <direction> <distance>"
            );
        }

        let infinite = executor.execute(6, "move north inf").unwrap();
        assert_eq!(infinite.status, CommandStatus::Failed);

        // Nothing but the valid move reached the bus.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fractional_distance_is_echoed() {
        let (mut executor, _bus, _rx) = executor_with_bus();
        let outcome = executor.execute(1, "move left 2.5").unwrap();
        assert_eq!(outcome.response, "Moving left 2.5 units");
    }

    #[test]
    fn stop_ignores_arguments() {
        let (mut executor, _bus, mut rx) = executor_with_bus();
        for (id, text) in [(1, "stop"), (2, "STOP now please"), (3, "  Stop  ")] {
            let outcome = executor.execute(id, text).unwrap();
            assert_eq!(outcome.status, CommandStatus::Success, "{text}");
            assert_eq!(outcome.response, "Emergency stop engaged");
            assert_eq!(rx.try_recv().unwrap().data["data"], text);
        }
    }

    #[test]
    fn camera_requires_exactly_one_argument() {
        let (mut executor, _bus, _rx) = executor_with_bus();
        let ok = executor.execute(1, "camera snapshot").unwrap();
        assert_eq!(ok.status, CommandStatus::Success);
        assert_eq!(ok.response, "Camera snapshot command executed");

        for (id, text) in [(2, "camera"), (3, "camera pan left")] {
            let outcome = executor.execute(id, text).unwrap();
            assert_eq!(outcome.status, CommandStatus::Failed);
            assert_eq!(
                outcome.response,
                "Error executing command: Camera command format is incorrect. Expected: camera <action>"
            );
        }
    }

    #[test]
    fn unknown_action_fails_without_publishing() {
        let (mut executor, _bus, mut rx) = executor_with_bus();
        let outcome = executor.execute(1, "Dance wildly").unwrap();
        assert_eq!(outcome.status, CommandStatus::Failed);
        assert_eq!(outcome.response, "Unknown command: dance");

        let empty = executor.execute(2, "   ").unwrap();
        assert_eq!(empty.status, CommandStatus::Failed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn missing_bus_fails_every_command() {
        let mut executor = CommandExecutor::new(None, "rover_commands");
        let outcome = executor.execute(1, "stop").unwrap();
        assert_eq!(outcome.status, CommandStatus::Failed);
        assert_eq!(outcome.response, "Actuator bus is not available.");
    }

    #[test]
    fn closed_bus_fails_as_unavailable() {
        let (mut executor, bus, _rx) = executor_with_bus();
        bus.shutdown().unwrap();
        let outcome = executor.execute(1, "stop").unwrap();
        assert_eq!(outcome.status, CommandStatus::Failed);
        assert_eq!(outcome.response, "Actuator bus is not available.");
    }

    #[test]
    fn publish_error_becomes_failed_response() {
        let mut executor = CommandExecutor::new(Some(Arc::new(FailingBus)), "rover_commands");
        let outcome = executor.execute(1, "stop").unwrap();
        assert_eq!(outcome.status, CommandStatus::Failed);
        assert!(outcome.response.starts_with("Error executing command: Bus Error on rover_commands"));
    }

    #[test]
    fn outcome_converts_to_command_response() {
        let message: OutboundMessage = CommandOutcome {
            command_id: 4,
            status: CommandStatus::Success,
            response: "Emergency stop engaged".to_string(),
        }
        .into();
        assert_eq!(message.kind(), "COMMAND");
    }
}
