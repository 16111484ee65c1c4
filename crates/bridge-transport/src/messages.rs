//! Application-level payloads carried over the bridge, once per line as
//! JSON. Unknown message kinds are logged and dropped rather than treated
//! as a framing error — the server and controller evolve independently.

use core_types::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    StartSession {
        goal: String,
        model: String,
    },
    StopSession {
        session_id: SessionId,
    },
    Observation {
        session_id: SessionId,
        step_number: u32,
        observation: Value,
    },
    Ping,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        session_id: SessionId,
        status: String,
        message: Option<String>,
    },
    Action {
        session_id: SessionId,
        action: Value,
    },
    Error {
        error: String,
    },
    Pong,
    StartAutomation {
        goal: String,
        session_id: SessionId,
    },
    ReloadExtension,
}

/// Parses one line of wire JSON into a `ServerMessage`, returning `None`
/// (and leaving the caller to log) on anything that isn't a recognized
/// message kind.
pub fn parse_server_message(line: &str) -> Option<ServerMessage> {
    match serde_json::from_str::<ServerMessage>(line) {
        Ok(message) => Some(message),
        Err(err) => {
            tracing::warn!(target: "bridge-transport", %err, line, "dropping unparseable server message");
            None
        }
    }
}
