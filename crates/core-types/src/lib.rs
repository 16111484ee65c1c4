//! Shared identifiers, wire-level action/observation types, and the error
//! taxonomy used across the browser agent control plane.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque handle identifying a browser tab. The core holds at most one CDP
/// attachment per handle at any instant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TabHandle(pub u64);

impl fmt::Display for TabHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

/// Opaque session identifier, assigned when a goal arrives.
#[derive(Clone, Debug, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error taxonomy surfaced by every component. Kinds mirror user-facing
/// failure categories rather than internal implementation classes.
#[derive(Clone, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
pub enum AgentErrorKind {
    #[error("debugger protocol failure")]
    Protocol,
    #[error("selector did not resolve")]
    Selector,
    #[error("javascript evaluation threw")]
    Evaluation,
    #[error("another debugger is already attached")]
    AttachmentConflict,
    #[error("bridge transport failure")]
    Transport,
    #[error("operation timed out")]
    Timeout,
    #[error("execution host was torn down")]
    HostTeardown,
    #[error("session is stopped")]
    Stopped,
    #[error("internal error")]
    Internal,
}

/// Enriched error value threaded through the core. Never used for
/// control-flow panics; every fallible operation returns this as a value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub hint: Option<String>,
    pub retriable: bool,
}

impl AgentError {
    pub fn new(kind: AgentErrorKind) -> Self {
        Self {
            kind,
            hint: None,
            retriable: false,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn retriable(mut self, flag: bool) -> Self {
        self.retriable = flag;
        self
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for AgentError {}

/// Best-effort hint for how `click_element` should attempt to click.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickMethod {
    Auto,
    Js,
    Focus,
}

impl Default for ClickMethod {
    fn default() -> Self {
        ClickMethod::Auto
    }
}

/// Scroll direction for the `scroll` action.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// Type hint attached to an interactive element.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ElementType {
    Link,
    Button,
    Input,
    Select,
    Element,
}

/// One entry in the bounded interactive-element list handed to the policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteractiveElement {
    /// 1-based, stable within one observation.
    pub index: u32,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub selector: String,
    pub tag: String,
    /// Up to 50 chars of visible text.
    pub text: String,
}

pub const MAX_OBSERVATION_ELEMENTS: usize = 15;
pub const MAX_CLICKABLE_CANDIDATES: usize = 30;
pub const MAX_ACTION_LOG_LEN: usize = 50;
pub const MAX_RECENT_ACTIONS_IN_OBSERVATION: usize = 5;
pub const MAX_ELEMENT_TEXT_CHARS: usize = 50;
pub const DEFAULT_MAX_STEPS: u32 = 15;
pub const OBSERVATION_SCREENSHOT_QUALITY: u8 = 30;

/// An action kind. Policy kinds are an open string set in the wire
/// protocol; this enum models the ones the core understands and falls back
/// to `Unknown` (treated as `wait`) for anything else.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Input,
    Search,
    Press,
    Submit,
    Enter,
    Scroll,
    Navigate,
    Wait,
    Screenshot,
    Done,
    ClearInput,
    #[serde(other)]
    Unknown,
}

impl ActionKind {
    pub fn is_click_like(&self) -> bool {
        matches!(self, ActionKind::Click)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Input => "input",
            ActionKind::Search => "search",
            ActionKind::Press => "press",
            ActionKind::Submit => "submit",
            ActionKind::Enter => "enter",
            ActionKind::Scroll => "scroll",
            ActionKind::Navigate => "navigate",
            ActionKind::Wait => "wait",
            ActionKind::Screenshot => "screenshot",
            ActionKind::Done => "done",
            ActionKind::ClearInput => "clear_input",
            ActionKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// An action as received from the policy, with alias fields normalized by
/// the agent loop (`value`/`key`/`query` all collapse to `text`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    #[serde(default, alias = "element")]
    pub selector: Option<String>,
    #[serde(default, alias = "value", alias = "key", alias = "query")]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub direction: Option<ScrollDirection>,
    #[serde(default)]
    pub click_method: Option<ClickMethod>,
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub done: bool,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            selector: None,
            text: None,
            url: None,
            direction: None,
            click_method: None,
            thought: None,
            done: false,
        }
    }

    /// `selector`'s text is `None` if empty; used for the 3rd-consecutive
    /// submit-button-text heuristic.
    pub fn selector_text(&self) -> &str {
        self.selector.as_deref().unwrap_or("")
    }

    pub fn selector_required(&self) -> Result<&str, AgentError> {
        self.selector.as_deref().ok_or_else(|| {
            AgentError::new(AgentErrorKind::Selector)
                .with_hint(format!("{} action requires a selector", self.kind))
        })
    }
}

/// One entry appended to the session's action log after each attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub selector: Option<String>,
    pub success: bool,
    pub post_url: Option<String>,
    pub error: Option<String>,
    pub step_index: u32,
}

/// A fresh snapshot of the page, produced before each policy call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub task: String,
    pub url: String,
    pub title: String,
    /// JPEG bytes at quality ~30.
    pub screenshot: Vec<u8>,
    pub elements: Vec<InteractiveElement>,
    pub recent_actions: Vec<ActionRecord>,
    pub progress_note: Option<String>,
    pub original_goal: String,
    pub last_action_error: Option<String>,
}

/// Connection state of the bridge transport. Progresses monotonically
/// during one connection attempt; may cycle arbitrarily across attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Cross-incarnation shared state: the only record that must survive a host
/// restart so a new host can detect and tear down a stale attachment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistentSessionRecord {
    pub active_tab: Option<TabHandle>,
    pub session_id: Option<SessionId>,
    pub is_active: bool,
    pub last_update: Option<chrono::DateTime<chrono::Utc>>,
}

impl PersistentSessionRecord {
    pub fn touch(&mut self) {
        self.last_update = Some(chrono::Utc::now());
    }
}

impl PartialEq for SessionId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn unknown_action_kind_degrades() {
        let parsed: Action = serde_json::from_str(
            r#"{"kind":"frobnicate","selector":null,"text":null,"url":null,"direction":null,"click_method":null,"thought":null,"done":false}"#,
        )
        .unwrap();
        assert_eq!(parsed.kind, ActionKind::Unknown);
    }

    #[test]
    fn action_record_round_trips() {
        let record = ActionRecord {
            kind: ActionKind::Click,
            selector: Some("#go".into()),
            success: true,
            post_url: Some("https://example.com".into()),
            error: None,
            step_index: 3,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: ActionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.step_index, 3);
        assert_eq!(back.selector.as_deref(), Some("#go"));
    }
}
