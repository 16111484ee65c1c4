//! Drives one session's observation/action cycle against a Driver and a
//! Bridge Transport: normalization, loop-break escalation, and the
//! no-navigation stall detector.

pub mod config;
pub mod escalation;
pub mod loop_controller;

pub use config::AgentLoopConfig;
pub use loop_controller::{AgentLoop, AgentLoopOutcome};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_transport::{BridgeTransport, ControllerMessage, ServerMessage};
    use cdp_driver::{StubDriver, StubPage};
    use core_types::{Action, ActionKind, AgentError, ConnectionState, SessionId, TabHandle};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Hands back one scripted server message per `recv()` call and
    /// records everything sent through it.
    struct ScriptedBridge {
        script: Mutex<std::collections::VecDeque<ServerMessage>>,
        sent: Mutex<Vec<ControllerMessage>>,
    }

    impl ScriptedBridge {
        fn new(script: Vec<ServerMessage>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BridgeTransport for ScriptedBridge {
        async fn send(&self, message: ControllerMessage) -> Result<(), AgentError> {
            self.sent.lock().await.push(message);
            Ok(())
        }

        async fn recv(&self) -> Option<ServerMessage> {
            self.script.lock().await.pop_front()
        }

        fn connection_state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
    }

    fn action_message(session_id: &SessionId, action: Action) -> ServerMessage {
        ServerMessage::Action {
            session_id: session_id.clone(),
            action: serde_json::to_value(&action).unwrap(),
        }
    }

    #[tokio::test]
    async fn stop_flag_prevents_any_observation_send() {
        let bridge = Arc::new(ScriptedBridge::new(vec![]));
        let driver = Arc::new(StubDriver::new(StubPage::default()));
        let loop_runner = AgentLoop::new(driver, bridge.clone(), AgentLoopConfig::default());
        let stopped = Arc::new(AtomicBool::new(true));

        let outcome = loop_runner
            .run(TabHandle(1), SessionId::new(), "noop".into(), stopped)
            .await
            .unwrap();

        assert!(outcome.stopped_externally);
        assert_eq!(outcome.steps_taken, 0);
        assert!(bridge.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn done_action_completes_the_loop() {
        let session_id = SessionId::new();
        let mut done_action = Action::new(ActionKind::Done);
        done_action.thought = Some("goal satisfied".into());

        let bridge = Arc::new(ScriptedBridge::new(vec![action_message(&session_id, done_action)]));
        let driver = Arc::new(StubDriver::new(StubPage {
            url: "https://example.com/results".into(),
            title: "Results".into(),
            elements: Vec::new(),
        }));

        let loop_runner = AgentLoop::new(driver, bridge.clone(), AgentLoopConfig::default());
        let outcome = loop_runner
            .run(TabHandle(1), session_id, "find something".into(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.steps_taken, 1);
        assert_eq!(outcome.summary.as_deref(), Some("goal satisfied"));
        assert_eq!(bridge.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn max_steps_cap_stops_the_loop_without_completion() {
        let session_id = SessionId::new();
        let mut wait_action = Action::new(ActionKind::Wait);
        wait_action.thought = None;

        let script: Vec<ServerMessage> = (0..5)
            .map(|_| action_message(&session_id, wait_action.clone()))
            .collect();
        let bridge = Arc::new(ScriptedBridge::new(script));
        let driver = Arc::new(StubDriver::new(StubPage::default()));

        let mut config = AgentLoopConfig::default();
        config.max_steps = 3;
        config.wait_after_click_ms = 0;

        let loop_runner = AgentLoop::new(driver, bridge, config);
        let outcome = loop_runner
            .run(TabHandle(1), session_id, "stay put".into(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        assert!(!outcome.completed);
        assert_eq!(outcome.steps_taken, 3);
    }

    #[tokio::test]
    async fn stuck_click_injects_navigation_error_after_threshold() {
        let session_id = SessionId::new();
        let mut click = Action::new(ActionKind::Click);
        click.selector = Some("#load-more".into());

        let mut script: Vec<ServerMessage> = (0..4)
            .map(|_| action_message(&session_id, click.clone()))
            .collect();
        let mut done = Action::new(ActionKind::Done);
        done.thought = Some("gave up after the stall warning".into());
        script.push(action_message(&session_id, done));
        let bridge = Arc::new(ScriptedBridge::new(script));

        // Every click lands but nothing navigates.
        let driver = Arc::new(StubDriver::new(StubPage::default()));
        for _ in 0..4 {
            driver.queue_click_result(None);
        }

        let mut config = AgentLoopConfig::default();
        config.max_steps = 10;
        let loop_runner = AgentLoop::new(driver, bridge.clone(), config);

        let outcome = loop_runner
            .run(TabHandle(1), session_id, "load more results".into(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.steps_taken, 5);

        let sent = bridge.sent.lock().await;
        let fourth_observation = match &sent[3] {
            ControllerMessage::Observation { observation, .. } => observation.clone(),
            other => panic!("expected an observation, got {other:?}"),
        };
        let last_error = fourth_observation["last_action_error"].as_str().unwrap_or_default();
        assert!(
            last_error.contains("CLICK DID NOT NAVIGATE"),
            "expected stall error after 3 consecutive no-navigation clicks, got {last_error:?}"
        );
    }
}
