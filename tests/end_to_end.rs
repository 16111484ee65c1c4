//! Exercises the session controller and agent loop together against a
//! stub driver, the way the real binary wires them, without a live
//! browser or policy server.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use agent_loop::{AgentLoop, AgentLoopConfig};
use bridge_transport::{BridgeTransport, ControllerMessage, ServerMessage};
use cdp_driver::{CdpDriver, StubDriver, StubPage};
use core_types::{
    Action, ActionKind, AgentError, ConnectionState, PersistentSessionRecord, SessionId, TabHandle,
};
use session_controller::{MemoryStore, PersistentStore, SessionController, TabResolver};

struct FixedResolver {
    tab: TabHandle,
}

#[async_trait]
impl TabResolver for FixedResolver {
    async fn resolve(&self, requested: Option<TabHandle>) -> Result<Option<TabHandle>, AgentError> {
        Ok(Some(requested.unwrap_or(self.tab)))
    }

    async fn create_tab(&self, _deadline: Duration) -> Result<TabHandle, AgentError> {
        Ok(self.tab)
    }
}

struct ScriptedBridge {
    script: Mutex<VecDeque<ServerMessage>>,
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

fn test_controller(
    driver: Arc<StubDriver>,
) -> SessionController<StubDriver> {
    let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::default());
    let resolver: Arc<dyn TabResolver> = Arc::new(FixedResolver { tab: TabHandle(1) });
    SessionController::new(driver, store, resolver)
}

/// A Google-search-style happy path: the controller attaches a tab, the
/// agent loop runs one observe/act/done cycle, the controller tears the
/// session back down, and the persistent record reflects it cleanly.
#[tokio::test]
async fn happy_path_session_completes_and_tears_down_cleanly() {
    let driver = Arc::new(StubDriver::new(StubPage {
        url: "https://search.example/results?q=rust".into(),
        title: "rust - search results".into(),
        elements: Vec::new(),
    }));
    let controller = test_controller(driver.clone());
    controller.reconcile_on_startup().await.unwrap();

    let session_id = SessionId::new();
    let tab = controller.start(session_id.clone(), None).await.unwrap();

    let mut done = Action::new(ActionKind::Done);
    done.thought = Some("found the first result".into());
    let bridge = Arc::new(ScriptedBridge::new(vec![action_message(&session_id, done)]));

    let agent_loop = AgentLoop::new(driver, bridge, AgentLoopConfig::default());
    let outcome = agent_loop
        .run(tab, session_id, "search for rust release notes".into(), Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.summary.as_deref(), Some("found the first result"));

    controller.stop().await.unwrap();
    let record = controller.store().load().await.unwrap();
    assert!(!record.is_active);
    assert_eq!(record.active_tab, Some(tab));
}

/// Two sessions run back to back against the same controller; the second
/// start must go through the same cleanup path as the first and land on
/// the same tab (the fixed resolver always returns it).
#[tokio::test]
async fn back_to_back_sessions_reuse_the_cleanup_path() {
    let driver = Arc::new(StubDriver::new(StubPage::default()));
    let controller = test_controller(driver);

    let first_tab = controller.start(SessionId::new(), None).await.unwrap();
    controller.stop().await.unwrap();

    let second_tab = controller.start(SessionId::new(), None).await.unwrap();
    assert_eq!(first_tab, second_tab);
    assert_eq!(controller.state().await, session_controller::SessionState::Running);
    controller.stop().await.unwrap();
}

/// A previous incarnation crashed mid-session, leaving `isActive=true` and
/// an `activeTabId` behind. The next incarnation's reconciliation must
/// clean it up before the first new session attaches.
#[tokio::test]
async fn stale_record_from_a_killed_host_is_cleaned_before_first_session() {
    let driver = Arc::new(StubDriver::new(StubPage::default()));
    let controller = test_controller(driver);

    let mut stale = PersistentSessionRecord {
        active_tab: Some(TabHandle(1)),
        session_id: Some(SessionId::new()),
        is_active: true,
        last_update: None,
    };
    stale.touch();
    controller.store().save(&stale).await.unwrap();

    controller.reconcile_on_startup().await.unwrap();
    assert_eq!(controller.state().await, session_controller::SessionState::Idle);

    let tab = controller.start(SessionId::new(), None).await.unwrap();
    assert_eq!(tab, TabHandle(1));
}

/// A policy that clicks the same dead selector three times in a row gets
/// switched to a JS click on the second attempt and a submit on the third;
/// the loop keeps going rather than spinning forever.
#[tokio::test]
async fn repeated_clicks_on_a_dead_selector_escalate_instead_of_looping_forever() {
    let driver = Arc::new(StubDriver::new(StubPage::default()));
    for _ in 0..3 {
        driver.queue_click_result(None);
    }

    let session_id = SessionId::new();
    let mut click = Action::new(ActionKind::Click);
    click.selector = Some("button.btn-search".into());

    let mut script: Vec<ServerMessage> = (0..3).map(|_| action_message(&session_id, click.clone())).collect();
    let mut done = Action::new(ActionKind::Done);
    done.thought = Some("gave up".into());
    script.push(action_message(&session_id, done));

    let bridge = Arc::new(ScriptedBridge::new(script));
    let mut config = AgentLoopConfig::default();
    config.max_steps = 10;
    let agent_loop = AgentLoop::new(driver, bridge, config);

    let outcome = agent_loop
        .run(TabHandle(1), session_id, "search for something".into(), Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.steps_taken, 4);
}

/// A bridge that hands back exactly one action and, as it does, flips the
/// stop flag — modeling an external `stop` request arriving while the loop
/// is in the middle of acting on the step it already committed to.
struct StopMidActionBridge {
    session_id: SessionId,
    action: Mutex<Option<Action>>,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl BridgeTransport for StopMidActionBridge {
    async fn send(&self, _message: ControllerMessage) -> Result<(), AgentError> {
        Ok(())
    }

    async fn recv(&self) -> Option<ServerMessage> {
        let action = self.action.lock().await.take()?;
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        Some(action_message(&self.session_id, action))
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }
}

/// Stopping the session sets the stop flag the loop checks before every
/// observation; an in-flight action still finishes, but no further
/// observation is sent once the flag is seen.
#[tokio::test]
async fn stop_during_action_halts_the_loop_without_completing() {
    let driver = Arc::new(StubDriver::new(StubPage::default()));
    let stopped = Arc::new(AtomicBool::new(false));
    let session_id = SessionId::new();

    let mut wait = Action::new(ActionKind::Wait);
    wait.thought = None;
    let bridge = Arc::new(StopMidActionBridge {
        session_id: session_id.clone(),
        action: Mutex::new(Some(wait)),
        stopped: stopped.clone(),
    });

    let mut config = AgentLoopConfig::default();
    config.wait_after_click_ms = 0;
    let agent_loop = AgentLoop::new(driver, bridge, config);

    let outcome = agent_loop
        .run(TabHandle(1), session_id, "stay idle".into(), stopped)
        .await
        .unwrap();

    assert!(!outcome.completed);
    assert!(outcome.stopped_externally, "the flag flips while the first action is in flight, so the loop must stop before a second observation");
    assert_eq!(outcome.steps_taken, 1);
}
