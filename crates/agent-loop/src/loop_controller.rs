//! Drives the observation/action cycle for one session: produce an
//! observation, await a policy action, normalize and execute it, repeat
//! until the policy signals `done`, the step cap is hit, or the session
//! is stopped out from under the loop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use bridge_transport::{BridgeTransport, ControllerMessage, ServerMessage};
use cdp_driver::CdpDriver;
use core_types::{
    Action, ActionKind, ActionRecord, AgentError, AgentErrorKind, Observation, SessionId,
    TabHandle, MAX_ACTION_LOG_LEN, MAX_CLICKABLE_CANDIDATES, MAX_OBSERVATION_ELEMENTS,
    MAX_RECENT_ACTIONS_IN_OBSERVATION,
};

use crate::config::AgentLoopConfig;
use crate::escalation::RepeatTracker;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentLoopOutcome {
    pub completed: bool,
    pub stopped_externally: bool,
    pub steps_taken: u32,
    pub summary: Option<String>,
}

pub struct AgentLoop<D: CdpDriver, B: BridgeTransport> {
    driver: Arc<D>,
    bridge: Arc<B>,
    config: AgentLoopConfig,
}

impl<D: CdpDriver, B: BridgeTransport> AgentLoop<D, B> {
    pub fn new(driver: Arc<D>, bridge: Arc<B>, config: AgentLoopConfig) -> Self {
        Self { driver, bridge, config }
    }

    #[instrument(level = "info", skip(self, stopped))]
    pub async fn run(
        &self,
        tab: TabHandle,
        session_id: SessionId,
        task: String,
        stopped: Arc<AtomicBool>,
    ) -> Result<AgentLoopOutcome, AgentError> {
        let mut action_log: Vec<ActionRecord> = Vec::new();
        let mut tracker = RepeatTracker::new();
        let no_nav_streak = AtomicU32::new(0);
        let mut last_action_error: Option<String> = None;
        let mut step: u32 = 0;

        loop {
            if stopped.load(Ordering::SeqCst) {
                return Ok(AgentLoopOutcome {
                    completed: false,
                    stopped_externally: true,
                    steps_taken: step,
                    summary: None,
                });
            }

            step += 1;

            let observation = self
                .build_observation(tab, &task, &action_log, last_action_error.take())
                .await?;

            self.bridge
                .send(ControllerMessage::Observation {
                    session_id: session_id.clone(),
                    step_number: step,
                    observation: serde_json::to_value(&observation).map_err(|err| {
                        AgentError::new(AgentErrorKind::Internal).with_hint(err.to_string())
                    })?,
                })
                .await?;

            let mut action = match self.await_action(&session_id).await? {
                Some(action) => action,
                None => {
                    return Err(AgentError::new(AgentErrorKind::Transport)
                        .with_hint("bridge closed before an action arrived")
                        .retriable(true))
                }
            };

            if action.done || action.kind == ActionKind::Done {
                return Ok(AgentLoopOutcome {
                    completed: true,
                    stopped_externally: false,
                    steps_taken: step,
                    summary: action.thought.take(),
                });
            }

            if step >= self.config.max_steps {
                return Ok(AgentLoopOutcome {
                    completed: false,
                    stopped_externally: false,
                    steps_taken: step,
                    summary: None,
                });
            }

            tracker.apply_and_record(&mut action);

            let (success, post_url, error, navigated) =
                self.execute(tab, &action).await;

            if action.kind == ActionKind::Click && success {
                if navigated.unwrap_or(true) {
                    no_nav_streak.store(0, Ordering::SeqCst);
                } else {
                    let streak = no_nav_streak.fetch_add(1, Ordering::SeqCst) + 1;
                    if streak >= self.config.no_nav_click_threshold {
                        last_action_error = Some(format!(
                            "CLICK DID NOT NAVIGATE: clicking {:?} {} times in a row produced no \
                             page change. Try a different selector or navigate directly.",
                            action.selector_text(),
                            streak
                        ));
                        no_nav_streak.store(0, Ordering::SeqCst);
                    }
                }
            }

            record(&mut action_log, ActionRecord {
                kind: action.kind.clone(),
                selector: action.selector.clone(),
                success,
                post_url,
                error: error.clone(),
                step_index: step,
            });

            if error.is_some() && last_action_error.is_none() {
                last_action_error = error;
            }
        }
    }

    async fn await_action(&self, session_id: &SessionId) -> Result<Option<Action>, AgentError> {
        loop {
            match self.bridge.recv().await {
                Some(ServerMessage::Action { session_id: reply_session, action }) => {
                    if &reply_session != session_id {
                        continue;
                    }
                    let parsed: Action = serde_json::from_value(action).map_err(|err| {
                        AgentError::new(AgentErrorKind::Internal)
                            .with_hint(format!("malformed action from server: {err}"))
                    })?;
                    return Ok(Some(parsed));
                }
                Some(ServerMessage::Error { error }) => {
                    warn!(target: "agent-loop", %error, "server reported an error instead of an action");
                    return Err(AgentError::new(AgentErrorKind::Protocol).with_hint(error));
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    async fn build_observation(
        &self,
        tab: TabHandle,
        task: &str,
        action_log: &[ActionRecord],
        last_action_error: Option<String>,
    ) -> Result<Observation, AgentError> {
        let state = self.driver.get_page_state(tab).await?;
        let screenshot_b64 = self.driver.capture_screenshot(tab).await?;
        let screenshot = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, screenshot_b64)
            .unwrap_or_default();
        let mut elements = self.driver.get_clickable_elements(tab).await?;
        elements.truncate(MAX_OBSERVATION_ELEMENTS.min(MAX_CLICKABLE_CANDIDATES));

        let recent_actions = action_log
            .iter()
            .rev()
            .take(MAX_RECENT_ACTIONS_IN_OBSERVATION)
            .rev()
            .cloned()
            .collect();

        Ok(Observation {
            task: task.to_string(),
            url: state.url,
            title: state.title,
            screenshot,
            elements,
            recent_actions,
            progress_note: None,
            original_goal: task.to_string(),
            last_action_error,
        })
    }

    async fn execute(
        &self,
        tab: TabHandle,
        action: &Action,
    ) -> (bool, Option<String>, Option<String>, Option<bool>) {
        let result = self.dispatch(tab, action).await;
        let post_url = self
            .driver
            .get_page_state(tab)
            .await
            .ok()
            .map(|state| state.url);

        match result {
            Ok(navigated) => (true, post_url, None, navigated),
            Err(err) => (false, post_url, Some(err.to_string()), None),
        }
    }

    async fn dispatch(&self, tab: TabHandle, action: &Action) -> Result<Option<bool>, AgentError> {
        match action.kind {
            ActionKind::Click => {
                let selector = action.selector_required()?;
                let outcome = self
                    .driver
                    .click_element(tab, selector, action.click_method.unwrap_or_default())
                    .await?;
                Ok(Some(outcome.navigated))
            }
            ActionKind::Submit | ActionKind::Enter | ActionKind::Press => {
                let selector = action.selector_required()?;
                self.driver.submit_via_enter(tab, selector).await?;
                Ok(None)
            }
            ActionKind::Type | ActionKind::Input | ActionKind::Search => {
                let text = action.text.as_deref().unwrap_or_default();
                match &action.selector {
                    Some(selector) => self.driver.type_in_element(tab, selector, text).await?,
                    None => self.driver.type_text(tab, text).await?,
                }
                Ok(None)
            }
            ActionKind::ClearInput => {
                let selector = action.selector_required()?;
                self.driver.type_in_element(tab, selector, "").await?;
                Ok(None)
            }
            ActionKind::Scroll => {
                let dy = match action.direction {
                    Some(core_types::ScrollDirection::Down) | None => 400.0,
                    Some(core_types::ScrollDirection::Up) => -400.0,
                };
                self.driver.scroll(tab, dy).await?;
                Ok(None)
            }
            ActionKind::Navigate => {
                let url = action.url.as_deref().ok_or_else(|| {
                    AgentError::new(AgentErrorKind::Protocol).with_hint("navigate action missing url")
                })?;
                self.driver.navigate(tab, url).await?;
                Ok(Some(true))
            }
            ActionKind::Wait => {
                tokio::time::sleep(Duration::from_millis(self.config.wait_after_click_ms)).await;
                Ok(None)
            }
            ActionKind::Screenshot => Ok(None),
            ActionKind::Done | ActionKind::Unknown => Ok(None),
        }
    }
}

fn record(log: &mut Vec<ActionRecord>, entry: ActionRecord) {
    log.push(entry);
    if log.len() > MAX_ACTION_LOG_LEN {
        let overflow = log.len() - MAX_ACTION_LOG_LEN;
        log.drain(0..overflow);
    }
}
