//! The driver: attach/detach bookkeeping plus the selector-resolved
//! click/type operations an agent loop drives a page with.
//!
//! Everything here goes over raw CDP commands (`Target.*`, `DOM.*`,
//! `Input.*`, `Runtime.*`, `Page.*`) rather than a typed page object, so the
//! click/type fallback ladders below have full control over what is sent
//! and in what order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use core_types::{AgentError, AgentErrorKind, ClickMethod, InteractiveElement, TabHandle};
use routing_fabric::{RouteTarget, Router, RoutedMessage};

use crate::config::CdpConfig;
use crate::metrics;
use crate::registry::Registry;
use crate::transport::{CdpTransport, CommandTarget};

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub ready_state: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClickOutcome {
    pub method_used: ClickMethod,
    pub navigated: bool,
}

#[async_trait]
pub trait CdpDriver: Send + Sync {
    async fn attach(&self, tab: TabHandle) -> Result<(), AgentError>;
    async fn detach(&self, tab: TabHandle) -> Result<(), AgentError>;
    async fn navigate(&self, tab: TabHandle, url: &str) -> Result<(), AgentError>;
    async fn evaluate(&self, tab: TabHandle, expression: &str) -> Result<Value, AgentError>;
    async fn click_at(&self, tab: TabHandle, x: f64, y: f64) -> Result<(), AgentError>;
    async fn click_element(
        &self,
        tab: TabHandle,
        selector: &str,
        method: ClickMethod,
    ) -> Result<ClickOutcome, AgentError>;
    /// Focuses the element and sends Enter; used for the loop's
    /// submit-on-third-consecutive-click escalation.
    async fn submit_via_enter(&self, tab: TabHandle, selector: &str) -> Result<(), AgentError>;
    async fn type_text(&self, tab: TabHandle, text: &str) -> Result<(), AgentError>;
    async fn type_in_element(
        &self,
        tab: TabHandle,
        selector: &str,
        text: &str,
    ) -> Result<(), AgentError>;
    async fn scroll(&self, tab: TabHandle, dy: f64) -> Result<(), AgentError>;
    async fn capture_screenshot(&self, tab: TabHandle) -> Result<String, AgentError>;
    async fn get_page_state(&self, tab: TabHandle) -> Result<PageState, AgentError>;
    async fn get_clickable_elements(
        &self,
        tab: TabHandle,
    ) -> Result<Vec<InteractiveElement>, AgentError>;
}

pub struct ChromiumDriver<T: CdpTransport> {
    transport: Arc<T>,
    registry: Arc<Registry>,
    cfg: CdpConfig,
    url_counter: AtomicU64,
    event_pump: JoinHandle<()>,
}

impl<T: CdpTransport + 'static> ChromiumDriver<T> {
    /// Wires the driver to the routing fabric so a browser-initiated
    /// detach (tab closed, user revoked the debugger) reaches whoever is
    /// listening as `RouteTarget::Controller` instead of being silently
    /// swallowed by the transport's event stream.
    pub fn new(transport: T, cfg: CdpConfig, router: Router) -> Self {
        let transport = Arc::new(transport);
        let registry = Arc::new(Registry::new());

        let pump_transport = transport.clone();
        let pump_registry = registry.clone();
        let event_pump = tokio::spawn(async move {
            Self::pump_events(pump_transport, pump_registry, router).await;
        });

        Self {
            transport,
            registry,
            cfg,
            url_counter: AtomicU64::new(0),
            event_pump,
        }
    }

    /// Forwards host-initiated detach events: the browser can tear down an
    /// attachment on its own (tab closed, user revoked the debugger), and
    /// when it does there is no CDP command left to send — only
    /// bookkeeping to clear and a message to route onward.
    async fn pump_events(transport: Arc<T>, registry: Arc<Registry>, router: Router) {
        while let Some(event) = transport.next_event().await {
            if event.method != "Target.detachedFromTarget" {
                continue;
            }
            let session_id = event
                .session_id
                .clone()
                .or_else(|| event.params.get("sessionId").and_then(Value::as_str).map(str::to_string));

            let Some(session_id) = session_id else { continue };
            let Some(tab) = registry.tab_for_session(&session_id) else { continue };

            registry.remove(tab);
            info!(target: "cdp-driver", tab = tab.0, "host-initiated detach observed; marked detached without cleanup calls");
            router.send(RoutedMessage {
                target: RouteTarget::Controller,
                kind: "target_detached".to_string(),
                payload: json!({ "tab": tab.0 }),
            });
        }
    }

    async fn session_for(&self, tab: TabHandle) -> Result<String, AgentError> {
        self.registry.cdp_session(tab).ok_or_else(|| {
            AgentError::new(AgentErrorKind::Stopped)
                .with_hint(format!("tab {tab} is not attached"))
        })
    }

    #[instrument(level = "debug", skip(self, params))]
    async fn send(&self, tab: TabHandle, method: &str, params: Value) -> Result<Value, AgentError> {
        let session = self.session_for(tab).await?;
        let started = Instant::now();
        metrics::record_command();

        let result = self
            .transport
            .send_command(CommandTarget::Session(session), method, params)
            .await;

        match &result {
            Ok(_) => metrics::record_command_success(started.elapsed()),
            Err(_) => metrics::record_command_failure(),
        }
        result
    }

    /// Scrolls the selector's element to viewport centre and returns its
    /// centre-point rectangle only if it is positive-sized and on-screen;
    /// the coordinate-click step must never fire on a collapsed or
    /// off-screen element.
    async fn scrolled_center_rect(
        &self,
        tab: TabHandle,
        selector: &str,
    ) -> Result<(f64, f64), AgentError> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return null; \
             el.scrollIntoView({{block: 'center', inline: 'center'}}); \
             const r = el.getBoundingClientRect(); \
             if (r.width <= 0 || r.height <= 0) return null; \
             const x = r.left + r.width / 2, y = r.top + r.height / 2; \
             if (x < 0 || y < 0 || x > 2000 || y > 2000) return null; \
             return {{x, y}}; }})()",
            sel = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string())
        );
        let point = self.evaluate(tab, &expr).await?;
        match (point["x"].as_f64(), point["y"].as_f64()) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(AgentError::new(AgentErrorKind::Selector)
                .with_hint(format!("element for {selector:?} is collapsed or off-screen"))),
        }
    }

    async fn dispatch_mouse_click(&self, tab: TabHandle, x: f64, y: f64) -> Result<(), AgentError> {
        let x = crate::util::clamp_coordinate(x);
        let y = crate::util::clamp_coordinate(y);
        for event_type in ["mouseMoved", "mousePressed", "mouseReleased"] {
            self.send(
                tab,
                "Input.dispatchMouseEvent",
                json!({
                    "type": event_type,
                    "x": x,
                    "y": y,
                    "button": "left",
                    "clickCount": 1,
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn js_click(&self, tab: TabHandle, selector: &str) -> Result<(), AgentError> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; el.click(); return true; }})()",
            sel = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string())
        );
        let value = self.evaluate(tab, &expr).await?;
        if value.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(AgentError::new(AgentErrorKind::Selector)
                .with_hint(format!("no element matched selector {selector:?} for js click")))
        }
    }

    async fn focus_and_enter(&self, tab: TabHandle, selector: &str) -> Result<(), AgentError> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; el.focus(); return true; }})()",
            sel = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string())
        );
        let focused = self.evaluate(tab, &expr).await?;
        if focused.as_bool() != Some(true) {
            return Err(AgentError::new(AgentErrorKind::Selector)
                .with_hint(format!("no element matched selector {selector:?} to focus")));
        }

        self.send(
            tab,
            "Input.dispatchKeyEvent",
            json!({ "type": "rawKeyDown", "key": "Enter", "code": "Enter", "windowsVirtualKeyCode": 13 }),
        )
        .await?;
        self.send(
            tab,
            "Input.dispatchKeyEvent",
            json!({ "type": "keyUp", "key": "Enter", "code": "Enter", "windowsVirtualKeyCode": 13 }),
        )
        .await?;
        Ok(())
    }

    async fn submit_nearest_form(&self, tab: TabHandle, selector: &str) -> Result<(), AgentError> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({sel}); const form = el && el.closest('form'); if (!form) return false; form.requestSubmit ? form.requestSubmit() : form.submit(); return true; }})()",
            sel = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string())
        );
        let submitted = self.evaluate(tab, &expr).await?;
        if submitted.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(AgentError::new(AgentErrorKind::Selector)
                .with_hint(format!("no enclosing form for selector {selector:?}")))
        }
    }

    async fn url_and_title(&self, tab: TabHandle) -> Result<(String, String), AgentError> {
        let value = self
            .evaluate(tab, "({url: location.href, title: document.title, readyState: document.readyState})")
            .await?;
        let url = value["url"].as_str().unwrap_or_default().to_string();
        let title = value["title"].as_str().unwrap_or_default().to_string();
        Ok((url, title))
    }

    /// Extracts the quoted text out of a `:contains('Foo')`/`:contains("Foo")`
    /// fragment, scrolls the first matching anchor or button into view, and
    /// clicks its centre. Used when a selector carries jQuery-only syntax no
    /// `DOM.querySelector` call will ever resolve.
    async fn text_fallback_click(&self, tab: TabHandle, selector: &str) -> Result<(), AgentError> {
        let text = extract_contains_text(selector).ok_or_else(|| {
            AgentError::new(AgentErrorKind::Selector)
                .with_hint(format!("invalid selector {selector:?}"))
        })?;

        let expr = format!(
            "(() => {{ const needle = {needle}; const els = Array.from(document.querySelectorAll('a, button')); \
             const el = els.find((e) => (e.innerText || e.textContent || '').includes(needle)); \
             if (!el) return null; el.scrollIntoView({{block: 'center', inline: 'center'}}); \
             const r = el.getBoundingClientRect(); return {{x: r.left + r.width / 2, y: r.top + r.height / 2}}; }})()",
            needle = serde_json::to_string(&text).unwrap_or_else(|_| "\"\"".to_string())
        );
        let point = self.evaluate(tab, &expr).await?;
        let x = point["x"].as_f64();
        let y = point["y"].as_f64();
        match (x, y) {
            (Some(x), Some(y)) => self.dispatch_mouse_click(tab, x, y).await,
            _ => Err(AgentError::new(AgentErrorKind::Selector)
                .with_hint(format!("no anchor or button contains text {text:?}"))),
        }
    }
}

/// Selectors coming from a jQuery-flavoured policy (`:contains(...)`,
/// `:has(...)`, a bare `$(`) never resolve against `DOM.querySelector`; this
/// is the heuristic the text-fallback path gates on.
fn is_jquery_style_selector(selector: &str) -> bool {
    selector.contains(":contains(")
        || selector.contains(":has(")
        || selector.trim_start().starts_with('$')
}

fn extract_contains_text(selector: &str) -> Option<String> {
    let start = selector.find(":contains(")? + ":contains(".len();
    let rest = &selector[start..];
    let end = rest.find(')')?;
    let inner = rest[..end].trim();
    let unquoted = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(inner);
    if unquoted.is_empty() {
        None
    } else {
        Some(unquoted.to_string())
    }
}

#[async_trait]
impl<T: CdpTransport> CdpDriver for ChromiumDriver<T> {
    #[instrument(level = "info", skip(self))]
    async fn attach(&self, tab: TabHandle) -> Result<(), AgentError> {
        if self.registry.is_attached(tab) {
            return Ok(());
        }
        if self.registry.has_conflicting_attachment(tab) {
            return Err(AgentError::new(AgentErrorKind::AttachmentConflict)
                .with_hint("another tab already holds this process's cdp attachment"));
        }

        self.transport.start().await?;

        let target_id = format!("target-{}", tab.0);
        let session_id = format!("session-{}", self.url_counter.fetch_add(1, Ordering::Relaxed));

        let attach_result = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await;

        let resolved_session = match attach_result {
            Ok(value) => value["sessionId"].as_str().map(str::to_string).unwrap_or(session_id),
            Err(err) => {
                warn!(target: "cdp-driver", ?err, "Target.attachToTarget failed; continuing with synthesized session");
                session_id
            }
        };

        self.registry.insert(tab, Some(target_id), Some(resolved_session.clone()));

        for (domain, method) in [
            ("DOM", "DOM.enable"),
            ("Page", "Page.enable"),
            ("Runtime", "Runtime.enable"),
            ("Network", "Network.enable"),
        ] {
            if let Err(err) = self
                .transport
                .send_command(CommandTarget::Session(resolved_session.clone()), method, json!({}))
                .await
            {
                debug!(target: "cdp-driver", domain, ?err, "domain enable failed");
            }
        }

        info!(target: "cdp-driver", tab = tab.0, "attached");
        Ok(())
    }

    #[instrument(level = "info", skip(self))]
    async fn detach(&self, tab: TabHandle) -> Result<(), AgentError> {
        if let Some(ctx) = self.registry.get(tab) {
            if let Some(session) = ctx.cdp_session {
                let _ = self
                    .transport
                    .send_command(
                        CommandTarget::Browser,
                        "Target.detachFromTarget",
                        json!({ "sessionId": session }),
                    )
                    .await;
            }
        }
        self.registry.remove(tab);
        Ok(())
    }

    async fn navigate(&self, tab: TabHandle, url: &str) -> Result<(), AgentError> {
        self.send(tab, "Page.navigate", json!({ "url": url })).await?;
        Ok(())
    }

    async fn evaluate(&self, tab: TabHandle, expression: &str) -> Result<Value, AgentError> {
        let response = self
            .send(
                tab,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(exception) = response.get("exceptionDetails") {
            let text = exception["exception"]["description"]
                .as_str()
                .unwrap_or("javascript evaluation threw")
                .to_string();
            return Err(AgentError::new(AgentErrorKind::Evaluation).with_hint(text));
        }

        Ok(response["result"]["value"].clone())
    }

    async fn click_at(&self, tab: TabHandle, x: f64, y: f64) -> Result<(), AgentError> {
        self.dispatch_mouse_click(tab, x, y).await
    }

    /// Four-layer fallback: coordinate click on the resolved box, then a
    /// synthetic `.click()`, then focus+Enter, then submit the nearest form.
    #[instrument(level = "debug", skip(self))]
    async fn click_element(
        &self,
        tab: TabHandle,
        selector: &str,
        method: ClickMethod,
    ) -> Result<ClickOutcome, AgentError> {
        let (before_url, _) = self.url_and_title(tab).await.unwrap_or_default();

        if is_jquery_style_selector(selector) {
            return if self.text_fallback_click(tab, selector).await.is_ok() {
                let navigated = self.settled_navigation(tab, &before_url).await;
                Ok(ClickOutcome { method_used: ClickMethod::Auto, navigated })
            } else {
                metrics::record_click_fallback_failed();
                Err(AgentError::new(AgentErrorKind::Selector)
                    .with_hint(format!("invalid selector {selector:?}")))
            };
        }

        if matches!(method, ClickMethod::Auto) {
            if let Ok((x, y)) = self.scrolled_center_rect(tab, selector).await {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if self.dispatch_mouse_click(tab, x, y).await.is_ok() {
                    let navigated = self.settled_navigation(tab, &before_url).await;
                    return Ok(ClickOutcome { method_used: ClickMethod::Auto, navigated });
                }
            }
        }

        if self.js_click(tab, selector).await.is_ok() {
            metrics::record_click_fallback_js();
            let navigated = self.settled_navigation(tab, &before_url).await;
            return Ok(ClickOutcome { method_used: ClickMethod::Js, navigated });
        }

        if self.focus_and_enter(tab, selector).await.is_ok() {
            metrics::record_click_fallback_focus();
            let navigated = self.settled_navigation(tab, &before_url).await;
            return Ok(ClickOutcome { method_used: ClickMethod::Focus, navigated });
        }

        if self.submit_nearest_form(tab, selector).await.is_ok() {
            metrics::record_click_fallback_focus();
            let navigated = self.settled_navigation(tab, &before_url).await;
            return Ok(ClickOutcome { method_used: ClickMethod::Focus, navigated });
        }

        metrics::record_click_fallback_failed();
        Err(AgentError::new(AgentErrorKind::Selector)
            .with_hint(format!("every click strategy failed for selector {selector:?}")))
    }

    async fn submit_via_enter(&self, tab: TabHandle, selector: &str) -> Result<(), AgentError> {
        self.focus_and_enter(tab, selector).await
    }

    /// Inserts text atomically via the protocol's text-insertion primitive;
    /// per-character `Input.dispatchKeyEvent` dispatch double-types on some
    /// platforms.
    async fn type_text(&self, tab: TabHandle, text: &str) -> Result<(), AgentError> {
        self.send(tab, "Input.insertText", json!({ "text": text })).await?;
        Ok(())
    }

    /// Clears the field through three textually distinct mechanisms before
    /// typing: a JS value reset (works for `<input>`/`<textarea>`), a
    /// keyboard select-all-then-backspace (the only thing that clears a
    /// `[contenteditable=true]` field, which has no `.value`), then a
    /// verify-and-force pass for whatever is left over.
    async fn type_in_element(
        &self,
        tab: TabHandle,
        selector: &str,
        text: &str,
    ) -> Result<(), AgentError> {
        let sel_json = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());

        let focus_expr = format!(
            "(() => {{ const el = document.querySelector({sel_json}); if (!el) return false; \
             el.focus(); return true; }})()"
        );
        if self.evaluate(tab, &focus_expr).await?.as_bool() != Some(true) {
            return Err(AgentError::new(AgentErrorKind::Selector)
                .with_hint(format!("no element matched selector {selector:?} to clear")));
        }

        // 1. JS value reset: the cheap path for plain form controls.
        let reset_expr = format!(
            "(() => {{ const el = document.querySelector({sel_json}); if (!el) return false; \
             if ('value' in el) el.value = ''; \
             el.dispatchEvent(new Event('input', {{bubbles: true}})); \
             el.dispatchEvent(new Event('change', {{bubbles: true}})); return true; }})()"
        );
        self.evaluate(tab, &reset_expr).await?;

        // 2. Platform-agnostic select-all (Meta+A and Control+A) then
        // Backspace: the only mechanism that reaches a contenteditable node.
        for modifiers in [4, 2] {
            self.send(
                tab,
                "Input.dispatchKeyEvent",
                json!({ "type": "keyDown", "key": "a", "code": "KeyA", "modifiers": modifiers }),
            )
            .await?;
            self.send(
                tab,
                "Input.dispatchKeyEvent",
                json!({ "type": "keyUp", "key": "a", "code": "KeyA", "modifiers": modifiers }),
            )
            .await?;
        }
        self.send(
            tab,
            "Input.dispatchKeyEvent",
            json!({ "type": "rawKeyDown", "key": "Backspace", "code": "Backspace", "windowsVirtualKeyCode": 8 }),
        )
        .await?;
        self.send(
            tab,
            "Input.dispatchKeyEvent",
            json!({ "type": "keyUp", "key": "Backspace", "code": "Backspace", "windowsVirtualKeyCode": 8 }),
        )
        .await?;

        // 3. Verify empty and force-clear whatever the first two steps missed.
        let verify_expr = format!(
            "(() => {{ const el = document.querySelector({sel_json}); if (!el) return false; \
             const content = 'value' in el ? el.value : el.textContent; \
             if (content && content.length > 0) {{ \
               if ('value' in el) el.value = ''; else el.textContent = ''; \
               el.dispatchEvent(new Event('input', {{bubbles: true}})); \
             }} \
             return true; }})()"
        );
        self.evaluate(tab, &verify_expr).await?;

        self.type_text(tab, text).await?;

        let commit_expr = format!(
            "(() => {{ const el = document.querySelector({sel_json}); if (!el) return false; \
             el.dispatchEvent(new Event('change', {{bubbles: true}})); return true; }})()"
        );
        self.evaluate(tab, &commit_expr).await?;
        Ok(())
    }

    async fn scroll(&self, tab: TabHandle, dy: f64) -> Result<(), AgentError> {
        self.send(
            tab,
            "Input.dispatchMouseEvent",
            json!({
                "type": "mouseWheel",
                "x": 0,
                "y": 0,
                "deltaX": 0.0,
                "deltaY": dy,
            }),
        )
        .await?;
        Ok(())
    }

    async fn capture_screenshot(&self, tab: TabHandle) -> Result<String, AgentError> {
        let response = self
            .send(
                tab,
                "Page.captureScreenshot",
                json!({ "format": "jpeg", "quality": core_types::OBSERVATION_SCREENSHOT_QUALITY }),
            )
            .await?;
        response["data"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                AgentError::new(AgentErrorKind::Protocol).with_hint("screenshot response missing data")
            })
    }

    async fn get_page_state(&self, tab: TabHandle) -> Result<PageState, AgentError> {
        let value = self
            .evaluate(tab, "({url: location.href, title: document.title, readyState: document.readyState})")
            .await?;
        Ok(PageState {
            url: value["url"].as_str().unwrap_or_default().to_string(),
            title: value["title"].as_str().unwrap_or_default().to_string(),
            ready_state: value["readyState"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn get_clickable_elements(
        &self,
        tab: TabHandle,
    ) -> Result<Vec<InteractiveElement>, AgentError> {
        let script = include_str!("scripts/clickable_elements.js");
        let value = self.evaluate(tab, script).await?;
        let elements: Vec<InteractiveElement> = serde_json::from_value(value).map_err(|err| {
            AgentError::new(AgentErrorKind::Evaluation)
                .with_hint(format!("clickable elements script returned unexpected shape: {err}"))
        })?;
        Ok(elements
            .into_iter()
            .take(core_types::MAX_CLICKABLE_CANDIDATES)
            .collect())
    }
}

impl<T: CdpTransport> ChromiumDriver<T> {
    /// Polls for a short window to see whether the URL changed, the
    /// cheapest signal the loop above uses to tell a real navigation from a
    /// click that landed but did nothing.
    async fn settled_navigation(&self, tab: TabHandle, before_url: &str) -> bool {
        let deadline = Duration::from_millis(self.cfg.default_deadline_ms.min(1_500));
        let started = Instant::now();
        while started.elapsed() < deadline {
            if let Ok((url, _)) = self.url_and_title(tab).await {
                if url != before_url && !url.is_empty() {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }
}

impl<T: CdpTransport> Drop for ChromiumDriver<T> {
    fn drop(&mut self) {
        self.event_pump.abort();
    }
}
