//! Chrome DevTools Protocol driver.
//!
//! Owns exactly one browser attachment at a time and exposes the
//! navigate/click/type/observe surface the agent loop drives a page with,
//! including the selector-resolution and click fallback ladder.

pub mod config;
pub mod driver;
pub mod metrics;
pub mod registry;
pub mod stub;
pub mod transport;
mod util;

pub use config::CdpConfig;
pub use driver::{CdpDriver, ChromiumDriver, ClickOutcome, PageState};
pub use registry::{AttachmentContext, Registry};
pub use stub::{StubDriver, StubPage};
pub use transport::{CdpTransport, ChromiumTransport, CommandTarget, NoopTransport, TransportEvent};

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{AgentErrorKind, TabHandle};
    use serde_json::json;

    #[tokio::test]
    async fn noop_transport_reports_protocol_error() {
        let transport = NoopTransport::default();
        let err = transport
            .send_command(CommandTarget::Browser, "Page.navigate", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Protocol);
    }

    #[tokio::test]
    async fn attach_without_transport_rejects_cleanly() {
        let driver = ChromiumDriver::new(
            NoopTransport::default(),
            CdpConfig::default(),
            routing_fabric::Router::new(),
        );
        let err = driver.attach(TabHandle(1)).await;
        assert!(err.is_ok(), "attach only fails once a command is attempted against a dead transport");
        let nav_err = driver.navigate(TabHandle(1), "https://example.com").await;
        assert!(nav_err.is_err());
    }
}
