//! Best-effort message dispatch between the UI, controller, driver-adjacent
//! subscribers, and sidecar.
//!
//! Every send is infallible from the producer's point of view: a missing
//! listener is not an error, and a listener whose `target` doesn't match a
//! message just treats it as a no-match sentinel and keeps waiting rather
//! than returning an error to the router.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Where an inbound message should be handled. Mirrors the two execution
/// contexts a host may split the controller across.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    Controller,
    Sidecar,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub target: RouteTarget,
    pub kind: String,
    pub payload: serde_json::Value,
}

const CHANNEL_CAPACITY: usize = 256;

/// The fabric itself: a broadcast channel every listener subscribes to
/// independently, so a slow or absent listener never blocks another.
#[derive(Clone)]
pub struct Router {
    sender: broadcast::Sender<RoutedMessage>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Best-effort send: if nobody is listening right now, the message is
    /// simply dropped rather than treated as a failure.
    pub fn send(&self, message: RoutedMessage) {
        let _ = self.sender.send(message);
    }

    /// Subscribes a listener bound to one `RouteTarget`. Messages tagged
    /// for the other target are treated as no-match and skipped
    /// transparently by `recv`.
    pub fn subscribe(&self, target: RouteTarget) -> Subscription {
        Subscription {
            target,
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct Subscription {
    target: RouteTarget,
    receiver: broadcast::Receiver<RoutedMessage>,
}

impl Subscription {
    /// Waits for the next message addressed to this subscription's
    /// target, silently skipping ones addressed elsewhere. Returns `None`
    /// once the router itself has been dropped.
    pub async fn recv(&mut self) -> Option<RoutedMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if message.target == self.target => return Some(message),
                Ok(other) => {
                    trace!(target: "routing-fabric", kind = %other.kind, "no-match sentinel, skipping");
                    continue;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(target: "routing-fabric", skipped, "subscriber lagged; some messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_only_sees_its_own_target() {
        let router = Router::new();
        let mut controller_sub = router.subscribe(RouteTarget::Controller);
        let mut sidecar_sub = router.subscribe(RouteTarget::Sidecar);

        router.send(RoutedMessage {
            target: RouteTarget::Sidecar,
            kind: "reload_extension".into(),
            payload: serde_json::json!({}),
        });
        router.send(RoutedMessage {
            target: RouteTarget::Controller,
            kind: "start_automation".into(),
            payload: serde_json::json!({"goal": "search"}),
        });

        let for_sidecar = sidecar_sub.recv().await.unwrap();
        assert_eq!(for_sidecar.kind, "reload_extension");

        let for_controller = controller_sub.recv().await.unwrap();
        assert_eq!(for_controller.kind, "start_automation");
    }

    #[test]
    fn send_with_no_listeners_does_not_panic() {
        let router = Router::new();
        router.send(RoutedMessage {
            target: RouteTarget::Controller,
            kind: "ping".into(),
            payload: serde_json::json!(null),
        });
    }
}
