//! Long-lived duplex JSON-framed channel to the policy server.
//!
//! Runs either directly in the controller process (`InlineBridge`) or
//! addressed through a sidecar-hosted instance (`SidecarBridge`), so the
//! session controller keeps talking to the server across a controller-host
//! teardown as long as the sidecar survives it.

pub mod messages;
pub mod socket;
pub mod transport;

pub use messages::{parse_server_message, ControllerMessage, ServerMessage};
pub use socket::{ChannelSocket, Socket, TcpSocket};
pub use transport::{BridgeTransport, InlineBridge, SidecarBridge, SocketFactory};

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{ConnectionState, SessionId};
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    fn channel_factory(
        socket: Arc<StdMutex<Option<ChannelSocket>>>,
    ) -> SocketFactory {
        Arc::new(move || {
            let socket = socket.clone();
            Box::pin(async move {
                let taken = socket.lock().unwrap().take();
                taken
                    .map(|s| Box::new(s) as Box<dyn Socket>)
                    .ok_or_else(|| {
                        core_types::AgentError::new(core_types::AgentErrorKind::Transport)
                            .with_hint("socket already consumed")
                    })
            })
        })
    }

    #[tokio::test]
    async fn connects_and_drains_queued_message_in_order() {
        let (controller_side, server_side) = ChannelSocket::pair();
        let holder = Arc::new(StdMutex::new(Some(controller_side)));
        let bridge = InlineBridge::spawn(channel_factory(holder));

        bridge
            .send(ControllerMessage::StartSession {
                goal: "search for rust release notes".into(),
                model: "policy-v1".into(),
            })
            .await
            .unwrap();

        let mut server_side = server_side;
        let line = tokio::time::timeout(std::time::Duration::from_secs(1), server_side.read_line())
            .await
            .expect("no timeout")
            .unwrap()
            .expect("got a line");
        assert!(line.contains("start_session"));

        // Give the actor a moment to flip state after the socket write.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(bridge.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn server_message_round_trips() {
        let status = ServerMessage::Status {
            session_id: SessionId::new(),
            status: "running".into(),
            message: None,
        };
        let line = serde_json::to_string(&status).unwrap();
        let parsed = parse_server_message(&line).unwrap();
        matches!(parsed, ServerMessage::Status { .. });
    }

    #[test]
    fn unknown_message_kind_is_dropped_not_fatal() {
        assert!(parse_server_message(r#"{"type":"frobnicate"}"#).is_none());
    }
}
