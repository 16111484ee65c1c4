//! The raw duplex byte channel underneath the bridge. Abstracted behind a
//! trait so tests can swap in an in-memory pair instead of a real TCP
//! connection to a policy server.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use core_types::{AgentError, AgentErrorKind};

#[async_trait]
pub trait Socket: Send + Sync {
    async fn write_line(&mut self, line: &str) -> Result<(), AgentError>;
    async fn read_line(&mut self) -> Result<Option<String>, AgentError>;
}

pub struct TcpSocket {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl TcpSocket {
    pub async fn connect(addr: &str) -> Result<Self, AgentError> {
        let stream = TcpStream::connect(addr).await.map_err(|err| {
            AgentError::new(AgentErrorKind::Transport)
                .with_hint(format!("connect to {addr}: {err}"))
                .retriable(true)
        })?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn write_line(&mut self, line: &str) -> Result<(), AgentError> {
        self.writer.write_all(line.as_bytes()).await.map_err(|err| {
            AgentError::new(AgentErrorKind::Transport)
                .with_hint(err.to_string())
                .retriable(true)
        })?;
        self.writer.write_all(b"\n").await.map_err(|err| {
            AgentError::new(AgentErrorKind::Transport)
                .with_hint(err.to_string())
                .retriable(true)
        })
    }

    async fn read_line(&mut self) -> Result<Option<String>, AgentError> {
        let mut buf = String::new();
        let bytes = self.reader.read_line(&mut buf).await.map_err(|err| {
            AgentError::new(AgentErrorKind::Transport)
                .with_hint(err.to_string())
                .retriable(true)
        })?;
        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some(buf.trim_end_matches(['\n', '\r']).to_string()))
    }
}

/// An in-process pair used by the sidecar facade and by tests; writes on
/// one end become reads on the other.
pub struct ChannelSocket {
    tx: tokio::sync::mpsc::Sender<String>,
    rx: tokio::sync::mpsc::Receiver<String>,
}

impl ChannelSocket {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = tokio::sync::mpsc::channel(256);
        let (b_tx, a_rx) = tokio::sync::mpsc::channel(256);
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

#[async_trait]
impl Socket for ChannelSocket {
    async fn write_line(&mut self, line: &str) -> Result<(), AgentError> {
        self.tx.send(line.to_string()).await.map_err(|_| {
            AgentError::new(AgentErrorKind::Transport).with_hint("channel socket peer dropped")
        })
    }

    async fn read_line(&mut self) -> Result<Option<String>, AgentError> {
        Ok(self.rx.recv().await)
    }
}
