//! Small helpers shared by the transport and driver modules.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;

/// Scrapes the `ws://` debugger URL Chrome prints to stderr on launch
/// (`DevTools listening on ws://127.0.0.1:PORT/devtools/browser/UUID`).
pub async fn extract_ws_url(child: &mut Child) -> std::io::Result<String> {
    let stderr = child.stderr.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "chrome child has no stderr pipe")
    })?;
    let mut lines = BufReader::new(stderr).lines();

    let result = tokio::time::timeout(Duration::from_secs(20), async {
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(idx) = line.find("ws://") {
                return Ok(line[idx..].trim().to_string());
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "chrome exited before printing a devtools websocket url",
        ))
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out waiting for chrome devtools websocket url",
        )),
    }
}

/// Clamps a floating coordinate to something safe to hand to
/// `Input.dispatchMouseEvent`, which expects finite, non-negative values.
pub fn clamp_coordinate(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.max(0.0)
}
