//! Echo protocol handler for the Tokio runtime.

use crate::connection::{CloseReason, ConnState, Connection};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Handle an echo protocol connection.
///
/// Reads lines until the stream ends or fails and answers each one with
/// `Echo: <line>\n`. The disconnect is logged on every exit path and the
/// stream is dropped (closed) when this returns.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    max_line_length: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(stream, peer, max_line_length);
    info!(peer = %peer, "Connected to: {}", peer);

    let reason = loop {
        let line = match conn.read_line().await {
            Ok(line) => line,
            Err(reason) => break reason,
        };

        info!(
            peer = %peer,
            "Received from {}: {}",
            peer,
            String::from_utf8_lossy(&line)
        );

        if let Err(reason) = conn.write_echo(&line).await {
            break reason;
        }
    };

    debug_assert_eq!(conn.state(), ConnState::Disconnected);
    info!(peer = %peer, "Disconnected: {}", peer);

    match reason {
        CloseReason::Eof => Ok(()),
        CloseReason::LineTooLong => {
            warn!(peer = %peer, max_line_length, "Line too long, closing connection");
            Err(CloseReason::LineTooLong.into())
        }
        CloseReason::Io(e) => {
            debug!(peer = %peer, error = %e, "Connection I/O error");
            Err(e.into())
        }
    }
}
