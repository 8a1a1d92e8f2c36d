//! Connection state machine for a single accepted peer.
//!
//! Each connection owns its stream, the peer address and a read buffer,
//! and moves `Connected -> Disconnected` exactly once.

use crate::protocols::echo::parser::{self, ParseResult};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted and still reading lines.
    Connected,
    /// Stream ended, failed, or sent an over-long line.
    Disconnected,
}

/// Why a connection stopped reading.
#[derive(Debug)]
pub enum CloseReason {
    /// Peer closed its write side.
    Eof,
    /// A line exceeded the configured maximum length.
    LineTooLong,
    /// Read or write failed.
    Io(io::Error),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "end of stream"),
            CloseReason::LineTooLong => write!(f, "line too long"),
            CloseReason::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CloseReason {}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_line_length: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection in the connected state.
    pub fn new(stream: S, peer: SocketAddr, max_line_length: usize) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Connected,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE.min(max_line_length)),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
            max_line_length,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Read the next line, without its terminator.
    ///
    /// Returns `Err` with the close reason once the connection is done;
    /// the state is then `Disconnected` and further calls keep failing
    /// with `Eof`.
    pub async fn read_line(&mut self) -> Result<Bytes, CloseReason> {
        if self.state == ConnState::Disconnected {
            return Err(CloseReason::Eof);
        }

        loop {
            match parser::parse(&self.read_buf, self.max_line_length) {
                ParseResult::Complete(line, consumed) => {
                    let line = Bytes::copy_from_slice(line);
                    self.read_buf.advance(consumed);
                    return Ok(line);
                }
                ParseResult::TooLong => return Err(self.close(CloseReason::LineTooLong)),
                ParseResult::Incomplete => {}
            }

            match self.stream.read_buf(&mut self.read_buf).await {
                Ok(0) => {
                    // Unterminated data at end-of-stream is a final line
                    if let Some(line) = parser::parse_final(&self.read_buf) {
                        let line = Bytes::copy_from_slice(line);
                        self.read_buf.clear();
                        return Ok(line);
                    }
                    trace!(peer = %self.peer, "Connection closed by client");
                    return Err(self.close(CloseReason::Eof));
                }
                Ok(_) => {}
                Err(e) => return Err(self.close(CloseReason::Io(e))),
            }
        }
    }

    /// Write `Echo: <line>\n` back to the peer.
    pub async fn write_echo(&mut self, line: &[u8]) -> Result<(), CloseReason> {
        self.write_buf.clear();
        parser::response(line, &mut self.write_buf);

        if let Err(e) = self.stream.write_all(&self.write_buf).await {
            return Err(self.close(CloseReason::Io(e)));
        }
        if let Err(e) = self.stream.flush().await {
            return Err(self.close(CloseReason::Io(e)));
        }
        Ok(())
    }

    fn close(&mut self, reason: CloseReason) -> CloseReason {
        self.state = ConnState::Disconnected;
        self.read_buf.clear();
        reason
    }
}
