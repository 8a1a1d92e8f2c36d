//! Echo protocol implementation.
//!
//! A line-oriented echo service:
//! - Client sends: `<text>\n`
//! - Server responds: `Echo: <text>\n`
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  hello\n
//! Response: Echo: hello\n
//!
//! Request:  hello\r\n
//! Response: Echo: hello\n
//! ```
//!
//! Bytes are echoed verbatim, whether or not they are valid UTF-8. A line
//! longer than the configured maximum closes the connection without a
//! response. Unterminated data at end-of-stream is echoed as a final line.

pub mod handler;
pub mod parser;

pub use handler::handle_connection;
