//! Echo protocol parser.

use bytes::{BufMut, BytesMut};

/// Prefix written before every echoed line.
pub const ECHO_PREFIX: &[u8] = b"Echo: ";

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<'a> {
    /// A full line, without its terminator, and the bytes consumed.
    Complete(&'a [u8], usize),
    /// No terminator yet and the buffered data still fits.
    Incomplete,
    /// No terminator within `max_line_length` bytes.
    TooLong,
}

/// Parse one `\n`-terminated line from the front of `input`.
///
/// A single `\r` before the `\n` is dropped. `max_line_length` bounds the
/// line including its terminator.
pub fn parse(input: &[u8], max_line_length: usize) -> ParseResult<'_> {
    let window = &input[..input.len().min(max_line_length)];

    match find_lf(window) {
        Some(pos) => ParseResult::Complete(trim_cr(&input[..pos]), pos + 1),
        None if input.len() >= max_line_length => ParseResult::TooLong,
        None => ParseResult::Incomplete,
    }
}

/// Take whatever is left at end-of-stream as a final, unterminated line.
pub fn parse_final(input: &[u8]) -> Option<&[u8]> {
    if input.is_empty() {
        None
    } else {
        Some(trim_cr(input))
    }
}

/// Format an echo response: `Echo: <line>\n`.
pub fn response(line: &[u8], output: &mut BytesMut) {
    output.reserve(ECHO_PREFIX.len() + line.len() + 1);
    output.put_slice(ECHO_PREFIX);
    output.put_slice(line);
    output.put_u8(b'\n');
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Find \n in buffer.
fn find_lf(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}
