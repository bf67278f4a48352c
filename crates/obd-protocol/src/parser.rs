//! ELM327 Response Framing
//!
//! The adapter streams text in arbitrary chunks and marks the end of each
//! response with a `>` prompt. [`FrameParser`] accumulates chunks until the
//! prompt shows up and hands back the completed frame; [`decode_frame`] then
//! turns a frame into one [`Signal`] per meaningful line.
//!
//! Splitting the two steps lets the connection task release the command gate
//! as soon as a frame is complete, before any decoding happens.

use crate::error::ObdError;
use crate::pid::HEADER_BYTES;
use crate::protocol::{CURRENT_DATA_RESPONSE, PROMPT};
use crate::registry::PidRegistry;
use crate::signal::Signal;
use tracing::debug;

/// Accumulates adapter output until a full response has arrived
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of transport bytes.
    ///
    /// Returns the completed frame (up to and including the last prompt) once
    /// the buffer contains a prompt. Anything received after that prompt stays
    /// buffered as the start of the next frame.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        let data = String::from_utf8_lossy(chunk);
        debug!("Received data {:?}", data);
        self.buffer.push_str(&data);

        let end = self.buffer.rfind(PROMPT)? + PROMPT.len_utf8();
        let rest = self.buffer.split_off(end);
        let frame = std::mem::replace(&mut self.buffer, rest);
        debug!("Serial output completed: {:?}", frame);
        Some(frame)
    }

    /// Text buffered so far for the current frame
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Discard any partially received frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Split a frame into its non-empty response lines.
///
/// Line feeds are dropped, escaped `\r` sequences are unescaped, then the
/// frame is split on carriage returns. Each line loses its prompt and spaces.
pub fn extract_lines(frame: &str) -> Vec<String> {
    frame
        .replace('\n', "")
        .replace("\\r", "\r")
        .split('\r')
        .map(|line| line.replace([PROMPT, ' '], "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Whether a line consists solely of uppercase hex digits
pub fn is_hex(line: &str) -> bool {
    !line.is_empty() && line.bytes().all(|b| matches!(b, b'0'..=b'9' | b'A'..=b'F'))
}

/// Group a hex line into bytes, two characters at a time.
///
/// An odd trailing digit becomes its own byte. Returns `None` if the line is
/// not hex.
pub fn byte_groups(line: &str) -> Option<Vec<u8>> {
    if !is_hex(line) {
        return None;
    }
    line.as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).ok().and_then(|s| u8::from_str_radix(s, 16).ok()))
        .collect()
}

/// Classify and decode a single response line.
///
/// - non-hex text (`NO DATA`, `OK`, `SEARCHING...`) becomes a raw signal
/// - a current-data reply is decoded through the registry, or kept raw if
///   its PID is unknown
/// - any other hex line is the adapter echoing our own request and yields
///   `Ok(None)`
pub fn parse_line(line: &str, registry: &PidRegistry) -> Result<Option<Signal>, ObdError> {
    let bytes = match byte_groups(line) {
        Some(bytes) => bytes,
        None => {
            debug!("Received generic (non hex) output {:?}, not parsing", line);
            return Ok(Some(Signal::raw(line)));
        }
    };

    if !line.starts_with(CURRENT_DATA_RESPONSE) {
        debug!("Ignoring {:?}, not a recognised response type", line);
        return Ok(None);
    }

    let code = match line.get(HEADER_BYTES..HEADER_BYTES * 2) {
        Some(code) => code,
        None => {
            debug!("Response {:?} carries no PID code", line);
            return Ok(Some(Signal::raw(line)));
        }
    };

    match registry.lookup(code) {
        Some(pid) => {
            let value = pid.value_for_bytes(&bytes)?;
            debug!("Decoded {} = {}", pid.name(), value);
            Ok(Some(Signal::decoded(line, pid, value)))
        }
        None => {
            debug!("No match found for PID {}", code);
            Ok(Some(Signal::raw(line)))
        }
    }
}

/// Decode every line of a completed frame.
///
/// Each line is decoded independently, so one bad line does not prevent the
/// others from producing signals. Echo lines are skipped.
pub fn decode_frame(frame: &str, registry: &PidRegistry) -> Vec<Result<Signal, ObdError>> {
    extract_lines(frame)
        .iter()
        .filter_map(|line| parse_line(line, registry).transpose())
        .collect()
}
