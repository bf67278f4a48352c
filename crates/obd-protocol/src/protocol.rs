//! ELM327 Protocol Definitions
//!
//! Wire constants, the OBD bus protocol selector, and the adapter
//! configuration handshake.

use serde::{Deserialize, Serialize};

/// Terminates every command written to the adapter
pub const COMMAND_TERMINATOR: char = '\r';

/// Prompt character the adapter prints once a response is complete
pub const PROMPT: char = '>';

/// Prefix of adapter configuration commands
pub const AT_PREFIX: &str = "AT";

/// Leading byte pair of a mode 01 (current data) response
pub const CURRENT_DATA_RESPONSE: &str = "41";

/// OBD bus protocols the adapter can be told to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    /// Get the ELM327 AT command selecting this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "ATSP0",
            ObdProtocol::J1850Pwm => "ATSP1",
            ObdProtocol::J1850Vpw => "ATSP2",
            ObdProtocol::Iso9141_2 => "ATSP3",
            ObdProtocol::Iso14230_4Kwp => "ATSP4",
            ObdProtocol::Iso14230_4KwpFast => "ATSP5",
            ObdProtocol::Iso15765_4Can11bit500 => "ATSP6",
            ObdProtocol::Iso15765_4Can29bit500 => "ATSP7",
            ObdProtocol::Iso15765_4Can11bit250 => "ATSP8",
            ObdProtocol::Iso15765_4Can29bit250 => "ATSP9",
        }
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
        )
    }

    /// Default serial baud rate when none is configured
    pub fn default_baud_rate(&self) -> u32 {
        if self.is_can() {
            115200
        } else {
            38400
        }
    }
}

/// Whether a message is an adapter configuration command
pub fn is_at_command(msg: &str) -> bool {
    msg.starts_with(AT_PREFIX)
}

/// Number of ECU replies the adapter should wait for.
///
/// AT commands get no ECU reply, so the adapter is told to expect zero;
/// PID queries expect exactly one, which lets the adapter return as soon
/// as it arrives instead of waiting out its timeout.
pub fn reply_count(msg: &str) -> u8 {
    if is_at_command(msg) {
        0
    } else {
        1
    }
}

/// Format a message for the wire: `<body><replyCount>\r`
pub fn frame_command(msg: &str) -> String {
    format!("{}{}{}", msg, reply_count(msg), COMMAND_TERMINATOR)
}

/// The one-time adapter configuration sequence, in send order.
///
/// `adapter_timeout_ms` is rounded down to the adapter's 4 ms units and
/// clamped to a single byte.
pub fn handshake_commands(
    adaptive_timing: u8,
    adapter_timeout_ms: u64,
    protocol: ObdProtocol,
) -> Vec<String> {
    let timeout_units = (adapter_timeout_ms / 4).clamp(1, 0xFF);
    vec![
        // No echo
        "ATE0".to_string(),
        // No linefeeds
        "ATL0".to_string(),
        // No spaces between bytes
        "ATS0".to_string(),
        // No headers or checksums
        "ATH0".to_string(),
        format!("ATAT{}", adaptive_timing.min(2)),
        format!("ATST{:02X}", timeout_units),
        protocol.to_elm_command().to_string(),
    ]
}
