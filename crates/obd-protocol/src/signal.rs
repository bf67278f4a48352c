//! Decoded response lines

use crate::pid::{PidDescriptor, PidValue};
use serde::{Deserialize, Serialize};

/// One response line from the adapter, decoded where possible
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Unix time in milliseconds when the line was parsed
    pub ts: u64,
    /// The response line with delimiters and spaces stripped, e.g. `"410C1B58"`
    pub bytes: String,
    /// Decoded value, `None` for generic or unrecognised lines
    pub value: Option<PidValue>,
    /// Formatted value with unit, `None` for generic or unrecognised lines
    pub pretty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
}

impl Signal {
    /// A line that carries raw bytes only
    pub fn raw(bytes: impl Into<String>) -> Self {
        Self {
            ts: now_ms(),
            bytes: bytes.into(),
            value: None,
            pretty: None,
            name: None,
            pid: None,
        }
    }

    /// A line decoded by a registered PID
    pub fn decoded(bytes: impl Into<String>, pid: &PidDescriptor, value: PidValue) -> Self {
        Self {
            pretty: Some(pid.format_value(&value)),
            value: Some(value),
            name: Some(pid.name().to_string()),
            pid: Some(pid.code().to_string()),
            ..Self::raw(bytes)
        }
    }

    /// Whether this line answers a query for `code`.
    ///
    /// The code sits right after the response mode pair, at offset 2.
    pub fn matches_pid(&self, code: &str) -> bool {
        self.bytes
            .get(2..4)
            .map(|c| c.eq_ignore_ascii_case(code))
            .unwrap_or(false)
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_pid_offset() {
        assert!(Signal::raw("410C1B58").matches_pid("0C"));
        assert!(!Signal::raw("410D28").matches_pid("0C"));
        assert!(!Signal::raw("41").matches_pid("0C"));
        assert!(!Signal::raw("NODATA").matches_pid("0C"));
    }

    #[test]
    fn test_raw_signal_json_omits_name_and_pid() {
        let json = serde_json::to_value(Signal::raw("NODATA")).unwrap();
        assert!(json.get("name").is_none());
        assert!(json.get("pid").is_none());
        assert!(json["value"].is_null());
    }
}
