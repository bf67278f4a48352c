//! PID Registry
//!
//! Maps a PID code to its descriptor. The registry is small and static, so a
//! linear scan is all lookup needs.

use crate::error::ObdError;
use crate::pid::{standard_pids, PidDescriptor};
use serde::Serialize;
use tracing::debug;

/// Name and code of a registered PID
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PidInfo {
    pub name: &'static str,
    pub pid: &'static str,
}

/// Registry of PID descriptors, keyed by code
#[derive(Debug, Clone, Default)]
pub struct PidRegistry {
    pids: Vec<PidDescriptor>,
}

impl PidRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the standard mode 01 catalogue
    ///
    /// # Panics
    /// Panics if the built-in table contains a duplicate code.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for pid in standard_pids() {
            if let Err(e) = registry.register(pid) {
                panic!("invalid built-in PID table: {}", e);
            }
        }
        registry
    }

    /// Register a descriptor. Codes must be unique.
    pub fn register(&mut self, pid: PidDescriptor) -> Result<(), ObdError> {
        if self.lookup(pid.code()).is_some() {
            return Err(ObdError::DuplicatePid(pid.code().to_string()));
        }
        debug!("Registered PID {} ({})", pid.code(), pid.name());
        self.pids.push(pid);
        Ok(())
    }

    /// Find the descriptor for a PID code (case-insensitive)
    pub fn lookup(&self, code: &str) -> Option<&PidDescriptor> {
        self.pids.iter().find(|p| p.code().eq_ignore_ascii_case(code))
    }

    /// Like [`lookup`](Self::lookup), but unknown codes are an error
    pub fn get(&self, code: &str) -> Result<&PidDescriptor, ObdError> {
        self.lookup(code)
            .ok_or_else(|| ObdError::UnknownPid(code.to_string()))
    }

    /// Name and code of every registered PID, in registration order
    pub fn supported(&self) -> Vec<PidInfo> {
        self.pids
            .iter()
            .map(|p| PidInfo {
                name: p.name(),
                pid: p.code(),
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PidDescriptor> {
        self.pids.iter()
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pid::{codes, PidValue};

    #[test]
    fn test_standard_registry() {
        let registry = PidRegistry::standard();
        assert_eq!(registry.len(), 15);
        assert_eq!(registry.lookup("0C").unwrap().name(), "Engine RPM");
        assert_eq!(registry.lookup("0c").unwrap().code(), codes::RPM);
        assert!(registry.lookup("FF").is_none());
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let mut registry = PidRegistry::standard();
        let dup = PidDescriptor::current_data("0C", "Other RPM", 2, |_| PidValue::Number(0.0));
        assert_eq!(
            registry.register(dup),
            Err(ObdError::DuplicatePid("0C".to_string()))
        );
    }

    #[test]
    fn test_unknown_pid_error() {
        let registry = PidRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(
            registry.get("0C").unwrap_err(),
            ObdError::UnknownPid("0C".to_string())
        );
    }

    #[test]
    fn test_custom_pid() {
        let mut registry = PidRegistry::new();
        registry
            .register(
                PidDescriptor::current_data("46", "Ambient Air Temperature", 1, |p| {
                    PidValue::Number(p[0] as f64 - 40.0)
                })
                .with_unit("°C"),
            )
            .unwrap();
        let pid = registry.get("46").unwrap();
        assert_eq!(pid.formatted_value_for_bytes(&[0x41, 0x46, 0x50]).unwrap(), "40°C");
    }

    #[test]
    fn test_supported_info() {
        let info = PidRegistry::standard().supported();
        assert_eq!(info[1], PidInfo { name: "Engine RPM", pid: "0C" });
    }
}
