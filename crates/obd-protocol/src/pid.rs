//! OBD-II PID Descriptors and Decoding Formulas
//!
//! Every queryable parameter is described by a [`PidDescriptor`]: its mode and
//! code, how many payload bytes follow the response header, and plain function
//! pointers that decode and format those bytes. The standard mode 01 catalogue
//! lives at the bottom of this file.

use crate::error::ObdError;
use crate::mode;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Header pairs preceding the payload in a response (mode + PID code)
pub const HEADER_BYTES: usize = 2;

/// Well-known PID codes of the built-in catalogue
pub mod codes {
    pub const SUPPORTED_PIDS_01_20: &str = "00";
    pub const FUEL_SYSTEM_STATUS: &str = "03";
    pub const ENGINE_LOAD: &str = "04";
    pub const COOLANT_TEMP: &str = "05";
    pub const FUEL_PRESSURE: &str = "0A";
    pub const INTAKE_MANIFOLD_PRESSURE: &str = "0B";
    pub const RPM: &str = "0C";
    pub const SPEED: &str = "0D";
    pub const INTAKE_AIR_TEMP: &str = "0F";
    pub const MAF: &str = "10";
    pub const THROTTLE_POSITION: &str = "11";
    pub const OBD_STANDARD: &str = "1C";
    pub const SUPPORTED_PIDS_21_40: &str = "20";
    pub const FUEL_LEVEL: &str = "2F";
    pub const SUPPORTED_PIDS_41_60: &str = "40";
}

/// A decoded PID value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PidValue {
    /// Numeric reading (rpm, °C, kPa, ...)
    Number(f64),
    /// Composed or enumerated reading (status text, PID lists)
    Text(String),
}

impl PidValue {
    /// Numeric value, if this is a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PidValue::Number(v) => Some(*v),
            PidValue::Text(_) => None,
        }
    }

    /// Text value, if this is text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PidValue::Number(_) => None,
            PidValue::Text(s) => Some(s),
        }
    }
}

impl fmt::Display for PidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PidValue::Number(v) => write!(f, "{}", v),
            PidValue::Text(s) => f.write_str(s),
        }
    }
}

/// Decodes the payload bytes (header already stripped) into a value
pub type DecodeFn = fn(&[u8]) -> PidValue;

/// Renders a value for display, given the descriptor's unit
pub type FormatFn = fn(&PidValue, Option<&str>) -> String;

/// Default formatter: value followed by the unit, if any
pub fn format_with_unit(value: &PidValue, unit: Option<&str>) -> String {
    match unit {
        Some(unit) if !unit.is_empty() => format!("{}{}", value, unit),
        _ => value.to_string(),
    }
}

/// Describes how to query and decode one parameter
#[derive(Clone, Copy)]
pub struct PidDescriptor {
    mode: &'static str,
    code: &'static str,
    name: &'static str,
    bytes: usize,
    unit: Option<&'static str>,
    min: f64,
    max: f64,
    sample_min: u8,
    sample_max: u8,
    decode: DecodeFn,
    format: FormatFn,
}

impl PidDescriptor {
    /// Create a descriptor for a parameter with `bytes` payload bytes.
    ///
    /// # Panics
    /// Panics if `bytes` is zero; every PID reply carries at least one byte.
    pub fn new(
        mode: &'static str,
        code: &'static str,
        name: &'static str,
        bytes: usize,
        decode: DecodeFn,
    ) -> Self {
        assert!(bytes > 0, "PID {} must declare at least one payload byte", code);
        Self {
            mode,
            code,
            name,
            bytes,
            unit: None,
            min: 0.0,
            max: 255.0,
            sample_min: 0,
            sample_max: 255,
            decode,
            format: format_with_unit,
        }
    }

    /// Create a mode 01 (current data) descriptor
    pub fn current_data(code: &'static str, name: &'static str, bytes: usize, decode: DecodeFn) -> Self {
        Self::new(mode::CURRENT_DATA, code, name, bytes, decode)
    }

    /// Set the display unit
    pub fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Set the documented value range
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Set the raw byte range used for synthetic samples
    pub fn with_sample_range(mut self, min: u8, max: u8) -> Self {
        self.sample_min = min.min(max);
        self.sample_max = max.max(min);
        self
    }

    /// Replace the default `value + unit` formatter
    pub fn with_formatter(mut self, format: FormatFn) -> Self {
        self.format = format;
        self
    }

    pub fn mode(&self) -> &'static str {
        self.mode
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of payload bytes this PID replies with
    pub fn byte_count(&self) -> usize {
        self.bytes
    }

    pub fn unit(&self) -> Option<&'static str> {
        self.unit
    }

    /// Documented `(min, max)` of the decoded value
    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// The request written to the adapter, e.g. `"010C"` for engine RPM
    pub fn write_string(&self) -> String {
        format!("{}{}", self.mode, self.code)
    }

    /// Slice this PID's payload out of a full response (header included)
    pub fn payload<'a>(&self, bytes: &'a [u8]) -> Result<&'a [u8], ObdError> {
        bytes
            .get(HEADER_BYTES..HEADER_BYTES + self.bytes)
            .ok_or_else(|| ObdError::Decode {
                line: hex_string(bytes),
                reason: format!(
                    "{} expects {} payload bytes, got {}",
                    self.name,
                    self.bytes,
                    bytes.len().saturating_sub(HEADER_BYTES)
                ),
            })
    }

    /// Decode a full response (header included) into a value
    pub fn value_for_bytes(&self, bytes: &[u8]) -> Result<PidValue, ObdError> {
        let payload = self.payload(bytes)?;
        Ok((self.decode)(payload))
    }

    /// Format an already decoded value
    pub fn format_value(&self, value: &PidValue) -> String {
        (self.format)(value, self.unit)
    }

    /// Decode and format a full response (header included)
    pub fn formatted_value_for_bytes(&self, bytes: &[u8]) -> Result<String, ObdError> {
        self.value_for_bytes(bytes).map(|v| self.format_value(&v))
    }

    /// Plausible payload bytes within the declared sample range
    pub fn sample_bytes(&self, seed: u64) -> Vec<u8> {
        self.sample_bytes_in(self.sample_min, self.sample_max, seed)
    }

    /// Payload bytes within `[min, max]`, pseudo-random but deterministic in `seed`
    pub fn sample_bytes_in(&self, min: u8, max: u8, seed: u64) -> Vec<u8> {
        let (lo, hi) = (min.min(max) as u64, min.max(max) as u64);
        (0..self.bytes)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                seed.hash(&mut hasher);
                i.hash(&mut hasher);
                self.code.hash(&mut hasher);
                (lo + hasher.finish() % (hi - lo + 1)) as u8
            })
            .collect()
    }
}

impl fmt::Debug for PidDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidDescriptor")
            .field("mode", &self.mode)
            .field("code", &self.code)
            .field("name", &self.name)
            .field("bytes", &self.bytes)
            .field("unit", &self.unit)
            .finish()
    }
}

impl PartialEq for PidDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.mode == other.mode && self.code == other.code
    }
}

/// Uppercase hex rendering of a byte slice, no separators
pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

// ---------------------------------------------------------------------------
// Standard mode 01 catalogue
// ---------------------------------------------------------------------------

fn single_byte(p: &[u8]) -> PidValue {
    PidValue::Number(p[0] as f64)
}

// A * 100 / 255
fn percentage(p: &[u8]) -> PidValue {
    PidValue::Number(p[0] as f64 * 100.0 / 255.0)
}

// A - 40
fn temperature(p: &[u8]) -> PidValue {
    PidValue::Number(p[0] as f64 - 40.0)
}

// ((A*256)+B)/4
fn rpm(p: &[u8]) -> PidValue {
    PidValue::Number((p[0] as f64 * 256.0 + p[1] as f64) / 4.0)
}

// A * 3
fn fuel_pressure(p: &[u8]) -> PidValue {
    PidValue::Number(p[0] as f64 * 3.0)
}

// ((A*256)+B)/100
fn maf(p: &[u8]) -> PidValue {
    PidValue::Number((p[0] as f64 * 256.0 + p[1] as f64) / 100.0)
}

fn obd_standard(p: &[u8]) -> PidValue {
    let name = match p[0] {
        1 => "OBD-II as defined by the CARB",
        2 => "OBD as defined by the EPA",
        3 => "OBD and OBD-II",
        4 => "OBD-I",
        5 => "Not OBD compliant",
        6 => "EOBD (Europe)",
        7 => "EOBD and OBD-II",
        8 => "EOBD and OBD",
        9 => "EOBD, OBD and OBD II",
        10 => "JOBD (Japan)",
        11 => "JOBD and OBD II",
        12 => "JOBD and EOBD",
        13 => "JOBD, EOBD, and OBD II",
        17 => "Engine Manufacturer Diagnostics (EMD)",
        18 => "Engine Manufacturer Diagnostics Enhanced (EMD+)",
        19 => "Heavy Duty On-Board Diagnostics (Child/Partial) (HD OBD-C)",
        20 => "Heavy Duty On-Board Diagnostics (HD OBD)",
        21 => "World Wide Harmonized OBD (WWH OBD)",
        23 => "Heavy Duty Euro OBD Stage I without NOx control (HD EOBD-I)",
        24 => "Heavy Duty Euro OBD Stage I with NOx control (HD EOBD-I N)",
        25 => "Heavy Duty Euro OBD Stage II without NOx control (HD EOBD-II)",
        26 => "Heavy Duty Euro OBD Stage II with NOx control (HD EOBD-II N)",
        28 => "Brazil OBD Phase 1 (OBDBr-1)",
        29 => "Brazil OBD Phase 2 (OBDBr-2)",
        30 => "Korean OBD (KOBD)",
        31 => "India OBD I (IOBD I)",
        32 => "India OBD II (IOBD II)",
        33 => "Heavy Duty Euro OBD Stage VI (HD EOBD-IV)",
        _ => "Unknown",
    };
    PidValue::Text(name.to_string())
}

fn fuel_system_type(status: u8) -> &'static str {
    match status {
        1 => "Open loop due to insufficient engine temperature",
        2 => "Closed loop, using oxygen sensor feedback to determine fuel mix",
        4 => "Open loop due to engine load OR fuel cut due to deceleration",
        8 => "Open loop due to system failure",
        16 => "Closed loop, using at least one oxygen sensor but there is a fault in the feedback system",
        _ => "Unknown",
    }
}

fn fuel_system_status(p: &[u8]) -> PidValue {
    let (a, b) = (p[0], p[1]);
    if b != 0 {
        PidValue::Text(format!(
            "System A: {}. System B: {}",
            fuel_system_type(a),
            fuel_system_type(b)
        ))
    } else {
        PidValue::Text(fuel_system_type(a).to_string())
    }
}

/// Expand a 32-bit support bitmap into a comma-joined list of PID codes.
///
/// The most significant bit of the first byte is PID `first`.
pub fn supported_pid_list(p: &[u8], first: u8) -> String {
    let mut supported = Vec::new();
    for (i, byte) in p.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                let pid = first as usize + i * 8 + bit;
                supported.push(format!("{:02X}", pid));
            }
        }
    }
    supported.join(",")
}

fn supported_01_20(p: &[u8]) -> PidValue {
    PidValue::Text(supported_pid_list(p, 0x01))
}

fn supported_21_40(p: &[u8]) -> PidValue {
    PidValue::Text(supported_pid_list(p, 0x21))
}

fn supported_41_60(p: &[u8]) -> PidValue {
    PidValue::Text(supported_pid_list(p, 0x41))
}

/// Descriptors for the standard mode 01 parameters
pub fn standard_pids() -> Vec<PidDescriptor> {
    use codes::*;
    vec![
        PidDescriptor::current_data(FUEL_LEVEL, "Fuel Level Input", 1, percentage)
            .with_unit("%")
            .with_range(0.0, 100.0),
        PidDescriptor::current_data(RPM, "Engine RPM", 2, rpm)
            .with_unit("rpm")
            .with_range(0.0, 16383.75),
        PidDescriptor::current_data(COOLANT_TEMP, "Engine Coolant Temperature", 1, temperature)
            .with_unit("°C")
            .with_range(-40.0, 215.0),
        PidDescriptor::current_data(SPEED, "Vehicle Speed", 1, single_byte)
            .with_unit("km/h")
            .with_range(0.0, 255.0),
        PidDescriptor::current_data(ENGINE_LOAD, "Calculated Engine Load", 1, percentage)
            .with_unit("%")
            .with_range(0.0, 100.0),
        PidDescriptor::current_data(FUEL_PRESSURE, "Fuel Pressure", 1, fuel_pressure)
            .with_unit("kPa")
            .with_range(0.0, 765.0),
        PidDescriptor::current_data(
            INTAKE_MANIFOLD_PRESSURE,
            "Intake Manifold Absolute Pressure",
            1,
            single_byte,
        )
        .with_unit("kPa")
        .with_range(0.0, 255.0),
        PidDescriptor::current_data(INTAKE_AIR_TEMP, "Intake Air Temperature", 1, temperature)
            .with_unit("°C")
            .with_range(-40.0, 215.0),
        PidDescriptor::current_data(MAF, "MAF Air Flow Rate", 2, maf)
            .with_unit("grams/sec")
            .with_range(0.0, 655.35),
        PidDescriptor::current_data(THROTTLE_POSITION, "Throttle Position", 1, percentage)
            .with_unit("%")
            .with_range(0.0, 100.0),
        PidDescriptor::current_data(OBD_STANDARD, "OBD Standard", 1, obd_standard)
            .with_sample_range(0, 34),
        PidDescriptor::current_data(FUEL_SYSTEM_STATUS, "Fuel System Status", 2, fuel_system_status)
            .with_range(0.0, 16.0)
            .with_sample_range(0, 10),
        PidDescriptor::current_data(SUPPORTED_PIDS_01_20, "Supported PIDs 01-20", 4, supported_01_20),
        PidDescriptor::current_data(SUPPORTED_PIDS_21_40, "Supported PIDs 21-40", 4, supported_21_40),
        PidDescriptor::current_data(SUPPORTED_PIDS_41_60, "Supported PIDs 41-60", 4, supported_41_60),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find(code: &str) -> PidDescriptor {
        standard_pids()
            .into_iter()
            .find(|p| p.code() == code)
            .unwrap()
    }

    #[test]
    fn test_rpm_decode() {
        // 1B 58 => ((0x1B * 256) + 0x58) / 4 = 7000 / 4 = 1750
        let value = find(codes::RPM)
            .value_for_bytes(&[0x41, 0x0C, 0x1B, 0x58])
            .unwrap();
        assert_eq!(value, PidValue::Number(1750.0));
    }

    #[test]
    fn test_coolant_temp_decode() {
        // 0x73 = 115, so temp = 115 - 40 = 75°C
        let pid = find(codes::COOLANT_TEMP);
        let value = pid.value_for_bytes(&[0x41, 0x05, 0x73]).unwrap();
        assert_eq!(value, PidValue::Number(75.0));
        assert_eq!(pid.format_value(&value), "75°C");
    }

    #[test]
    fn test_maf_decode() {
        let value = find(codes::MAF)
            .value_for_bytes(&[0x41, 0x10, 0x01, 0xF4])
            .unwrap();
        assert!((value.as_f64().unwrap() - 5.0).abs() < 0.001);
    }

    #[test]
    fn test_percentage_decode() {
        let value = find(codes::THROTTLE_POSITION)
            .value_for_bytes(&[0x41, 0x11, 0xFF])
            .unwrap();
        assert!((value.as_f64().unwrap() - 100.0).abs() < 0.001);
    }

    #[test]
    fn test_speed_formats_with_unit() {
        let pid = find(codes::SPEED);
        assert_eq!(
            pid.formatted_value_for_bytes(&[0x41, 0x0D, 0x28]).unwrap(),
            "40km/h"
        );
    }

    #[test]
    fn test_short_payload_is_decode_error() {
        let err = find(codes::RPM).value_for_bytes(&[0x41, 0x0C, 0x1B]).unwrap_err();
        assert!(matches!(err, ObdError::Decode { .. }));
    }

    #[test]
    fn test_supported_pids_bitmap() {
        // BE 1F A8 13 is the classic example from the SAE J1979 docs
        let value = find(codes::SUPPORTED_PIDS_01_20)
            .value_for_bytes(&[0x41, 0x00, 0xBE, 0x1F, 0xA8, 0x13])
            .unwrap();
        assert_eq!(
            value.as_str().unwrap(),
            "01,03,04,05,06,07,0C,0D,0E,0F,10,11,13,15,1C,1F,20"
        );
    }

    #[test]
    fn test_supported_pids_second_page_offset() {
        let value = find(codes::SUPPORTED_PIDS_21_40)
            .value_for_bytes(&[0x41, 0x20, 0x80, 0x00, 0x00, 0x01])
            .unwrap();
        assert_eq!(value.as_str().unwrap(), "21,40");
    }

    #[test]
    fn test_fuel_system_status() {
        let pid = find(codes::FUEL_SYSTEM_STATUS);
        let single = pid.value_for_bytes(&[0x41, 0x03, 0x02, 0x00]).unwrap();
        assert_eq!(
            single.as_str().unwrap(),
            "Closed loop, using oxygen sensor feedback to determine fuel mix"
        );
        let dual = pid.value_for_bytes(&[0x41, 0x03, 0x01, 0x08]).unwrap();
        assert!(dual.as_str().unwrap().starts_with("System A: Open loop"));
        assert!(dual.as_str().unwrap().ends_with("System B: Open loop due to system failure"));
    }

    #[test]
    fn test_obd_standard_unknown() {
        let pid = find(codes::OBD_STANDARD);
        let value = pid.value_for_bytes(&[0x41, 0x1C, 0xFA]).unwrap();
        assert_eq!(pid.format_value(&value), "Unknown");
    }

    #[test]
    fn test_write_string() {
        assert_eq!(find(codes::RPM).write_string(), "010C");
        assert_eq!(find(codes::FUEL_LEVEL).write_string(), "012F");
    }

    #[test]
    fn test_sample_bytes_within_range() {
        let pid = find(codes::OBD_STANDARD);
        for seed in 0..200 {
            let bytes = pid.sample_bytes(seed);
            assert_eq!(bytes.len(), 1);
            assert!(bytes[0] <= 34);
        }
        let rpm = find(codes::RPM);
        assert_eq!(rpm.sample_bytes(7), rpm.sample_bytes(7));
        assert_eq!(rpm.sample_bytes_in(10, 12, 3).len(), 2);
        assert!(rpm.sample_bytes_in(12, 10, 3).iter().all(|b| (10..=12).contains(b)));
    }
}
