//! Core value types: charge status, charge mode, UI/push messages, and
//! power/current conversion helpers.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

/// Pilot state of the charger connection per IEC 61851-1.
///
/// `A` means no vehicle, `B` plugged but not charging, `C` charging, `F`
/// fault. `None` is reported when the charger state cannot be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    /// No vehicle connected.
    A,
    /// Vehicle connected, not charging.
    B,
    /// Vehicle connected and charging.
    C,
    /// Charger fault.
    F,
    /// Unknown or unreadable state.
    None,
}

impl ChargeStatus {
    /// Whether a vehicle is connected in this state.
    pub fn connected(self) -> bool {
        matches!(self, ChargeStatus::B | ChargeStatus::C)
    }

    /// Whether the vehicle is charging in this state.
    pub fn charging(self) -> bool {
        self == ChargeStatus::C
    }
}

impl fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChargeStatus::A => "A",
            ChargeStatus::B => "B",
            ChargeStatus::C => "C",
            ChargeStatus::F => "F",
            ChargeStatus::None => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Charge mode selected for the site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeMode {
    /// Charging disabled.
    Off,
    /// Charge at maximum current regardless of surplus.
    Now,
    /// Never below minimum current while connected, more when surplus allows.
    MinPv,
    /// Charge from surplus only, with enable/disable hysteresis.
    Pv,
}

impl fmt::Display for ChargeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChargeMode::Off => "off",
            ChargeMode::Now => "now",
            ChargeMode::MinPv => "minpv",
            ChargeMode::Pv => "pv",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ChargeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(ChargeMode::Off),
            "now" => Ok(ChargeMode::Now),
            "minpv" => Ok(ChargeMode::MinPv),
            "pv" => Ok(ChargeMode::Pv),
            other => Err(format!(
                "unknown charge mode \"{other}\", expected off, now, minpv or pv"
            )),
        }
    }
}

/// A key/value message published to UI and telemetry consumers.
///
/// Messages originating from a loadpoint are stamped with the loadpoint
/// index by the site fan-in before they reach the global channel.
#[derive(Debug, Clone)]
pub struct Param {
    /// Originating loadpoint index, `None` for site-level values.
    pub loadpoint: Option<usize>,
    /// Value key, e.g. `chargePower`.
    pub key: String,
    /// JSON-encoded value.
    pub val: Value,
}

impl Param {
    /// Creates a site-level param from any serializable value.
    pub fn new(key: &str, val: impl serde::Serialize) -> Self {
        Self {
            loadpoint: None,
            key: key.to_string(),
            val: serde_json::to_value(val).unwrap_or(Value::Null),
        }
    }
}

/// Session-edge notification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    /// Charging started.
    Start,
    /// Charging stopped.
    Stop,
}

/// Push notification emitted on charge session edges.
#[derive(Debug, Clone)]
pub struct PushEvent {
    /// Originating loadpoint index, stamped by the site fan-in.
    pub loadpoint: Option<usize>,
    /// Edge kind.
    pub kind: PushKind,
}

/// Converts power in watts to whole amperes for the given voltage and
/// phase count, truncating towards zero.
pub fn power_to_current(power: f64, voltage: f64, phases: u32) -> i64 {
    (power / (voltage * f64::from(phases))) as i64
}

/// Converts a current in amperes to power in watts for the given voltage
/// and phase count.
pub fn current_to_power(current: f64, voltage: f64, phases: u32) -> f64 {
    current * voltage * f64::from(phases)
}
