//! TOML-based site configuration and preset definitions.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::core::loadpoint::{LoadpointConfig, Threshold};
use crate::core::site::SiteConfig;
use crate::core::types::ChargeMode;

/// Top-level configuration parsed from TOML.
///
/// All scalar fields have defaults; device sections are free-form tables
/// decoded by the driver named in their `type` key. Load from TOML with
/// [`Config::from_toml_file`] or use [`Config::demo`] for the built-in
/// simulated setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Site-level parameters and meter references.
    #[serde(default)]
    pub site: SiteSection,
    /// Meter definitions, keyed by reference name.
    #[serde(default)]
    pub meters: HashMap<String, DriverConfig>,
    /// Charger definitions, keyed by reference name.
    #[serde(default)]
    pub chargers: HashMap<String, DriverConfig>,
    /// Vehicle definitions, keyed by reference name.
    #[serde(default)]
    pub vehicles: HashMap<String, DriverConfig>,
    /// Loadpoint definitions, dispatched in declaration order.
    #[serde(default)]
    pub loadpoints: Vec<LoadpointSection>,
}

/// Site-level parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteSection {
    /// UI title.
    pub title: String,
    /// Nominal grid voltage (V).
    pub voltage: f64,
    /// Household safety margin subtracted from the surplus (W).
    pub residual_power: f64,
    /// Initial charge mode: `off`, `now`, `minpv`, or `pv`.
    pub mode: String,
    /// Control loop interval in seconds.
    pub interval_secs: u64,
    /// Meter references.
    pub meters: SiteMeterRefs,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            title: "Site".to_string(),
            voltage: 230.0,
            residual_power: 0.0,
            mode: "pv".to_string(),
            interval_secs: 10,
            meters: SiteMeterRefs::default(),
        }
    }
}

/// References from the site to its meters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteMeterRefs {
    /// Grid meter reference (required).
    pub grid: String,
    /// PV meter reference.
    pub pv: Option<String>,
    /// Battery meter reference.
    pub battery: Option<String>,
}

/// A device definition: driver type plus free-form driver parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Driver type resolved through the registry.
    #[serde(rename = "type")]
    pub kind: String,
    /// Driver-specific parameters, decoded by the driver itself.
    #[serde(flatten)]
    pub params: toml::Table,
}

/// Enable/disable hysteresis parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdSection {
    /// Site power threshold (W).
    pub threshold: f64,
    /// Dwell time in seconds before toggling.
    pub delay_secs: u64,
}

impl Default for ThresholdSection {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            delay_secs: 60,
        }
    }
}

/// One loadpoint definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadpointSection {
    /// UI title.
    pub title: String,
    /// Charger reference (required).
    pub charger: String,
    /// Default vehicle reference.
    pub vehicle: Option<String>,
    /// Separate charge meter reference.
    pub charge_meter: Option<String>,
    /// Number of connected phases (1..=3).
    pub phases: u32,
    /// Minimum charge current (A).
    pub min_current: i64,
    /// Maximum charge current (A).
    pub max_current: i64,
    /// Budget priority; higher values are served first.
    pub priority: i32,
    /// Smallest setpoint delta worth a device write (A).
    pub sensitivity: i64,
    /// Minimum interval between two non-forced charger writes, in seconds.
    pub guard_duration_secs: u64,
    /// Enable hysteresis.
    pub enable: ThresholdSection,
    /// Disable hysteresis.
    pub disable: ThresholdSection,
}

impl Default for LoadpointSection {
    fn default() -> Self {
        Self {
            title: "Loadpoint".to_string(),
            charger: String::new(),
            vehicle: None,
            charge_meter: None,
            phases: 1,
            min_current: 6,
            max_current: 16,
            priority: 0,
            sensitivity: 1,
            guard_duration_secs: 30,
            enable: ThresholdSection::default(),
            disable: ThresholdSection::default(),
        }
    }
}

/// Configuration error with field path and constraint description.
#[derive(Debug)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"site.meters.grid"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {} — {}", self.field, self.message)
    }
}

impl Config {
    /// Available preset names.
    pub const PRESETS: &[&str] = &["demo"];

    /// Returns the built-in demo setup: simulated grid and PV meters, one
    /// simulated charger and vehicle, PV mode.
    pub fn demo() -> Self {
        let toml = r#"
[site]
title = "Demo"
mode = "pv"
residual_power = 100.0
interval_secs = 10

[site.meters]
grid = "grid"
pv = "pv"

[meters.grid]
type = "simulated"
base_power = 500.0
amplitude = 300.0
noise_std = 50.0
solar_peak = 5500.0
cache_secs = 2

[meters.pv]
type = "simulated"
solar_peak = 5000.0
energy = true

[chargers.wallbox]
type = "simulated"
connect_after_secs = 30
has_limiter = true
identity = "demo-rfid"
identify_delay_secs = 40

[vehicles.ev]
type = "simulated"
title = "Demo EV"
capacity_kwh = 58.0
soc = 35.0
charge_power = 7400.0
identifiers = ["demo-rfid"]

[[loadpoints]]
title = "Garage"
charger = "wallbox"
vehicle = "ev"
phases = 3
min_current = 6
max_current = 16
disable = { threshold = 200.0, delay_secs = 60 }
enable = { threshold = -1500.0, delay_secs = 60 }
"#;
        match Self::from_toml_str(toml) {
            Ok(cfg) => cfg,
            Err(err) => unreachable!("demo preset must parse: {err}"),
        }
    }

    /// Loads a configuration from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "demo" => Ok(Self::demo()),
            _ => Err(ConfigError {
                field: "preset".to_string(),
                message: format!(
                    "unknown preset \"{name}\", available: {}",
                    Self::PRESETS.join(", ")
                ),
            }),
        }
    }

    /// Parses a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is
    /// invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "config".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown
    /// fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Validates all fields and references and returns every violation.
    ///
    /// Returns an empty vector if the configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let site = &self.site;

        if site.voltage <= 0.0 {
            errors.push(ConfigError {
                field: "site.voltage".into(),
                message: "must be > 0".into(),
            });
        }
        if site.interval_secs == 0 {
            errors.push(ConfigError {
                field: "site.interval_secs".into(),
                message: "must be > 0".into(),
            });
        }
        if site.mode.parse::<ChargeMode>().is_err() {
            errors.push(ConfigError {
                field: "site.mode".into(),
                message: format!(
                    "must be \"off\", \"now\", \"minpv\" or \"pv\", got \"{}\"",
                    site.mode
                ),
            });
        }

        if site.meters.grid.is_empty() {
            errors.push(ConfigError {
                field: "site.meters.grid".into(),
                message: "grid meter is required".into(),
            });
        } else if !self.meters.contains_key(&site.meters.grid) {
            errors.push(ConfigError {
                field: "site.meters.grid".into(),
                message: format!("unknown meter \"{}\"", site.meters.grid),
            });
        }
        for (field, reference) in [
            ("site.meters.pv", &site.meters.pv),
            ("site.meters.battery", &site.meters.battery),
        ] {
            if let Some(name) = reference {
                if !self.meters.contains_key(name) {
                    errors.push(ConfigError {
                        field: field.into(),
                        message: format!("unknown meter \"{name}\""),
                    });
                }
            }
        }

        if self.loadpoints.is_empty() {
            errors.push(ConfigError {
                field: "loadpoints".into(),
                message: "at least one loadpoint is required".into(),
            });
        }

        for (id, lp) in self.loadpoints.iter().enumerate() {
            let field = |name: &str| format!("loadpoints[{id}].{name}");

            if lp.charger.is_empty() {
                errors.push(ConfigError {
                    field: field("charger"),
                    message: "charger is required".into(),
                });
            } else if !self.chargers.contains_key(&lp.charger) {
                errors.push(ConfigError {
                    field: field("charger"),
                    message: format!("unknown charger \"{}\"", lp.charger),
                });
            }
            if let Some(vehicle) = &lp.vehicle {
                if !self.vehicles.contains_key(vehicle) {
                    errors.push(ConfigError {
                        field: field("vehicle"),
                        message: format!("unknown vehicle \"{vehicle}\""),
                    });
                }
            }
            if let Some(meter) = &lp.charge_meter {
                if !self.meters.contains_key(meter) {
                    errors.push(ConfigError {
                        field: field("charge_meter"),
                        message: format!("unknown meter \"{meter}\""),
                    });
                }
            }
            if !(1..=3).contains(&lp.phases) {
                errors.push(ConfigError {
                    field: field("phases"),
                    message: "must be 1..=3".into(),
                });
            }
            if lp.min_current <= 0 {
                errors.push(ConfigError {
                    field: field("min_current"),
                    message: "must be > 0".into(),
                });
            }
            if lp.min_current > lp.max_current {
                errors.push(ConfigError {
                    field: field("min_current"),
                    message: "must be <= max_current".into(),
                });
            }
            if lp.sensitivity < 1 {
                errors.push(ConfigError {
                    field: field("sensitivity"),
                    message: "must be >= 1".into(),
                });
            }
        }

        errors
    }
}

impl SiteSection {
    /// Converts the section into core site parameters.
    ///
    /// # Errors
    ///
    /// Returns the mode parse error; run [`Config::validate`] first for a
    /// full report.
    pub fn to_core(&self) -> Result<SiteConfig, String> {
        Ok(SiteConfig {
            title: self.title.clone(),
            voltage: self.voltage,
            residual_power: self.residual_power,
            interval: Duration::from_secs(self.interval_secs),
            mode: self.mode.parse()?,
        })
    }
}

impl LoadpointSection {
    /// Converts the section into core loadpoint parameters.
    pub fn to_core(&self) -> LoadpointConfig {
        LoadpointConfig {
            title: self.title.clone(),
            phases: self.phases,
            min_current: self.min_current,
            max_current: self.max_current,
            priority: self.priority,
            sensitivity: self.sensitivity,
            guard_duration: Duration::from_secs(self.guard_duration_secs),
            enable: self.enable.to_core(),
            disable: self.disable.to_core(),
        }
    }
}

impl ThresholdSection {
    fn to_core(&self) -> Threshold {
        Threshold {
            threshold: self.threshold,
            delay: Duration::from_secs(self.delay_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_preset_valid() {
        let cfg = Config::demo();
        let errors = cfg.validate();
        assert!(errors.is_empty(), "demo should be valid: {errors:?}");
    }

    #[test]
    fn from_preset_unknown() {
        let err = Config::from_preset("nonexistent");
        assert!(err.is_err());
        let e = err.unwrap_err();
        assert!(e.message.contains("unknown preset"));
    }

    #[test]
    fn valid_toml_parses() {
        let toml = r#"
[site]
title = "Home"
voltage = 230.0
mode = "minpv"
interval_secs = 30

[site.meters]
grid = "grid"

[meters.grid]
type = "simulated"
base_power = 300.0

[chargers.box]
type = "simulated"

[[loadpoints]]
title = "Carport"
charger = "box"
phases = 3
min_current = 6
max_current = 32
guard_duration_secs = 120
disable = { threshold = 500.0, delay_secs = 180 }
"#;
        let cfg = Config::from_toml_str(toml).expect("valid TOML should parse");
        assert_eq!(cfg.site.mode, "minpv");
        assert_eq!(cfg.site.interval_secs, 30);
        assert_eq!(cfg.loadpoints.len(), 1);
        assert_eq!(cfg.loadpoints[0].max_current, 32);
        assert_eq!(cfg.loadpoints[0].disable.delay_secs, 180);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn driver_params_stay_free_form() {
        let toml = r#"
[meters.grid]
type = "simulated"
base_power = 300.0
noise_std = 10.0
"#;
        let cfg = Config::from_toml_str(toml).expect("should parse");
        let grid = &cfg.meters["grid"];
        assert_eq!(grid.kind, "simulated");
        assert_eq!(
            grid.params.get("base_power").and_then(|v| v.as_float()),
            Some(300.0)
        );
        assert!(!grid.params.contains_key("type"));
    }

    #[test]
    fn invalid_toml_unknown_field() {
        let toml = r#"
[site]
interval_secs = 10
bogus_field = true
"#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn validation_catches_missing_grid_meter() {
        let cfg = Config::from_toml_str("").expect("empty config parses");
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "site.meters.grid"));
    }

    #[test]
    fn validation_catches_dangling_references() {
        let toml = r#"
[site.meters]
grid = "nope"

[chargers.box]
type = "simulated"

[[loadpoints]]
charger = "box"
vehicle = "ghost"
"#;
        let cfg = Config::from_toml_str(toml).expect("should parse");
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "site.meters.grid"));
        assert!(errors.iter().any(|e| e.field == "loadpoints[0].vehicle"));
    }

    #[test]
    fn validation_catches_bad_mode() {
        let mut cfg = Config::demo();
        cfg.site.mode = "turbo".to_string();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "site.mode"));
    }

    #[test]
    fn validation_catches_current_range() {
        let mut cfg = Config::demo();
        cfg.loadpoints[0].min_current = 20;
        cfg.loadpoints[0].max_current = 10;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "loadpoints[0].min_current"));
    }

    #[test]
    fn validation_catches_phase_range() {
        let mut cfg = Config::demo();
        cfg.loadpoints[0].phases = 4;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "loadpoints[0].phases"));
    }

    #[test]
    fn section_conversion_round_trip() {
        let cfg = Config::demo();
        let site = cfg.site.to_core().expect("demo mode parses");
        assert_eq!(site.mode, ChargeMode::Pv);
        assert_eq!(site.interval, Duration::from_secs(10));

        let lp = cfg.loadpoints[0].to_core();
        assert_eq!(lp.phases, 3);
        assert_eq!(lp.disable.threshold, 200.0);
        assert_eq!(lp.enable.delay, Duration::from_secs(60));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml = r#"
[site]
interval_secs = 25
"#;
        let cfg = Config::from_toml_str(toml).expect("should parse");
        assert_eq!(cfg.site.interval_secs, 25);
        assert_eq!(cfg.site.voltage, 230.0);
        assert_eq!(cfg.site.mode, "pv");
    }
}
