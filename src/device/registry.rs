//! Driver discovery: maps a `type` string to a constructor taking the
//! driver's free-form configuration table.
//!
//! Construction failures are fatal and abort startup; the control core
//! never sees a half-built device.

use std::collections::HashMap;
use std::sync::Arc;

use super::{simulated, ChargerDevice, DeviceError, MeterDevice, Vehicle};

type MeterFactory = fn(&toml::Table) -> Result<MeterDevice, DeviceError>;
type ChargerFactory = fn(&toml::Table) -> Result<ChargerDevice, DeviceError>;
type VehicleFactory = fn(&toml::Table) -> Result<Arc<dyn Vehicle>, DeviceError>;

/// Registry of driver constructors, keyed by device class and type.
#[derive(Default)]
pub struct DriverRegistry {
    meters: HashMap<&'static str, MeterFactory>,
    chargers: HashMap<&'static str, ChargerFactory>,
    vehicles: HashMap<&'static str, VehicleFactory>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in drivers registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_meter("simulated", simulated::meter_from_config);
        registry.register_charger("simulated", simulated::charger_from_config);
        registry.register_vehicle("simulated", simulated::vehicle_from_config);
        registry
    }

    /// Registers a meter constructor under a type name.
    pub fn register_meter(&mut self, kind: &'static str, factory: MeterFactory) {
        self.meters.insert(kind, factory);
    }

    /// Registers a charger constructor under a type name.
    pub fn register_charger(&mut self, kind: &'static str, factory: ChargerFactory) {
        self.chargers.insert(kind, factory);
    }

    /// Registers a vehicle constructor under a type name.
    pub fn register_vehicle(&mut self, kind: &'static str, factory: VehicleFactory) {
        self.vehicles.insert(kind, factory);
    }

    /// Constructs a meter of the given type.
    pub fn meter(&self, kind: &str, config: &toml::Table) -> Result<MeterDevice, DeviceError> {
        let factory = self
            .meters
            .get(kind)
            .ok_or_else(|| DeviceError::Fatal(format!("unknown meter type \"{kind}\"")))?;
        factory(config)
    }

    /// Constructs a charger of the given type.
    pub fn charger(&self, kind: &str, config: &toml::Table) -> Result<ChargerDevice, DeviceError> {
        let factory = self
            .chargers
            .get(kind)
            .ok_or_else(|| DeviceError::Fatal(format!("unknown charger type \"{kind}\"")))?;
        factory(config)
    }

    /// Constructs a vehicle of the given type.
    pub fn vehicle(&self, kind: &str, config: &toml::Table) -> Result<Arc<dyn Vehicle>, DeviceError> {
        let factory = self
            .vehicles
            .get(kind)
            .ok_or_else(|| DeviceError::Fatal(format!("unknown vehicle type \"{kind}\"")))?;
        factory(config)
    }
}
