//! Surplus-aware EV charge controller.
//!
//! A site owns the household meters and one or more loadpoints (charger +
//! optional vehicle). A periodic control loop samples the meters, computes
//! the available site power, and hands each loadpoint its share of the
//! budget. Loadpoints run a charge-status state machine and translate the
//! budget into charger commands under hysteresis and guard discipline.

#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod core;
pub mod device;
