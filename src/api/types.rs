//! API response, request, and snapshot types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::loadpoint::LoadpointSettings;

/// Latest published values, keyed the same way they appear on the UI
/// channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SiteState {
    /// Site-level values (`sitePower`, `gridPower`, ...).
    pub site: Map<String, Value>,
    /// Per-loadpoint values (`chargePower`, `chargerStatus`, ...).
    pub loadpoints: Vec<Map<String, Value>>,
}

/// Combined state response.
#[derive(Debug, Serialize)]
pub struct StateResponse {
    /// Active charge mode.
    pub mode: String,
    /// Site-level published values.
    pub site: Map<String, Value>,
    /// Per-loadpoint published values.
    pub loadpoints: Vec<Map<String, Value>>,
}

/// One loadpoint's published values and current settings.
#[derive(Debug, Serialize)]
pub struct LoadpointResponse {
    /// Loadpoint name.
    pub title: String,
    /// Published values.
    pub values: Map<String, Value>,
    /// Runtime settings.
    pub settings: LoadpointSettings,
}

/// Mode-change request body.
#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    /// New charge mode: `off`, `now`, `minpv`, or `pv`.
    pub mode: String,
}

/// Partial loadpoint settings update. Absent fields stay unchanged;
/// non-positive limit values clear the limit.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsRequest {
    /// Phase count (1..=3).
    pub phases: Option<u32>,
    /// Minimum charge current (A).
    pub min_current: Option<i64>,
    /// Maximum charge current (A).
    pub max_current: Option<i64>,
    /// Budget priority.
    pub priority: Option<i32>,
    /// Session SoC limit in percent; `<= 0` clears it.
    pub limit_soc: Option<f64>,
    /// Session energy limit in kWh; `<= 0` clears it.
    pub limit_energy: Option<f64>,
}

/// Error response body for 4xx errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
}
