//! Records handed to persistence after the day-boundary pass

use serde::{Deserialize, Serialize};

use crate::Observation;

/// Observation plus values derived by the replay engine.
///
/// `observation.rain_rate` is always present here: either the decoder's
/// explicit rate or one derived from counter deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedObservation {
    #[serde(flatten)]
    pub observation: Observation,

    /// Station identifier of the producing driver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,

    pub rain_today: f64,
    pub rain_since_midnight: f64,
    pub rain_since_9am: f64,
    pub windrun_today: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_bearing: Option<f64>,
    pub heating_degree_days: f64,
    pub cooling_degree_days: f64,
    pub chill_hours: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_temp_today: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snow_24h: Option<f64>,
}

/// Day totals captured immediately before a rollover reset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaySummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_temp: Option<f64>,
    pub temp_samples: u32,
    pub rain: f64,
    pub windrun: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_bearing: Option<f64>,
    pub heating_degree_days: f64,
    pub cooling_degree_days: f64,
    pub chill_hours: f64,
}
