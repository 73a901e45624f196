// Telemetry data domain models
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One timestamped numeric observation of an entity's state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }

    /// Build a sample from a raw backend value, dropping anything that is not a finite number
    pub fn parse(raw: &serde_json::Value, timestamp: DateTime<Utc>) -> Option<Self> {
        let value = match raw {
            serde_json::Value::Number(n) => n.as_f64()?,
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        Self::is_plottable(value).then(|| Self::new(value, timestamp))
    }

    pub fn is_plottable(value: f64) -> bool {
        value.is_finite()
    }

    /// Hours elapsed between this sample and `now`; negative for samples from the future
    pub fn hours_ago(&self, now: DateTime<Utc>) -> f64 {
        (now - self.timestamp).num_milliseconds() as f64 / 3_600_000.0
    }
}

/// A pixel-space point of the rendered polyline
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProjectedPoint {
    pub x: f64,
    pub y: f64,
}

impl ProjectedPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}
