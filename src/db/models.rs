//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::probe::StepResult;

/// One recorded step or service test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub time: DateTime<Utc>,
    pub sensor: String,
    pub network: String,
    /// Step name such as `dhcp`, `dns`, `icmp` or `internal_error`.
    pub step: String,
    /// Service or resolver the step ran against; empty for network steps.
    pub target: String,
    pub ok: bool,
    pub duration_ms: f64,
    pub error: Option<String>,
    /// Measured value for steps that produce one (rtt, loss, MOS, Mbps).
    pub value: Option<f64>,
}

impl ResultRecord {
    pub fn from_step(
        time: DateTime<Utc>,
        sensor: &str,
        network: &str,
        step: &str,
        target: &str,
        result: &StepResult,
    ) -> Self {
        Self {
            time,
            sensor: sensor.to_string(),
            network: network.to_string(),
            step: step.to_string(),
            target: target.to_string(),
            ok: result.ok,
            duration_ms: result.duration_ms(),
            error: result.error.clone(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: Option<f64>) -> Self {
        self.value = value;
        self
    }
}
