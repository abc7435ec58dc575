//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control command rejection taxonomy."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use thiserror::Error;

/// Reasons a control command was refused. A rejection never changes state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("equipment {0} not found")]
    NotFound(String),
    #[error("emergency stop is active; start refused")]
    Emergency,
    #[error("motor start interlock active; retry in {} ms", remaining.as_millis())]
    Interlock { remaining: Duration },
    #[error("caller is not allowed to issue control commands")]
    Unauthorized,
    #[error("equipment {0} is not an inverter")]
    NotInverter(String),
    #[error("frequency {requested} Hz is outside the drive range {min}-{max} Hz")]
    InvalidFrequency { requested: f64, min: f64, max: f64 },
    #[error("alarm {0} not found")]
    AlarmNotFound(u64),
    #[error("alarm {0} is already acknowledged")]
    AlarmAcknowledged(u64),
    #[error("alarm {0} is already resolved")]
    AlarmResolved(u64),
}

impl CommandError {
    /// Stable label for metrics and structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            CommandError::NotFound(_) => "not_found",
            CommandError::Emergency => "emergency",
            CommandError::Interlock { .. } => "interlock",
            CommandError::Unauthorized => "unauthorized",
            CommandError::NotInverter(_) => "not_inverter",
            CommandError::InvalidFrequency { .. } => "invalid_frequency",
            CommandError::AlarmNotFound(_) => "alarm_not_found",
            CommandError::AlarmAcknowledged(_) => "alarm_acknowledged",
            CommandError::AlarmResolved(_) => "alarm_resolved",
        }
    }
}
