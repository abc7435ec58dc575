//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Startup inrush current model."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::f64::consts::PI;

use chrono::{DateTime, Utc};
use fleetsim_common::config::InrushConfig;
use serde::{Deserialize, Serialize};

use crate::equipment::{Category, Equipment};

/// Transient startup values for one energisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InrushReading {
    pub inrush_current: f64,
    /// Inrush as a multiple of nominal current.
    pub factor: f64,
    /// `inrush_current > alarm_multiple × nominal_current`.
    pub alarm: bool,
}

/// Entry in the global energisation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InrushLogEntry {
    pub timestamp: DateTime<Utc>,
    pub equipment_id: String,
    pub equipment_name: String,
    pub inrush_current: f64,
    pub nominal_current: f64,
    pub inrush_factor: f64,
    pub alarm: bool,
}

/// Stateless inrush calculator parameterised by per-category constants.
///
/// * Motors and transformers are inductive: `inrush = k × I_nominal`.
/// * Capacitor banks draw `V × 2πf × C`.
/// * Drives, generators and unmodelled loads assume a soft start.
#[derive(Debug, Clone, Default)]
pub struct InrushModel {
    config: InrushConfig,
}

impl InrushModel {
    pub fn new(config: InrushConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InrushConfig {
        &self.config
    }

    pub fn compute(
        &self,
        category: Category,
        nominal_current: f64,
        voltage: f64,
        capacitance: Option<f64>,
    ) -> InrushReading {
        let (inrush_current, factor) = match category {
            Category::Motor => {
                let k = self.config.motor_factor;
                (k * nominal_current, k)
            }
            Category::Transformer => {
                let k = self.config.transformer_factor;
                (k * nominal_current, k)
            }
            Category::Capacitor => {
                let omega = 2.0 * PI * self.config.line_frequency_hz;
                let c = capacitance.unwrap_or(self.config.default_capacitance);
                let inrush = voltage * omega * c;
                (inrush, inrush / nominal_current)
            }
            Category::Inverter | Category::Generator | Category::Other => {
                let k = self.config.soft_start_factor;
                (k * nominal_current, k)
            }
        };
        InrushReading {
            inrush_current,
            factor,
            alarm: self.exceeds_alarm_limit(inrush_current, nominal_current),
        }
    }

    pub fn for_equipment(&self, equipment: &Equipment) -> InrushReading {
        self.compute(
            equipment.category(),
            equipment.nominal_current(),
            equipment.voltage(),
            equipment.capacitance(),
        )
    }

    pub fn exceeds_alarm_limit(&self, inrush_current: f64, nominal_current: f64) -> bool {
        inrush_current > self.config.alarm_multiple * nominal_current
    }
}
