//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Equipment records, categories and history samples."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use fleetsim_common::config::{DriveConfig, EquipmentSpec, SimulationConfig};
use serde::{Deserialize, Serialize};

use crate::aggregate::PowerReadings;
use crate::inrush::InrushReading;
use crate::ring::BoundedLog;

/// Equipment category. Fixed at creation; selects the inrush formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Motor,
    Transformer,
    Capacitor,
    Inverter,
    Generator,
    /// Anything not modelled explicitly; treated as a soft-start load.
    #[serde(other)]
    Other,
}

impl Category {
    /// Parse a category label, degrading unknown labels to [`Category::Other`].
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "motor" => Category::Motor,
            "transformer" => Category::Transformer,
            "capacitor" => Category::Capacitor,
            "inverter" => Category::Inverter,
            "generator" => Category::Generator,
            _ => Category::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Motor => "motor",
            Category::Transformer => "transformer",
            Category::Capacitor => "capacitor",
            Category::Inverter => "inverter",
            Category::Generator => "generator",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentStatus {
    Stopped,
    Running,
}

/// Steady-state ratings captured at creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ratings {
    pub nominal_current: f64,
    pub base_voltage: f64,
    pub base_power: f64,
}

/// One telemetry point folded into an equipment's history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub timestamp: DateTime<Utc>,
    pub current: f64,
    pub voltage: f64,
    pub power: f64,
    pub temperature: f64,
}

/// Frequency state of a variable-frequency drive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriveState {
    /// Requested output frequency in Hz.
    pub setpoint: f64,
    /// Frequency actually delivered; zero while stopped.
    pub output_frequency: f64,
}

impl DriveState {
    /// Synchronous shaft speed of the driven motor: `120 * f / poles`.
    pub fn shaft_speed_rpm(&self, poles: u32) -> f64 {
        if poles == 0 {
            return 0.0;
        }
        120.0 * self.output_frequency / f64::from(poles)
    }
}

/// Live record of one physical unit.
///
/// Fields are read-only outside the crate; every write goes through
/// [`EquipmentRegistry::apply_transition`](crate::registry::EquipmentRegistry::apply_transition).
#[derive(Debug, Clone, Serialize)]
pub struct Equipment {
    id: String,
    name: String,
    category: Category,
    status: EquipmentStatus,
    in_transient: bool,
    current: f64,
    voltage: f64,
    power: f64,
    temperature: f64,
    ratings: Ratings,
    capacitance: Option<f64>,
    /// Present only for inverters.
    drive: Option<DriveState>,
    history: BoundedLog<HistorySample>,
}

impl Equipment {
    /// Build a record from its static definition.
    ///
    /// Units declared running start at their steady-state values; the initial
    /// temperature is clamped into the thermal envelope.
    pub fn from_spec(spec: &EquipmentSpec, sim: &SimulationConfig) -> Self {
        let ratings = Ratings {
            nominal_current: spec.nominal_current,
            base_voltage: spec.base_voltage,
            base_power: spec.base_power,
        };
        let category = Category::from_label(&spec.category);
        let setpoint = DriveConfig::default().default_setpoint;
        let drive = (category == Category::Inverter).then(|| DriveState {
            setpoint,
            output_frequency: if spec.running { setpoint } else { 0.0 },
        });
        let (status, current, power) = if spec.running {
            (
                EquipmentStatus::Running,
                ratings.nominal_current,
                ratings.base_power,
            )
        } else {
            (EquipmentStatus::Stopped, 0.0, 0.0)
        };
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            category,
            status,
            in_transient: false,
            current,
            voltage: ratings.base_voltage,
            power,
            temperature: sim.clamp_temperature(spec.temperature),
            ratings,
            capacitance: spec.capacitance,
            drive,
            history: BoundedLog::with_capacity(sim.history_capacity),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn status(&self) -> EquipmentStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == EquipmentStatus::Running
    }

    /// Running with inrush values that have not yet settled.
    pub fn in_transient(&self) -> bool {
        self.in_transient
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    pub fn power(&self) -> f64 {
        self.power
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn ratings(&self) -> Ratings {
        self.ratings
    }

    pub fn nominal_current(&self) -> f64 {
        self.ratings.nominal_current
    }

    pub fn capacitance(&self) -> Option<f64> {
        self.capacitance
    }

    pub fn drive(&self) -> Option<DriveState> {
        self.drive
    }

    pub fn history(&self) -> &BoundedLog<HistorySample> {
        &self.history
    }

    /// Load as a percentage of nominal current.
    pub fn load_percent(&self) -> f64 {
        self.current / self.ratings.nominal_current * 100.0
    }

    /// Active, reactive and apparent power at the given power factor.
    pub fn power_readings(&self, power_factor: f64) -> PowerReadings {
        PowerReadings::from_line(self.current, self.voltage, power_factor)
    }

    /// Replace the initial drive setpoint. Ignored for units without a drive.
    pub(crate) fn with_drive_setpoint(mut self, setpoint: f64) -> Self {
        let running = self.is_running();
        if let Some(drive) = self.drive.as_mut() {
            drive.setpoint = setpoint;
            drive.output_frequency = if running { setpoint } else { 0.0 };
        }
        self
    }

    /// Store a new drive setpoint; a running drive follows it at once.
    ///
    /// Returns false when the unit has no drive.
    pub(crate) fn set_frequency(&mut self, hz: f64) -> bool {
        let running = self.is_running();
        match self.drive.as_mut() {
            Some(drive) => {
                drive.setpoint = hz;
                if running {
                    drive.output_frequency = hz;
                }
                true
            }
            None => false,
        }
    }

    /// Enter the running-transient state with inrush values.
    pub(crate) fn energise(&mut self, reading: &InrushReading) {
        self.status = EquipmentStatus::Running;
        self.in_transient = true;
        self.current = reading.inrush_current;
        self.voltage = self.ratings.base_voltage;
        self.power = self.ratings.base_power * reading.factor;
        if let Some(drive) = self.drive.as_mut() {
            drive.output_frequency = drive.setpoint;
        }
    }

    /// Drop from transient to steady-state values. No-op unless still in transient.
    pub(crate) fn settle(&mut self) -> bool {
        if !(self.is_running() && self.in_transient) {
            return false;
        }
        self.in_transient = false;
        self.current = self.ratings.nominal_current;
        self.power = self.ratings.base_power;
        true
    }

    /// Stop the unit and cool it by `cooldown`, never below `ambient`.
    pub(crate) fn shut_down(&mut self, cooldown: f64, ambient: f64) {
        self.status = EquipmentStatus::Stopped;
        self.in_transient = false;
        self.current = 0.0;
        self.power = 0.0;
        self.temperature = (self.temperature - cooldown).max(ambient);
        if let Some(drive) = self.drive.as_mut() {
            drive.output_frequency = 0.0;
        }
    }

    pub(crate) fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
    }

    /// Append a sample of the live values; stopped units report zero current and power.
    pub(crate) fn record_sample(&mut self, timestamp: DateTime<Utc>) {
        let (current, power) = if self.is_running() {
            (self.current, self.power)
        } else {
            (0.0, 0.0)
        };
        self.history.push(HistorySample {
            timestamp,
            current,
            voltage: self.voltage,
            power,
            temperature: self.temperature,
        });
    }
}
