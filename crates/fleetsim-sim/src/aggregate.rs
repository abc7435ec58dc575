//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fleet-wide electrical aggregates."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::equipment::{Category, Equipment};

pub const BASE_POWER_FACTOR: f64 = 0.95;
pub const MOTOR_PENALTY: f64 = 0.05;
pub const INVERTER_PENALTY: f64 = 0.03;
pub const CAPACITOR_COMPENSATION: f64 = 0.15;
pub const MIN_POWER_FACTOR: f64 = 0.70;
pub const MAX_POWER_FACTOR: f64 = 0.99;
/// Reported average voltage when nothing is running.
pub const IDLE_VOLTAGE: f64 = 380.0;

/// Fleet aggregate derived from the registry. Never mutated independently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FleetAggregate {
    pub power_factor: f64,
    pub total_current: f64,
    pub average_voltage: f64,
    pub running: usize,
}

impl Default for FleetAggregate {
    fn default() -> Self {
        Self {
            power_factor: BASE_POWER_FACTOR,
            total_current: 0.0,
            average_voltage: IDLE_VOLTAGE,
            running: 0,
        }
    }
}

impl FleetAggregate {
    pub fn compute<'a, I>(units: I) -> Self
    where
        I: IntoIterator<Item = &'a Equipment>,
    {
        let mut accumulator = AggregateAccumulator::default();
        for unit in units {
            accumulator.observe(unit);
        }
        accumulator.finish()
    }

    /// Active, reactive and apparent power of the whole fleet.
    pub fn power(&self) -> PowerReadings {
        PowerReadings::from_line(self.total_current, self.average_voltage, self.power_factor)
    }
}

/// Incremental form of [`FleetAggregate::compute`] for visitors that cannot
/// hand out an iterator (e.g. lock-per-record traversal).
#[derive(Debug, Default, Clone)]
pub struct AggregateAccumulator {
    running: usize,
    total_current: f64,
    voltage_sum: f64,
    running_motors: usize,
    running_inverters: usize,
    capacitor_running: bool,
}

impl AggregateAccumulator {
    /// Fold one unit in. Capacitor compensation (+0.15) applies once if any bank is running.
    pub fn observe(&mut self, unit: &Equipment) {
        if !unit.is_running() {
            return;
        }
        self.running += 1;
        self.total_current += unit.current();
        self.voltage_sum += unit.voltage();
        match unit.category() {
            Category::Motor => self.running_motors += 1,
            Category::Inverter => self.running_inverters += 1,
            Category::Capacitor => self.capacitor_running = true,
            Category::Transformer | Category::Generator | Category::Other => {}
        }
    }

    pub fn finish(self) -> FleetAggregate {
        let average_voltage = if self.running == 0 {
            IDLE_VOLTAGE
        } else {
            self.voltage_sum / self.running as f64
        };
        FleetAggregate {
            power_factor: power_factor(
                self.running_motors,
                self.running_inverters,
                self.capacitor_running,
            ),
            total_current: self.total_current,
            average_voltage,
            running: self.running,
        }
    }
}

/// Fleet power factor: motors and drives degrade it, a capacitor bank compensates.
pub fn power_factor(running_motors: usize, running_inverters: usize, capacitor_running: bool) -> f64 {
    let mut pf = BASE_POWER_FACTOR;
    pf -= MOTOR_PENALTY * running_motors as f64;
    pf -= INVERTER_PENALTY * running_inverters as f64;
    if capacitor_running {
        pf += CAPACITOR_COMPENSATION;
    }
    pf.clamp(MIN_POWER_FACTOR, MAX_POWER_FACTOR)
}

/// Power triangle for a line current and voltage at a power factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerReadings {
    pub active_kw: f64,
    pub reactive_kvar: f64,
    pub apparent_kva: f64,
}

impl PowerReadings {
    pub fn from_line(current: f64, voltage: f64, power_factor: f64) -> Self {
        let volt_amps = current * voltage;
        let active_kw = volt_amps * power_factor / 1000.0;
        let reactive_kvar = volt_amps * (1.0 - power_factor * power_factor).max(0.0).sqrt() / 1000.0;
        Self {
            active_kw,
            reactive_kvar,
            apparent_kva: active_kw.hypot(reactive_kvar),
        }
    }
}
