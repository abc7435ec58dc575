//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Equipment alarm events and condition scanning."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::cmp::Reverse;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use fleetsim_common::config::AlarmConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::equipment::Equipment;
use crate::error::CommandError;
use crate::inrush::InrushReading;
use crate::ring::BoundedLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    InrushHigh,
    EmergencyStop,
    Overload,
    OverTemperature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AlarmKind {
    pub fn severity(&self) -> AlarmSeverity {
        match self {
            AlarmKind::InrushHigh | AlarmKind::EmergencyStop => AlarmSeverity::Critical,
            AlarmKind::Overload | AlarmKind::OverTemperature => AlarmSeverity::High,
        }
    }
}

/// One raised alarm. Active until resolved; acknowledgement is independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    /// Assigned by the [`AlarmBook`] when raised; unique for the book's lifetime.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub equipment_id: String,
    pub equipment_name: String,
    pub kind: AlarmKind,
    pub severity: AlarmSeverity,
    pub message: String,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AlarmEvent {
    fn new(
        unit: &Equipment,
        kind: AlarmKind,
        message: String,
        value: Option<f64>,
        threshold: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            timestamp,
            equipment_id: unit.id().to_owned(),
            equipment_name: unit.name().to_owned(),
            kind,
            severity: kind.severity(),
            message,
            value,
            threshold,
            acknowledged: false,
            acknowledged_at: None,
            resolved_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn inrush(unit: &Equipment, reading: &InrushReading, limit: f64, at: DateTime<Utc>) -> Self {
        Self::new(
            unit,
            AlarmKind::InrushHigh,
            format!(
                "inrush current {:.2} A ({:.1}x nominal) exceeds limit",
                reading.inrush_current, reading.factor
            ),
            Some(reading.inrush_current),
            Some(limit),
            at,
        )
    }

    pub fn emergency_stop(unit: &Equipment, at: DateTime<Utc>) -> Self {
        Self::new(
            unit,
            AlarmKind::EmergencyStop,
            "emergency stop engaged while running".to_owned(),
            None,
            None,
            at,
        )
    }
}

/// Transition of a latched condition after one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Latch {
    Raised,
    Cleared,
    Unchanged,
}

/// Bounded alarm history plus the latch set used for edge-triggered conditions.
#[derive(Debug)]
pub struct AlarmBook {
    config: AlarmConfig,
    log: BoundedLog<AlarmEvent>,
    latched: HashSet<(String, AlarmKind)>,
    next_id: u64,
}

impl AlarmBook {
    pub fn new(config: AlarmConfig, capacity: usize) -> Self {
        Self {
            config,
            log: BoundedLog::with_capacity(capacity),
            latched: HashSet::new(),
            next_id: 1,
        }
    }

    /// Record an alarm and return its id.
    pub fn raise(&mut self, mut event: AlarmEvent) -> u64 {
        event.id = self.next_id;
        self.next_id += 1;
        warn!(
            alarm = event.id,
            equipment = %event.equipment_id,
            kind = ?event.kind,
            severity = ?event.severity,
            message = %event.message,
            "alarm raised"
        );
        let id = event.id;
        self.log.push(event);
        id
    }

    /// Mark an alarm as seen by an operator. Resolved alarms may still be acknowledged.
    pub fn acknowledge(&mut self, id: u64, at: DateTime<Utc>) -> Result<AlarmEvent, CommandError> {
        let event = self.find_mut(id)?;
        if event.acknowledged {
            return Err(CommandError::AlarmAcknowledged(id));
        }
        event.acknowledged = true;
        event.acknowledged_at = Some(at);
        info!(alarm = id, equipment = %event.equipment_id, "alarm acknowledged");
        Ok(event.clone())
    }

    /// Close an alarm by hand.
    pub fn resolve(&mut self, id: u64, at: DateTime<Utc>) -> Result<AlarmEvent, CommandError> {
        let event = self.find_mut(id)?;
        if !event.is_active() {
            return Err(CommandError::AlarmResolved(id));
        }
        event.resolved_at = Some(at);
        info!(alarm = id, equipment = %event.equipment_id, "alarm resolved");
        Ok(event.clone())
    }

    fn find_mut(&mut self, id: u64) -> Result<&mut AlarmEvent, CommandError> {
        self.log
            .iter_mut()
            .find(|event| event.id == id)
            .ok_or(CommandError::AlarmNotFound(id))
    }

    /// Resolve every active alarm of `kind` on one unit.
    fn resolve_condition(
        &mut self,
        equipment_id: &str,
        kind: AlarmKind,
        at: DateTime<Utc>,
    ) -> usize {
        let mut resolved = 0;
        for event in self.log.iter_mut() {
            if event.is_active() && event.kind == kind && event.equipment_id == equipment_id {
                event.resolved_at = Some(at);
                resolved += 1;
            }
        }
        if resolved > 0 {
            info!(equipment = %equipment_id, kind = ?kind, resolved, "alarm condition cleared");
        }
        resolved
    }

    /// Evaluate overload and over-temperature on one unit.
    ///
    /// A condition raises once when it passes its trip level and latches until
    /// the value falls to its clear level, which resolves the raised alarm.
    /// Units still in their inrush transient are exempt from the overload check.
    pub fn scan(&mut self, unit: &Equipment, at: DateTime<Utc>) -> usize {
        let mut raised = 0;

        let load = unit.load_percent();
        let load_counts = unit.is_running() && !unit.in_transient();
        let overload = self.latch(
            unit.id(),
            AlarmKind::Overload,
            load_counts && load > self.config.overload_percent,
            !unit.is_running() || load <= self.config.overload_clear_percent,
        );
        match overload {
            Latch::Raised => {
                self.raise(AlarmEvent::new(
                    unit,
                    AlarmKind::Overload,
                    format!("overload: {:.1}% of nominal current", load),
                    Some(load),
                    Some(self.config.overload_percent),
                    at,
                ));
                raised += 1;
            }
            Latch::Cleared => {
                self.resolve_condition(unit.id(), AlarmKind::Overload, at);
            }
            Latch::Unchanged => {}
        }

        let temperature = unit.temperature();
        let overheat = self.latch(
            unit.id(),
            AlarmKind::OverTemperature,
            temperature > self.config.over_temperature,
            temperature <= self.config.over_temperature_clear,
        );
        match overheat {
            Latch::Raised => {
                self.raise(AlarmEvent::new(
                    unit,
                    AlarmKind::OverTemperature,
                    format!("temperature high: {:.1} °C", temperature),
                    Some(temperature),
                    Some(self.config.over_temperature),
                    at,
                ));
                raised += 1;
            }
            Latch::Cleared => {
                self.resolve_condition(unit.id(), AlarmKind::OverTemperature, at);
            }
            Latch::Unchanged => {}
        }

        raised
    }

    fn latch(&mut self, id: &str, kind: AlarmKind, tripped: bool, clear: bool) -> Latch {
        let key = (id.to_owned(), kind);
        if tripped {
            if self.latched.insert(key) {
                Latch::Raised
            } else {
                Latch::Unchanged
            }
        } else if clear && self.latched.remove(&key) {
            Latch::Cleared
        } else {
            Latch::Unchanged
        }
    }

    pub fn events(&self) -> Vec<AlarmEvent> {
        self.log.to_vec()
    }

    /// Unresolved alarms, most severe first and newest first within a severity.
    pub fn active(&self) -> Vec<AlarmEvent> {
        self.collect_sorted(AlarmEvent::is_active)
    }

    /// Unresolved alarms no operator has acknowledged yet.
    pub fn unacknowledged(&self) -> Vec<AlarmEvent> {
        self.collect_sorted(|event| event.is_active() && !event.acknowledged)
    }

    fn collect_sorted<P>(&self, predicate: P) -> Vec<AlarmEvent>
    where
        P: Fn(&AlarmEvent) -> bool,
    {
        let mut events: Vec<AlarmEvent> = self
            .log
            .iter()
            .filter(|event| predicate(event))
            .cloned()
            .collect();
        events.sort_by_key(|event| {
            (
                Reverse(event.severity),
                Reverse(event.timestamp),
                Reverse(event.id),
            )
        });
        events
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsim_common::config::{EquipmentSpec, SimulationConfig};

    fn unit(running: bool, temperature: f64) -> Equipment {
        let spec = EquipmentSpec {
            id: "m".into(),
            name: "Motor M".into(),
            category: "motor".into(),
            nominal_current: 40.0,
            base_voltage: 380.0,
            base_power: 26.0,
            capacitance: None,
            running,
            temperature,
        };
        Equipment::from_spec(&spec, &SimulationConfig::default())
    }

    #[test]
    fn over_temperature_raises_once_until_cleared() {
        let mut book = AlarmBook::new(AlarmConfig::default(), 100);
        let hot = unit(true, 82.0);
        let now = Utc::now();
        assert_eq!(book.scan(&hot, now), 1);
        assert_eq!(book.scan(&hot, now), 0);
        let cool = unit(true, 70.0);
        assert_eq!(book.scan(&cool, now), 0);
        assert_eq!(book.scan(&hot, now), 1);
        assert_eq!(book.len(), 2);
        let events = book.events();
        assert!(!events[0].is_active());
        assert!(events[1].is_active());
        assert_ne!(events[0].id, events[1].id);
        assert!(book
            .events()
            .iter()
            .all(|event| event.kind == AlarmKind::OverTemperature
                && event.severity == AlarmSeverity::High));
    }

    #[test]
    fn over_temperature_latches_until_clear_level() {
        let mut book = AlarmBook::new(AlarmConfig::default(), 100);
        let now = Utc::now();
        assert_eq!(book.scan(&unit(true, 81.0), now), 1);
        // Between the clear and trip levels the alarm stays latched and active.
        assert_eq!(book.scan(&unit(true, 78.0), now), 0);
        assert_eq!(book.scan(&unit(true, 81.0), now), 0);
        assert_eq!(book.active().len(), 1);

        let later = now + chrono::Duration::seconds(3);
        assert_eq!(book.scan(&unit(true, 75.0), later), 0);
        assert!(book.active().is_empty());
        assert_eq!(book.events()[0].resolved_at, Some(later));
    }

    #[test]
    fn overload_resolves_when_unit_stops() {
        let mut book = AlarmBook::new(AlarmConfig::default(), 100);
        let mut motor = unit(false, 30.0);
        motor.energise(&InrushReading {
            inrush_current: 60.0,
            factor: 1.5,
            alarm: false,
        });
        assert!(motor.settle());
        // Steady state at nominal is not an overload.
        assert_eq!(book.scan(&motor, Utc::now()), 0);

        let mut book = AlarmBook::new(
            AlarmConfig {
                overload_percent: 90.0,
                overload_clear_percent: 80.0,
                ..AlarmConfig::default()
            },
            100,
        );
        assert_eq!(book.scan(&motor, Utc::now()), 1);
        motor.shut_down(10.0, 25.0);
        assert_eq!(book.scan(&motor, Utc::now()), 0);
        assert!(book.active().is_empty());
    }

    #[test]
    fn acknowledge_and_resolve_lifecycle() {
        let mut book = AlarmBook::new(AlarmConfig::default(), 100);
        let motor = unit(true, 30.0);
        let now = Utc::now();
        let id = book.raise(AlarmEvent::emergency_stop(&motor, now));

        assert_eq!(book.unacknowledged().len(), 1);
        let acked = book.acknowledge(id, now).unwrap();
        assert!(acked.acknowledged);
        assert_eq!(acked.acknowledged_at, Some(now));
        assert!(acked.is_active());
        assert_eq!(book.acknowledge(id, now), Err(CommandError::AlarmAcknowledged(id)));
        assert!(book.unacknowledged().is_empty());
        assert_eq!(book.active().len(), 1);

        let resolved = book.resolve(id, now).unwrap();
        assert!(!resolved.is_active());
        assert_eq!(book.resolve(id, now), Err(CommandError::AlarmResolved(id)));
        assert!(book.active().is_empty());
        assert_eq!(book.acknowledge(99, now), Err(CommandError::AlarmNotFound(99)));
        assert_eq!(book.resolve(99, now), Err(CommandError::AlarmNotFound(99)));
    }

    #[test]
    fn active_alarms_sort_by_severity_then_recency() {
        let mut book = AlarmBook::new(AlarmConfig::default(), 100);
        let start = Utc::now();
        let hot = book.scan(&unit(true, 82.0), start);
        assert_eq!(hot, 1);
        let motor = unit(true, 30.0);
        let older = book.raise(AlarmEvent::emergency_stop(&motor, start));
        let newer = book.raise(AlarmEvent::emergency_stop(
            &motor,
            start + chrono::Duration::seconds(1),
        ));

        let active = book.active();
        let order: Vec<u64> = active.iter().map(|event| event.id).collect();
        assert_eq!(order, vec![newer, older, 1]);
        assert_eq!(active[2].kind, AlarmKind::OverTemperature);
    }

    #[test]
    fn transient_inrush_is_not_an_overload() {
        let mut book = AlarmBook::new(AlarmConfig::default(), 100);
        let mut motor = unit(false, 30.0);
        motor.energise(&InrushReading {
            inrush_current: 280.0,
            factor: 7.0,
            alarm: false,
        });
        assert_eq!(book.scan(&motor, Utc::now()), 0);
    }

    #[test]
    fn log_is_bounded() {
        let mut book = AlarmBook::new(AlarmConfig::default(), 3);
        let motor = unit(true, 30.0);
        for _ in 0..5 {
            book.raise(AlarmEvent::emergency_stop(&motor, Utc::now()));
        }
        assert_eq!(book.len(), 3);
    }
}
