//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Equipment state machine, interlock and emergency override."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fleetsim_common::config::{AppConfig, DriveConfig, SimulationConfig};
use fleetsim_common::time::{remaining_in_window, wall_clock};
use fleetsim_metrics::FleetMetrics;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregate::{AggregateAccumulator, FleetAggregate};
use crate::alarms::{AlarmBook, AlarmEvent};
use crate::equipment::{Category, Equipment, EquipmentStatus};
use crate::error::CommandError;
use crate::inrush::{InrushLogEntry, InrushModel};
use crate::registry::EquipmentRegistry;
use crate::ring::BoundedLog;

/// Pending settle timer for one unit, tagged with the start that armed it.
#[derive(Debug)]
struct SettleTask {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Command-side state. Held while a transition is validated and applied so the
/// emergency flag, interlock timestamp and settle timers change atomically.
///
/// Lock order: control, then alarms, then equipment records.
#[derive(Debug, Default)]
struct ControlState {
    emergency: bool,
    last_motor_start: Option<Instant>,
    generation: u64,
    settle_tasks: HashMap<String, SettleTask>,
}

impl ControlState {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn cancel_settle(&mut self, id: &str) {
        if let Some(task) = self.settle_tasks.remove(id) {
            task.handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, task) in self.settle_tasks.drain() {
            task.handle.abort();
        }
    }

    /// Claim the settle for `id` if `generation` is still the armed one.
    ///
    /// An aborted timer can already be past its sleep; a stop or restart
    /// replaces or removes the entry, so the late timer finds no match.
    fn take_settle(&mut self, id: &str, generation: u64) -> bool {
        match self.settle_tasks.get(id) {
            Some(task) if task.generation == generation => {
                self.settle_tasks.remove(id);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
struct EngineInner {
    registry: EquipmentRegistry,
    model: InrushModel,
    sim: SimulationConfig,
    drive: DriveConfig,
    control: Mutex<ControlState>,
    inrush_log: Mutex<BoundedLog<InrushLogEntry>>,
    alarms: Mutex<AlarmBook>,
    aggregate_tx: watch::Sender<FleetAggregate>,
    metrics: Option<FleetMetrics>,
}

/// Owned handle to one simulation instance. Cheap to clone.
///
/// Start requests spawn their settle timer on the ambient tokio runtime, so
/// [`Engine::request_start`] must be called from within one.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub equipment: Vec<Equipment>,
    pub aggregate: FleetAggregate,
    pub emergency_active: bool,
    pub interlock_active: bool,
    pub interlock_remaining_ms: u64,
    pub inrush_log: Vec<InrushLogEntry>,
    pub alarms: Vec<AlarmEvent>,
}

impl Engine {
    pub fn from_config(config: &AppConfig, metrics: Option<FleetMetrics>) -> Self {
        let registry = EquipmentRegistry::from_specs(
            &config.effective_fleet(),
            &config.simulation,
            &config.drive,
        );
        let aggregate = compute_aggregate(&registry);
        let (aggregate_tx, _) = watch::channel(aggregate);
        let inner = EngineInner {
            registry,
            model: InrushModel::new(config.inrush.clone()),
            sim: config.simulation.clone(),
            drive: config.drive.clone(),
            control: Mutex::new(ControlState::default()),
            inrush_log: Mutex::new(BoundedLog::with_capacity(config.simulation.log_capacity)),
            alarms: Mutex::new(AlarmBook::new(
                config.alarms.clone(),
                config.simulation.log_capacity,
            )),
            aggregate_tx,
            metrics,
        };
        if let Some(metrics) = &inner.metrics {
            metrics.set_emergency(false);
            metrics.set_aggregate(
                aggregate.power_factor,
                aggregate.total_current,
                aggregate.average_voltage,
                aggregate.running,
            );
        }
        info!(
            equipment = inner.registry.len(),
            running = aggregate.running,
            "simulation engine initialised"
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn registry(&self) -> &EquipmentRegistry {
        &self.inner.registry
    }

    pub fn simulation_config(&self) -> &SimulationConfig {
        &self.inner.sim
    }

    pub fn drive_config(&self) -> &DriveConfig {
        &self.inner.drive
    }

    pub fn inrush_model(&self) -> &InrushModel {
        &self.inner.model
    }

    pub fn equipment(&self, id: &str) -> Option<Equipment> {
        self.inner.registry.get(id)
    }

    /// Start a unit.
    ///
    /// Refused while the emergency stop is engaged and, for motors, within the
    /// fleet-wide interlock window after any motor start. On success the unit
    /// holds inrush values until its settle timer fires.
    pub fn request_start(&self, id: &str) -> Result<InrushLogEntry, CommandError> {
        let now = Instant::now();
        let mut control = self.inner.control.lock();

        if control.emergency {
            return Err(self.reject(id, CommandError::Emergency));
        }
        let Some(category) = self.inner.registry.category(id) else {
            return Err(self.reject(id, CommandError::NotFound(id.to_owned())));
        };
        if category == Category::Motor {
            let remaining = self.interlock_remaining_locked(&control, now);
            if !remaining.is_zero() {
                return Err(self.reject(id, CommandError::Interlock { remaining }));
            }
        }

        let model = &self.inner.model;
        let started = self.inner.registry.apply_transition(id, |unit| {
            let reading = model.for_equipment(unit);
            unit.energise(&reading);
            (reading, unit.clone())
        });
        let Some((reading, unit)) = started else {
            return Err(self.reject(id, CommandError::NotFound(id.to_owned())));
        };
        if category == Category::Motor {
            control.last_motor_start = Some(now);
        }

        let timestamp = wall_clock();
        let entry = InrushLogEntry {
            timestamp,
            equipment_id: unit.id().to_owned(),
            equipment_name: unit.name().to_owned(),
            inrush_current: reading.inrush_current,
            nominal_current: unit.nominal_current(),
            inrush_factor: reading.factor,
            alarm: reading.alarm,
        };
        self.inner.inrush_log.lock().push(entry.clone());
        if reading.alarm {
            let limit = model.config().alarm_multiple * unit.nominal_current();
            self.inner
                .alarms
                .lock()
                .raise(AlarmEvent::inrush(&unit, &reading, limit, timestamp));
        }

        control.cancel_settle(id);
        let generation = control.next_generation();
        let handle = self.spawn_settle(id.to_owned(), generation);
        control
            .settle_tasks
            .insert(id.to_owned(), SettleTask { generation, handle });
        drop(control);

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_inrush(category.as_str(), reading.alarm);
        }
        info!(
            equipment = %entry.equipment_id,
            name = %entry.equipment_name,
            category = %category,
            inrush_a = entry.inrush_current,
            factor = entry.inrush_factor,
            alarm = entry.alarm,
            "equipment started"
        );
        self.publish_aggregate();
        Ok(entry)
    }

    /// Stop a unit. Always allowed, including during an emergency.
    pub fn request_stop(&self, id: &str) -> Result<Equipment, CommandError> {
        let mut control = self.inner.control.lock();
        let sim = &self.inner.sim;
        let stopped = self.inner.registry.apply_transition(id, |unit| {
            unit.shut_down(sim.stop_cooldown, sim.ambient);
            unit.clone()
        });
        let Some(unit) = stopped else {
            return Err(self.reject(id, CommandError::NotFound(id.to_owned())));
        };
        control.cancel_settle(id);
        drop(control);

        info!(equipment = %unit.id(), name = %unit.name(), temperature = unit.temperature(), "equipment stopped");
        self.publish_aggregate();
        Ok(unit)
    }

    /// Change the frequency setpoint of an inverter.
    ///
    /// A running drive switches its output frequency at once; a stopped drive
    /// keeps the setpoint for its next start.
    pub fn set_frequency(&self, id: &str, hz: f64) -> Result<Equipment, CommandError> {
        let Some(category) = self.inner.registry.category(id) else {
            return Err(self.reject(id, CommandError::NotFound(id.to_owned())));
        };
        if category != Category::Inverter {
            return Err(self.reject(id, CommandError::NotInverter(id.to_owned())));
        }
        let drive = &self.inner.drive;
        if !drive.accepts(hz) {
            let error = CommandError::InvalidFrequency {
                requested: hz,
                min: drive.min_frequency,
                max: drive.max_frequency,
            };
            return Err(self.reject(id, error));
        }
        let updated = self.inner.registry.apply_transition(id, |unit| {
            unit.set_frequency(hz);
            unit.clone()
        });
        let Some(unit) = updated else {
            return Err(self.reject(id, CommandError::NotFound(id.to_owned())));
        };
        if let Some(state) = unit.drive() {
            info!(
                equipment = %unit.id(),
                setpoint_hz = state.setpoint,
                output_hz = state.output_frequency,
                "drive frequency updated"
            );
        }
        Ok(unit)
    }

    /// Engage or release the emergency stop. Returns whether the flag changed.
    ///
    /// Engaging stops every unit at once and cancels pending settle timers.
    /// Releasing restarts nothing. The interlock timestamp is left untouched.
    pub fn set_emergency(&self, active: bool) -> bool {
        let mut control = self.inner.control.lock();
        if control.emergency == active {
            return false;
        }
        control.emergency = active;

        if active {
            control.cancel_all();
            let sim = &self.inner.sim;
            let timestamp = wall_clock();
            let mut tripped = Vec::new();
            self.inner.registry.apply_all(|unit| {
                if unit.is_running() {
                    tripped.push(AlarmEvent::emergency_stop(unit, timestamp));
                }
                unit.shut_down(sim.emergency_cooldown, sim.ambient);
            });
            drop(control);

            let mut alarms = self.inner.alarms.lock();
            for event in tripped {
                alarms.raise(event);
            }
            drop(alarms);
            warn!("emergency stop engaged; all equipment stopped");
        } else {
            drop(control);
            info!("emergency stop released");
        }

        if let Some(metrics) = &self.inner.metrics {
            metrics.set_emergency(active);
        }
        self.publish_aggregate();
        true
    }

    pub fn is_emergency_active(&self) -> bool {
        self.inner.control.lock().emergency
    }

    /// Time until the next motor start is permitted; zero when the interlock is clear.
    pub fn interlock_remaining(&self) -> Duration {
        let control = self.inner.control.lock();
        self.interlock_remaining_locked(&control, Instant::now())
    }

    pub fn interlock_active(&self) -> bool {
        !self.interlock_remaining().is_zero()
    }

    pub fn inrush_log(&self) -> Vec<InrushLogEntry> {
        self.inner.inrush_log.lock().to_vec()
    }

    pub fn alarms(&self) -> Vec<AlarmEvent> {
        self.inner.alarms.lock().events()
    }

    pub fn active_alarms(&self) -> Vec<AlarmEvent> {
        self.inner.alarms.lock().active()
    }

    pub fn unacknowledged_alarms(&self) -> Vec<AlarmEvent> {
        self.inner.alarms.lock().unacknowledged()
    }

    pub fn acknowledge_alarm(&self, alarm_id: u64) -> Result<AlarmEvent, CommandError> {
        let acknowledged = self.inner.alarms.lock().acknowledge(alarm_id, wall_clock());
        acknowledged.map_err(|error| self.reject_alarm(alarm_id, error))
    }

    pub fn resolve_alarm(&self, alarm_id: u64) -> Result<AlarmEvent, CommandError> {
        let resolved = self.inner.alarms.lock().resolve(alarm_id, wall_clock());
        resolved.map_err(|error| self.reject_alarm(alarm_id, error))
    }

    /// Most recently published aggregate.
    pub fn aggregate(&self) -> FleetAggregate {
        *self.inner.aggregate_tx.borrow()
    }

    /// Receiver notified after every registry change.
    pub fn subscribe(&self) -> watch::Receiver<FleetAggregate> {
        self.inner.aggregate_tx.subscribe()
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        let remaining = self.interlock_remaining();
        FleetSnapshot {
            equipment: self.inner.registry.snapshot(),
            aggregate: self.aggregate(),
            emergency_active: self.is_emergency_active(),
            interlock_active: !remaining.is_zero(),
            interlock_remaining_ms: fleetsim_common::time::duration_to_millis(remaining),
            inrush_log: self.inrush_log(),
            alarms: self.alarms(),
        }
    }

    pub fn units_with_status(&self, status: EquipmentStatus) -> Vec<Equipment> {
        self.inner.registry.by_status(status)
    }

    /// Abort every pending settle timer. Leaves equipment state as it is.
    pub fn shutdown(&self) {
        let mut control = self.inner.control.lock();
        let pending = control.settle_tasks.len();
        control.cancel_all();
        debug!(pending, "settle timers cancelled");
    }

    /// Recompute and publish the fleet aggregate from current registry state.
    ///
    /// The recompute runs under the channel's write lock, so concurrent
    /// publishers are serialised and the last one reads the latest registry.
    pub fn publish_aggregate(&self) -> FleetAggregate {
        let registry = &self.inner.registry;
        let metrics = self.inner.metrics.as_ref();
        let mut published = FleetAggregate::default();
        self.inner.aggregate_tx.send_modify(|current| {
            *current = compute_aggregate(registry);
            if let Some(metrics) = metrics {
                metrics.set_aggregate(
                    current.power_factor,
                    current.total_current,
                    current.average_voltage,
                    current.running,
                );
            }
            published = *current;
        });
        published
    }

    /// Fold one telemetry sample into every unit and scan for alarm conditions.
    ///
    /// Holds the control lock for the whole pass, so an emergency stop cannot
    /// land between the check and the writes. Returns the number of alarms
    /// raised, or `None` while the emergency stop is engaged.
    pub(crate) fn sample<F>(&self, mut next_temperature: F) -> Option<usize>
    where
        F: FnMut(&Equipment) -> f64,
    {
        let control = self.inner.control.lock();
        if control.emergency {
            return None;
        }
        let sim = &self.inner.sim;
        let timestamp = wall_clock();
        let mut alarms = self.inner.alarms.lock();
        let mut raised = 0;
        self.inner.registry.apply_all(|unit| {
            let next = next_temperature(unit);
            unit.set_temperature(sim.clamp_temperature(next));
            unit.record_sample(timestamp);
            raised += alarms.scan(unit, timestamp);
        });
        drop(alarms);
        drop(control);
        Some(raised)
    }

    pub(crate) fn metrics(&self) -> Option<&FleetMetrics> {
        self.inner.metrics.as_ref()
    }

    pub(crate) fn record_rejection(&self, error: &CommandError) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_rejection(error.reason());
        }
    }

    fn reject(&self, id: &str, error: CommandError) -> CommandError {
        warn!(equipment = %id, reason = error.reason(), error = %error, "command rejected");
        self.record_rejection(&error);
        error
    }

    fn reject_alarm(&self, alarm_id: u64, error: CommandError) -> CommandError {
        warn!(alarm = alarm_id, reason = error.reason(), error = %error, "alarm command rejected");
        self.record_rejection(&error);
        error
    }

    fn interlock_remaining_locked(&self, control: &ControlState, now: Instant) -> Duration {
        match control.last_motor_start {
            Some(last) => remaining_in_window(
                self.inner.sim.interlock_window,
                now.saturating_duration_since(last),
            ),
            None => Duration::ZERO,
        }
    }

    fn spawn_settle(&self, id: String, generation: u64) -> JoinHandle<()> {
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let delay = self.inner.sim.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = engine.upgrade() else {
                return;
            };
            let engine = Engine { inner };
            engine.settle(&id, generation);
        })
    }

    /// Settle a transient to steady-state values if `generation` still owns
    /// the unit's timer and the unit is still running.
    fn settle(&self, id: &str, generation: u64) {
        let mut control = self.inner.control.lock();
        if !control.take_settle(id, generation) {
            debug!(equipment = %id, generation, "stale settle timer ignored");
            return;
        }
        let settled = self
            .inner
            .registry
            .apply_transition(id, |unit| unit.settle())
            .unwrap_or(false);
        drop(control);
        if settled {
            debug!(equipment = %id, "inrush transient settled");
            self.publish_aggregate();
        } else {
            debug!(equipment = %id, "settle skipped; equipment no longer in transient");
        }
    }
}

fn compute_aggregate(registry: &EquipmentRegistry) -> FleetAggregate {
    let mut accumulator = AggregateAccumulator::default();
    registry.for_each(|unit| accumulator.observe(unit));
    accumulator.finish()
}
