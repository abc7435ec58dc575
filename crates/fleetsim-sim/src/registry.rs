//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Equipment registry with per-record exclusive access."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use fleetsim_common::config::{DriveConfig, EquipmentSpec, SimulationConfig};
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::equipment::{Category, Equipment, EquipmentStatus};

/// Source of truth for equipment state.
///
/// The id set is fixed at construction. Each record sits behind its own lock so
/// a transition or sample append is atomic with respect to readers, and writers
/// on different units never contend.
#[derive(Debug)]
pub struct EquipmentRegistry {
    units: IndexMap<String, Mutex<Equipment>>,
}

impl EquipmentRegistry {
    /// Build the registry in declaration order. Later duplicates of an id are ignored.
    pub fn from_specs(
        specs: &[EquipmentSpec],
        sim: &SimulationConfig,
        drive: &DriveConfig,
    ) -> Self {
        let mut units = IndexMap::with_capacity(specs.len());
        for spec in specs {
            units.entry(spec.id.clone()).or_insert_with(|| {
                let unit = Equipment::from_spec(spec, sim).with_drive_setpoint(drive.default_setpoint);
                Mutex::new(unit)
            });
        }
        Self { units }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.units.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    /// Copy of the current record.
    pub fn get(&self, id: &str) -> Option<Equipment> {
        self.units.get(id).map(|unit| unit.lock().clone())
    }

    pub fn category(&self, id: &str) -> Option<Category> {
        self.units.get(id).map(|unit| unit.lock().category())
    }

    /// Read-only iteration in registry order; each record is locked while visited.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Equipment),
    {
        for unit in self.units.values() {
            visit(&unit.lock());
        }
    }

    pub fn snapshot(&self) -> Vec<Equipment> {
        self.units.values().map(|unit| unit.lock().clone()).collect()
    }

    pub fn by_status(&self, status: EquipmentStatus) -> Vec<Equipment> {
        self.filter(|unit| unit.status() == status)
    }

    pub fn by_category(&self, category: Category) -> Vec<Equipment> {
        self.filter(|unit| unit.category() == category)
    }

    fn filter<P>(&self, predicate: P) -> Vec<Equipment>
    where
        P: Fn(&Equipment) -> bool,
    {
        self.units
            .values()
            .filter_map(|unit| {
                let guard = unit.lock();
                predicate(&guard).then(|| guard.clone())
            })
            .collect()
    }

    /// Run `mutation` with exclusive access to one record.
    ///
    /// Returns `None` for unknown ids without touching any state.
    pub(crate) fn apply_transition<R, F>(&self, id: &str, mutation: F) -> Option<R>
    where
        F: FnOnce(&mut Equipment) -> R,
    {
        self.units.get(id).map(|unit| mutation(&mut unit.lock()))
    }

    /// Run `mutation` on every record in turn, one lock at a time.
    pub(crate) fn apply_all<F>(&self, mut mutation: F)
    where
        F: FnMut(&mut Equipment),
    {
        for unit in self.units.values() {
            mutation(&mut unit.lock());
        }
    }
}
