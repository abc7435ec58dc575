//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulation engine module exports and shared types."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Equipment fleet simulation engine.
//!
//! The [`Engine`] owns the equipment registry and serialises every start, stop
//! and emergency transition. Inrush transients settle on a per-equipment
//! cancellable timer, the [`TelemetrySampler`] folds live values into bounded
//! history, and fleet aggregates are recomputed after every mutation.

pub mod aggregate;
pub mod alarms;
pub mod command;
pub mod engine;
pub mod equipment;
pub mod error;
pub mod inrush;
pub mod registry;
pub mod ring;
pub mod sampler;

pub use aggregate::{FleetAggregate, PowerReadings};
pub use alarms::{AlarmEvent, AlarmKind, AlarmSeverity};
pub use command::{AlarmFilter, Command, CommandOutcome, ControlSession, ParseCommandError};
pub use engine::{Engine, FleetSnapshot};
pub use equipment::{Category, DriveState, Equipment, EquipmentStatus, HistorySample, Ratings};
pub use error::CommandError;
pub use inrush::{InrushLogEntry, InrushModel, InrushReading};
pub use registry::EquipmentRegistry;
pub use ring::BoundedLog;
pub use sampler::TelemetrySampler;
