//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the simulator runtime."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the FleetSim workspace.
//! This crate exposes configuration loading, logging, and the scheduling
//! helpers consumed by the simulation engine and the daemon.

pub mod config;
pub mod logging;
pub mod schedule;
pub mod time;

pub use config::{
    AlarmConfig, AppConfig, ControlConfig, DriveConfig, EquipmentSpec, InrushConfig,
    LoadedAppConfig, LoggingConfig, MetricsConfig, SimulationConfig,
};
pub use logging::{init_tracing, LogFormat, LogStream};
pub use schedule::RateLimiter;
