//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Layered TOML configuration for the simulator."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::{LogFormat, LogStream};

fn default_settle_delay() -> Duration {
    Duration::from_millis(2000)
}

fn default_sample_interval() -> Duration {
    Duration::from_millis(3000)
}

fn default_interlock_window() -> Duration {
    Duration::from_millis(5000)
}

fn default_history_capacity() -> usize {
    50
}

fn default_log_capacity() -> usize {
    100
}

fn default_simulation_seed() -> u64 {
    0xF1EE7u64
}

fn default_ambient() -> f64 {
    25.0
}

fn default_max_temperature() -> f64 {
    85.0
}

fn default_walk_step() -> f64 {
    1.0
}

fn default_idle_decay() -> f64 {
    0.5
}

fn default_stop_cooldown() -> f64 {
    10.0
}

fn default_emergency_cooldown() -> f64 {
    5.0
}

fn default_motor_factor() -> f64 {
    7.0
}

fn default_transformer_factor() -> f64 {
    8.0
}

fn default_soft_start_factor() -> f64 {
    3.0
}

fn default_alarm_multiple() -> f64 {
    12.0
}

fn default_line_frequency() -> f64 {
    60.0
}

fn default_capacitance() -> f64 {
    0.001
}

fn default_overload_percent() -> f64 {
    110.0
}

fn default_over_temperature() -> f64 {
    80.0
}

fn default_overload_clear_percent() -> f64 {
    100.0
}

fn default_over_temperature_clear() -> f64 {
    75.0
}

fn default_min_frequency() -> f64 {
    10.0
}

fn default_max_frequency() -> f64 {
    60.0
}

fn default_frequency_setpoint() -> f64 {
    60.0
}

fn default_motor_poles() -> u32 {
    4
}

fn default_can_control() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_file_output() -> bool {
    true
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the simulator runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub inrush: InrushConfig,
    #[serde(default)]
    pub alarms: AlarmConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub fleet: Vec<EquipmentSpec>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "FLEETSIM_CONFIG";

    /// Load configuration from disk, respecting the `FLEETSIM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Equipment definitions in effect; the reference plant when none are configured.
    pub fn effective_fleet(&self) -> Vec<EquipmentSpec> {
        if self.fleet.is_empty() {
            EquipmentSpec::reference_plant()
        } else {
            self.fleet.clone()
        }
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()?;
        self.inrush.validate()?;
        self.alarms.validate()?;
        self.drive.validate()?;
        let mut seen = HashSet::new();
        for spec in &self.fleet {
            spec.validate()?;
            if !seen.insert(spec.id.as_str()) {
                return Err(anyhow!("duplicate equipment id '{}'", spec.id));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Timing, buffer and thermal constants for the simulation engine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_settle_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub settle_delay: Duration,
    #[serde(default = "default_sample_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sample_interval: Duration,
    #[serde(default = "default_interlock_window")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interlock_window: Duration,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_simulation_seed")]
    pub random_seed: u64,
    #[serde(default = "default_ambient")]
    pub ambient: f64,
    #[serde(default = "default_max_temperature")]
    pub max_temperature: f64,
    #[serde(default = "default_walk_step")]
    pub walk_step: f64,
    #[serde(default = "default_idle_decay")]
    pub idle_decay: f64,
    #[serde(default = "default_stop_cooldown")]
    pub stop_cooldown: f64,
    #[serde(default = "default_emergency_cooldown")]
    pub emergency_cooldown: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            settle_delay: default_settle_delay(),
            sample_interval: default_sample_interval(),
            interlock_window: default_interlock_window(),
            history_capacity: default_history_capacity(),
            log_capacity: default_log_capacity(),
            random_seed: default_simulation_seed(),
            ambient: default_ambient(),
            max_temperature: default_max_temperature(),
            walk_step: default_walk_step(),
            idle_decay: default_idle_decay(),
            stop_cooldown: default_stop_cooldown(),
            emergency_cooldown: default_emergency_cooldown(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval.is_zero() {
            return Err(anyhow!("simulation.sample_interval must be positive"));
        }
        if self.history_capacity == 0 || self.log_capacity == 0 {
            return Err(anyhow!(
                "simulation.history_capacity and simulation.log_capacity must be positive"
            ));
        }
        let thermal = [
            ("ambient", self.ambient),
            ("max_temperature", self.max_temperature),
            ("walk_step", self.walk_step),
            ("idle_decay", self.idle_decay),
            ("stop_cooldown", self.stop_cooldown),
            ("emergency_cooldown", self.emergency_cooldown),
        ];
        for (name, value) in thermal {
            if !value.is_finite() {
                return Err(anyhow!("simulation.{} must be a finite number", name));
            }
        }
        let non_negative = [
            ("walk_step", self.walk_step),
            ("idle_decay", self.idle_decay),
            ("stop_cooldown", self.stop_cooldown),
            ("emergency_cooldown", self.emergency_cooldown),
        ];
        for (name, value) in non_negative {
            if value < 0.0 {
                return Err(anyhow!("simulation.{} must not be negative", name));
            }
        }
        if self.max_temperature <= self.ambient {
            return Err(anyhow!(
                "simulation.max_temperature ({}) must exceed ambient ({})",
                self.max_temperature,
                self.ambient
            ));
        }
        Ok(())
    }

    /// Clamp a temperature into the simulated thermal envelope.
    pub fn clamp_temperature(&self, value: f64) -> f64 {
        value.clamp(self.ambient, self.max_temperature)
    }
}

/// Per-category inrush multipliers and alarm threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InrushConfig {
    #[serde(default = "default_motor_factor")]
    pub motor_factor: f64,
    #[serde(default = "default_transformer_factor")]
    pub transformer_factor: f64,
    #[serde(default = "default_soft_start_factor")]
    pub soft_start_factor: f64,
    #[serde(default = "default_alarm_multiple")]
    pub alarm_multiple: f64,
    #[serde(default = "default_line_frequency")]
    pub line_frequency_hz: f64,
    #[serde(default = "default_capacitance")]
    pub default_capacitance: f64,
}

impl Default for InrushConfig {
    fn default() -> Self {
        Self {
            motor_factor: default_motor_factor(),
            transformer_factor: default_transformer_factor(),
            soft_start_factor: default_soft_start_factor(),
            alarm_multiple: default_alarm_multiple(),
            line_frequency_hz: default_line_frequency(),
            default_capacitance: default_capacitance(),
        }
    }
}

impl InrushConfig {
    pub fn validate(&self) -> Result<()> {
        let factors = [
            ("motor_factor", self.motor_factor),
            ("transformer_factor", self.transformer_factor),
            ("soft_start_factor", self.soft_start_factor),
            ("alarm_multiple", self.alarm_multiple),
            ("line_frequency_hz", self.line_frequency_hz),
            ("default_capacitance", self.default_capacitance),
        ];
        for (name, value) in factors {
            if !(value.is_finite() && value > 0.0) {
                return Err(anyhow!("inrush.{} must be a positive number", name));
            }
        }
        Ok(())
    }
}

/// Raise and auto-resolve thresholds for condition alarms.
///
/// An alarm raises above its trip level and resolves once the value falls to
/// its clear level or below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    #[serde(default = "default_overload_percent")]
    pub overload_percent: f64,
    #[serde(default = "default_overload_clear_percent")]
    pub overload_clear_percent: f64,
    #[serde(default = "default_over_temperature")]
    pub over_temperature: f64,
    #[serde(default = "default_over_temperature_clear")]
    pub over_temperature_clear: f64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            overload_percent: default_overload_percent(),
            overload_clear_percent: default_overload_clear_percent(),
            over_temperature: default_over_temperature(),
            over_temperature_clear: default_over_temperature_clear(),
        }
    }
}

impl AlarmConfig {
    pub fn validate(&self) -> Result<()> {
        let pairs = [
            ("overload", self.overload_percent, self.overload_clear_percent),
            ("over_temperature", self.over_temperature, self.over_temperature_clear),
        ];
        for (name, trip, clear) in pairs {
            if !(trip.is_finite() && clear.is_finite()) {
                return Err(anyhow!("alarms.{} thresholds must be finite", name));
            }
            if clear > trip {
                return Err(anyhow!(
                    "alarms.{} clear level ({}) must not exceed its trip level ({})",
                    name,
                    clear,
                    trip
                ));
            }
        }
        Ok(())
    }
}

/// Frequency limits for variable-frequency drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    #[serde(default = "default_min_frequency")]
    pub min_frequency: f64,
    #[serde(default = "default_max_frequency")]
    pub max_frequency: f64,
    /// Setpoint every drive starts with.
    #[serde(default = "default_frequency_setpoint")]
    pub default_setpoint: f64,
    #[serde(default = "default_motor_poles")]
    pub motor_poles: u32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            min_frequency: default_min_frequency(),
            max_frequency: default_max_frequency(),
            default_setpoint: default_frequency_setpoint(),
            motor_poles: default_motor_poles(),
        }
    }
}

impl DriveConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_frequency.is_finite()
            && self.max_frequency.is_finite()
            && self.min_frequency > 0.0
            && self.min_frequency <= self.max_frequency)
        {
            return Err(anyhow!(
                "drive frequency range [{}, {}] is invalid",
                self.min_frequency,
                self.max_frequency
            ));
        }
        if !self.accepts(self.default_setpoint) {
            return Err(anyhow!(
                "drive.default_setpoint ({}) lies outside [{}, {}]",
                self.default_setpoint,
                self.min_frequency,
                self.max_frequency
            ));
        }
        if self.motor_poles == 0 || self.motor_poles % 2 != 0 {
            return Err(anyhow!("drive.motor_poles must be a positive even number"));
        }
        Ok(())
    }

    /// Whether `hz` is an acceptable setpoint. NaN is never accepted.
    pub fn accepts(&self, hz: f64) -> bool {
        (self.min_frequency..=self.max_frequency).contains(&hz)
    }
}

/// Capability granted to the local operator console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_can_control")]
    pub can_control: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            can_control: default_can_control(),
        }
    }
}

/// Static definition of one physical unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EquipmentSpec {
    pub id: String,
    pub name: String,
    pub category: String,
    pub nominal_current: f64,
    pub base_voltage: f64,
    pub base_power: f64,
    #[serde(default)]
    pub capacitance: Option<f64>,
    #[serde(default)]
    pub running: bool,
    #[serde(default = "default_ambient")]
    pub temperature: f64,
}

impl EquipmentSpec {
    #[allow(clippy::too_many_arguments)]
    fn reference(
        id: &str,
        name: &str,
        category: &str,
        nominal_current: f64,
        base_voltage: f64,
        base_power: f64,
        running: bool,
        temperature: f64,
    ) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            category: category.to_owned(),
            nominal_current,
            base_voltage,
            base_power,
            capacitance: None,
            running,
            temperature,
        }
    }

    /// The nine-unit reference plant used when no fleet is configured.
    pub fn reference_plant() -> Vec<Self> {
        let mut capacitor_bank = Self::reference(
            "6",
            "Capacitor Bank",
            "capacitor",
            30.0,
            380.0,
            19.8,
            false,
            25.0,
        );
        capacitor_bank.capacitance = Some(0.001);
        vec![
            Self::reference("1", "Motor A1", "motor", 45.0, 380.0, 29.6, true, 65.0),
            Self::reference("2", "Motor B2", "motor", 42.0, 380.0, 27.7, false, 25.0),
            Self::reference("3", "Motor C3", "motor", 38.0, 380.0, 25.1, true, 58.0),
            Self::reference(
                "4",
                "Main Transformer",
                "transformer",
                120.0,
                13800.0,
                2872.0,
                true,
                55.0,
            ),
            Self::reference(
                "5",
                "Auxiliary Transformer",
                "transformer",
                95.0,
                13800.0,
                2276.0,
                false,
                30.0,
            ),
            capacitor_bank,
            Self::reference("7", "VFD Drive 1", "inverter", 52.0, 380.0, 34.3, true, 48.0),
            Self::reference("8", "VFD Drive 2", "inverter", 48.0, 380.0, 31.7, false, 28.0),
            Self::reference(
                "9",
                "Emergency Generator",
                "generator",
                180.0,
                380.0,
                118.8,
                false,
                22.0,
            ),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(anyhow!("equipment id must not be empty"));
        }
        if !(self.nominal_current.is_finite() && self.nominal_current > 0.0) {
            return Err(anyhow!(
                "equipment '{}' must declare a positive nominal_current",
                self.id
            ));
        }
        if self.base_voltage < 0.0 || self.base_power < 0.0 {
            return Err(anyhow!(
                "equipment '{}' base ratings must be non-negative",
                self.id
            ));
        }
        if let Some(capacitance) = self.capacitance {
            if capacitance <= 0.0 {
                return Err(anyhow!(
                    "equipment '{}' capacitance must be positive",
                    self.id
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when neither `FLEETSIM_LOG` nor `RUST_LOG` is set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Console stream for log output.
    #[serde(default)]
    pub stream: LogStream,
    #[serde(default = "default_file_output")]
    pub file_output: bool,
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            stream: LogStream::default(),
            file_output: default_file_output(),
            directory: default_logging_directory(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
