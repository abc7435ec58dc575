//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Operator command parsing and capability gating."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::alarms::AlarmEvent;
use crate::engine::{Engine, FleetSnapshot};
use crate::equipment::Equipment;
use crate::error::CommandError;
use crate::inrush::InrushLogEntry;

/// Which alarms an `alarms` query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlarmFilter {
    #[default]
    All,
    Active,
    Unacknowledged,
}

/// Operator command as typed on the console.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(String),
    Stop(String),
    Emergency(bool),
    Frequency { id: String, hz: f64 },
    Acknowledge(u64),
    Resolve(u64),
    Status,
    InrushLog,
    Alarms(AlarmFilter),
}

impl Command {
    /// Whether the command changes equipment or alarm state.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Command::Start(_)
                | Command::Stop(_)
                | Command::Emergency(_)
                | Command::Frequency { .. }
                | Command::Acknowledge(_)
                | Command::Resolve(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("'{0}' requires an equipment id")]
    MissingId(&'static str),
    #[error("emergency expects 'on' or 'off', got '{0}'")]
    InvalidSwitch(String),
    #[error("'{0}' requires an alarm id")]
    MissingAlarmId(&'static str),
    #[error("invalid alarm id '{0}'")]
    InvalidAlarmId(String),
    #[error("freq requires a frequency in Hz")]
    MissingFrequency,
    #[error("invalid frequency '{0}'")]
    InvalidFrequency(String),
    #[error("alarms expects 'all', 'active' or 'unacked', got '{0}'")]
    InvalidFilter(String),
    #[error("unexpected trailing input '{0}'")]
    Trailing(String),
}

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut words = input.split_whitespace();
        let verb = words.next().ok_or(ParseCommandError::Empty)?;
        let command = match verb.to_ascii_lowercase().as_str() {
            "start" => Command::Start(
                words
                    .next()
                    .ok_or(ParseCommandError::MissingId("start"))?
                    .to_owned(),
            ),
            "stop" => Command::Stop(
                words
                    .next()
                    .ok_or(ParseCommandError::MissingId("stop"))?
                    .to_owned(),
            ),
            "emergency" => {
                let switch = words.next().unwrap_or_default();
                match switch.to_ascii_lowercase().as_str() {
                    "on" => Command::Emergency(true),
                    "off" => Command::Emergency(false),
                    other => return Err(ParseCommandError::InvalidSwitch(other.to_owned())),
                }
            }
            "freq" => {
                let id = words
                    .next()
                    .ok_or(ParseCommandError::MissingId("freq"))?
                    .to_owned();
                let raw = words.next().ok_or(ParseCommandError::MissingFrequency)?;
                let hz = raw
                    .parse::<f64>()
                    .map_err(|_| ParseCommandError::InvalidFrequency(raw.to_owned()))?;
                Command::Frequency { id, hz }
            }
            "ack" => Command::Acknowledge(alarm_id(words.next(), "ack")?),
            "resolve" => Command::Resolve(alarm_id(words.next(), "resolve")?),
            "status" => Command::Status,
            "log" => Command::InrushLog,
            "alarms" => {
                let filter = match words.next().map(str::to_ascii_lowercase).as_deref() {
                    None | Some("all") => AlarmFilter::All,
                    Some("active") => AlarmFilter::Active,
                    Some("unacked") => AlarmFilter::Unacknowledged,
                    Some(other) => return Err(ParseCommandError::InvalidFilter(other.to_owned())),
                };
                Command::Alarms(filter)
            }
            other => return Err(ParseCommandError::Unknown(other.to_owned())),
        };
        let rest: Vec<&str> = words.collect();
        if !rest.is_empty() {
            return Err(ParseCommandError::Trailing(rest.join(" ")));
        }
        Ok(command)
    }
}

fn alarm_id(word: Option<&str>, verb: &'static str) -> Result<u64, ParseCommandError> {
    let word = word.ok_or(ParseCommandError::MissingAlarmId(verb))?;
    word.parse()
        .map_err(|_| ParseCommandError::InvalidAlarmId(word.to_owned()))
}

/// Result of a successfully executed command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum CommandOutcome {
    Started(InrushLogEntry),
    Stopped(Equipment),
    Emergency { active: bool, changed: bool },
    Frequency {
        equipment: Box<Equipment>,
        shaft_speed_rpm: f64,
    },
    Acknowledged(AlarmEvent),
    Resolved(AlarmEvent),
    Snapshot(Box<FleetSnapshot>),
    InrushLog(Vec<InrushLogEntry>),
    Alarms(Vec<AlarmEvent>),
}

/// Caller context carrying the externally granted control capability.
///
/// The capability is necessary but not sufficient: the engine still applies
/// its emergency and interlock guards to authorised callers.
#[derive(Debug, Clone)]
pub struct ControlSession {
    engine: Engine,
    can_control: bool,
}

impl ControlSession {
    pub fn new(engine: Engine, can_control: bool) -> Self {
        Self {
            engine,
            can_control,
        }
    }

    pub fn can_control(&self) -> bool {
        self.can_control
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn execute(&self, command: Command) -> Result<CommandOutcome, CommandError> {
        if command.is_control() && !self.can_control {
            let error = CommandError::Unauthorized;
            warn!(command = ?command, "control command refused; capability missing");
            self.engine.record_rejection(&error);
            return Err(error);
        }
        match command {
            Command::Start(id) => self.engine.request_start(&id).map(CommandOutcome::Started),
            Command::Stop(id) => self.engine.request_stop(&id).map(CommandOutcome::Stopped),
            Command::Emergency(active) => {
                let changed = self.engine.set_emergency(active);
                Ok(CommandOutcome::Emergency { active, changed })
            }
            Command::Frequency { id, hz } => {
                let unit = self.engine.set_frequency(&id, hz)?;
                let poles = self.engine.drive_config().motor_poles;
                let shaft_speed_rpm = unit
                    .drive()
                    .map(|drive| drive.shaft_speed_rpm(poles))
                    .unwrap_or_default();
                Ok(CommandOutcome::Frequency {
                    equipment: Box::new(unit),
                    shaft_speed_rpm,
                })
            }
            Command::Acknowledge(alarm_id) => self
                .engine
                .acknowledge_alarm(alarm_id)
                .map(CommandOutcome::Acknowledged),
            Command::Resolve(alarm_id) => self
                .engine
                .resolve_alarm(alarm_id)
                .map(CommandOutcome::Resolved),
            Command::Status => Ok(CommandOutcome::Snapshot(Box::new(self.engine.snapshot()))),
            Command::InrushLog => Ok(CommandOutcome::InrushLog(self.engine.inrush_log())),
            Command::Alarms(filter) => {
                let alarms = match filter {
                    AlarmFilter::All => self.engine.alarms(),
                    AlarmFilter::Active => self.engine.active_alarms(),
                    AlarmFilter::Unacknowledged => self.engine.unacknowledged_alarms(),
                };
                Ok(CommandOutcome::Alarms(alarms))
            }
        }
    }
}
