//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing subscriber setup for the simulator daemon."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

pub const LOG_ENV: &str = "FLEETSIM_LOG";

/// Flush guards for the non-blocking writers; dropped only at process exit.
static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Console rendering for the daemon. The log file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Console stream the human-facing log layer writes to.
///
/// Set to `stderr` when stdout carries program output such as console replies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogStream {
    #[default]
    Stdout,
    Stderr,
}

/// Install the global tracing subscriber.
///
/// The filter comes from `FLEETSIM_LOG`, then `RUST_LOG`, then `config.level`.
/// A second call is a no-op.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let mut guards = Vec::with_capacity(2);

    let (console_writer, guard) = console_writer(config.stream);
    guards.push(guard);

    let file_layer = if config.file_output {
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let (writer, guard) = file_writer(&config.directory, prefix)?;
        guards.push(guard);
        Some(
            fmt::layer()
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_writer(writer),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(resolve_filter(&config.level))
        .with(console_layer(config.format, console_writer))
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return Ok(());
    }
    let _ = GUARDS.set(guards);

    info!(
        service = %service_name,
        format = ?config.format,
        stream = ?config.stream,
        file_output = config.file_output,
        log_dir = %config.directory.display(),
        "tracing initialised"
    );
    Ok(())
}

fn console_writer(stream: LogStream) -> (NonBlocking, WorkerGuard) {
    match stream {
        LogStream::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        LogStream::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    }
}

fn file_writer(directory: &Path, prefix: &str) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(directory)
        .with_context(|| format!("unable to create log directory {}", directory.display()))?;
    let appender = rolling::daily(directory, log_file_name(prefix));
    Ok(tracing_appender::non_blocking(appender))
}

fn log_file_name(prefix: &str) -> String {
    format!("{prefix}.log")
}

fn resolve_filter(fallback: &str) -> EnvFilter {
    let directive = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .unwrap_or_else(|_| fallback.to_owned());
    EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log filter '{directive}' ({err}); using 'info'");
        EnvFilter::new("info")
    })
}

fn console_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_use_kebab_case_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            format: LogFormat,
        }
        let json: Wrapper = toml::from_str("format = \"structured-json\"").unwrap();
        assert_eq!(json.format, LogFormat::StructuredJson);
        let pretty: Wrapper = toml::from_str("format = \"pretty\"").unwrap();
        assert_eq!(pretty.format, LogFormat::Pretty);
    }

    #[test]
    fn stream_defaults_to_stdout() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(default)]
            stream: LogStream,
        }
        let unset: Wrapper = toml::from_str("").unwrap();
        assert_eq!(unset.stream, LogStream::Stdout);
        let stderr: Wrapper = toml::from_str("stream = \"stderr\"").unwrap();
        assert_eq!(stderr.stream, LogStream::Stderr);
    }

    #[test]
    fn file_name_uses_prefix() {
        assert_eq!(log_file_name("fleetsimd"), "fleetsimd.log");
    }

    #[test]
    fn file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs/daemon");
        let (_writer, _guard) = file_writer(&nested, "test").unwrap();
        assert!(nested.is_dir());
    }
}
