//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fleet gauges, counters and the Prometheus exporter."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Bind `addr` and serve the registry at `/metrics` until [`MetricsServer::shutdown`].
///
/// Binding happens synchronously so a port clash fails startup instead of a background task.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let listener = TcpListener::from_std(listener)
        .context("failed to hand metrics listener to tokio")?;

    let app = Router::new().route(
        "/metrics",
        get(move || {
            let registry = registry.clone();
            async move { metrics_response(&registry) }
        }),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server terminated with an error")
    });
    info!(address = %bound, "metrics exporter listening");

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

/// Encode every registered family in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

fn metrics_response(registry: &Registry) -> impl IntoResponse {
    match render(registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT))],
            body,
        ),
        Err(err) => {
            error!(error = %err, "metrics scrape failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN))],
                err.to_string(),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for in-flight requests to drain.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Fleet-level gauges and counters fed by the simulation engine.
#[derive(Clone, Debug)]
pub struct FleetMetrics {
    registry: SharedRegistry,
    power_factor: Gauge,
    total_current: Gauge,
    average_voltage: Gauge,
    running: IntGauge,
    emergency: IntGauge,
    inrush_events: IntCounterVec,
    rejections: IntCounterVec,
    samples: IntCounter,
}

impl FleetMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let power_factor = Gauge::with_opts(Opts::new(
            "fleetsim_power_factor",
            "Fleet-wide power factor after compensation",
        ))?;
        registry.register(Box::new(power_factor.clone()))?;

        let total_current = Gauge::with_opts(Opts::new(
            "fleetsim_total_current_amperes",
            "Sum of current drawn by running equipment",
        ))?;
        registry.register(Box::new(total_current.clone()))?;

        let average_voltage = Gauge::with_opts(Opts::new(
            "fleetsim_average_voltage_volts",
            "Mean voltage across running equipment",
        ))?;
        registry.register(Box::new(average_voltage.clone()))?;

        let running = IntGauge::with_opts(Opts::new(
            "fleetsim_equipment_running",
            "Number of equipment units currently running",
        ))?;
        registry.register(Box::new(running.clone()))?;

        let emergency = IntGauge::with_opts(Opts::new(
            "fleetsim_emergency_active",
            "Indicator (0/1) whether the emergency stop is engaged",
        ))?;
        registry.register(Box::new(emergency.clone()))?;

        let inrush_events = IntCounterVec::new(
            Opts::new(
                "fleetsim_inrush_events_total",
                "Energisations recorded in the inrush log by category and alarm flag",
            ),
            &["category", "alarm"],
        )?;
        registry.register(Box::new(inrush_events.clone()))?;

        let rejections = IntCounterVec::new(
            Opts::new(
                "fleetsim_command_rejections_total",
                "Control commands rejected by the engine, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        let samples = IntCounter::with_opts(Opts::new(
            "fleetsim_sampler_ticks_total",
            "Telemetry sampler ticks that appended history",
        ))?;
        registry.register(Box::new(samples.clone()))?;

        Ok(Self {
            registry,
            power_factor,
            total_current,
            average_voltage,
            running,
            emergency,
            inrush_events,
            rejections,
            samples,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_aggregate(
        &self,
        power_factor: f64,
        total_current: f64,
        average_voltage: f64,
        running: usize,
    ) {
        self.power_factor.set(power_factor);
        self.total_current.set(total_current);
        self.average_voltage.set(average_voltage);
        self.running.set(running as i64);
    }

    pub fn set_emergency(&self, active: bool) {
        self.emergency.set(if active { 1 } else { 0 });
    }

    pub fn record_inrush(&self, category: &str, alarm: bool) {
        let alarm = if alarm { "true" } else { "false" };
        self.inrush_events
            .with_label_values(&[category, alarm])
            .inc();
    }

    pub fn record_rejection(&self, reason: &str) {
        self.rejections.with_label_values(&[reason]).inc();
    }

    pub fn record_sample_tick(&self) {
        self.samples.inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    fn family_value(registry: &Registry, name: &str) -> Option<f64> {
        registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == name)
            .and_then(|family| family.get_metric().first().cloned())
            .map(|metric| {
                if metric.has_gauge() {
                    metric.get_gauge().get_value()
                } else {
                    metric.get_counter().get_value()
                }
            })
    }

    #[test]
    fn aggregate_gauges_reflect_latest_values() {
        let registry = new_registry();
        let metrics = FleetMetrics::new(registry.clone()).unwrap();
        metrics.set_aggregate(0.85, 255.0, 380.0, 4);
        metrics.set_emergency(true);
        assert_eq!(family_value(&registry, "fleetsim_power_factor"), Some(0.85));
        assert_eq!(
            family_value(&registry, "fleetsim_total_current_amperes"),
            Some(255.0)
        );
        assert_eq!(family_value(&registry, "fleetsim_equipment_running"), Some(4.0));
        assert_eq!(family_value(&registry, "fleetsim_emergency_active"), Some(1.0));
    }

    #[test]
    fn counters_accumulate_by_label() {
        let registry = new_registry();
        let metrics = FleetMetrics::new(registry.clone()).unwrap();
        metrics.record_rejection("interlock");
        metrics.record_rejection("interlock");
        metrics.record_inrush("motor", false);
        assert_eq!(
            family_value(&registry, "fleetsim_command_rejections_total"),
            Some(2.0)
        );
        assert_eq!(
            family_value(&registry, "fleetsim_inrush_events_total"),
            Some(1.0)
        );
    }

    #[test]
    fn render_emits_text_exposition() {
        let registry = new_registry();
        let metrics = FleetMetrics::new(registry.clone()).unwrap();
        metrics.set_aggregate(0.9, 120.0, 380.0, 2);
        metrics.record_inrush("capacitor", true);
        let body = render(&registry).unwrap();
        assert!(body.contains("fleetsim_power_factor 0.9"));
        let inrush = body
            .lines()
            .find(|line| line.starts_with("fleetsim_inrush_events_total{"))
            .unwrap();
        assert!(inrush.contains("category=\"capacitor\""));
        assert!(inrush.contains("alarm=\"true\""));
        assert!(inrush.ends_with(" 1"));
    }

    #[tokio::test]
    async fn exporter_binds_and_shuts_down() {
        let server = spawn_http_server(new_registry(), "127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await.unwrap();
    }

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = new_registry();
        FleetMetrics::new(registry.clone()).unwrap();
        assert!(FleetMetrics::new(registry).is_err());
    }
}
