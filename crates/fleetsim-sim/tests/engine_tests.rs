//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Timing and invariant tests for the simulation engine."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use fleetsim_common::config::AppConfig;
use fleetsim_metrics::{new_registry, FleetMetrics};
use fleetsim_sim::{
    AlarmKind, CommandError, Engine, EquipmentStatus, FleetAggregate, TelemetrySampler,
};
use tokio::sync::broadcast;

fn engine() -> Engine {
    Engine::from_config(&AppConfig::default(), None)
}

/// Let spawned settle tasks observe the advanced clock.
async fn drain_tasks() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

async fn advance_ms(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    drain_tasks().await;
}

fn assert_stopped_units_are_dark(engine: &Engine) {
    engine.registry().for_each(|unit| {
        if unit.status() == EquipmentStatus::Stopped {
            assert_eq!(unit.current(), 0.0, "{} draws current while stopped", unit.id());
            assert_eq!(unit.power(), 0.0, "{} draws power while stopped", unit.id());
        }
    });
}

#[tokio::test(start_paused = true)]
async fn second_motor_waits_for_interlock_window() {
    let engine = engine();
    engine.request_stop("1").unwrap();
    engine.request_start("1").unwrap();

    advance_ms(4999).await;
    match engine.request_start("2") {
        Err(CommandError::Interlock { remaining }) => {
            assert_eq!(remaining, Duration::from_millis(1));
        }
        other => panic!("expected interlock rejection, got {other:?}"),
    }
    assert!(!engine.equipment("2").unwrap().is_running());
    assert!(engine.interlock_active());

    advance_ms(2).await;
    assert!(!engine.interlock_active());
    assert!(engine.request_start("2").is_ok());
    assert!(engine.equipment("2").unwrap().is_running());
}

#[tokio::test(start_paused = true)]
async fn rejected_motor_start_does_not_extend_interlock() {
    let engine = engine();
    engine.request_start("2").unwrap();
    advance_ms(3000).await;
    assert!(engine.request_start("1").is_err());
    advance_ms(2000).await;
    assert!(engine.request_start("1").is_ok());
}

#[tokio::test(start_paused = true)]
async fn transient_settles_to_nominal_after_delay() {
    let engine = engine();
    engine.request_start("2").unwrap();
    assert_eq!(engine.equipment("2").unwrap().current(), 294.0);

    advance_ms(1999).await;
    let unit = engine.equipment("2").unwrap();
    assert_eq!(unit.current(), 294.0);
    assert!(unit.in_transient());

    advance_ms(1).await;
    let unit = engine.equipment("2").unwrap();
    assert_eq!(unit.current(), 42.0);
    assert!((unit.power() - 27.7).abs() < 1e-9);
    assert!(!unit.in_transient());
    assert!(unit.is_running());
}

#[tokio::test(start_paused = true)]
async fn stop_during_transient_is_not_resurrected() {
    let engine = engine();
    engine.request_start("5").unwrap();
    advance_ms(1000).await;
    engine.request_stop("5").unwrap();
    advance_ms(5000).await;

    let unit = engine.equipment("5").unwrap();
    assert!(!unit.is_running());
    assert_eq!(unit.current(), 0.0);
    assert_eq!(unit.power(), 0.0);
    assert_stopped_units_are_dark(&engine);
}

#[tokio::test(start_paused = true)]
async fn restart_uses_fresh_settle_timer() {
    let engine = engine();
    engine.request_start("8").unwrap();
    advance_ms(1500).await;
    engine.request_stop("8").unwrap();
    engine.request_start("8").unwrap();

    // The first start's timer would have fired here.
    advance_ms(600).await;
    assert!(engine.equipment("8").unwrap().in_transient());

    advance_ms(1400).await;
    let unit = engine.equipment("8").unwrap();
    assert!(!unit.in_transient());
    assert_eq!(unit.current(), 48.0);
}

#[tokio::test(start_paused = true)]
async fn emergency_stops_everything_and_blocks_starts() {
    let engine = engine();
    engine.request_start("9").unwrap();
    let before = engine.equipment("1").unwrap().temperature();

    assert!(engine.set_emergency(true));
    assert_stopped_units_are_dark(&engine);
    engine.registry().for_each(|unit| assert!(!unit.is_running()));
    assert_eq!(engine.equipment("1").unwrap().temperature(), before - 5.0);
    assert_eq!(engine.aggregate().running, 0);
    assert_eq!(engine.aggregate().total_current, 0.0);

    assert_eq!(engine.request_start("6"), Err(CommandError::Emergency));
    advance_ms(10_000).await;
    assert_eq!(engine.request_start("6"), Err(CommandError::Emergency));
    // The generator's pending settle must not revive it.
    assert_stopped_units_are_dark(&engine);

    let tripped = engine
        .alarms()
        .iter()
        .filter(|event| event.kind == AlarmKind::EmergencyStop)
        .count();
    assert_eq!(tripped, 5);

    assert!(engine.set_emergency(false));
    engine.registry().for_each(|unit| assert!(!unit.is_running()));
    assert!(engine.request_start("6").is_ok());
}

#[tokio::test(start_paused = true)]
async fn stop_is_allowed_during_emergency() {
    let engine = engine();
    engine.set_emergency(true);
    assert!(engine.request_stop("4").is_ok());
}

#[tokio::test(start_paused = true)]
async fn emergency_keeps_interlock_timestamp() {
    let engine = engine();
    engine.request_start("2").unwrap();
    engine.set_emergency(true);
    engine.set_emergency(false);
    assert!(matches!(
        engine.request_start("1"),
        Err(CommandError::Interlock { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn inrush_log_is_bounded_fifo() {
    let engine = engine();
    // 30 starts that must be evicted, then 100 that must survive in order.
    for _ in 0..30 {
        engine.request_start("7").unwrap();
    }
    for round in 0..100 {
        let id = if round % 2 == 0 { "5" } else { "8" };
        engine.request_start(id).unwrap();
    }

    let log = engine.inrush_log();
    assert_eq!(log.len(), 100);
    assert!(log.iter().all(|entry| entry.equipment_id != "7"));
    assert_eq!(log.first().unwrap().equipment_id, "5");
    assert_eq!(log.last().unwrap().equipment_id, "8");
    assert!(log
        .iter()
        .enumerate()
        .all(|(index, entry)| entry.equipment_id == if index % 2 == 0 { "5" } else { "8" }));
    assert!(log
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));
}

#[tokio::test(start_paused = true)]
async fn capacitor_entry_matches_reactance_model() {
    let engine = engine();
    let entry = engine.request_start("6").unwrap();
    assert!((entry.inrush_current - 143.2566).abs() < 1e-3);
    assert!((entry.inrush_factor - 4.7752).abs() < 1e-3);
    assert!(!entry.alarm);
    assert_eq!(entry.nominal_current, 30.0);
}

#[tokio::test(start_paused = true)]
async fn inrush_alarm_is_raised_for_oversized_capacitor() {
    let config: AppConfig = r#"
        [[fleet]]
        id = "cb"
        name = "Oversized Bank"
        category = "capacitor"
        nominal_current = 30.0
        base_voltage = 380.0
        base_power = 19.8
        capacitance = 0.01
    "#
    .parse()
    .unwrap();
    let engine = Engine::from_config(&config, None);
    let entry = engine.request_start("cb").unwrap();
    assert!(entry.alarm);
    let alarms = engine.alarms();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].kind, AlarmKind::InrushHigh);
}

#[tokio::test(start_paused = true)]
async fn unknown_category_uses_soft_start() {
    let config: AppConfig = r#"
        [[fleet]]
        id = "hp"
        name = "Heat Pump"
        category = "heat-pump"
        nominal_current = 20.0
        base_voltage = 400.0
        base_power = 12.0
    "#
    .parse()
    .unwrap();
    let engine = Engine::from_config(&config, None);
    let entry = engine.request_start("hp").unwrap();
    assert_eq!(entry.inrush_current, 60.0);
    assert_eq!(entry.inrush_factor, 3.0);
}

#[tokio::test(start_paused = true)]
async fn power_factor_stays_clamped_across_transitions() {
    let engine = engine();
    let ids: Vec<String> = engine.registry().ids().map(str::to_owned).collect();
    for id in &ids {
        let _ = engine.request_start(id);
        advance_ms(5001).await;
        let pf = engine.aggregate().power_factor;
        assert!((0.70..=0.99).contains(&pf), "pf {pf} out of range");
    }
    for id in &ids {
        engine.request_stop(id).unwrap();
        let pf = engine.aggregate().power_factor;
        assert!((0.70..=0.99).contains(&pf), "pf {pf} out of range");
    }
    assert_eq!(engine.aggregate(), FleetAggregate::default());
}

#[tokio::test(start_paused = true)]
async fn sampler_loop_ticks_on_period_and_stops_on_shutdown() {
    let engine = engine();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(TelemetrySampler::new(engine.clone()).run(shutdown_rx));
    drain_tasks().await;

    advance_ms(2999).await;
    assert!(engine.equipment("1").unwrap().history().is_empty());
    advance_ms(1).await;
    assert_eq!(engine.equipment("1").unwrap().history().len(), 1);
    advance_ms(3000).await;
    assert_eq!(engine.equipment("1").unwrap().history().len(), 2);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
    advance_ms(9000).await;
    assert_eq!(engine.equipment("1").unwrap().history().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn metrics_track_engine_activity() {
    let registry = new_registry();
    let metrics = FleetMetrics::new(registry.clone()).unwrap();
    let engine = Engine::from_config(&AppConfig::default(), Some(metrics));
    engine.request_start("2").unwrap();
    let _ = engine.request_start("3");
    engine.set_emergency(true);

    let families = registry.gather();
    let value = |name: &str| {
        families
            .iter()
            .find(|family| family.get_name() == name)
            .map(|family| {
                family
                    .get_metric()
                    .iter()
                    .map(|metric| {
                        if metric.has_gauge() {
                            metric.get_gauge().get_value()
                        } else {
                            metric.get_counter().get_value()
                        }
                    })
                    .sum::<f64>()
            })
            .unwrap_or_default()
    };
    assert_eq!(value("fleetsim_emergency_active"), 1.0);
    assert_eq!(value("fleetsim_equipment_running"), 0.0);
    assert_eq!(value("fleetsim_inrush_events_total"), 1.0);
    assert_eq!(value("fleetsim_command_rejections_total"), 1.0);
}

#[tokio::test(start_paused = true)]
async fn snapshot_serialises_for_presentation() {
    let engine = engine();
    engine.request_start("2").unwrap();
    let snapshot = engine.snapshot();
    assert!(snapshot.interlock_active);
    assert_eq!(snapshot.interlock_remaining_ms, 5000);
    assert_eq!(snapshot.inrush_log.len(), 1);
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["equipment"][1]["status"], "running");
    assert_eq!(json["equipment"][1]["category"], "motor");
    assert_eq!(json["emergency_active"], false);
}
