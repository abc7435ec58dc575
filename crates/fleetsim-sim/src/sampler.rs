//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Periodic telemetry sampling and thermal drift."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use fleetsim_common::schedule::RateLimiter;
use rand::prelude::*;
use rand_distr::Uniform;
use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::Engine;

/// Folds live equipment values into bounded history on a fixed period.
///
/// Running units random-walk their temperature by up to `walk_step` per tick;
/// stopped units decay towards ambient. Both stay within the thermal envelope.
#[derive(Debug)]
pub struct TelemetrySampler {
    engine: Engine,
    rng: StdRng,
    walk: Uniform<f64>,
    ticks: u64,
}

impl TelemetrySampler {
    pub fn new(engine: Engine) -> Self {
        let sim = engine.simulation_config();
        let seed = sim.random_seed;
        let step = sim.walk_step.abs();
        Self {
            rng: StdRng::seed_from_u64(seed),
            walk: Uniform::new_inclusive(-step, step),
            engine,
            ticks: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Sample every unit once. Skipped entirely while the emergency stop is engaged.
    ///
    /// Returns whether a sample was taken.
    pub fn tick(&mut self) -> bool {
        let decay = self.engine.simulation_config().idle_decay;
        let rng = &mut self.rng;
        let walk = &self.walk;
        let sampled = self.engine.sample(|unit| {
            if unit.is_running() {
                unit.temperature() + walk.sample(&mut *rng)
            } else {
                unit.temperature() - decay
            }
        });
        let Some(raised) = sampled else {
            debug!("sampler tick skipped; emergency active");
            return false;
        };

        self.ticks += 1;
        if let Some(metrics) = self.engine.metrics() {
            metrics.record_sample_tick();
        }
        let aggregate = self.engine.publish_aggregate();
        debug!(
            tick = self.ticks,
            running = aggregate.running,
            total_current = aggregate.total_current,
            alarms = raised,
            "telemetry sampled"
        );
        true
    }

    /// Tick on the configured period until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut limiter = RateLimiter::new(self.engine.simulation_config().sample_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(ticks = self.ticks, "sampler shutdown");
                    break;
                }
                _ = limiter.tick() => {
                    self.tick();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsim_common::config::AppConfig;

    fn sampler() -> (Engine, TelemetrySampler) {
        let engine = Engine::from_config(&AppConfig::default(), None);
        let sampler = TelemetrySampler::new(engine.clone());
        (engine, sampler)
    }

    #[test]
    fn running_temperature_walks_within_one_unit() {
        let (engine, mut sampler) = sampler();
        let before = engine.equipment("1").unwrap().temperature();
        assert!(sampler.tick());
        let after = engine.equipment("1").unwrap();
        assert!((after.temperature() - before).abs() <= 1.0);
        let sample = after.history().latest().copied().unwrap();
        assert_eq!(sample.current, 45.0);
        assert_eq!(sample.temperature, after.temperature());
    }

    #[test]
    fn stopped_units_decay_towards_ambient() {
        let (engine, mut sampler) = sampler();
        // Auxiliary transformer starts stopped at 30 °C.
        for _ in 0..4 {
            sampler.tick();
        }
        assert_eq!(engine.equipment("5").unwrap().temperature(), 28.0);
        for _ in 0..20 {
            sampler.tick();
        }
        let unit = engine.equipment("5").unwrap();
        assert_eq!(unit.temperature(), 25.0);
        assert!(unit
            .history()
            .iter()
            .all(|sample| sample.current == 0.0 && sample.power == 0.0));
    }

    #[test]
    fn history_is_capped_fifo() {
        let (engine, mut sampler) = sampler();
        for _ in 0..60 {
            sampler.tick();
        }
        let history = engine.equipment("1").unwrap().history().to_vec();
        assert_eq!(history.len(), 50);
        assert!(history
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[test]
    fn temperatures_stay_in_envelope() {
        let (engine, mut sampler) = sampler();
        for _ in 0..500 {
            sampler.tick();
        }
        engine.registry().for_each(|unit| {
            assert!((25.0..=85.0).contains(&unit.temperature()));
        });
    }

    #[test]
    fn over_temperature_resolves_once_unit_cools() {
        let config: AppConfig = r#"
            [simulation]
            walk_step = 0.0

            [[fleet]]
            id = "hot"
            name = "Hot Motor"
            category = "motor"
            nominal_current = 40.0
            base_voltage = 380.0
            base_power = 26.0
            running = true
            temperature = 84.0
        "#
        .parse()
        .unwrap();
        let engine = Engine::from_config(&config, None);
        let mut sampler = TelemetrySampler::new(engine.clone());

        assert!(sampler.tick());
        let active = engine.active_alarms();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].equipment_id, "hot");

        // Stopping cools to 74 °C; the next tick sees it under the clear level.
        engine.request_stop("hot").unwrap();
        assert!(sampler.tick());
        assert!(engine.active_alarms().is_empty());
        assert!(engine.alarms()[0].resolved_at.is_some());
    }

    #[test]
    fn emergency_suspends_sampling() {
        let (engine, mut sampler) = sampler();
        engine.set_emergency(true);
        assert!(!sampler.tick());
        assert!(engine.equipment("1").unwrap().history().is_empty());
        engine.set_emergency(false);
        assert!(sampler.tick());
        assert_eq!(engine.equipment("1").unwrap().history().len(), 1);
    }
}
