use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use meetup_kernel::Simulation;
use meetup_service::ServerContext;

/// Totals for one run of the tick loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub ticks: u64,
    pub collisions: usize,
    pub evicted: usize,
    pub overruns: u64,
    pub ledger_swept: usize,
}

/// Run the simulation at the configured rate on its own thread until shutdown
/// is requested. The thread hands the simulation back when it exits.
pub fn spawn_tick_loop(
    ctx: Arc<ServerContext>,
    sim: Simulation,
) -> io::Result<JoinHandle<(Simulation, TickSummary)>> {
    thread::Builder::new()
        .name("meetup-tick".into())
        .spawn(move || {
            let mut sim = sim;
            let summary = run_ticks(&ctx, &mut sim);
            (sim, summary)
        })
}

fn run_ticks(ctx: &ServerContext, sim: &mut Simulation) -> TickSummary {
    let interval = ctx.config().simulation.tick_interval();
    let dt = interval.as_secs_f32();
    let sweep_every = Duration::from_secs(ctx.config().rate_limit.sweep_interval_secs);
    let mut last_sweep = Instant::now();
    let mut summary = TickSummary::default();

    tracing::info!(
        tick_ms = interval.as_millis() as u64,
        entities = sim.entity_count(),
        "tick loop started"
    );
    while !ctx.shutdown_requested() {
        let started = Instant::now();
        let report = sim.tick(dt);
        summary.ticks += 1;
        summary.collisions += report.collisions.len();
        summary.evicted += report.evicted.len();

        if !sweep_every.is_zero() && last_sweep.elapsed() >= sweep_every {
            let swept = ctx.handler().sweep_ledger();
            summary.ledger_swept += swept;
            last_sweep = Instant::now();
            tracing::debug!(swept, "rate limit ledger swept");
        }

        let elapsed = started.elapsed();
        match interval.checked_sub(elapsed) {
            Some(remaining) => thread::sleep(remaining),
            None => {
                summary.overruns += 1;
                tracing::warn!(
                    tick = report.tick,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "tick overran its interval"
                );
            }
        }
    }
    tracing::info!(
        ticks = summary.ticks,
        collisions = summary.collisions,
        overruns = summary.overruns,
        "tick loop stopped"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use meetup_common::SystemClock;
    use meetup_persist::MemoryMedium;
    use meetup_service::{LifecycleHooks, ServerConfig};

    #[test]
    fn tick_loop_runs_until_shutdown() {
        let mut config = ServerConfig::default();
        config.simulation.seed = Some(3);
        config.simulation.tick_rate_hz = 200;
        config.simulation.creatures = 2;
        let ctx = Arc::new(
            ServerContext::with_medium(config, Arc::new(MemoryMedium::new()), Arc::new(SystemClock))
                .unwrap(),
        );
        let sim = ctx.build_simulation().unwrap();
        let handle = spawn_tick_loop(Arc::clone(&ctx), sim).unwrap();

        thread::sleep(Duration::from_millis(100));
        ctx.on_shutdown_requested();
        let (sim, summary) = handle.join().unwrap();
        assert!(summary.ticks > 0);
        assert_eq!(sim.tick_count(), summary.ticks);
        assert_eq!(sim.entity_count(), 2);
        ctx.shutdown();
    }
}
