//! Retention maintenance: purges expired rows and persists the mirror.
//!
//! Runs on a periodic interval and additionally at a configured daily
//! time. The single scheduler thread guarantees two sweeps never run
//! concurrently.

use crate::sched::{AutomationTask, TaskContext};
use crate::state::RetentionPolicy;
use chrono::{Local, NaiveTime};
use ferrite::logging;
use ferrite::time::timestamp_millis;
use std::time::{Duration, Instant};

pub const TASK_NAME: &str = "maintenance";

const DEFAULT_INTERVAL_MINUTES: u64 = 360;

pub struct Maintenance {
    last_sweep: Option<Instant>,
    last_daily_date: Option<chrono::NaiveDate>,
}

impl Maintenance {
    pub fn new() -> Maintenance {
        Maintenance {
            last_sweep: None,
            last_daily_date: None,
        }
    }

    fn sweep(&mut self, ctx: &TaskContext, reason: &str) {
        let settings = ctx.state().settings();
        let policy = RetentionPolicy::from_settings(&settings);

        let stats = ctx.state().retention_sweep(&policy, timestamp_millis());
        self.last_sweep = Some(Instant::now());

        if let Err(err) = ctx.state().persist() {
            logging::error!(ctx.log, "state persist failed";
                            "context" => "sweep",
                            "error" => %err);
        }

        ctx.audit(
            TASK_NAME,
            None,
            reason,
            Some(format!(
                "messages {} telemetry {} traceroutes {} segments {} neighbors {}",
                stats.messages,
                stats.telemetry,
                stats.traceroutes,
                stats.route_segments,
                stats.neighbors
            )),
        );
    }
}

impl AutomationTask for Maintenance {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn schedule(&self, _ctx: &TaskContext) -> Option<Duration> {
        // Always on; minute polling so the daily time lands precisely.
        Some(Duration::from_secs(60))
    }

    fn tick(&mut self, ctx: &TaskContext) {
        let settings = ctx.state().settings();
        let interval_minutes =
            settings.get_u64("maintenance_interval_minutes", DEFAULT_INTERVAL_MINUTES);

        let now = Local::now();

        // Daily slot.
        if let Some(daily) = settings.get_str("maintenance_daily_time") {
            if let Ok(daily_time) = NaiveTime::parse_from_str(daily, "%H:%M") {
                let today = now.date_naive();

                if now.time() >= daily_time && self.last_daily_date != Some(today) {
                    self.last_daily_date = Some(today);
                    self.sweep(ctx, "daily-sweep");
                    return;
                }
            }
        }

        // Periodic slot.
        let due = self
            .last_sweep
            .map_or(true, |last| last.elapsed() >= Duration::from_secs(interval_minutes * 60));

        if due {
            self.sweep(ctx, "interval-sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{complete_capture, harness, teardown, wait_for_ready};

    #[test]
    fn test_periodic_sweep_runs_once_per_interval() {
        let mut h = harness();
        complete_capture(&mut h.remote);
        wait_for_ready(&h);

        let ctx = TaskContext {
            session: h.session.clone(),
            log: logging::discard(),
        };

        let mut task = Maintenance::new();

        task.tick(&ctx);
        task.tick(&ctx);

        let sweeps = ctx
            .state()
            .audit_log()
            .iter()
            .filter(|e| e.outcome == "interval-sweep")
            .count();

        assert_eq!(sweeps, 1);

        teardown(h);
    }
}
