//! Cron-driven timer triggers: scripts or canned texts.

use crate::sched::cron::CronExpr;
use crate::sched::{AutomationTask, TaskContext};
use crate::script::run_script;
use chrono::Local;
use ferrite::logging;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

pub const TASK_NAME: &str = "timer-triggers";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum TimerAction {
    Text(String),
    Script(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Five-field cron expression in local time.
    pub schedule: String,
    pub action: TimerAction,
    /// Channel the text action announces on.
    #[serde(default)]
    pub channel: u32,
}

pub struct TimerTriggers {
    /// Minute stamp each timer last fired in, to fire once per matching
    /// minute.
    fired: HashMap<usize, i64>,
}

impl TimerTriggers {
    pub fn new() -> TimerTriggers {
        TimerTriggers {
            fired: HashMap::new(),
        }
    }
}

impl AutomationTask for TimerTriggers {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn schedule(&self, ctx: &TaskContext) -> Option<Duration> {
        let settings = ctx.state().settings();

        if !settings.get_bool("timer_triggers_enabled", false) {
            return None;
        }

        // Sub-minute polling; the minute stamp deduplicates.
        Some(Duration::from_secs(20))
    }

    fn tick(&mut self, ctx: &TaskContext) {
        let settings = ctx.state().settings();
        let timers: Vec<TimerConfig> = settings.get_json("timer_triggers").unwrap_or_default();

        let now = Local::now();
        let minute_stamp = now.timestamp() / 60;

        for (index, timer) in timers.iter().enumerate() {
            if self.fired.get(&index) == Some(&minute_stamp) {
                continue;
            }

            let cron = match CronExpr::parse(&timer.schedule) {
                Ok(cron) => cron,
                Err(err) => {
                    logging::warn!(ctx.log, "broken timer schedule skipped";
                                   "context" => "tick",
                                   "schedule" => %timer.schedule,
                                   "error" => ?err);
                    continue;
                }
            };

            if !cron.matches(&now.naive_local()) {
                continue;
            }

            self.fired.insert(index, minute_stamp);

            match &timer.action {
                TimerAction::Text(text) => {
                    if !ctx.session.is_ready() {
                        continue;
                    }

                    match ctx.session.send_text(text, None, timer.channel as u8, false) {
                        Ok(_) => ctx.audit(TASK_NAME, None, "text-sent", Some(timer.schedule.clone())),
                        Err(err) => ctx.audit(TASK_NAME, None, "error", Some(err.to_string())),
                    }
                }
                TimerAction::Script(command) => match run_script(command, &[]) {
                    Ok(output) if output.timed_out => {
                        ctx.audit(TASK_NAME, None, "script-timeout", Some(command.clone()));
                    }
                    Ok(_) => {
                        ctx.audit(TASK_NAME, None, "script-run", Some(command.clone()));
                    }
                    Err(err) => {
                        ctx.audit(TASK_NAME, None, "error", Some(err.to_string()));
                    }
                },
            }
        }

        // Old stamps are only useful for the current minute.
        self.fired.retain(|_, stamp| *stamp == minute_stamp);
    }
}
