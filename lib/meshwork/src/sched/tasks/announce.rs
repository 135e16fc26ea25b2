//! Periodic announcement text on a configured channel.
//!
//! Either a plain interval or a day/hour schedule matrix; the matrix
//! fires once per matching hour.

use crate::sched::{AutomationTask, TaskContext};
use chrono::{Datelike, Local, Timelike};
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

pub const TASK_NAME: &str = "auto-announce";

const DEFAULT_INTERVAL_MINUTES: u64 = 24 * 60;

/// Day-of-week (0 = Sunday) by hour-of-day matrix.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AnnounceSchedule {
    #[serde(default)]
    pub days: Vec<u32>,
    #[serde(default)]
    pub hours: Vec<u32>,
}

impl AnnounceSchedule {
    pub fn matches(&self, day: u32, hour: u32) -> bool {
        (self.days.is_empty() || self.days.contains(&day))
            && (self.hours.is_empty() || self.hours.contains(&hour))
    }
}

pub struct AutoAnnounce {
    /// Day/hour slot already fired, for the matrix mode.
    last_slot: Option<(u32, u32)>,
}

impl AutoAnnounce {
    pub fn new() -> AutoAnnounce {
        AutoAnnounce { last_slot: None }
    }
}

impl AutomationTask for AutoAnnounce {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn schedule(&self, ctx: &TaskContext) -> Option<Duration> {
        let settings = ctx.state().settings();

        if !settings.get_bool("auto_announce_enabled", false) {
            return None;
        }

        if settings.get("auto_announce_schedule").is_some() {
            // Matrix mode polls each minute and gates on the slot.
            return Some(Duration::from_secs(60));
        }

        Some(Duration::from_secs(
            settings.get_u64("auto_announce_interval_minutes", DEFAULT_INTERVAL_MINUTES) * 60,
        ))
    }

    fn tick(&mut self, ctx: &TaskContext) {
        if !ctx.session.is_ready() {
            return;
        }

        let settings = ctx.state().settings();

        let text = match settings.get_str("auto_announce_text") {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => return,
        };
        let channel = settings.get_u64("auto_announce_channel", 0) as u8;

        if let Some(schedule) = settings.get_json::<AnnounceSchedule>("auto_announce_schedule") {
            let now = Local::now();
            let slot = (now.weekday().num_days_from_sunday(), now.hour());

            if !schedule.matches(slot.0, slot.1) || self.last_slot == Some(slot) {
                return;
            }

            self.last_slot = Some(slot);
        }

        match ctx.session.send_text(&text, None, channel, false) {
            Ok(send) => {
                ctx.audit(
                    TASK_NAME,
                    None,
                    "sent",
                    Some(format!("channel {} id {}", channel, send.packet_id)),
                );
            }
            Err(err) => {
                ctx.audit(TASK_NAME, None, "error", Some(err.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_matrix() {
        let schedule = AnnounceSchedule {
            days: vec![1, 3],
            hours: vec![9, 18],
        };

        assert!(schedule.matches(1, 9));
        assert!(schedule.matches(3, 18));
        assert!(!schedule.matches(2, 9));
        assert!(!schedule.matches(1, 10));

        // Empty clauses are wildcards.
        let any = AnnounceSchedule::default();
        assert!(any.matches(0, 0));
    }
}
