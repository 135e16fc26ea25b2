//! Pushes the host clock to filtered nodes.

use crate::sched::{AutomationTask, NodeFilter, TaskContext};
use std::time::Duration;

pub const TASK_NAME: &str = "auto-timesync";

const DEFAULT_INTERVAL_MINUTES: u64 = 720;

pub struct AutoTimeSync;

impl AutoTimeSync {
    pub fn new() -> AutoTimeSync {
        AutoTimeSync
    }
}

impl AutomationTask for AutoTimeSync {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn schedule(&self, ctx: &TaskContext) -> Option<Duration> {
        let settings = ctx.state().settings();

        if !settings.get_bool("auto_timesync_enabled", false) {
            return None;
        }

        Some(Duration::from_secs(
            settings.get_u64("auto_timesync_interval_minutes", DEFAULT_INTERVAL_MINUTES) * 60,
        ))
    }

    fn tick(&mut self, ctx: &TaskContext) {
        if !ctx.session.is_ready() {
            return;
        }

        let settings = ctx.state().settings();
        let filter: NodeFilter = settings.get_json("auto_timesync_filter").unwrap_or_default();

        let nodes = ctx.state().nodes();
        let local = ctx.state().local_node_num();

        for node in filter.select(&nodes, local) {
            match ctx.session.send_time_sync(node.num) {
                Ok(_) => ctx.audit(TASK_NAME, Some(node.num), "sent", None),
                Err(err) => {
                    ctx.audit(TASK_NAME, Some(node.num), "error", Some(err.to_string()))
                }
            }
        }
    }
}
