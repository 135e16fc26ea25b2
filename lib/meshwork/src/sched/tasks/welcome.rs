//! Greets nodes on their first appearance.
//!
//! When first enabled, every already-known node is bulk-marked welcomed so
//! the whole mesh is not greeted at once. New nodes can be gated on having
//! a long name and on hop distance.

use crate::events::MeshEvent;
use crate::sched::{AutomationTask, TaskContext};
use std::time::Duration;

pub const TASK_NAME: &str = "auto-welcome";

const DEFAULT_MAX_HOPS: u64 = 3;
const DEFAULT_TEXT: &str = "Welcome to the mesh!";

pub struct AutoWelcome;

impl AutoWelcome {
    pub fn new() -> AutoWelcome {
        AutoWelcome
    }

    fn try_welcome(&self, ctx: &TaskContext, num: ferrite::NodeNum) {
        if !ctx.session.is_ready() {
            return;
        }

        let settings = ctx.state().settings();

        if !settings.get_bool("auto_welcome_enabled", false)
            || !settings.get_bool("auto_welcome_initialized", false)
        {
            return;
        }

        let node = match ctx.state().node(num) {
            Some(node) => node,
            None => return,
        };

        if node.welcomed || node.is_local || node.is_ignored {
            return;
        }

        if settings.get_bool("auto_welcome_require_long_name", true) && node.long_name.is_none() {
            return;
        }

        let max_hops = settings.get_u64("auto_welcome_max_hops", DEFAULT_MAX_HOPS) as u32;
        if node.hops_away.map_or(false, |hops| hops > max_hops) {
            return;
        }

        let text = settings
            .get_str("auto_welcome_text")
            .unwrap_or(DEFAULT_TEXT)
            .to_string();

        match ctx.session.send_text(&text, Some(num), 0, true) {
            Ok(_) => {
                ctx.state().mark_welcomed(num);
                ctx.audit(TASK_NAME, Some(num), "welcomed", None);
            }
            Err(err) => {
                ctx.audit(TASK_NAME, Some(num), "error", Some(err.to_string()));
            }
        }
    }
}

impl AutomationTask for AutoWelcome {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn schedule(&self, ctx: &TaskContext) -> Option<Duration> {
        let settings = ctx.state().settings();

        if !settings.get_bool("auto_welcome_enabled", false) {
            return None;
        }

        // The periodic tick only handles first-enable initialisation and
        // nodes that grew a long name since they appeared.
        Some(Duration::from_secs(60))
    }

    fn tick(&mut self, ctx: &TaskContext) {
        let initialized = ctx
            .state()
            .settings()
            .get_bool("auto_welcome_initialized", false);

        if !initialized {
            let marked = ctx.state().bulk_mark_welcomed();
            ctx.state()
                .with_settings(|settings| settings.set("auto_welcome_initialized", true));
            ctx.audit(
                TASK_NAME,
                None,
                "initialized",
                Some(format!("{} existing nodes marked", marked)),
            );
            return;
        }

        // Catch nodes whose long name arrived after the observation event.
        let pending: Vec<ferrite::NodeNum> = ctx
            .state()
            .nodes()
            .into_iter()
            .filter(|node| !node.welcomed && !node.is_local)
            .map(|node| node.num)
            .collect();

        for num in pending {
            self.try_welcome(ctx, num);
        }
    }

    fn on_event(&mut self, ctx: &TaskContext, event: &MeshEvent) {
        if let MeshEvent::NodeObserved { num, .. } = event {
            self.try_welcome(ctx, *num);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{complete_capture, harness, teardown, wait_for_ready};
    use ferrite::logging;

    #[test]
    fn test_first_enable_bulk_marks() {
        let mut h = harness();
        complete_capture(&mut h.remote);
        wait_for_ready(&h);

        let ctx = TaskContext {
            session: h.session.clone(),
            log: logging::discard(),
        };

        for num in 1..=3u32 {
            ctx.state().with_node(num, |node| {
                node.long_name = Some(format!("Old {}", num));
            });
        }

        ctx.state()
            .with_settings(|settings| settings.set("auto_welcome_enabled", true));

        let mut task = AutoWelcome::new();
        task.tick(&ctx);

        // Everyone pre-existing is marked, nobody was greeted.
        assert!(ctx.state().nodes().iter().all(|n| n.welcomed));
        assert!(!ctx
            .state()
            .audit_log()
            .iter()
            .any(|e| e.outcome == "welcomed"));

        // A node appearing afterwards gets the greeting.
        ctx.state().with_node(50, |node| {
            node.long_name = Some("Newcomer".into());
            node.hops_away = Some(1);
        });

        task.on_event(
            &ctx,
            &MeshEvent::NodeObserved {
                num: 50,
                is_new: true,
            },
        );

        assert!(ctx.state().node(50).unwrap().welcomed);
        assert!(ctx
            .state()
            .audit_log()
            .iter()
            .any(|e| e.target == Some(50) && e.outcome == "welcomed"));

        teardown(h);
    }

    #[test]
    fn test_gating_on_long_name_and_hops() {
        let mut h = harness();
        complete_capture(&mut h.remote);
        wait_for_ready(&h);

        let ctx = TaskContext {
            session: h.session.clone(),
            log: logging::discard(),
        };

        ctx.state().with_settings(|settings| {
            settings.set("auto_welcome_enabled", true);
            settings.set("auto_welcome_initialized", true);
            settings.set("auto_welcome_max_hops", 2u64);
        });

        // No long name yet.
        ctx.state().with_node(10, |_| {});
        // Too far away.
        ctx.state().with_node(11, |node| {
            node.long_name = Some("Far".into());
            node.hops_away = Some(5);
        });

        let mut task = AutoWelcome::new();
        task.on_event(&ctx, &MeshEvent::NodeObserved { num: 10, is_new: true });
        task.on_event(&ctx, &MeshEvent::NodeObserved { num: 11, is_new: true });

        assert!(!ctx.state().node(10).unwrap().welcomed);
        assert!(!ctx.state().node(11).unwrap().welcomed);

        // The long name arriving later makes the periodic tick greet it.
        ctx.state().with_node(10, |node| {
            node.long_name = Some("Named".into());
        });
        task.tick(&ctx);

        assert!(ctx.state().node(10).unwrap().welcomed);

        teardown(h);
    }
}
