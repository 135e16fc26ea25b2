//! Periodic traceroutes towards filtered nodes, a few per tick.

use crate::sched::{AutomationTask, NodeFilter, TaskContext};
use ferrite::logging;
use ferrite::NodeNum;
use hashbrown::HashSet;
use std::time::Duration;

pub const TASK_NAME: &str = "auto-traceroute";

const DEFAULT_INTERVAL_MINUTES: u64 = 30;
const DEFAULT_BUDGET: u64 = 5;

pub struct AutoTraceroute {
    /// Nodes already traced in the current pass over the filtered set.
    traced: HashSet<NodeNum>,
}

impl AutoTraceroute {
    pub fn new() -> AutoTraceroute {
        AutoTraceroute {
            traced: HashSet::new(),
        }
    }
}

impl AutomationTask for AutoTraceroute {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn schedule(&self, ctx: &TaskContext) -> Option<Duration> {
        let settings = ctx.state().settings();

        if !settings.get_bool("auto_traceroute_enabled", false) {
            return None;
        }

        Some(Duration::from_secs(
            settings.get_u64("auto_traceroute_interval_minutes", DEFAULT_INTERVAL_MINUTES) * 60,
        ))
    }

    fn tick(&mut self, ctx: &TaskContext) {
        if !ctx.session.is_ready() {
            return;
        }

        let settings = ctx.state().settings();
        let budget = settings.get_u64("auto_traceroute_budget", DEFAULT_BUDGET) as usize;
        let filter: NodeFilter = settings
            .get_json("auto_traceroute_filter")
            .unwrap_or_default();
        let sort_by_hops = settings.get_bool("auto_traceroute_sort_by_hops", false);

        let nodes = ctx.state().nodes();
        let local = ctx.state().local_node_num();

        let mut candidates: Vec<&crate::state::Node> = Vec::new();

        for node in &nodes {
            if Some(node.num) == local {
                continue;
            }

            if !filter.matches(node) {
                ctx.audit(TASK_NAME, Some(node.num), "skipped-filter", None);
                continue;
            }

            candidates.push(node);
        }

        // One pass visits every candidate once; start over when done.
        candidates.retain(|node| !self.traced.contains(&node.num));

        if candidates.is_empty() {
            self.traced.clear();
            return;
        }

        if sort_by_hops {
            candidates.sort_by(|a, b| b.hops_away.unwrap_or(0).cmp(&a.hops_away.unwrap_or(0)));
        }

        let mut sent = 0usize;

        for node in candidates {
            if sent >= budget {
                ctx.audit(TASK_NAME, Some(node.num), "skipped-rate-limit", None);
                continue;
            }

            match ctx.session.send_traceroute(node.num) {
                Ok(waiter) => {
                    // The reply lands in state via the inbound path; the
                    // waiter is not held.
                    drop(waiter);
                    self.traced.insert(node.num);
                    sent += 1;
                    ctx.audit(TASK_NAME, Some(node.num), "sent", None);
                }
                Err(err) => {
                    ctx.audit(TASK_NAME, Some(node.num), "error", Some(err.to_string()));
                }
            }
        }

        logging::debug!(ctx.log, "traceroute tick finished";
                        "context" => "tick",
                        "sent" => sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{complete_capture, harness, teardown, wait_for_ready};
    use ferrite::logging;

    #[test]
    fn test_budget_limits_sends_per_tick() {
        let mut h = harness();
        complete_capture(&mut h.remote);
        wait_for_ready(&h);

        let ctx = TaskContext {
            session: h.session.clone(),
            log: logging::discard(),
        };

        // Forty candidate nodes beyond the local one.
        for num in 1..=40u32 {
            ctx.state().with_node(num, |node| {
                node.long_name = Some(format!("N{}", num));
            });
        }

        ctx.state().with_settings(|settings| {
            settings.set("auto_traceroute_enabled", true);
            settings.set("auto_traceroute_budget", 5u64);
        });

        let mut task = AutoTraceroute::new();
        task.tick(&ctx);

        let audit = ctx.state().audit_log();
        let sent = audit.iter().filter(|e| e.outcome == "sent").count();
        let skipped = audit
            .iter()
            .filter(|e| e.outcome == "skipped-rate-limit")
            .count();

        assert_eq!(sent, 5);
        assert_eq!(skipped, 35);

        // Next tick moves on to five fresh nodes.
        task.tick(&ctx);
        let audit = ctx.state().audit_log();
        let sent_targets: std::collections::HashSet<Option<u32>> = audit
            .iter()
            .filter(|e| e.outcome == "sent")
            .map(|e| e.target)
            .collect();

        assert_eq!(sent_targets.len(), 10);

        // Eight ticks exhaust the set of forty.
        for _ in 0..6 {
            task.tick(&ctx);
        }
        let audit = ctx.state().audit_log();
        assert_eq!(audit.iter().filter(|e| e.outcome == "sent").count(), 40);

        teardown(h);
    }

    #[test]
    fn test_filter_outcomes_logged() {
        let mut h = harness();
        complete_capture(&mut h.remote);
        wait_for_ready(&h);

        let ctx = TaskContext {
            session: h.session.clone(),
            log: logging::discard(),
        };

        ctx.state().with_node(1, |node| {
            node.long_name = Some("Relay".into());
        });
        ctx.state().with_node(2, |node| {
            node.long_name = Some("Sensor".into());
        });

        ctx.state().with_settings(|settings| {
            settings.set("auto_traceroute_enabled", true);
            settings.set_json(
                "auto_traceroute_filter",
                &NodeFilter {
                    name_pattern: Some("^Relay".into()),
                    ..NodeFilter::default()
                },
            );
        });

        let mut task = AutoTraceroute::new();
        task.tick(&ctx);

        let audit = ctx.state().audit_log();

        assert!(audit
            .iter()
            .any(|e| e.target == Some(1) && e.outcome == "sent"));
        assert!(audit
            .iter()
            .any(|e| e.target == Some(2) && e.outcome == "skipped-filter"));

        teardown(h);
    }
}
