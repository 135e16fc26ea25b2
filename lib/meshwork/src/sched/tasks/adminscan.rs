//! Probes nodes for remote-admin capability.
//!
//! Nodes without a verdict get a device-metadata admin request. A reply
//! marks them administrable and caches the metadata; a timeout records a
//! negative verdict that expires after the recheck window.

use crate::error::Error;
use crate::sched::{AutomationTask, TaskContext};
use crate::state::Node;
use ferrite::time::timestamp_secs;
use ferrite::NodeNum;
use std::time::Duration;

pub const TASK_NAME: &str = "remote-admin-scan";

const DEFAULT_INTERVAL_MINUTES: u64 = 120;
const DEFAULT_MIN_LAST_HEARD_SECS: u64 = 6 * 3600;
const DEFAULT_RECHECK_SECS: u64 = 7 * 24 * 3600;
const DEFAULT_BUDGET: u64 = 3;

pub struct RemoteAdminScanner;

impl RemoteAdminScanner {
    pub fn new() -> RemoteAdminScanner {
        RemoteAdminScanner
    }
}

/// Nodes eligible for a probe: heard recently enough, and either never
/// probed or carrying an expired negative verdict.
pub fn probe_candidates(
    nodes: &[Node],
    local: Option<NodeNum>,
    now_secs: u64,
    min_last_heard_secs: u64,
    recheck_secs: u64,
) -> Vec<NodeNum> {
    nodes
        .iter()
        .filter(|node| Some(node.num) != local && !node.is_ignored)
        .filter(|node| {
            node.last_heard
                .map_or(false, |heard| now_secs.saturating_sub(heard) < min_last_heard_secs)
        })
        .filter(|node| match node.has_remote_admin {
            None => true,
            Some(true) => false,
            Some(false) => node
                .remote_admin_checked_at
                .map_or(true, |checked| now_secs.saturating_sub(checked) >= recheck_secs),
        })
        .map(|node| node.num)
        .collect()
}

impl AutomationTask for RemoteAdminScanner {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn schedule(&self, ctx: &TaskContext) -> Option<Duration> {
        let settings = ctx.state().settings();

        if !settings.get_bool("admin_scan_enabled", false) {
            return None;
        }

        Some(Duration::from_secs(
            settings.get_u64("admin_scan_interval_minutes", DEFAULT_INTERVAL_MINUTES) * 60,
        ))
    }

    fn tick(&mut self, ctx: &TaskContext) {
        if !ctx.session.is_ready() {
            return;
        }

        let settings = ctx.state().settings();
        let budget = settings.get_u64("admin_scan_budget", DEFAULT_BUDGET) as usize;
        let min_last_heard =
            settings.get_u64("admin_scan_min_last_heard_secs", DEFAULT_MIN_LAST_HEARD_SECS);
        let recheck = settings.get_u64("admin_scan_recheck_secs", DEFAULT_RECHECK_SECS);

        let now_secs = timestamp_secs();
        let candidates = probe_candidates(
            &ctx.state().nodes(),
            ctx.state().local_node_num(),
            now_secs,
            min_last_heard,
            recheck,
        );

        for num in candidates.into_iter().take(budget) {
            match ctx.session.request_device_metadata(num) {
                Ok(_) => {
                    // The inbound path already marked the node.
                    ctx.audit(TASK_NAME, Some(num), "verified", None);
                }
                Err(Error::Timeout(_)) => {
                    ctx.state().with_node(num, |node| {
                        node.has_remote_admin = Some(false);
                        node.remote_admin_checked_at = Some(now_secs);
                    });
                    ctx.audit(TASK_NAME, Some(num), "no-response", None);
                }
                Err(err) => {
                    ctx.audit(TASK_NAME, Some(num), "error", Some(err.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(num: NodeNum, last_heard: Option<u64>) -> Node {
        let mut node = Node::new(num);
        node.last_heard = last_heard;
        node
    }

    #[test]
    fn test_candidate_selection() {
        let now = 1_000_000u64;

        let fresh_unknown = node(1, Some(now - 100));
        let stale_unknown = node(2, Some(now - 100_000));
        let never_heard = node(3, None);

        let mut verified = node(4, Some(now - 100));
        verified.has_remote_admin = Some(true);

        let mut fresh_negative = node(5, Some(now - 100));
        fresh_negative.has_remote_admin = Some(false);
        fresh_negative.remote_admin_checked_at = Some(now - 100);

        let mut expired_negative = node(6, Some(now - 100));
        expired_negative.has_remote_admin = Some(false);
        expired_negative.remote_admin_checked_at = Some(now - 10 * 24 * 3600);

        let nodes = vec![
            fresh_unknown,
            stale_unknown,
            never_heard,
            verified,
            fresh_negative,
            expired_negative,
        ];

        let candidates = probe_candidates(&nodes, None, now, 6 * 3600, 7 * 24 * 3600);

        assert_eq!(candidates, vec![1, 6]);
    }

    #[test]
    fn test_local_node_excluded() {
        let now = 1_000u64;
        let nodes = vec![node(1, Some(now)), node(2, Some(now))];

        let candidates = probe_candidates(&nodes, Some(1), now, 3600, 3600);

        assert_eq!(candidates, vec![2]);
    }
}
