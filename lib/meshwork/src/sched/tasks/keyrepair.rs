//! Repairs nodes with duplicate or low-entropy keys.
//!
//! A fresh node-info exchange usually makes the peer regenerate and
//! republish its key. Nodes that stay broken after the configured number
//! of exchanges can be purged so the duplicate stops poisoning routing.

use crate::sched::{AutomationTask, TaskContext};
use ferrite::NodeNum;
use hashbrown::HashMap;
use std::time::Duration;

pub const TASK_NAME: &str = "auto-keyrepair";

const DEFAULT_INTERVAL_MINUTES: u64 = 60;
const DEFAULT_MAX_EXCHANGES: u64 = 3;

pub struct AutoKeyRepair {
    exchanges: HashMap<NodeNum, u64>,
}

impl AutoKeyRepair {
    pub fn new() -> AutoKeyRepair {
        AutoKeyRepair {
            exchanges: HashMap::new(),
        }
    }
}

impl AutomationTask for AutoKeyRepair {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn schedule(&self, ctx: &TaskContext) -> Option<Duration> {
        let settings = ctx.state().settings();

        if !settings.get_bool("auto_keyrepair_enabled", false) {
            return None;
        }

        Some(Duration::from_secs(
            settings.get_u64("auto_keyrepair_interval_minutes", DEFAULT_INTERVAL_MINUTES) * 60,
        ))
    }

    fn tick(&mut self, ctx: &TaskContext) {
        if !ctx.session.is_ready() {
            return;
        }

        let settings = ctx.state().settings();
        let max_exchanges = settings.get_u64("auto_keyrepair_max_exchanges", DEFAULT_MAX_EXCHANGES);
        let auto_purge = settings.get_bool("auto_keyrepair_auto_purge", false);

        ctx.state().scan_key_security();

        let flagged: Vec<NodeNum> = ctx
            .state()
            .nodes()
            .into_iter()
            .filter(|node| node.duplicate_key_detected || node.key_is_low_entropy)
            .map(|node| node.num)
            .collect();

        // Nodes whose keys healed drop out of the exchange ledger.
        self.exchanges.retain(|num, _| flagged.contains(num));

        for num in flagged {
            let attempts = self.exchanges.entry(num).or_insert(0);

            if *attempts < max_exchanges {
                *attempts += 1;

                match ctx.session.request_node_info(num) {
                    Ok(waiter) => {
                        drop(waiter);
                        ctx.audit(
                            TASK_NAME,
                            Some(num),
                            "exchange-requested",
                            Some(format!("attempt {}", attempts)),
                        );
                    }
                    Err(err) => {
                        ctx.audit(TASK_NAME, Some(num), "error", Some(err.to_string()));
                    }
                }
            } else if auto_purge {
                ctx.state().purge_node(num);
                self.exchanges.remove(&num);
                ctx.audit(TASK_NAME, Some(num), "purged", None);
            } else {
                ctx.audit(TASK_NAME, Some(num), "exchanges-exhausted", None);
            }
        }
    }
}
