//! Trigger-driven replies to inbound text.
//!
//! Each configured trigger pairs a pattern with an action: a canned text,
//! an HTTP GET whose body leads the reply, or a local script run with the
//! captures in its environment.

use crate::events::MeshEvent;
use crate::sched::trigger::{render_template, TriggerPattern};
use crate::sched::{AutomationTask, TaskContext};
use crate::script::run_script;
use crate::state::StoredMessage;
use crate::DM_CHANNEL;
use ferrite::logging;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

pub const TASK_NAME: &str = "auto-responder";

/// Leading slice of an HTTP body used as the reply.
pub const HTTP_REPLY_LIMIT: usize = 500;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum TriggerAction {
    /// Canned reply; `{name}` placeholders are substituted.
    Text(String),
    /// GET this URL, reply with the leading body slice.
    Http(String),
    /// Run this command with `PARAM_<name>` environment variables; a
    /// non-empty stdout becomes the reply.
    Script(String),
}

/// Where a trigger listens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerScope {
    Any,
    Dm,
    Channel(u32),
}

impl Default for TriggerScope {
    fn default() -> TriggerScope {
        TriggerScope::Any
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub pattern: String,
    pub action: TriggerAction,
    #[serde(default)]
    pub scope: TriggerScope,
    /// Skip senders without a long name yet.
    #[serde(default)]
    pub skip_incomplete_nodes: bool,
}

impl TriggerScope {
    fn covers(&self, message: &StoredMessage) -> bool {
        match self {
            TriggerScope::Any => true,
            TriggerScope::Dm => message.channel == DM_CHANNEL,
            TriggerScope::Channel(index) => message.channel == *index as i32,
        }
    }
}

pub struct AutoResponder;

impl AutoResponder {
    pub fn new() -> AutoResponder {
        AutoResponder
    }

    fn resolve_reply(
        &self,
        ctx: &TaskContext,
        action: &TriggerAction,
        params: &hashbrown::HashMap<String, String>,
    ) -> Option<String> {
        match action {
            TriggerAction::Text(template) => Some(render_template(template, params)),
            TriggerAction::Http(url) => {
                let url = render_template(url, params);

                let client = reqwest::blocking::Client::builder()
                    .timeout(HTTP_TIMEOUT)
                    .build()
                    .ok()?;

                match client.get(&url).send().and_then(|resp| resp.text()) {
                    Ok(body) => {
                        let reply: String = body.chars().take(HTTP_REPLY_LIMIT).collect();
                        Some(reply)
                    }
                    Err(err) => {
                        logging::warn!(ctx.log, "responder fetch failed";
                                       "context" => "resolve_reply",
                                       "error" => %err);
                        None
                    }
                }
            }
            TriggerAction::Script(command) => {
                let env = TriggerPattern::env_params(params);

                match run_script(command, &env) {
                    Ok(output) if !output.stdout.trim().is_empty() => {
                        Some(output.stdout.trim().to_string())
                    }
                    Ok(_) => None,
                    Err(err) => {
                        logging::warn!(ctx.log, "responder script failed";
                                       "context" => "resolve_reply",
                                       "error" => %err);
                        None
                    }
                }
            }
        }
    }

    fn handle_message(&self, ctx: &TaskContext, message: &StoredMessage) {
        if !ctx.session.is_ready() {
            return;
        }

        let settings = ctx.state().settings();

        if !settings.get_bool("auto_responder_enabled", false) {
            return;
        }

        // Never respond to our own traffic.
        if Some(message.from_num) == ctx.state().local_node_num() {
            return;
        }

        let text = match &message.text {
            Some(text) => text,
            None => return,
        };

        let triggers: Vec<TriggerConfig> = settings
            .get_json("auto_responder_triggers")
            .unwrap_or_default();

        for trigger in &triggers {
            if !trigger.scope.covers(message) {
                continue;
            }

            if trigger.skip_incomplete_nodes {
                let complete = ctx
                    .state()
                    .node(message.from_num)
                    .map_or(false, |node| node.long_name.is_some());

                if !complete {
                    continue;
                }
            }

            let pattern = match TriggerPattern::compile(&trigger.pattern) {
                Ok(pattern) => pattern,
                Err(err) => {
                    logging::warn!(ctx.log, "broken trigger pattern skipped";
                                   "context" => "handle_message",
                                   "pattern" => %trigger.pattern,
                                   "error" => ?err);
                    continue;
                }
            };

            let params = match pattern.match_text(text) {
                Some(params) => params,
                None => continue,
            };

            let reply = match self.resolve_reply(ctx, &trigger.action, &params) {
                Some(reply) if !reply.is_empty() => reply,
                _ => continue,
            };

            // Reply where the message came from: DM to the sender, or the
            // same channel.
            let result = if message.channel == DM_CHANNEL {
                ctx.session
                    .send_text(&reply, Some(message.from_num), 0, true)
            } else {
                ctx.session
                    .send_text(&reply, None, message.channel as u8, false)
            };

            match result {
                Ok(_) => {
                    ctx.audit(
                        TASK_NAME,
                        Some(message.from_num),
                        "replied",
                        Some(trigger.pattern.clone()),
                    );
                }
                Err(err) => {
                    ctx.audit(
                        TASK_NAME,
                        Some(message.from_num),
                        "error",
                        Some(err.to_string()),
                    );
                }
            }

            // First matching trigger wins.
            return;
        }
    }
}

impl AutomationTask for AutoResponder {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn schedule(&self, ctx: &TaskContext) -> Option<Duration> {
        if ctx
            .state()
            .settings()
            .get_bool("auto_responder_enabled", false)
        {
            // Purely reactive; the tick is a no-op heartbeat.
            Some(Duration::from_secs(3600))
        } else {
            None
        }
    }

    fn tick(&mut self, _ctx: &TaskContext) {}

    fn on_event(&mut self, ctx: &TaskContext, event: &MeshEvent) {
        if let MeshEvent::MessageReceived(message) = event {
            self.handle_message(ctx, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeliveryState;
    use crate::testutil::{complete_capture, harness, teardown, wait_for_ready, LOCAL};
    use ferrite::logging;

    fn inbound(text: &str, channel: i32, from: u32) -> StoredMessage {
        StoredMessage {
            id: "9001".into(),
            from_num: from,
            to_num: LOCAL,
            from_id: ferrite::node_id(from),
            to_id: ferrite::node_id(LOCAL),
            text: Some(text.into()),
            channel,
            portnum: crate::proto::PortNum::TextMessageApp as i32,
            request_id: None,
            timestamp: Some(1),
            rx_time: Some(1),
            hop_start: None,
            hop_limit: None,
            relay_node: None,
            reply_id: None,
            emoji: false,
            via_mqtt: false,
            rx_snr: None,
            rx_rssi: None,
            ack_failed: false,
            routing_error_received: false,
            delivery_state: DeliveryState::Pending,
            want_ack: false,
            ack_from_node: None,
            created_at: 1,
            decrypted_by: None,
        }
    }

    #[test]
    fn test_text_reply_with_captures() {
        let mut h = harness();
        complete_capture(&mut h.remote);
        wait_for_ready(&h);

        let ctx = TaskContext {
            session: h.session.clone(),
            log: logging::discard(),
        };

        ctx.state().with_node(0xAA, |node| {
            node.long_name = Some("Asker".into());
        });

        ctx.state().with_settings(|settings| {
            settings.set("auto_responder_enabled", true);
            settings.set_json(
                "auto_responder_triggers",
                &vec![TriggerConfig {
                    pattern: "ping {name:[A-Z]+}".into(),
                    action: TriggerAction::Text("pong {name}".into()),
                    scope: TriggerScope::Dm,
                    skip_incomplete_nodes: true,
                }],
            );
        });

        let mut task = AutoResponder::new();

        task.on_event(
            &ctx,
            &MeshEvent::MessageReceived(Box::new(inbound("ping FOO", DM_CHANNEL, 0xAA))),
        );

        let audit = ctx.state().audit_log();
        assert!(audit
            .iter()
            .any(|e| e.outcome == "replied" && e.target == Some(0xAA)));

        // The stored reply carries the substituted capture.
        let page = ctx.state().direct_messages(LOCAL, 0xAA, 10, 0);
        assert!(page
            .messages
            .iter()
            .any(|m| m.text.as_deref() == Some("pong FOO")));

        // A non-matching case is silent.
        task.on_event(
            &ctx,
            &MeshEvent::MessageReceived(Box::new(inbound("ping foo", DM_CHANNEL, 0xAA))),
        );
        let audit = ctx.state().audit_log();
        assert_eq!(audit.iter().filter(|e| e.outcome == "replied").count(), 1);

        teardown(h);
    }

    #[test]
    fn test_scope_and_incomplete_gating() {
        let mut h = harness();
        complete_capture(&mut h.remote);
        wait_for_ready(&h);

        let ctx = TaskContext {
            session: h.session.clone(),
            log: logging::discard(),
        };

        ctx.state().with_settings(|settings| {
            settings.set("auto_responder_enabled", true);
            settings.set_json(
                "auto_responder_triggers",
                &vec![TriggerConfig {
                    pattern: "status".into(),
                    action: TriggerAction::Text("all good".into()),
                    scope: TriggerScope::Channel(2),
                    skip_incomplete_nodes: true,
                }],
            );
        });

        let mut task = AutoResponder::new();

        // Wrong scope: DM instead of channel 2.
        task.on_event(
            &ctx,
            &MeshEvent::MessageReceived(Box::new(inbound("status", DM_CHANNEL, 0xBB))),
        );
        // Right scope, but the sender has no long name.
        task.on_event(
            &ctx,
            &MeshEvent::MessageReceived(Box::new(inbound("status", 2, 0xBB))),
        );

        assert!(!ctx
            .state()
            .audit_log()
            .iter()
            .any(|e| e.outcome == "replied"));

        ctx.state().with_node(0xBB, |node| {
            node.long_name = Some("Complete".into());
        });
        task.on_event(
            &ctx,
            &MeshEvent::MessageReceived(Box::new(inbound("status", 2, 0xBB))),
        );

        assert!(ctx
            .state()
            .audit_log()
            .iter()
            .any(|e| e.outcome == "replied"));

        teardown(h);
    }
}
