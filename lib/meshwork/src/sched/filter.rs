//! Node selection predicate shared by the automation tasks.

use crate::state::Node;
use ferrite::NodeNum;
use regex::Regex;
use serde_derive::{Deserialize, Serialize};

/// Declarative filter stored in settings. Every populated clause must
/// match; an empty filter matches everything except ignored nodes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeFilter {
    #[serde(default)]
    pub channels: Vec<u32>,
    #[serde(default)]
    pub roles: Vec<i32>,
    #[serde(default)]
    pub hw_models: Vec<i32>,
    #[serde(default)]
    pub name_pattern: Option<String>,
    /// Explicit allow-list of node numbers.
    #[serde(default)]
    pub nodes: Vec<NodeNum>,
}

impl NodeFilter {
    pub fn matches(&self, node: &Node) -> bool {
        if node.is_ignored {
            return false;
        }

        if !self.nodes.is_empty() && !self.nodes.contains(&node.num) {
            return false;
        }

        if !self.channels.is_empty() {
            match node.channel {
                Some(channel) if self.channels.contains(&channel) => {}
                _ => return false,
            }
        }

        if !self.roles.is_empty() {
            match node.role {
                Some(role) if self.roles.contains(&role) => {}
                _ => return false,
            }
        }

        if !self.hw_models.is_empty() {
            match node.hw_model {
                Some(model) if self.hw_models.contains(&model) => {}
                _ => return false,
            }
        }

        if let Some(pattern) = &self.name_pattern {
            let regex = match Regex::new(pattern) {
                Ok(regex) => regex,
                // A broken pattern matches nothing rather than everything.
                Err(_) => return false,
            };

            let name_matches = node
                .long_name
                .as_deref()
                .map_or(false, |name| regex.is_match(name))
                || node
                    .short_name
                    .as_deref()
                    .map_or(false, |name| regex.is_match(name));

            if !name_matches {
                return false;
            }
        }

        true
    }

    /// Applies the filter over a node list, excluding the local node.
    pub fn select<'a>(&self, nodes: &'a [Node], local: Option<NodeNum>) -> Vec<&'a Node> {
        nodes
            .iter()
            .filter(|node| Some(node.num) != local && self.matches(node))
            .collect()
    }
}
