//! Delegation policies
//!
//! A policy turns one delegation request of a node into zero or more
//! subtasks. The orchestrator never looks at which policy is active; a
//! session without delegation simply runs [`NoDelegation`].

use std::sync::Arc;

use serde_json::json;

use crate::agent::AgentNode;
use crate::error::WarrenError;
use crate::tools::{ToolSpec, DELEGATE_FUNCTION};

/// One unit of work handed to a child node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtask {
    pub instructions: String,
}

impl Subtask {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }
}

pub trait DelegationPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Whether nodes are offered the `delegate` function at all
    fn offers_delegation(&self) -> bool;

    /// Subtasks to spawn for one delegation request of `node`
    fn decide(&self, node: &AgentNode, task: &str) -> Vec<Subtask>;

    /// Function spec advertised to nodes that may delegate
    fn tool_spec(&self) -> ToolSpec {
        ToolSpec::new(
            DELEGATE_FUNCTION,
            "Hand part of your task to a helper that has the same tools as you. \
             It reports back with its result.",
            json!({
                "type": "object",
                "properties": {
                    "instructions": {
                        "type": "string",
                        "description": "Detailed instructions for the helper."
                    }
                },
                "required": ["instructions"]
            }),
        )
    }
}

/// Never delegates; every session is a single node
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelegation;

impl DelegationPolicy for NoDelegation {
    fn name(&self) -> &str {
        "none"
    }

    fn offers_delegation(&self) -> bool {
        false
    }

    fn decide(&self, _node: &AgentNode, _task: &str) -> Vec<Subtask> {
        Vec::new()
    }
}

/// One child per delegation request
#[derive(Debug, Clone, Copy, Default)]
pub struct DelegateOne;

impl DelegationPolicy for DelegateOne {
    fn name(&self) -> &str {
        "delegate_one"
    }

    fn offers_delegation(&self) -> bool {
        true
    }

    fn decide(&self, _node: &AgentNode, task: &str) -> Vec<Subtask> {
        let task = task.trim();
        if task.is_empty() {
            return Vec::new();
        }
        vec![Subtask::new(task)]
    }
}

/// Splits a request into one child per listed item
///
/// Each non-empty line of the instructions becomes a subtask (list markers
/// are stripped), up to `max_children`.
#[derive(Debug, Clone, Copy)]
pub struct DelegateFanOut {
    pub max_children: usize,
}

impl DelegationPolicy for DelegateFanOut {
    fn name(&self) -> &str {
        "fan_out"
    }

    fn offers_delegation(&self) -> bool {
        true
    }

    fn decide(&self, _node: &AgentNode, task: &str) -> Vec<Subtask> {
        task.lines()
            .map(strip_list_marker)
            .filter(|line| !line.is_empty())
            .take(self.max_children)
            .map(Subtask::new)
            .collect()
    }

    fn tool_spec(&self) -> ToolSpec {
        ToolSpec::new(
            DELEGATE_FUNCTION,
            format!(
                "Hand parts of your task to helpers that have the same tools as you. \
                 Put one subtask per line (at most {}); each line gets its own helper \
                 and all helpers run at the same time.",
                self.max_children
            ),
            json!({
                "type": "object",
                "properties": {
                    "instructions": {
                        "type": "string",
                        "description": "One subtask per line."
                    }
                },
                "required": ["instructions"]
            }),
        )
    }
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .unwrap_or(line);
    match line.split_once(". ") {
        Some((n, rest)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => rest.trim(),
        _ => line.trim(),
    }
}

/// The built-in policies, selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelegationScheme {
    None,
    #[default]
    One,
    FanOut { max_children: usize },
}

impl DelegationScheme {
    pub fn validate(&self) -> Result<(), WarrenError> {
        match self {
            DelegationScheme::FanOut { max_children: 0 } => Err(WarrenError::Configuration(
                "fan-out delegation needs max_children > 0".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn build(&self) -> Arc<dyn DelegationPolicy> {
        match *self {
            DelegationScheme::None => Arc::new(NoDelegation),
            DelegationScheme::One => Arc::new(DelegateOne),
            DelegationScheme::FanOut { max_children } => Arc::new(DelegateFanOut { max_children }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NodeId;

    fn node() -> AgentNode {
        AgentNode::new(NodeId::root(), None, vec![], vec![], vec![])
    }

    #[test]
    fn test_no_delegation_never_splits() {
        let policy = NoDelegation;
        assert!(!policy.offers_delegation());
        assert!(policy.decide(&node(), "a\nb\nc").is_empty());
    }

    #[test]
    fn test_delegate_one_yields_at_most_one() {
        let policy = DelegateOne;
        assert_eq!(
            policy.decide(&node(), "  find flights\nand hotels "),
            vec![Subtask::new("find flights\nand hotels")]
        );
        assert!(policy.decide(&node(), "   ").is_empty());
    }

    #[test]
    fn test_fan_out_splits_lines() {
        let policy = DelegateFanOut { max_children: 2 };
        let subtasks = policy.decide(&node(), "1. flights\n\n- hotels\n* cars");
        assert_eq!(subtasks, vec![Subtask::new("flights"), Subtask::new("hotels")]);
    }

    #[test]
    fn test_strip_list_marker_keeps_sentences() {
        assert_eq!(strip_list_marker("Go home. Now."), "Go home. Now.");
        assert_eq!(strip_list_marker("12. twelve"), "twelve");
    }

    #[test]
    fn test_scheme_validation() {
        assert!(DelegationScheme::FanOut { max_children: 0 }.validate().is_err());
        assert!(DelegationScheme::One.validate().is_ok());
        assert_eq!(DelegationScheme::None.build().name(), "none");
        assert_eq!(DelegationScheme::default().build().name(), "delegate_one");
    }

    #[test]
    fn test_tool_spec_uses_reserved_name() {
        assert_eq!(DelegateOne.tool_spec().name, DELEGATE_FUNCTION);
        assert!(DelegateFanOut { max_children: 3 }.tool_spec().description.contains("at most 3"));
    }
}
