//! Agent node - one autonomous unit of execution

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::message::{ChatMessage, TokenUsage};

/// Run state of a node
///
/// `idle -> running -> (waiting_on_children -> running)* -> completed | failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    WaitingOnChildren,
    Completed,
    Failed,
}

impl RunState {
    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, WaitingOnChildren)
                | (WaitingOnChildren, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (WaitingOnChildren, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// Running or blocked on children
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::WaitingOnChildren)
    }
}

/// An autonomous agent instance and its conversation
///
/// Nodes never hold references to each other; `parent` and `children` are
/// lookup keys into the session's node table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeId>,
    pub run_state: RunState,
    /// Injected into every model call; fixed at spawn
    pub always_included_context: Vec<ChatMessage>,
    pub history: Vec<ChatMessage>,
    /// Function names available to this node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl AgentNode {
    pub fn new(
        id: NodeId,
        parent: Option<NodeId>,
        always_included_context: Vec<ChatMessage>,
        history: Vec<ChatMessage>,
        tools: Vec<String>,
    ) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            run_state: RunState::Idle,
            always_included_context,
            history,
            tools,
            token_usage: TokenUsage::default(),
            failure: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Full prompt context: fixed context followed by history
    pub fn context(&self) -> Vec<ChatMessage> {
        self.always_included_context
            .iter()
            .chain(self.history.iter())
            .cloned()
            .collect()
    }
}
