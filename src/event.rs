//! Event taxonomy
//!
//! Every state change in a session is expressed as an [`Event`]. Events are
//! the only way state is observed or persisted: the session reducer folds
//! them into node state, the logger persists the durable ones, and live
//! subscribers receive all of them.

use serde::{Deserialize, Serialize};

use crate::agent::RunState;
use crate::ids::NodeId;
use crate::message::ChatMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Something went wrong that observers should know about
    Error { msg: String },

    /// A node was spawned. Reusing an existing id replaces that node.
    NodeSpawn {
        id: NodeId,
        parent: Option<NodeId>,
        always_included_messages: Vec<ChatMessage>,
        chat_history: Vec<ChatMessage>,
        #[serde(default)]
        tools: Vec<String>,
    },

    NodeStateChange {
        id: NodeId,
        state: RunState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    TokensUsed {
        id: NodeId,
        prompt_tokens: u64,
        completion_tokens: u64,
    },

    /// A node added a message to its history
    MessageAppended { id: NodeId, msg: ChatMessage },

    /// The root node produced its result
    RootResult { msg: ChatMessage },

    /// Incremental model output; never persisted
    StreamDelta { id: NodeId, delta: String },

    /// Inbound message injected by a human observer
    UserMessage { content: String },
}

impl Event {
    /// Whether the event must be written to the durable log
    pub fn is_durable(&self) -> bool {
        match self {
            Event::StreamDelta { .. } => false,
            Event::Error { .. }
            | Event::NodeSpawn { .. }
            | Event::NodeStateChange { .. }
            | Event::TokensUsed { .. }
            | Event::MessageAppended { .. }
            | Event::RootResult { .. }
            | Event::UserMessage { .. } => true,
        }
    }

    /// The wire `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Error { .. } => "error",
            Event::NodeSpawn { .. } => "node_spawn",
            Event::NodeStateChange { .. } => "node_state_change",
            Event::TokensUsed { .. } => "tokens_used",
            Event::MessageAppended { .. } => "message_appended",
            Event::RootResult { .. } => "root_result",
            Event::StreamDelta { .. } => "stream_delta",
            Event::UserMessage { .. } => "user_message",
        }
    }

    /// Node the event is about, if any
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Event::NodeSpawn { id, .. }
            | Event::NodeStateChange { id, .. }
            | Event::TokensUsed { id, .. }
            | Event::MessageAppended { id, .. }
            | Event::StreamDelta { id, .. } => Some(id),
            Event::Error { .. } | Event::RootResult { .. } | Event::UserMessage { .. } => None,
        }
    }

    pub fn state_change(id: NodeId, state: RunState) -> Self {
        Event::NodeStateChange {
            id,
            state,
            reason: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Event::Error { msg: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_only_stream_deltas_are_transient() {
        let delta = Event::StreamDelta { id: "n".into(), delta: "a".into() };
        assert!(!delta.is_durable());
        assert!(Event::error("x").is_durable());
        assert!(Event::UserMessage { content: "hi".into() }.is_durable());
        assert!(Event::state_change("n".into(), RunState::Running).is_durable());
    }

    #[test]
    fn test_wire_format_is_internally_tagged() {
        let event = Event::NodeStateChange {
            id: "root".into(),
            state: RunState::WaitingOnChildren,
            reason: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "node_state_change", "id": "root", "state": "waiting_on_children"})
        );
        assert_eq!(value["type"], event.kind());
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let events = vec![
            Event::error("e"),
            Event::NodeSpawn {
                id: "a".into(),
                parent: None,
                always_included_messages: vec![],
                chat_history: vec![],
                tools: vec![],
            },
            Event::TokensUsed { id: "a".into(), prompt_tokens: 1, completion_tokens: 2 },
            Event::MessageAppended { id: "a".into(), msg: ChatMessage::user("x") },
            Event::RootResult { msg: ChatMessage::assistant("done") },
            Event::StreamDelta { id: "a".into(), delta: "d".into() },
            Event::UserMessage { content: "u".into() },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn test_parse_spawn_without_tools_field() {
        let line = r#"{"type":"node_spawn","id":"c1","parent":"root","always_included_messages":[],"chat_history":[]}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        assert_eq!(event.node_id(), Some(&NodeId::new("c1")));
    }
}
