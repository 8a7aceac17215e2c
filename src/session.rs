//! Session aggregate
//!
//! A [`Session`] is the fold of every durable event emitted so far. The live
//! orchestrator and log replay both go through [`Session::apply`], which is
//! what makes a replayed session identical to the live one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::AgentNode;
use crate::error::{Result, WarrenError};
use crate::event::Event;
use crate::hierarchy::AgentHierarchy;
use crate::ids::{NodeId, SessionId};
use crate::message::ChatRole;

/// Longest auto-generated title, in characters
const TITLE_MAX_CHARS: usize = 60;

/// The root aggregate of one delegation session
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// `None` until configured or derived from the first root task
    pub title: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub durable_event_count: u64,
    nodes: AgentHierarchy,
}

impl Session {
    pub fn new(id: SessionId, title: Option<String>) -> Self {
        Self {
            id,
            title,
            last_modified: Utc::now(),
            durable_event_count: 0,
            nodes: AgentHierarchy::new(),
        }
    }

    pub fn nodes(&self) -> &AgentHierarchy {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&AgentNode> {
        self.nodes.get(id)
    }

    pub fn root(&self) -> Option<&AgentNode> {
        self.nodes.root().and_then(|id| self.nodes.get(id))
    }

    /// Check an event against current state without applying it
    pub fn validate(&self, event: &Event) -> Result<()> {
        match event {
            Event::NodeStateChange { id, state, .. } => {
                let node = self
                    .nodes
                    .get(id)
                    .ok_or_else(|| WarrenError::NodeNotFound(id.clone()))?;
                if !node.run_state.can_transition_to(*state) {
                    return Err(WarrenError::InvalidTransition {
                        id: id.clone(),
                        from: node.run_state,
                        to: *state,
                    });
                }
            }
            Event::TokensUsed { id, .. } | Event::MessageAppended { id, .. } => {
                let node = self
                    .nodes
                    .get(id)
                    .ok_or_else(|| WarrenError::NodeNotFound(id.clone()))?;
                if node.run_state.is_terminal() {
                    return Err(WarrenError::NodeFinished(id.clone()));
                }
            }
            Event::NodeSpawn { parent: Some(pid), .. } => {
                if !self.nodes.contains(pid) {
                    return Err(WarrenError::NodeNotFound(pid.clone()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Fold one event into the session
    pub fn apply(&mut self, event: &Event) -> Result<()> {
        self.validate(event)?;

        match event {
            Event::NodeSpawn {
                id,
                parent,
                always_included_messages,
                chat_history,
                tools,
            } => {
                let node = AgentNode::new(
                    id.clone(),
                    parent.clone(),
                    always_included_messages.clone(),
                    chat_history.clone(),
                    tools.clone(),
                );
                if self.nodes.insert(node).is_some() {
                    debug!(node_id = %id, "Spawn replaced existing node");
                }
            }
            Event::NodeStateChange { id, state, reason } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.run_state = *state;
                    if reason.is_some() {
                        node.failure = reason.clone();
                    }
                }
            }
            Event::TokensUsed {
                id,
                prompt_tokens,
                completion_tokens,
            } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.token_usage.add(*prompt_tokens, *completion_tokens);
                }
            }
            Event::MessageAppended { id, msg } => {
                if self.title.is_none() && msg.role == ChatRole::User && self.nodes.parent(id).is_none() {
                    self.title = Some(derive_title(msg.text()));
                }
                if let Some(node) = self.nodes.get_mut(id) {
                    node.history.push(msg.clone());
                }
            }
            Event::Error { .. }
            | Event::RootResult { .. }
            | Event::StreamDelta { .. }
            | Event::UserMessage { .. } => {}
        }

        if event.is_durable() {
            self.durable_event_count += 1;
            self.last_modified = Utc::now();
        }
        Ok(())
    }

    /// Rebuild a session by folding events from empty state
    pub fn replay<'a>(
        id: SessionId,
        title: Option<String>,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> Result<Self> {
        let mut session = Self::new(id, title);
        for event in events {
            session.apply(event)?;
        }
        Ok(session)
    }

    /// Snapshot-shaped view with the given durable count
    pub fn to_snapshot(&self, durable_event_count: u64) -> Snapshot {
        Snapshot {
            session_id: self.id.clone(),
            title: self.title.clone(),
            last_modified: self.last_modified,
            durable_event_count,
            nodes: self.nodes.iter().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            id: snapshot.session_id,
            title: snapshot.title,
            last_modified: snapshot.last_modified,
            durable_event_count: snapshot.durable_event_count,
            nodes: AgentHierarchy::from_nodes(snapshot.nodes),
        }
    }
}

/// Point-in-time serialization of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub session_id: SessionId,
    pub title: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub durable_event_count: u64,
    pub nodes: Vec<AgentNode>,
}

fn derive_title(task: &str) -> String {
    let first_line = task.lines().next().unwrap_or_default().trim();
    let mut title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    if first_line.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RunState;
    use crate::message::ChatMessage;

    fn spawn(id: &str, parent: Option<&str>) -> Event {
        Event::NodeSpawn {
            id: id.into(),
            parent: parent.map(NodeId::from),
            always_included_messages: vec![ChatMessage::system("sys")],
            chat_history: vec![],
            tools: vec![],
        }
    }

    fn create_test_session() -> Session {
        Session::new(SessionId::new("s1"), None)
    }

    #[test]
    fn test_session_creation() {
        let session = create_test_session();
        assert!(session.nodes().is_empty());
        assert_eq!(session.durable_event_count, 0);
    }

    #[test]
    fn test_apply_builds_tree() {
        let mut session = create_test_session();
        session.apply(&spawn("root", None)).unwrap();
        session.apply(&spawn("c1", Some("root"))).unwrap();

        assert_eq!(session.root().map(|n| n.id.as_str()), Some("root"));
        assert_eq!(session.nodes().children(&"root".into()), &[NodeId::from("c1")]);
        assert_eq!(session.durable_event_count, 2);
    }

    #[test]
    fn test_spawn_under_unknown_parent_rejected() {
        let mut session = create_test_session();
        let result = session.apply(&spawn("c1", Some("ghost")));
        assert!(matches!(result, Err(WarrenError::NodeNotFound(_))));
        assert_eq!(session.durable_event_count, 0);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut session = create_test_session();
        session.apply(&spawn("root", None)).unwrap();

        let result = session.apply(&Event::state_change("root".into(), RunState::Completed));
        assert!(matches!(result, Err(WarrenError::InvalidTransition { .. })));
        assert_eq!(session.node(&"root".into()).unwrap().run_state, RunState::Idle);
    }

    #[test]
    fn test_failure_reason_recorded() {
        let mut session = create_test_session();
        session.apply(&spawn("root", None)).unwrap();
        session.apply(&Event::state_change("root".into(), RunState::Running)).unwrap();
        session
            .apply(&Event::NodeStateChange {
                id: "root".into(),
                state: RunState::Failed,
                reason: Some("cancelled".into()),
            })
            .unwrap();

        let root = session.root().unwrap();
        assert_eq!(root.run_state, RunState::Failed);
        assert_eq!(root.failure.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_finished_node_rejects_late_work() {
        let mut session = create_test_session();
        session.apply(&spawn("root", None)).unwrap();
        session.apply(&Event::state_change("root".into(), RunState::Running)).unwrap();
        session.apply(&Event::state_change("root".into(), RunState::Failed)).unwrap();

        let late = Event::MessageAppended { id: "root".into(), msg: ChatMessage::tool_result("c1", "late") };
        assert!(matches!(session.apply(&late), Err(WarrenError::NodeFinished(_))));
        let tokens = Event::TokensUsed { id: "root".into(), prompt_tokens: 1, completion_tokens: 1 };
        assert!(matches!(session.apply(&tokens), Err(WarrenError::NodeFinished(_))));

        let root = session.root().unwrap();
        assert!(root.history.is_empty());
        assert_eq!(root.token_usage.total(), 0);
        assert_eq!(session.durable_event_count, 3);
    }

    #[test]
    fn test_messages_and_tokens_accumulate() {
        let mut session = create_test_session();
        session.apply(&spawn("root", None)).unwrap();
        session
            .apply(&Event::MessageAppended { id: "root".into(), msg: ChatMessage::user("plan a trip") })
            .unwrap();
        session
            .apply(&Event::TokensUsed { id: "root".into(), prompt_tokens: 7, completion_tokens: 3 })
            .unwrap();
        session
            .apply(&Event::TokensUsed { id: "root".into(), prompt_tokens: 1, completion_tokens: 1 })
            .unwrap();

        let root = session.root().unwrap();
        assert_eq!(root.history.len(), 1);
        assert_eq!(root.token_usage.total(), 12);
    }

    #[test]
    fn test_title_derived_from_first_root_message() {
        let mut session = create_test_session();
        session.apply(&spawn("root", None)).unwrap();
        session.apply(&spawn("c1", Some("root"))).unwrap();
        session
            .apply(&Event::MessageAppended { id: "c1".into(), msg: ChatMessage::user("child task") })
            .unwrap();
        assert!(session.title.is_none());

        let long_task = format!("{}\nsecond line", "x".repeat(80));
        session
            .apply(&Event::MessageAppended { id: "root".into(), msg: ChatMessage::user(long_task) })
            .unwrap();
        session
            .apply(&Event::MessageAppended { id: "root".into(), msg: ChatMessage::user("later") })
            .unwrap();

        let title = session.title.as_deref().unwrap();
        assert!(title.starts_with("xxxx"));
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }

    #[test]
    fn test_stream_delta_not_counted() {
        let mut session = create_test_session();
        session.apply(&spawn("root", None)).unwrap();
        session
            .apply(&Event::StreamDelta { id: "root".into(), delta: "he".into() })
            .unwrap();
        assert_eq!(session.durable_event_count, 1);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_tree() {
        let mut session = create_test_session();
        session.apply(&spawn("root", None)).unwrap();
        session.apply(&spawn("c1", Some("root"))).unwrap();

        let snapshot = session.to_snapshot(session.durable_event_count);
        let restored = Session::from_snapshot(snapshot.clone());

        assert_eq!(restored.to_snapshot(2), snapshot);
        assert_eq!(restored.nodes(), session.nodes());
    }
}
