//! Live streaming boundary
//!
//! Observers attach with a [`Subscription`] and receive every event emitted
//! after they attach, durable or not. History is only available from the
//! durable log. The inbound direction accepts a single control event.

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::WarrenError;
use crate::event::Event;
use crate::ids::SubscriberId;

/// Receiving end of a live subscription
///
/// The channel is bounded; if the subscriber falls behind by more than the
/// configured buffer it is dropped from fan-out and `recv` returns `None`
/// once the buffered events are drained.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriberId, rx: mpsc::Receiver<Event>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once unsubscribed or dropped
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Inbound control events accepted from observers
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Append a message to the root node's pending input
    UserMessage { content: String },
}

impl ControlEvent {
    /// Parse a JSON control message, rejecting anything but accepted types
    pub fn from_json(raw: &str) -> Result<Self, WarrenError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("<missing>")
            .to_string();
        serde_json::from_value(value).map_err(|_| WarrenError::UnsupportedControl(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_message() {
        let event = ControlEvent::from_json(r#"{"type":"user_message","content":"go left"}"#).unwrap();
        assert_eq!(event, ControlEvent::UserMessage { content: "go left".into() });
    }

    #[test]
    fn test_reject_other_event_types() {
        let result = ControlEvent::from_json(r#"{"type":"node_spawn","id":"x"}"#);
        assert!(matches!(result, Err(WarrenError::UnsupportedControl(kind)) if kind == "node_spawn"));

        let missing = ControlEvent::from_json(r#"{"content":"x"}"#);
        assert!(matches!(missing, Err(WarrenError::UnsupportedControl(_))));
    }

    #[test]
    fn test_reject_malformed_json() {
        assert!(matches!(
            ControlEvent::from_json("not json"),
            Err(WarrenError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_receives() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(SubscriberId::new(1), rx);
        tx.send(Event::error("x")).await.unwrap();
        drop(tx);

        assert_eq!(sub.recv().await, Some(Event::error("x")));
        assert_eq!(sub.recv().await, None);
    }
}
