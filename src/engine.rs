//! Completion engine boundary
//!
//! The engine is the node's "brain": given the node's context and the
//! functions it may call, it answers with an assistant message that either
//! carries a final answer or requests function calls. It reports token usage
//! for every call and observes the cancellation token it is handed.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::event::Event;
use crate::ids::NodeId;
use crate::message::{ChatMessage, TokenUsage};
use crate::tools::ToolSpec;

/// Everything the engine needs for one call
pub struct CompletionRequest {
    pub node_id: NodeId,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    /// Sink for incremental output
    pub deltas: DeltaSink,
    /// Cancelled when the session is cancelled
    pub cancel: CancellationToken,
}

/// Result of one engine call
#[derive(Debug, Clone)]
pub struct Completion {
    pub message: ChatMessage,
    pub usage: TokenUsage,
}

impl Completion {
    pub fn new(message: ChatMessage, usage: TokenUsage) -> Self {
        Self { message, usage }
    }
}

#[async_trait]
pub trait CompletionEngine: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<Completion>;
}

/// Publishes non-durable streaming deltas for one node
#[derive(Clone)]
pub struct DeltaSink {
    node_id: NodeId,
    publish: Arc<dyn Fn(Event) + Send + Sync>,
}

impl DeltaSink {
    pub(crate) fn new(node_id: NodeId, publish: Arc<dyn Fn(Event) + Send + Sync>) -> Self {
        Self { node_id, publish }
    }

    pub fn push(&self, delta: impl Into<String>) {
        (self.publish)(Event::StreamDelta {
            id: self.node_id.clone(),
            delta: delta.into(),
        });
    }
}

impl fmt::Debug for DeltaSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaSink").field("node_id", &self.node_id).finish()
    }
}
