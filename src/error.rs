//! Warren error types

use thiserror::Error;

use crate::agent::RunState;
use crate::ids::NodeId;

/// Errors that can occur in a delegation session
#[derive(Debug, Error)]
pub enum WarrenError {
    /// Completion engine call errored or timed out
    #[error("Engine failure: {0}")]
    EngineFailure(String),

    /// Top-down cancellation reached a node or blocked a spawn
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Snapshot and log disagree on the durable event count
    #[error("Log integrity: snapshot records {snapshot_count} events, log holds {log_count}")]
    LogIntegrity { snapshot_count: u64, log_count: u64 },

    /// Invalid session configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Work recorded for a node that already completed or failed
    #[error("Node already finished: {0}")]
    NodeFinished(NodeId),

    /// Run-state transition outside the state machine
    #[error("Invalid transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition { id: NodeId, from: RunState, to: RunState },

    /// Session already closed
    #[error("Session is closed")]
    SessionClosed,

    /// Control input arrived with no running root
    #[error("No active root node")]
    NoActiveRoot,

    /// Inbound control event of a type the boundary does not accept
    #[error("Unsupported control event: {0}")]
    UnsupportedControl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WarrenError>;
