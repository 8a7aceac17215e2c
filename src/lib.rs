//! # Warren
//!
//! Recursive agent delegation with an event-sourced session log.
//!
//! A root agent node works on a task with a completion engine. Whenever the
//! engine asks to `delegate`, the orchestrator spawns child nodes that run
//! concurrently with the same machinery, waits for all of them and hands
//! their results back to the parent in order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            ORCHESTRATOR                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                │
//! │  │ Node Runner  │  │  Delegation  │  │ Tool Registry│                │
//! │  └──────┬───────┘  └──────────────┘  └──────────────┘                │
//! └─────────┼────────────────────────────────────────────────────────────┘
//!           │ Event
//!           ▼
//!   ┌──────────────┐  apply   ┌──────────────┐
//!   │   EventBus   │ ───────▶ │   Session    │ ◀── replay / snapshot
//!   └──┬────────┬──┘          └──────────────┘
//!      │        │
//!      ▼        ▼
//! ┌──────────┐ ┌─────────────────────┐
//! │  Logger  │ │ Subscribers / query │
//! │ (.jsonl) │ │       stream        │
//! └──────────┘ └─────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Node**: one agent with its own context, history and tools
//! - **Event**: the only way state changes; durable events are logged
//! - **Session**: the fold of every durable event, rebuildable from the log
//! - **Policy**: decides how a delegation request becomes subtasks

pub mod agent;
pub mod bus;
pub mod channel;
pub mod config;
pub mod delegation;
pub mod engine;
pub mod error;
pub mod event;
pub mod hierarchy;
pub mod ids;
pub mod logger;
pub mod message;
pub mod orchestrator;
pub mod session;
pub mod tools;

pub use agent::{AgentNode, RunState};
pub use bus::{EventBus, EventSink};
pub use channel::{ControlEvent, Subscription};
pub use config::SessionConfig;
pub use delegation::{DelegateFanOut, DelegateOne, DelegationPolicy, DelegationScheme, NoDelegation, Subtask};
pub use engine::{Completion, CompletionEngine, CompletionRequest, DeltaSink};
pub use error::{Result, WarrenError};
pub use event::Event;
pub use hierarchy::AgentHierarchy;
pub use ids::{NodeId, SessionId, SubscriberId};
pub use logger::{EventLogger, SnapshotWriter};
pub use message::{ChatMessage, ChatRole, TokenUsage};
pub use orchestrator::{ChildResult, NodeOutcome, Orchestrator};
pub use session::{Session, Snapshot};
pub use tools::{ToolConfig, ToolInvocation, ToolSpec, Toolset};
