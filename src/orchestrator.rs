//! Main orchestrator - drives the delegation tree of one session
//!
//! Every mutation goes through [`Inner::emit`]: the event is validated and
//! folded into the session, written to the log if durable, then fanned out
//! to live listeners, all under one lock so that every observer sees the
//! same order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::{FutureExt, Stream};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentNode, RunState};
use crate::bus::EventBus;
use crate::channel::{ControlEvent, Subscription};
use crate::config::SessionConfig;
use crate::delegation::{DelegationPolicy, Subtask};
use crate::engine::{Completion, CompletionEngine, CompletionRequest, DeltaSink};
use crate::error::{Result, WarrenError};
use crate::event::Event;
use crate::ids::{NodeId, SessionId, SubscriberId};
use crate::logger::{EventLogger, SnapshotWriter};
use crate::message::ChatMessage;
use crate::session::{Session, Snapshot};
use crate::tools::{Placement, ToolInvocation, ToolRegistry, ToolSpec, DELEGATE_FUNCTION};

/// How a node's run ended
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Completed(ChatMessage),
    Failed(String),
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Completed(_))
    }
}

/// Result of one delegated subtask
#[derive(Debug, Clone, PartialEq)]
pub struct ChildResult {
    pub node_id: NodeId,
    pub subtask: Subtask,
    pub outcome: NodeOutcome,
}

/// Coordinates one session's tree of agent nodes
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct SessionState {
    session: Session,
    bus: EventBus<EventLogger>,
}

struct Inner {
    config: SessionConfig,
    policy: Arc<dyn DelegationPolicy>,
    tools: ToolRegistry,
    root_engine: Arc<dyn CompletionEngine>,
    delegate_engine: Arc<dyn CompletionEngine>,
    state: Mutex<SessionState>,
    /// Runs started through `spawn`, awaited by `join`
    running: Mutex<HashMap<NodeId, JoinHandle<NodeOutcome>>>,
    /// Injected messages not yet seen by the root
    pending_input: Mutex<VecDeque<String>>,
    cancel: CancellationToken,
    queried: AtomicBool,
}

impl Orchestrator {
    /// Create an orchestrator that uses one engine for every node
    pub fn new(config: SessionConfig, engine: Arc<dyn CompletionEngine>) -> Result<Self> {
        Self::with_engines(config, engine.clone(), engine)
    }

    /// Create an orchestrator with separate root and delegate engines
    ///
    /// Fails with `Configuration` on an invalid config, before anything is
    /// written to disk.
    pub fn with_engines(
        config: SessionConfig,
        root_engine: Arc<dyn CompletionEngine>,
        delegate_engine: Arc<dyn CompletionEngine>,
    ) -> Result<Self> {
        let tools = config.validate()?;
        let policy = config.policy();

        let logger = EventLogger::open(
            config.session_id.clone(),
            &config.log_dir,
            config.clear_existing_log,
        )?;
        let session = if logger.count() == 0 {
            Session::new(config.session_id.clone(), config.title.clone())
        } else {
            EventLogger::load(&config.log_dir, config.session_id.clone(), config.title.clone())?
        };
        let already_ran = session.root().is_some();

        info!(
            session_id = %config.session_id,
            policy = policy.name(),
            tools = tools.len(),
            resumed = already_ran,
            "Session configured"
        );

        let bus = EventBus::new(logger, config.subscriber_buffer);
        Ok(Self {
            inner: Arc::new(Inner {
                policy,
                tools,
                root_engine,
                delegate_engine,
                state: Mutex::new(SessionState { session, bus }),
                running: Mutex::new(HashMap::new()),
                pending_input: Mutex::new(VecDeque::new()),
                cancel: CancellationToken::new(),
                queried: AtomicBool::new(already_ran),
                config,
            }),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.config.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Run a task from the root and stream every event it produces
    ///
    /// The stream ends once the root node has completed or failed. A session
    /// runs one query; later calls yield a single `Error` event.
    pub fn query(&self, task: impl Into<String>) -> impl Stream<Item = Event> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let task = task.into();

        async_stream::stream! {
            if inner.queried.swap(true, Ordering::SeqCst) {
                yield Event::error("this session has already run a query");
                return;
            }

            let (listener, mut rx) = inner.state.lock().bus.attach();
            let mut driver = tokio::spawn(Arc::clone(&inner).run_root(task));

            loop {
                let next = tokio::select! {
                    biased;
                    event = rx.recv() => event,
                    _ = &mut driver => None,
                };
                match next {
                    Some(event) => yield event,
                    None => break,
                }
            }
            while let Ok(event) = rx.try_recv() {
                yield event;
            }
            inner.state.lock().bus.unsubscribe(listener);
        }
    }

    /// Register a node and start running it in the background
    ///
    /// Without a parent the node becomes the root. Use [`join`](Self::join)
    /// to await its outcome.
    pub fn spawn(&self, parent_id: Option<&NodeId>, task: impl Into<String>) -> Result<NodeId> {
        let task = task.into();
        let id = match parent_id {
            Some(_) => NodeId::generate(),
            None => NodeId::root(),
        };
        self.inner.register(&id, parent_id)?;
        let handle = self.inner.start(id.clone(), task);
        self.inner.running.lock().insert(id.clone(), handle);
        Ok(id)
    }

    /// Await a node started with [`spawn`](Self::spawn)
    pub async fn join(&self, id: &NodeId) -> Option<NodeOutcome> {
        self.inner.join(id).await
    }

    /// Spawn one child of `parent_id` per subtask and wait for all of them
    ///
    /// Results come back in subtask order, whatever order the children
    /// finish in.
    #[instrument(skip(self, subtasks), fields(count = subtasks.len()))]
    pub async fn delegate(&self, parent_id: &NodeId, subtasks: Vec<Subtask>) -> Result<Vec<ChildResult>> {
        self.inner.delegate(parent_id, subtasks).await
    }

    /// Cancel every active node, top-down, and refuse further spawns
    pub fn cancel(&self, reason: &str) {
        self.inner.cancel(reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Register a live subscriber
    pub fn subscribe(&self) -> Subscription {
        self.inner.state.lock().bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.state.lock().bus.unsubscribe(id)
    }

    /// Inject a human message into the running root
    pub fn send_message(&self, content: impl Into<String>) -> Result<()> {
        self.inner.send_message(content.into())
    }

    pub fn handle_control(&self, control: ControlEvent) -> Result<()> {
        match control {
            ControlEvent::UserMessage { content } => self.send_message(content),
        }
    }

    /// Parse and handle a JSON control event from an observer
    pub fn handle_control_json(&self, raw: &str) -> Result<()> {
        self.handle_control(ControlEvent::from_json(raw)?)
    }

    /// Snapshot-shaped view of the current state, without writing it
    pub fn get_save_state(&self) -> Snapshot {
        let state = self.inner.state.lock();
        state.session.to_snapshot(state.bus.sink().count())
    }

    /// Current state of one node
    pub fn node(&self, id: &NodeId) -> Option<AgentNode> {
        self.inner.node(id)
    }

    /// Durable events logged so far, by type
    pub fn event_counts(&self) -> HashMap<String, u64> {
        self.inner.state.lock().bus.sink().counts_by_type().clone()
    }

    /// Cancel what is still running, write the final snapshot and release
    /// the log. A second call fails with `SessionClosed`.
    #[instrument(skip(self), fields(session_id = %self.inner.config.session_id))]
    pub fn close(&self) -> Result<()> {
        let has_active = !self.inner.state.lock().session.nodes().active_top_down().is_empty();
        if has_active {
            self.inner.cancel("session closed");
        }

        let mut state = self.inner.state.lock();
        let SessionState { session, bus } = &mut *state;
        bus.sink_mut().close(session)
    }
}

impl Inner {
    /// Validate, fold, persist and fan out one event
    fn emit(&self, event: Event) -> Result<()> {
        let mut state = self.state.lock();
        self.emit_locked(&mut state, event)
    }

    /// The event reaches the session only once the log has accepted it, so
    /// the in-memory state never runs ahead of the durable count.
    fn emit_locked(&self, state: &mut SessionState, event: Event) -> Result<()> {
        if state.bus.sink().is_closed() {
            return Err(WarrenError::SessionClosed);
        }
        state.session.validate(&event)?;

        let before = state.bus.sink().count();
        let delivered = state.bus.publish(&event)?;
        state.session.apply(&event)?;
        debug!(event_type = event.kind(), delivered, "Published event");

        let count = state.bus.sink().count();
        let interval = self.config.snapshot_interval;
        if interval > 0 && count > before && count % interval == 0 {
            let snapshot = state.session.to_snapshot(count);
            let writer = state.bus.sink().snapshot_writer();
            save_snapshot(writer, snapshot);
        }
        Ok(())
    }

    /// Move a node to `to`; returns false if it already reached a terminal
    /// state (for example through cancellation)
    fn transition(&self, id: &NodeId, to: RunState, reason: Option<String>) -> Result<bool> {
        let mut state = self.state.lock();
        let current = state
            .session
            .node(id)
            .map(|n| n.run_state)
            .ok_or_else(|| WarrenError::NodeNotFound(id.clone()))?;
        if current.is_terminal() {
            return Ok(false);
        }
        self.emit_locked(&mut state, Event::NodeStateChange { id: id.clone(), state: to, reason })?;
        Ok(true)
    }

    fn node(&self, id: &NodeId) -> Option<AgentNode> {
        self.state.lock().session.node(id).cloned()
    }

    /// Emit the spawn of a new (idle) node
    fn register(&self, id: &NodeId, parent: Option<&NodeId>) -> Result<()> {
        let mut state = self.state.lock();
        self.register_locked(&mut state, id, parent)
    }

    fn register_locked(&self, state: &mut SessionState, id: &NodeId, parent: Option<&NodeId>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(WarrenError::Cancelled("session cancelled; spawn refused".into()));
        }

        let depth = match parent {
            Some(pid) => {
                if !state.session.nodes().contains(pid) {
                    return Err(WarrenError::NodeNotFound(pid.clone()));
                }
                state.session.nodes().depth(pid) + 1
            }
            None => 0,
        };

        let is_root = parent.is_none();
        let can_delegate = self.policy.offers_delegation() && depth < self.config.max_delegation_depth;
        let mut tools: Vec<String> = self
            .tools
            .available_for(Placement {
                is_root,
                is_leaf: !can_delegate,
                root_has_tools: self.config.root_has_tools,
            })
            .into_iter()
            .map(|spec| spec.name)
            .collect();
        if can_delegate {
            tools.push(DELEGATE_FUNCTION.to_string());
        }

        let prompt = if is_root {
            &self.config.root_system_prompt
        } else {
            &self.config.delegate_system_prompt
        };

        self.emit_locked(
            state,
            Event::NodeSpawn {
                id: id.clone(),
                parent: parent.cloned(),
                always_included_messages: prompt.iter().cloned().map(ChatMessage::system).collect(),
                chat_history: Vec::new(),
                tools,
            },
        )?;

        info!(node_id = %id, parent = ?parent.map(NodeId::as_str), depth, "Spawned node");
        Ok(())
    }

    fn start(self: &Arc<Self>, id: NodeId, task: String) -> JoinHandle<NodeOutcome> {
        tokio::spawn(Arc::clone(self).run_node(id, task))
    }

    async fn join(&self, id: &NodeId) -> Option<NodeOutcome> {
        let handle = self.running.lock().remove(id)?;
        Some(handle.await.unwrap_or_else(|e| NodeOutcome::Failed(format!("node task aborted: {e}"))))
    }

    /// Run one node to completion or failure
    ///
    /// Boxed so that children can be spawned from inside a running node.
    fn run_node(self: Arc<Self>, id: NodeId, task: String) -> BoxFuture<'static, NodeOutcome> {
        async move {
            match self.drive(&id, task).await {
                Ok(answer) => {
                    info!(node_id = %id, "Node completed");
                    if id.is_root() {
                        if let Err(e) = self.emit(Event::RootResult { msg: answer.clone() }) {
                            warn!(error = %e, "Could not publish root result");
                        }
                    }
                    NodeOutcome::Completed(answer)
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.fail(&id, &reason);
                    NodeOutcome::Failed(reason)
                }
            }
        }
        .boxed()
    }

    fn fail(&self, id: &NodeId, reason: &str) {
        match self.transition(id, RunState::Failed, Some(reason.to_string())) {
            Ok(true) => warn!(node_id = %id, reason, "Node failed"),
            Ok(false) => debug!(node_id = %id, "Node already terminal"),
            Err(e) => error!(node_id = %id, error = %e, "Could not record node failure"),
        }
        if id.is_root() {
            if let Err(e) = self.emit(Event::error(format!("root failed: {reason}"))) {
                warn!(error = %e, "Could not publish root failure");
            }
        }
    }

    /// The node's execution loop; returns its final answer
    async fn drive(self: &Arc<Self>, id: &NodeId, task: String) -> Result<ChatMessage> {
        if !self.transition(id, RunState::Running, None)? {
            return Err(WarrenError::Cancelled("node stopped before it started".into()));
        }
        self.check_cancelled()?;
        self.emit(Event::MessageAppended { id: id.clone(), msg: ChatMessage::user(task) })?;

        let is_root = id.is_root();
        let engine = if is_root { &self.root_engine } else { &self.delegate_engine };

        for round in 0..self.config.max_rounds {
            self.check_cancelled()?;
            if is_root {
                self.drain_pending_input(id)?;
            }

            let node = self.node(id).ok_or_else(|| WarrenError::NodeNotFound(id.clone()))?;
            debug!(node_id = %id, round, "Calling engine");
            let completion = self.call_engine(engine, id, &node).await?;

            self.emit(Event::TokensUsed {
                id: id.clone(),
                prompt_tokens: completion.usage.prompt_tokens,
                completion_tokens: completion.usage.completion_tokens,
            })?;
            let message = completion.message;
            self.emit(Event::MessageAppended { id: id.clone(), msg: message.clone() })?;

            if !message.has_tool_calls() {
                if self.finish(id, is_root)? {
                    return Ok(message);
                }
                continue;
            }

            let results = self.run_calls(id, &node, &message.tool_calls).await?;
            // Calls that outlived a cancellation are discarded
            self.check_cancelled()?;
            for result in results {
                self.emit(Event::MessageAppended { id: id.clone(), msg: result })?;
            }
        }

        Err(WarrenError::EngineFailure(format!(
            "no final answer after {} rounds",
            self.config.max_rounds
        )))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(WarrenError::Cancelled("session cancelled".into()))
        } else {
            Ok(())
        }
    }

    /// Mark the node completed, unless the root has unread input
    fn finish(&self, id: &NodeId, is_root: bool) -> Result<bool> {
        let mut state = self.state.lock();
        if is_root && !self.pending_input.lock().is_empty() {
            return Ok(false);
        }
        let current = state.session.node(id).map(|n| n.run_state);
        if current.map_or(true, RunState::is_terminal) {
            return Err(WarrenError::Cancelled("node stopped before completing".into()));
        }
        self.emit_locked(&mut state, Event::state_change(id.clone(), RunState::Completed))?;
        Ok(true)
    }

    fn drain_pending_input(&self, id: &NodeId) -> Result<()> {
        let pending: Vec<String> = self.pending_input.lock().drain(..).collect();
        for content in pending {
            self.emit(Event::MessageAppended { id: id.clone(), msg: ChatMessage::user(content) })?;
        }
        Ok(())
    }

    fn tool_specs(&self, names: &[String]) -> Vec<ToolSpec> {
        names
            .iter()
            .filter_map(|name| {
                if name == DELEGATE_FUNCTION {
                    Some(self.policy.tool_spec())
                } else {
                    self.tools.spec(name)
                }
            })
            .collect()
    }

    async fn call_engine(
        self: &Arc<Self>,
        engine: &Arc<dyn CompletionEngine>,
        id: &NodeId,
        node: &AgentNode,
    ) -> Result<Completion> {
        let publisher = Arc::clone(self);
        let request = CompletionRequest {
            node_id: id.clone(),
            messages: node.context(),
            tools: self.tool_specs(&node.tools),
            deltas: DeltaSink::new(
                id.clone(),
                Arc::new(move |event: Event| {
                    if let Err(e) = publisher.emit(event) {
                        debug!(error = %e, "Dropped stream delta");
                    }
                }),
            ),
            cancel: self.cancel.child_token(),
        };

        let call = async {
            let result = match self.config.engine_timeout {
                Some(limit) => tokio::time::timeout(limit, engine.complete(request))
                    .await
                    .map_err(|_| WarrenError::EngineFailure(format!("engine call timed out after {limit:?}")))?,
                None => engine.complete(request).await,
            };
            result.map_err(|e| WarrenError::EngineFailure(format!("{e:#}")))
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WarrenError::Cancelled("session cancelled".into())),
            result = call => result,
        }
    }

    /// Execute the calls of one assistant turn; results in call order
    async fn run_calls(
        self: &Arc<Self>,
        id: &NodeId,
        node: &AgentNode,
        calls: &[ToolInvocation],
    ) -> Result<Vec<ChatMessage>> {
        let can_delegate = node.tools.iter().any(|t| t == DELEGATE_FUNCTION);
        let mut results: Vec<Option<ChatMessage>> = vec![None; calls.len()];
        let mut batch: Vec<(usize, usize)> = Vec::new();
        let mut subtasks = Vec::new();

        for (i, call) in calls.iter().enumerate() {
            if !call.is_delegation() {
                results[i] = Some(self.tools.invoke(call).await);
                continue;
            }
            if !can_delegate {
                results[i] = Some(ChatMessage::tool_error(&call.id, "delegation is not available here"));
                continue;
            }
            let decided = match call.instructions() {
                Some(instructions) => self.policy.decide(node, instructions),
                None => Vec::new(),
            };
            if decided.is_empty() {
                results[i] = Some(ChatMessage::tool_error(&call.id, "nothing to delegate"));
                continue;
            }
            batch.push((i, decided.len()));
            subtasks.extend(decided);
        }

        if !subtasks.is_empty() {
            let mut children = self.delegate(id, subtasks).await?.into_iter();
            for (i, n) in batch {
                let chunk: Vec<ChildResult> = children.by_ref().take(n).collect();
                results[i] = Some(fold_child_results(&calls[i].id, &chunk));
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    async fn delegate(self: &Arc<Self>, parent: &NodeId, subtasks: Vec<Subtask>) -> Result<Vec<ChildResult>> {
        if subtasks.is_empty() {
            return Ok(Vec::new());
        }

        // Children and the parent's wait are recorded together or not at all
        let ids = {
            let mut state = self.state.lock();
            self.check_cancelled()?;
            let current = state
                .session
                .node(parent)
                .map(|n| n.run_state)
                .ok_or_else(|| WarrenError::NodeNotFound(parent.clone()))?;
            if current.is_terminal() {
                return Err(WarrenError::Cancelled("parent stopped before delegating".into()));
            }
            if current != RunState::Running {
                return Err(WarrenError::InvalidTransition {
                    id: parent.clone(),
                    from: current,
                    to: RunState::WaitingOnChildren,
                });
            }

            let mut ids = Vec::with_capacity(subtasks.len());
            for _ in &subtasks {
                let child = NodeId::generate();
                self.register_locked(&mut state, &child, Some(parent))?;
                ids.push(child);
            }
            self.emit_locked(&mut state, Event::state_change(parent.clone(), RunState::WaitingOnChildren))?;
            ids
        };

        let handles: Vec<_> = ids
            .iter()
            .zip(&subtasks)
            .map(|(child, subtask)| self.start(child.clone(), subtask.instructions.clone()))
            .collect();
        let outcomes = join_all(handles).await;

        if !self.transition(parent, RunState::Running, None)? {
            return Err(WarrenError::Cancelled("cancelled while waiting on children".into()));
        }

        Ok(ids
            .into_iter()
            .zip(subtasks)
            .zip(outcomes)
            .map(|((node_id, subtask), outcome)| ChildResult {
                node_id,
                subtask,
                outcome: outcome.unwrap_or_else(|e| NodeOutcome::Failed(format!("node task aborted: {e}"))),
            })
            .collect())
    }

    fn cancel(&self, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        warn!(reason, "Cancelling session");

        let mut state = self.state.lock();
        let active = state.session.nodes().active_top_down();
        for id in active {
            let event = Event::NodeStateChange {
                id: id.clone(),
                state: RunState::Failed,
                reason: Some(format!("cancelled: {reason}")),
            };
            if let Err(e) = self.emit_locked(&mut state, event) {
                error!(node_id = %id, error = %e, "Could not record cancellation");
            }
        }
    }

    fn send_message(&self, content: String) -> Result<()> {
        let mut state = self.state.lock();
        let root_running = state
            .session
            .root()
            .map_or(false, |root| !root.run_state.is_terminal());
        if !root_running {
            return Err(WarrenError::NoActiveRoot);
        }
        self.pending_input.lock().push_back(content.clone());
        self.emit_locked(&mut state, Event::UserMessage { content })
    }

    /// Run the root to its end, enforcing the session timeout
    async fn run_root(self: Arc<Self>, task: String) {
        let root = NodeId::root();
        if let Err(e) = self.register(&root, None) {
            error!(error = %e, "Could not spawn root");
            if let Err(e) = self.emit(Event::error(format!("could not start session: {e}"))) {
                warn!(error = %e, "Could not publish start failure");
            }
            return;
        }
        let mut handle = self.start(root.clone(), task);

        let finished = match self.config.session_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.cancel(&format!("session timed out after {limit:?}"));
                    handle.await
                }
            },
            None => handle.await,
        };
        if let Err(e) = finished {
            error!(error = %e, "Root task aborted");
            self.fail(&root, "root task aborted");
        }

        let leftover = self.state.lock().session.nodes().active_top_down();
        if !leftover.is_empty() {
            self.cancel("root finished");
        }
    }
}

/// Write a snapshot without holding the session lock
fn save_snapshot(writer: Arc<SnapshotWriter>, snapshot: Snapshot) {
    let write = move || {
        if let Err(e) = writer.write(&snapshot) {
            warn!(error = %e, "Periodic snapshot failed");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(write);
        }
        Err(_) => write(),
    }
}

/// Turn the children of one delegate call into the call's tool message
fn fold_child_results(call_id: &str, results: &[ChildResult]) -> ChatMessage {
    let render = |r: &ChildResult| match &r.outcome {
        NodeOutcome::Completed(msg) => msg.text().to_string(),
        NodeOutcome::Failed(reason) => format!("ERROR: helper {} failed: {}", r.node_id, reason),
    };

    let text = if let [single] = results {
        render(single)
    } else {
        results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("[helper {}]\n{}", i + 1, render(r)))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    if results.iter().all(|r| !r.outcome.is_success()) {
        ChatMessage::tool_error(call_id, text)
    } else {
        ChatMessage::tool_result(call_id, text)
    }
}
