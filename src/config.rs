//! Session configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::delegation::{DelegationPolicy, DelegationScheme};
use crate::error::WarrenError;
use crate::ids::SessionId;
use crate::tools::{ToolConfig, ToolRegistry};

pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 8;
pub const DEFAULT_MAX_ROUNDS: usize = 32;
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 32;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Everything needed to start one session
#[derive(Clone)]
pub struct SessionConfig {
    pub session_id: SessionId,
    /// `None` derives the title from the first root task
    pub title: Option<String>,
    /// Directory holding this session's log and snapshot
    pub log_dir: PathBuf,
    pub clear_existing_log: bool,
    pub root_system_prompt: Option<String>,
    pub delegate_system_prompt: Option<String>,
    /// Give the root the configured tools, not only delegation
    pub root_has_tools: bool,
    pub delegation: DelegationScheme,
    /// Overrides `delegation` with a custom policy
    pub policy: Option<Arc<dyn DelegationPolicy>>,
    /// Nodes at this depth can no longer delegate
    pub max_delegation_depth: usize,
    /// Engine calls allowed per node
    pub max_rounds: usize,
    pub engine_timeout: Option<Duration>,
    pub session_timeout: Option<Duration>,
    /// Durable events between periodic snapshots; 0 snapshots only on close
    pub snapshot_interval: u64,
    pub subscriber_buffer: usize,
    pub tools: Vec<ToolConfig>,
}

impl SessionConfig {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: SessionId::generate(),
            title: None,
            log_dir: log_dir.into(),
            clear_existing_log: false,
            root_system_prompt: None,
            delegate_system_prompt: None,
            root_has_tools: false,
            delegation: DelegationScheme::default(),
            policy: None,
            max_delegation_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            max_rounds: DEFAULT_MAX_ROUNDS,
            engine_timeout: None,
            session_timeout: None,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            tools: Vec::new(),
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = SessionId::new(id);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn clear_existing_log(mut self, clear: bool) -> Self {
        self.clear_existing_log = clear;
        self
    }

    pub fn with_root_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.root_system_prompt = Some(prompt.into());
        self
    }

    pub fn with_delegate_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.delegate_system_prompt = Some(prompt.into());
        self
    }

    pub fn root_has_tools(mut self, enabled: bool) -> Self {
        self.root_has_tools = enabled;
        self
    }

    pub fn with_delegation(mut self, scheme: DelegationScheme) -> Self {
        self.delegation = scheme;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn DelegationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_max_delegation_depth(mut self, depth: usize) -> Self {
        self.max_delegation_depth = depth;
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine_timeout = Some(timeout);
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer;
        self
    }

    pub fn with_tool(mut self, tool: ToolConfig) -> Self {
        self.tools.push(tool);
        self
    }

    /// The active delegation policy
    pub fn policy(&self) -> Arc<dyn DelegationPolicy> {
        self.policy.clone().unwrap_or_else(|| self.delegation.build())
    }

    /// Check the configuration and build the tool registry
    pub fn validate(&self) -> Result<ToolRegistry, WarrenError> {
        let id = self.session_id.as_str();
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(WarrenError::Configuration(format!("invalid session id: {id:?}")));
        }
        if self.subscriber_buffer == 0 {
            return Err(WarrenError::Configuration("subscriber_buffer must be > 0".into()));
        }
        if self.max_rounds == 0 {
            return Err(WarrenError::Configuration("max_rounds must be > 0".into()));
        }
        if self.policy.is_none() {
            self.delegation.validate()?;
        }
        ToolRegistry::from_configs(self.tools.clone())
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("session_id", &self.session_id)
            .field("title", &self.title)
            .field("log_dir", &self.log_dir)
            .field("clear_existing_log", &self.clear_existing_log)
            .field("root_has_tools", &self.root_has_tools)
            .field("delegation", &self.delegation)
            .field("policy", &self.policy.as_ref().map(|p| p.name().to_string()))
            .field("max_delegation_depth", &self.max_delegation_depth)
            .field("max_rounds", &self.max_rounds)
            .field("engine_timeout", &self.engine_timeout)
            .field("session_timeout", &self.session_timeout)
            .field("snapshot_interval", &self.snapshot_interval)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}
