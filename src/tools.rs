//! Tool boundary
//!
//! Tool implementations live outside this crate. A [`Toolset`] exposes one or
//! more functions; a [`ToolConfig`] says how a toolset is injected into nodes
//! and which keyword arguments accompany every invocation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::WarrenError;
use crate::message::ChatMessage;

/// Name of the function through which nodes delegate
pub const DELEGATE_FUNCTION: &str = "delegate";

/// Description of a callable function as shown to the completion engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A function call requested by the completion engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Shorthand for a `delegate` call with the given instructions
    pub fn delegate(id: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self::new(
            id,
            DELEGATE_FUNCTION,
            serde_json::json!({ "instructions": instructions.into() }),
        )
    }

    pub fn is_delegation(&self) -> bool {
        self.name == DELEGATE_FUNCTION
    }

    /// The `instructions` argument of a delegate call
    pub fn instructions(&self) -> Option<&str> {
        self.arguments.get("instructions").and_then(Value::as_str)
    }
}

/// An external capability set (web browsing, search, ...)
#[async_trait]
pub trait Toolset: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Functions this toolset provides
    fn functions(&self) -> Vec<ToolSpec>;

    /// Run one call; `kwargs` are the configured invocation arguments
    async fn invoke(&self, call: &ToolInvocation, kwargs: &Value) -> anyhow::Result<String>;
}

/// How a toolset is offered to nodes
#[derive(Clone)]
pub struct ToolConfig {
    pub toolset: Arc<dyn Toolset>,
    /// Offer to every non-root node, not only leaves
    pub always_include: bool,
    pub kwargs: Value,
}

impl ToolConfig {
    pub fn new(toolset: Arc<dyn Toolset>) -> Self {
        Self {
            toolset,
            always_include: false,
            kwargs: Value::Null,
        }
    }

    pub fn always_include(mut self, always: bool) -> Self {
        self.always_include = always;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Value) -> Self {
        self.kwargs = kwargs;
        self
    }
}

impl std::fmt::Debug for ToolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolConfig")
            .field("toolset", &self.toolset.name())
            .field("always_include", &self.always_include)
            .field("kwargs", &self.kwargs)
            .finish()
    }
}

/// Where a node sits, for deciding which tools it receives
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub is_root: bool,
    /// The node cannot delegate further
    pub is_leaf: bool,
    pub root_has_tools: bool,
}

/// All configured toolsets of a session, indexed by function name
#[derive(Default)]
pub struct ToolRegistry {
    configs: Vec<ToolConfig>,
    by_function: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry, rejecting reserved or duplicate function names
    pub fn from_configs(configs: Vec<ToolConfig>) -> Result<Self, WarrenError> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(config)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, config: ToolConfig) -> Result<(), WarrenError> {
        let index = self.configs.len();
        for spec in config.toolset.functions() {
            if spec.name == DELEGATE_FUNCTION {
                return Err(WarrenError::Configuration(format!(
                    "toolset {} uses the reserved function name {}",
                    config.toolset.name(),
                    DELEGATE_FUNCTION
                )));
            }
            if self.by_function.contains_key(&spec.name) {
                return Err(WarrenError::Configuration(format!(
                    "duplicate tool function: {}",
                    spec.name
                )));
            }
            self.by_function.insert(spec.name, index);
        }
        debug!(toolset = config.toolset.name(), "Registered toolset");
        self.configs.push(config);
        Ok(())
    }

    /// Function specs injected into a node at spawn time
    pub fn available_for(&self, placement: Placement) -> Vec<ToolSpec> {
        if placement.is_root && !placement.root_has_tools {
            return Vec::new();
        }
        self.configs
            .iter()
            .filter(|c| c.always_include || placement.is_leaf)
            .flat_map(|c| c.toolset.functions())
            .collect()
    }

    /// Spec of one registered function
    pub fn spec(&self, function: &str) -> Option<ToolSpec> {
        let index = *self.by_function.get(function)?;
        self.configs[index]
            .toolset
            .functions()
            .into_iter()
            .find(|spec| spec.name == function)
    }

    /// Run a call and turn the outcome into a tool message
    pub async fn invoke(&self, call: &ToolInvocation) -> ChatMessage {
        let Some(config) = self.by_function.get(&call.name).map(|&i| &self.configs[i]) else {
            warn!(function = %call.name, "Call to unknown tool function");
            return ChatMessage::tool_error(&call.id, format!("unknown function: {}", call.name));
        };

        match config.toolset.invoke(call, &config.kwargs).await {
            Ok(output) => ChatMessage::tool_result(&call.id, output),
            Err(e) => {
                warn!(function = %call.name, error = %e, "Tool invocation failed");
                ChatMessage::tool_error(&call.id, format!("{}: {}", call.name, e))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo {
        function: &'static str,
    }

    #[async_trait]
    impl Toolset for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn functions(&self) -> Vec<ToolSpec> {
            vec![ToolSpec::new(self.function, "echo input", json!({"type": "object"}))]
        }

        async fn invoke(&self, call: &ToolInvocation, kwargs: &Value) -> anyhow::Result<String> {
            if call.arguments.get("fail").is_some() {
                anyhow::bail!("requested failure");
            }
            Ok(format!("{}|{}", call.arguments, kwargs))
        }
    }

    fn echo(function: &'static str) -> Arc<dyn Toolset> {
        Arc::new(Echo { function })
    }

    #[test]
    fn test_reserved_name_rejected() {
        let result = ToolRegistry::from_configs(vec![ToolConfig::new(echo(DELEGATE_FUNCTION))]);
        assert!(matches!(result, Err(WarrenError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let result = ToolRegistry::from_configs(vec![
            ToolConfig::new(echo("search")),
            ToolConfig::new(echo("search")),
        ]);
        assert!(matches!(result, Err(WarrenError::Configuration(_))));
    }

    #[test]
    fn test_placement_filtering() {
        let registry = ToolRegistry::from_configs(vec![
            ToolConfig::new(echo("always")).always_include(true),
            ToolConfig::new(echo("leaf_only")),
        ])
        .unwrap();

        let names = |p| -> Vec<String> {
            registry.available_for(p).into_iter().map(|s| s.name).collect()
        };

        let root = Placement { is_root: true, is_leaf: false, root_has_tools: false };
        assert!(names(root).is_empty());

        let root_fc = Placement { root_has_tools: true, ..root };
        assert_eq!(names(root_fc), vec!["always"]);

        let middle = Placement { is_root: false, is_leaf: false, root_has_tools: false };
        assert_eq!(names(middle), vec!["always"]);

        let leaf = Placement { is_leaf: true, ..middle };
        assert_eq!(names(leaf), vec!["always", "leaf_only"]);
    }

    #[tokio::test]
    async fn test_invoke_passes_kwargs() {
        let registry = ToolRegistry::from_configs(vec![
            ToolConfig::new(echo("search")).with_kwargs(json!({"client": "x"}))
        ])
        .unwrap();

        let msg = registry
            .invoke(&ToolInvocation::new("c1", "search", json!({"q": 1})))
            .await;
        assert!(!msg.is_error);
        assert_eq!(msg.tool_call_id.as_deref(), Some("c1"));
        assert!(msg.text().contains("\"client\":\"x\""));
    }

    #[tokio::test]
    async fn test_invoke_failures_become_error_messages() {
        let registry = ToolRegistry::from_configs(vec![ToolConfig::new(echo("search"))]).unwrap();

        let failed = registry
            .invoke(&ToolInvocation::new("c1", "search", json!({"fail": true})))
            .await;
        assert!(failed.is_error);

        let unknown = registry
            .invoke(&ToolInvocation::new("c2", "missing", Value::Null))
            .await;
        assert!(unknown.is_error);
    }

    #[test]
    fn test_delegate_invocation_arguments() {
        let call = ToolInvocation::delegate("d1", "find flights");
        assert!(call.is_delegation());
        assert_eq!(call.instructions(), Some("find flights"));
    }
}
