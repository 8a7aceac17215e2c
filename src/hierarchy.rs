//! Agent hierarchy management
//!
//! The tree is a flat table keyed by node id. Parent and child links are ids,
//! so the table alone owns every node.

use std::collections::BTreeMap;

use crate::agent::AgentNode;
use crate::ids::NodeId;

/// Owns every node of a session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentHierarchy {
    /// All nodes by id; ordered so that serialization is deterministic
    nodes: BTreeMap<NodeId, AgentNode>,
    /// Root node id
    root: Option<NodeId>,
}

impl AgentHierarchy {
    /// Create a new empty hierarchy
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored nodes whose links are already in place
    pub fn from_nodes(nodes: impl IntoIterator<Item = AgentNode>) -> Self {
        let mut hierarchy = Self::new();
        for node in nodes {
            if node.parent.is_none() {
                hierarchy.root = Some(node.id.clone());
            }
            hierarchy.nodes.insert(node.id.clone(), node);
        }
        hierarchy
    }

    /// Insert a node, replacing any node that had the same id
    ///
    /// Returns the replaced node.
    pub fn insert(&mut self, node: AgentNode) -> Option<AgentNode> {
        let id = node.id.clone();
        let parent = node.parent.clone();

        let previous = self.nodes.remove(&id);
        if let Some(old_parent) = previous.as_ref().and_then(|p| p.parent.as_ref()) {
            if parent.as_ref() != Some(old_parent) {
                if let Some(old) = self.nodes.get_mut(old_parent) {
                    old.children.retain(|c| c != &id);
                }
            }
        }

        match &parent {
            None => self.root = Some(id.clone()),
            Some(pid) => {
                if let Some(parent_node) = self.nodes.get_mut(pid) {
                    if !parent_node.children.contains(&id) {
                        parent_node.children.push(id.clone());
                    }
                }
            }
        }

        self.nodes.insert(id, node);
        previous
    }

    pub fn get(&self, id: &NodeId) -> Option<&AgentNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut AgentNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Get the root node id
    pub fn root(&self) -> Option<&NodeId> {
        self.root.as_ref()
    }

    /// Get parent of a node
    pub fn parent(&self, id: &NodeId) -> Option<&NodeId> {
        self.nodes.get(id).and_then(|n| n.parent.as_ref())
    }

    /// Get children of a node in spawn order
    pub fn children(&self, id: &NodeId) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    /// Get depth of a node in the tree (root is 0)
    pub fn depth(&self, id: &NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.parent(id);

        while let Some(pid) = current {
            depth += 1;
            // Guard against a cycle introduced by id reuse
            if depth > self.nodes.len() {
                break;
            }
            current = self.parent(pid);
        }

        depth
    }

    /// Ids of running or waiting nodes, shallowest first
    pub fn active_top_down(&self) -> Vec<NodeId> {
        let mut active: Vec<(usize, NodeId)> = self
            .nodes
            .values()
            .filter(|n| n.run_state.is_active())
            .map(|n| (self.depth(&n.id), n.id.clone()))
            .collect();
        active.sort();
        active.into_iter().map(|(_, id)| id).collect()
    }

    /// Nodes ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &AgentNode> {
        self.nodes.values()
    }

    /// Get total node count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if hierarchy is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
