//! Forest — the registry of all conversation trees and nodes.
//!
//! Lookups take the read guard and are concurrent; creation and deletion take
//! the write guard briefly. A deleted node's id is never observable again.

use crate::node::Node;
use canopy_core::{FollowUp, ForestError, NodeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registry of every live node, the set of tree roots, and the active-node
/// handle used by clients that want a session-like model.
pub struct Forest {
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
    roots: RwLock<Vec<NodeId>>,
    active: RwLock<Option<NodeId>>,
    /// Buffer capacity applied to every node this forest creates.
    max_turns: usize,
}

impl Forest {
    pub fn new(max_turns: usize) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            roots: RwLock::new(Vec::new()),
            active: RwLock::new(None),
            max_turns,
        }
    }

    /// Create a new root-level conversation tree.
    pub async fn create_root(&self, title: Option<String>) -> Arc<Node> {
        let node = Arc::new(Node::new(title, None, None, self.max_turns));
        let id = node.id().clone();

        self.nodes.write().await.insert(id.clone(), node.clone());
        self.roots.write().await.push(id.clone());
        *self.active.write().await = Some(id.clone());

        info!(node_id = %id, "Created root conversation");
        node
    }

    /// Create a child node under an existing parent.
    ///
    /// The child inherits NO buffer content and NO summary; the optional
    /// follow-up record is the only link back to the parent.
    pub async fn create_child(
        &self,
        parent_id: &NodeId,
        title: Option<String>,
        follow_up: Option<FollowUp>,
    ) -> Result<Arc<Node>, ForestError> {
        let parent = {
            let nodes = self.nodes.read().await;
            nodes
                .get(parent_id)
                .cloned()
                .ok_or_else(|| ForestError::ParentNotFound(parent_id.to_string()))?
        };

        let node = Arc::new(Node::new(
            title,
            Some(parent_id.clone()),
            follow_up,
            self.max_turns,
        ));
        let id = node.id().clone();

        self.nodes.write().await.insert(id.clone(), node.clone());
        parent.push_child(id.clone()).await;
        *self.active.write().await = Some(id.clone());

        info!(node_id = %id, parent_id = %parent_id, "Created subchat");
        Ok(node)
    }

    /// Look up a node by id.
    pub async fn get(&self, id: &NodeId) -> Result<Arc<Node>, ForestError> {
        self.nodes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ForestError::NodeNotFound(id.to_string()))
    }

    /// Mark a node as active.
    pub async fn set_active(&self, id: &NodeId) -> Result<(), ForestError> {
        // Validate before publishing.
        self.get(id).await?;
        *self.active.write().await = Some(id.clone());
        Ok(())
    }

    /// The currently active node, if any.
    pub async fn active(&self) -> Option<Arc<Node>> {
        let id = self.active.read().await.clone()?;
        self.nodes.read().await.get(&id).cloned()
    }

    /// Delete a node and its entire subtree, depth-first.
    ///
    /// Archive records of the deleted nodes are intentionally left in place —
    /// long-term memory persists beyond node death. Returns the number of
    /// nodes removed.
    pub async fn delete(&self, id: &NodeId) -> Result<usize, ForestError> {
        let target = self.get(id).await?;

        // Collect the subtree before taking the write guard.
        let mut doomed = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Ok(node) = self.get(&current).await {
                stack.extend(node.children().await);
            }
            doomed.push(current);
        }

        if let Some(parent_id) = target.parent() {
            if let Ok(parent) = self.get(parent_id).await {
                parent.remove_child(id).await;
            }
        }

        {
            let mut nodes = self.nodes.write().await;
            for dead in &doomed {
                nodes.remove(dead);
            }
        }
        self.roots.write().await.retain(|r| !doomed.contains(r));

        let mut active = self.active.write().await;
        if active.as_ref().is_some_and(|a| doomed.contains(a)) {
            *active = None;
        }
        drop(active);

        debug!(node_id = %id, removed = doomed.len(), "Deleted subtree");
        Ok(doomed.len())
    }

    /// Titles from the root down to the given node, for rendering.
    pub async fn path_titles(&self, id: &NodeId) -> Result<Vec<String>, ForestError> {
        let mut titles = Vec::new();
        let mut current = Some(self.get(id).await?);
        while let Some(node) = current {
            titles.push(node.title().await);
            current = match node.parent() {
                Some(parent_id) => Some(self.get(parent_id).await?),
                None => None,
            };
        }
        titles.reverse();
        Ok(titles)
    }

    /// Ids of all root nodes.
    pub async fn roots(&self) -> Vec<NodeId> {
        self.roots.read().await.clone()
    }

    /// Total number of live nodes.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}
