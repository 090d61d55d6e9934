//! Named registry of value nodes.

use crate::error::{BoxError, Error, Result};
use crate::node::{link, Dependent, NodeId, ValueNode};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A directed acyclic graph of [`ValueNode`]s addressed by name.
///
/// Nodes are owned by the graph; the typed `Arc<ValueNode<T>>` handed back on
/// registration is for reading and setting values. Edges are checked for
/// cycles when they are wired, never at evaluation time.
#[derive(Default)]
pub struct ComputationGraph {
    nodes: RwLock<HashMap<String, Arc<dyn Dependent>>>,
}

impl ComputationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an input node without a value.
    pub fn input<T>(&self, name: &str) -> Result<Arc<ValueNode<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let node = ValueNode::input(name);
        self.register(&node)?;
        Ok(node)
    }

    /// Register an input node seeded with `value`.
    pub fn input_with<T>(&self, name: &str, value: T) -> Result<Arc<ValueNode<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let node = ValueNode::input_with(name, value);
        self.register(&node)?;
        Ok(node)
    }

    /// Register a derived node and wire it to each of `deps`.
    ///
    /// Nothing is registered if any dependency is unknown.
    pub fn derive<T, F>(&self, name: &str, deps: &[&str], compute: F) -> Result<Arc<ValueNode<T>>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let producers = deps
            .iter()
            .map(|dep| self.node(dep).ok_or_else(|| Error::UnknownNode(dep.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let node = ValueNode::derived(name, compute);
        self.register(&node)?;

        let consumer: Arc<dyn Dependent> = node.clone();
        for producer in &producers {
            link(producer, &consumer)?;
        }
        Ok(node)
    }

    /// Wire `producer -> consumer` by name.
    pub fn connect(&self, producer: &str, consumer: &str) -> Result<()> {
        let from = self
            .node(producer)
            .ok_or_else(|| Error::UnknownNode(producer.to_string()))?;
        let to = self
            .node(consumer)
            .ok_or_else(|| Error::UnknownNode(consumer.to_string()))?;
        link(&from, &to)
    }

    pub fn node(&self, name: &str) -> Option<Arc<dyn Dependent>> {
        self.nodes.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.read().contains_key(name)
    }

    /// Invalidate a node and everything downstream of it.
    pub fn invalidate(&self, name: &str) -> Result<()> {
        let node = self
            .node(name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
        tracing::debug!("invalidating '{}' and its dependents", name);
        node.invalidate();
        Ok(())
    }

    /// Names of nodes that have no cached value.
    pub fn dirty_nodes(&self) -> Vec<String> {
        let mut dirty: Vec<String> = self
            .nodes
            .read()
            .iter()
            .filter(|(_, node)| !node.is_cached())
            .map(|(name, _)| name.clone())
            .collect();
        dirty.sort();
        dirty
    }

    /// Producers-before-consumers order of every node (Kahn's algorithm).
    ///
    /// Ties are broken by registration order, so the result is stable.
    pub fn topological_order(&self) -> Vec<String> {
        let nodes = self.nodes.read();

        let mut by_id: Vec<(NodeId, &String, &Arc<dyn Dependent>)> = nodes
            .iter()
            .map(|(name, node)| (node.id(), name, node))
            .collect();
        by_id.sort_by_key(|(id, _, _)| *id);

        let mut indegree: HashMap<NodeId, usize> =
            by_id.iter().map(|(id, _, _)| (*id, 0)).collect();
        let mut edges: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for (id, _, node) in &by_id {
            for dependent in node.dependents() {
                // Dependents wired outside the graph are ignored.
                if let Some(degree) = indegree.get_mut(&dependent.id()) {
                    *degree += 1;
                    edges.entry(*id).or_default().push(dependent.id());
                }
            }
        }

        let names: HashMap<NodeId, &String> =
            by_id.iter().map(|(id, name, _)| (*id, *name)).collect();
        let mut queue: VecDeque<NodeId> = by_id
            .iter()
            .filter(|(id, _, _)| indegree[id] == 0)
            .map(|(id, _, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(by_id.len());

        while let Some(id) = queue.pop_front() {
            order.push(names[&id].clone());
            if let Some(targets) = edges.get(&id) {
                let mut ready: Vec<NodeId> = Vec::new();
                for target in targets {
                    if let Some(degree) = indegree.get_mut(target) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(*target);
                        }
                    }
                }
                ready.sort();
                queue.extend(ready);
            }
        }

        order
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn register<T>(&self, node: &Arc<ValueNode<T>>) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(node.name()) {
            return Err(Error::InvalidConfig(format!(
                "node '{}' already exists",
                node.name()
            )));
        }
        nodes.insert(node.name().to_string(), node.clone());
        Ok(())
    }
}

impl std::fmt::Debug for ComputationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationGraph")
            .field("nodes", &self.topological_order())
            .finish()
    }
}
