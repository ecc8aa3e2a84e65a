use std::collections::HashMap;

use tessera_types::SourcePos;

use crate::preview::HostValue;

/// Opaque handle to a node of the host tree. Only meaningful to the
/// [`TreeView`] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub u64);

/// Read-only view of the host's committed tree.
///
/// Called synchronously from the commit path, so implementations must not
/// block.
pub trait TreeView {
    fn root(&self) -> Option<NodeKey>;
    fn first_child(&self, node: NodeKey) -> Option<NodeKey>;
    fn next_sibling(&self, node: NodeKey) -> Option<NodeKey>;
    /// The node this one replaced, if the host linked them.
    fn predecessor(&self, node: NodeKey) -> Option<NodeKey>;

    fn name(&self, node: NodeKey) -> Option<&str>;
    fn key(&self, node: NodeKey) -> Option<&str>;
    fn attributes(&self, node: NodeKey) -> HostValue;
    fn derived_state(&self, node: NodeKey) -> HostValue;
    fn context(&self, node: NodeKey) -> HostValue;

    fn owner(&self, _node: NodeKey) -> Option<NodeKey> {
        None
    }

    fn cost(&self, _node: NodeKey) -> Option<f64> {
        None
    }

    fn source(&self, _node: NodeKey) -> Option<SourcePos> {
        None
    }
}

// ── In-memory host ──────────────────────────────────────────────

/// Everything a [`MemoryTree`] node carries besides its links.
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub name: Option<String>,
    pub key: Option<String>,
    pub attributes: HostValue,
    pub state: HostValue,
    pub context: HostValue,
    pub owner: Option<NodeKey>,
    pub cost: Option<f64>,
    pub source: Option<SourcePos>,
    pub predecessor: Option<NodeKey>,
}

impl NodeSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn attrs(mut self, attributes: HostValue) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn state(mut self, state: HostValue) -> Self {
        self.state = state;
        self
    }

    pub fn context(mut self, context: HostValue) -> Self {
        self.context = context;
        self
    }

    pub fn owner(mut self, owner: NodeKey) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn source(mut self, file: impl Into<String>, line: u32) -> Self {
        self.source = Some(SourcePos {
            file: file.into(),
            line,
            column: None,
        });
        self
    }

    pub fn replaces(mut self, predecessor: NodeKey) -> Self {
        self.predecessor = Some(predecessor);
        self
    }
}

#[derive(Debug)]
struct MemoryNode {
    spec: NodeSpec,
    parent: Option<NodeKey>,
    children: Vec<NodeKey>,
}

/// A mutable tree that implements [`TreeView`]; used by tests and the demo
/// host.
#[derive(Debug, Default)]
pub struct MemoryTree {
    next_key: u64,
    root: Option<NodeKey>,
    nodes: HashMap<NodeKey, MemoryNode>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, spec: NodeSpec, parent: Option<NodeKey>) -> NodeKey {
        self.next_key += 1;
        let key = NodeKey(self.next_key);
        self.nodes.insert(
            key,
            MemoryNode {
                spec,
                parent,
                children: Vec::new(),
            },
        );
        key
    }

    /// Installs a new root, dropping the previous tree.
    pub fn set_root(&mut self, spec: NodeSpec) -> NodeKey {
        if let Some(old) = self.root.take() {
            self.remove(old);
        }
        let key = self.alloc(spec, None);
        self.root = Some(key);
        key
    }

    /// Appends a child under `parent`. A child of an unknown parent is created
    /// detached and is never traversed.
    pub fn append_child(&mut self, parent: NodeKey, spec: NodeSpec) -> NodeKey {
        let known = self.nodes.contains_key(&parent);
        let key = self.alloc(spec, known.then_some(parent));
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(key);
        }
        key
    }

    /// Swaps `old` for a brand-new node that declares `old` as its
    /// predecessor, taking over its position and children.
    pub fn replace(&mut self, old: NodeKey, spec: NodeSpec) -> NodeKey {
        let spec = spec.replaces(old);
        let Some(previous) = self.nodes.remove(&old) else {
            return self.alloc(spec, None);
        };
        let key = self.alloc(spec, previous.parent);
        for child in &previous.children {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parent = Some(key);
            }
        }
        if let Some(node) = self.nodes.get_mut(&key) {
            node.children = previous.children;
        }
        match previous.parent {
            Some(parent) => {
                if let Some(node) = self.nodes.get_mut(&parent)
                    && let Some(slot) = node.children.iter_mut().find(|c| **c == old)
                {
                    *slot = key;
                }
            }
            None if self.root == Some(old) => self.root = Some(key),
            None => {}
        }
        key
    }

    /// Mutates a node in place, keeping its handle. Returns `false` if the
    /// node does not exist.
    pub fn update(&mut self, node: NodeKey, f: impl FnOnce(&mut NodeSpec)) -> bool {
        match self.nodes.get_mut(&node) {
            Some(n) => {
                f(&mut n.spec);
                true
            }
            None => false,
        }
    }

    /// Removes `node` and its whole subtree.
    pub fn remove(&mut self, node: NodeKey) {
        let Some(removed) = self.nodes.remove(&node) else {
            return;
        };
        if let Some(parent) = removed.parent
            && let Some(p) = self.nodes.get_mut(&parent)
        {
            p.children.retain(|c| *c != node);
        }
        if self.root == Some(node) {
            self.root = None;
        }
        let mut pending = removed.children;
        while let Some(child) = pending.pop() {
            if let Some(n) = self.nodes.remove(&child) {
                pending.extend(n.children);
            }
        }
    }

    pub fn get(&self, node: NodeKey) -> Option<&NodeSpec> {
        self.nodes.get(&node).map(|n| &n.spec)
    }

    pub fn children(&self, node: NodeKey) -> &[NodeKey] {
        self.nodes
            .get(&node)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl TreeView for MemoryTree {
    fn root(&self) -> Option<NodeKey> {
        self.root
    }

    fn first_child(&self, node: NodeKey) -> Option<NodeKey> {
        self.children(node).first().copied()
    }

    fn next_sibling(&self, node: NodeKey) -> Option<NodeKey> {
        let parent = self.nodes.get(&node)?.parent?;
        let siblings = self.children(parent);
        let at = siblings.iter().position(|c| *c == node)?;
        siblings.get(at + 1).copied()
    }

    fn predecessor(&self, node: NodeKey) -> Option<NodeKey> {
        self.get(node)?.predecessor
    }

    fn name(&self, node: NodeKey) -> Option<&str> {
        self.get(node)?.name.as_deref()
    }

    fn key(&self, node: NodeKey) -> Option<&str> {
        self.get(node)?.key.as_deref()
    }

    fn attributes(&self, node: NodeKey) -> HostValue {
        self.get(node)
            .map(|n| n.attributes.clone())
            .unwrap_or_default()
    }

    fn derived_state(&self, node: NodeKey) -> HostValue {
        self.get(node).map(|n| n.state.clone()).unwrap_or_default()
    }

    fn context(&self, node: NodeKey) -> HostValue {
        self.get(node).map(|n| n.context.clone()).unwrap_or_default()
    }

    fn owner(&self, node: NodeKey) -> Option<NodeKey> {
        self.get(node)?.owner
    }

    fn cost(&self, node: NodeKey) -> Option<f64> {
        self.get(node)?.cost
    }

    fn source(&self, node: NodeKey) -> Option<SourcePos> {
        self.get(node)?.source.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_keeps_position_and_children() {
        let mut tree = MemoryTree::new();
        let root = tree.set_root(NodeSpec::named("App"));
        let a = tree.append_child(root, NodeSpec::named("A"));
        let b = tree.append_child(root, NodeSpec::named("B"));
        let leaf = tree.append_child(a, NodeSpec::named("Leaf"));

        let a2 = tree.replace(a, NodeSpec::named("A"));
        assert_eq!(tree.first_child(root), Some(a2));
        assert_eq!(tree.next_sibling(a2), Some(b));
        assert_eq!(tree.first_child(a2), Some(leaf));
        assert_eq!(tree.predecessor(a2), Some(a));
        assert!(tree.get(a).is_none());
    }

    #[test]
    fn remove_drops_subtree() {
        let mut tree = MemoryTree::new();
        let root = tree.set_root(NodeSpec::named("App"));
        let a = tree.append_child(root, NodeSpec::named("A"));
        tree.append_child(a, NodeSpec::named("Leaf"));
        tree.remove(a);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.first_child(root), None);
    }
}
