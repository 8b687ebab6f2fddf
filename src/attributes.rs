//! Hierarchical attribute namespace.
//!
//! Maps dotted attribute paths ("CPUs.0.Status") to dense integer quarks.
//! The tree only ever grows: removing an attribute would invalidate
//! intervals already stored under its quark.

use crate::types::Quark;
use std::collections::HashMap;

/// One node in the attribute tree.
#[derive(Debug)]
struct AttributeNode {
    name: String,
    parent: Option<Quark>,
    /// Children in insertion order. Consumers needing a display order
    /// must sort explicitly.
    children: Vec<Quark>,
    child_index: HashMap<String, Quark>,
}

impl AttributeNode {
    fn new(name: String, parent: Option<Quark>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            child_index: HashMap::new(),
        }
    }
}

/// The attribute tree. Quarks index into `nodes`, so lookups by quark
/// are O(1); path resolution is case-sensitive and exact.
#[derive(Debug, Default)]
pub struct AttributeTree {
    nodes: Vec<AttributeNode>,
    roots: Vec<Quark>,
    root_index: HashMap<String, Quark>,
}

impl AttributeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attributes created so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolve a full path, creating intermediate nodes as needed.
    /// Idempotent. The path must not be empty.
    pub fn get_or_create_quark(&mut self, path: &[&str]) -> Quark {
        assert!(!path.is_empty(), "attribute path must not be empty");
        let mut current = self.get_or_create_root(path[0]);
        for segment in &path[1..] {
            current = self.get_or_create_child(current, segment);
        }
        current
    }

    /// Resolve a full path without creating anything.
    pub fn get_quark(&self, path: &[&str]) -> Option<Quark> {
        let mut current = *self.root_index.get(*path.first()?)?;
        for segment in &path[1..] {
            current = *self.nodes[current.index()].child_index.get(*segment)?;
        }
        Some(current)
    }

    /// Resolve a sub-path anchored at `base`, creating nodes as needed.
    /// An empty sub-path resolves to `base` itself.
    pub fn get_or_create_relative(&mut self, base: Quark, path: &[&str]) -> Quark {
        let mut current = base;
        for segment in path {
            current = self.get_or_create_child(current, segment);
        }
        current
    }

    /// Resolve a sub-path anchored at `base` without creating anything.
    pub fn get_relative(&self, base: Quark, path: &[&str]) -> Option<Quark> {
        let mut current = base;
        for segment in path {
            current = *self.nodes[current.index()].child_index.get(*segment)?;
        }
        Some(current)
    }

    /// Direct children of `quark`, in insertion order.
    pub fn children_of(&self, quark: Quark) -> &[Quark] {
        &self.nodes[quark.index()].children
    }

    /// Top-level attributes, in insertion order.
    pub fn roots(&self) -> &[Quark] {
        &self.roots
    }

    pub fn parent_of(&self, quark: Quark) -> Option<Quark> {
        self.nodes[quark.index()].parent
    }

    pub fn name_of(&self, quark: Quark) -> &str {
        &self.nodes[quark.index()].name
    }

    /// Reconstruct the dotted full path by walking parent links.
    pub fn full_path(&self, quark: Quark) -> String {
        let mut segments = Vec::new();
        let mut current = Some(quark);
        while let Some(q) = current {
            let node = &self.nodes[q.index()];
            segments.push(node.name.as_str());
            current = node.parent;
        }
        segments.reverse();
        segments.join(".")
    }

    fn get_or_create_root(&mut self, name: &str) -> Quark {
        if let Some(&quark) = self.root_index.get(name) {
            return quark;
        }
        let quark = Quark(self.nodes.len() as u32);
        self.nodes.push(AttributeNode::new(name.to_string(), None));
        self.roots.push(quark);
        self.root_index.insert(name.to_string(), quark);
        quark
    }

    fn get_or_create_child(&mut self, parent: Quark, name: &str) -> Quark {
        if let Some(&quark) = self.nodes[parent.index()].child_index.get(name) {
            return quark;
        }
        let quark = Quark(self.nodes.len() as u32);
        self.nodes
            .push(AttributeNode::new(name.to_string(), Some(parent)));
        let parent_node = &mut self.nodes[parent.index()];
        parent_node.children.push(quark);
        parent_node.child_index.insert(name.to_string(), quark);
        quark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let mut tree = AttributeTree::new();
        let q = tree.get_or_create_quark(&["CPUs", "0", "Status"]);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get_quark(&["CPUs", "0", "Status"]), Some(q));
        assert_eq!(tree.get_quark(&["CPUs", "1"]), None);
    }

    #[test]
    fn test_idempotent_creation() {
        let mut tree = AttributeTree::new();
        let a = tree.get_or_create_quark(&["Threads", "42"]);
        let b = tree.get_or_create_quark(&["Threads", "42"]);
        assert_eq!(a, b);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_case_sensitive_paths() {
        let mut tree = AttributeTree::new();
        let lower = tree.get_or_create_quark(&["cpus"]);
        let upper = tree.get_or_create_quark(&["CPUs"]);
        assert_ne!(lower, upper);
    }

    #[test]
    fn test_children_insertion_order() {
        let mut tree = AttributeTree::new();
        let parent = tree.get_or_create_quark(&["CPUs"]);
        let c2 = tree.get_or_create_quark(&["CPUs", "2"]);
        let c0 = tree.get_or_create_quark(&["CPUs", "0"]);
        let c1 = tree.get_or_create_quark(&["CPUs", "1"]);
        assert_eq!(tree.children_of(parent), &[c2, c0, c1]);
    }

    #[test]
    fn test_full_path_roundtrip() {
        let mut tree = AttributeTree::new();
        let q = tree.get_or_create_quark(&["Threads", "42", "Exec_name"]);
        assert_eq!(tree.full_path(q), "Threads.42.Exec_name");
    }

    #[test]
    fn test_relative_resolution() {
        let mut tree = AttributeTree::new();
        let base = tree.get_or_create_quark(&["Threads"]);
        let q = tree.get_or_create_relative(base, &["42", "PPID"]);
        assert_eq!(tree.get_quark(&["Threads", "42", "PPID"]), Some(q));
        assert_eq!(tree.get_relative(base, &["42", "PPID"]), Some(q));
        assert_eq!(tree.get_relative(base, &[]), Some(base));
    }
}
