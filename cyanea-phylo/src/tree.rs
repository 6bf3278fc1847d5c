//! Core phylogenetic tree data structures.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<Node>` and are
//! referenced by `NodeId` (a `usize` index). Ids are stable for the life of
//! the tree, so per-node caches elsewhere can be plain vectors indexed by id.

use cyanea_core::{CyaneaError, Result, Summarizable};

/// Index into the tree's node arena.
pub type NodeId = usize;

/// A single node in a phylogenetic tree.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    /// Index of this node in the arena.
    pub id: NodeId,
    /// Parent node (None for root).
    pub parent: Option<NodeId>,
    /// Child nodes.
    pub children: Vec<NodeId>,
    /// Branch length from this node to its parent.
    pub branch_length: Option<f64>,
    /// Relative clock rate on the branch above this node (`[&rate=..]` in Newick).
    pub rate: Option<f64>,
    /// Taxon or clade label.
    pub name: Option<String>,
}

impl Node {
    fn detached(id: NodeId, parent: Option<NodeId>) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            branch_length: None,
            rate: None,
            name: None,
        }
    }

    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// A rooted phylogenetic tree stored as an arena of nodes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhyloTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl PhyloTree {
    /// Create a new tree with a single unnamed root node.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::detached(0, None)],
            root: 0,
        }
    }

    /// Create a tree from pre-built nodes and a root index.
    ///
    /// Checks that ids match arena positions, that parent and child links
    /// agree, and that every node hangs off `root`.
    pub fn from_nodes(nodes: Vec<Node>, root: NodeId) -> Result<Self> {
        if nodes.is_empty() {
            return Err(CyaneaError::InvalidInput("empty node list".into()));
        }
        if root >= nodes.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "root index {} out of range ({})",
                root,
                nodes.len()
            )));
        }
        if nodes[root].parent.is_some() {
            return Err(CyaneaError::InvalidInput(format!(
                "root node {} has a parent",
                root
            )));
        }
        for (idx, node) in nodes.iter().enumerate() {
            if node.id != idx {
                return Err(CyaneaError::InvalidInput(format!(
                    "node at position {} carries id {}",
                    idx, node.id
                )));
            }
            for &child in &node.children {
                match nodes.get(child) {
                    Some(c) if c.parent == Some(idx) => {}
                    _ => {
                        return Err(CyaneaError::InvalidInput(format!(
                            "child link {} -> {} is not mirrored by a parent link",
                            idx, child
                        )))
                    }
                }
            }
        }
        let tree = Self { nodes, root };
        let reached = tree.iter_preorder().count();
        if reached != tree.nodes.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "{} of {} nodes are unreachable from the root",
                tree.nodes.len() - reached,
                tree.nodes.len()
            )));
        }
        Ok(tree)
    }

    /// Add a child to `parent` and return its `NodeId`.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: Option<String>,
        branch_length: Option<f64>,
    ) -> Result<NodeId> {
        if parent >= self.nodes.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "parent index {} out of range ({})",
                parent,
                self.nodes.len()
            )));
        }
        let id = self.nodes.len();
        let mut node = Node::detached(id, Some(parent));
        node.name = name;
        node.branch_length = branch_length;
        self.nodes.push(node);
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Access a node by id.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Mutable access to a node by id.
    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| CyaneaError::InvalidInput(format!("node id {} out of range", id)))
    }

    /// Set the branch length above `id`.
    pub fn set_branch_length(&mut self, id: NodeId, length: f64) -> Result<()> {
        let count = self.nodes.len();
        let node = self.nodes.get_mut(id).ok_or_else(|| {
            CyaneaError::InvalidInput(format!("node id {} out of range ({})", id, count))
        })?;
        node.branch_length = Some(length);
        Ok(())
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaf nodes.
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// All leaf node ids, in arena order.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.id)
            .collect()
    }

    /// Leaf carrying `name`, if any.
    pub fn find_leaf(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.is_leaf() && n.name.as_deref() == Some(name))
            .map(|n| n.id)
    }

    /// Pre-order (parent before children) traversal yielding node ids.
    pub fn iter_preorder(&self) -> PreorderIter<'_> {
        PreorderIter {
            tree: self,
            stack: vec![self.root],
        }
    }

    /// Post-order (children before parent) traversal yielding node ids.
    pub fn iter_postorder(&self) -> PostorderIter {
        // Reverse of a root-first walk that pushes children left to right.
        let mut sequence = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            sequence.push(id);
            stack.extend(self.nodes[id].children.iter().copied());
        }
        sequence.reverse();
        PostorderIter { sequence, pos: 0 }
    }

    /// Walk from `id` (exclusive) up to the root (inclusive).
    pub fn iter_ancestors(&self, id: NodeId) -> AncestorIter<'_> {
        AncestorIter {
            tree: self,
            current: self.nodes.get(id).and_then(|n| n.parent),
        }
    }

    /// Sum of branch lengths from `id` to the root. Missing lengths count as zero.
    pub fn distance_to_root(&self, id: NodeId) -> Result<f64> {
        let node = self.node(id)?;
        let own = if node.is_root() {
            0.0
        } else {
            node.branch_length.unwrap_or(0.0)
        };
        Ok(own
            + self
                .iter_ancestors(id)
                .filter(|&a| a != self.root)
                .map(|a| self.nodes[a].branch_length.unwrap_or(0.0))
                .sum::<f64>())
    }

    /// Largest root-to-leaf distance.
    pub fn root_height(&self) -> f64 {
        let mut depth = vec![0.0; self.nodes.len()];
        let mut height: f64 = 0.0;
        for id in self.iter_preorder() {
            let node = &self.nodes[id];
            if let Some(p) = node.parent {
                depth[id] = depth[p] + node.branch_length.unwrap_or(0.0);
            }
            if node.is_leaf() {
                height = height.max(depth[id]);
            }
        }
        height
    }

    /// Sum of all branch lengths below the root.
    pub fn tree_length(&self) -> f64 {
        self.nodes
            .iter()
            .filter(|n| !n.is_root())
            .map(|n| n.branch_length.unwrap_or(0.0))
            .sum()
    }

    /// Most recent common ancestor of two nodes.
    pub fn mrca(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        if a >= self.nodes.len() || b >= self.nodes.len() {
            return Err(CyaneaError::InvalidInput("node id out of range".into()));
        }
        let mut on_path = vec![false; self.nodes.len()];
        on_path[a] = true;
        for id in self.iter_ancestors(a) {
            on_path[id] = true;
        }
        if on_path[b] {
            return Ok(b);
        }
        Ok(self
            .iter_ancestors(b)
            .find(|&id| on_path[id])
            .unwrap_or(self.root))
    }

    /// Sorted list of leaf names (leaves without names are excluded).
    pub fn leaf_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.is_leaf())
            .filter_map(|n| n.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Parse a Newick format string into a tree.
    pub fn from_newick(input: &str) -> Result<Self> {
        crate::newick::parse(input)
    }
}

impl Default for PhyloTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Summarizable for PhyloTree {
    fn summary(&self) -> String {
        let leaves = self.leaf_count();
        format!(
            "PhyloTree: {} nodes ({} leaves, {} internal), length {:.4}",
            self.node_count(),
            leaves,
            self.node_count() - leaves,
            self.tree_length()
        )
    }
}

/// Pre-order iterator over node ids.
pub struct PreorderIter<'a> {
    tree: &'a PhyloTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for PreorderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        // Reverse push so the leftmost child comes out first.
        self.stack
            .extend(self.tree.nodes[id].children.iter().rev().copied());
        Some(id)
    }
}

/// Post-order iterator over node ids.
pub struct PostorderIter {
    sequence: Vec<NodeId>,
    pos: usize,
}

impl Iterator for PostorderIter {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = *self.sequence.get(self.pos)?;
        self.pos += 1;
        Some(id)
    }
}

/// Iterator from a node's parent up to the root.
pub struct AncestorIter<'a> {
    tree: &'a PhyloTree,
    current: Option<NodeId>,
}

impl<'a> Iterator for AncestorIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        self.current = self.tree.nodes[id].parent;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> PhyloTree {
        // ((A:0.1,B:0.2)AB:0.3,(C:0.4,D:0.5)CD:0.6)root;
        let mut tree = PhyloTree::new();
        tree.get_node_mut(0).unwrap().name = Some("root".into());
        let ab = tree.add_child(0, Some("AB".into()), Some(0.3)).unwrap();
        let cd = tree.add_child(0, Some("CD".into()), Some(0.6)).unwrap();
        tree.add_child(ab, Some("A".into()), Some(0.1)).unwrap();
        tree.add_child(ab, Some("B".into()), Some(0.2)).unwrap();
        tree.add_child(cd, Some("C".into()), Some(0.4)).unwrap();
        tree.add_child(cd, Some("D".into()), Some(0.5)).unwrap();
        tree
    }

    #[test]
    fn new_tree_has_single_root() {
        let tree = PhyloTree::new();
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.leaf_count(), 1);
        assert!(tree.get_node(0).unwrap().is_root());
    }

    #[test]
    fn add_child_invalid_parent() {
        let mut tree = PhyloTree::new();
        assert!(tree.add_child(99, None, None).is_err());
    }

    #[test]
    fn node_and_leaf_counts() {
        let tree = sample_tree();
        assert_eq!(tree.node_count(), 7);
        assert_eq!(tree.leaf_count(), 4);
    }

    #[test]
    fn preorder_traversal() {
        let tree = sample_tree();
        let order: Vec<NodeId> = tree.iter_preorder().collect();
        assert_eq!(order, vec![0, 1, 3, 4, 2, 5, 6]);
    }

    #[test]
    fn postorder_traversal() {
        let tree = sample_tree();
        let order: Vec<NodeId> = tree.iter_postorder().collect();
        assert_eq!(order, vec![3, 4, 1, 5, 6, 2, 0]);
    }

    #[test]
    fn ancestors_walk_to_root() {
        let tree = sample_tree();
        let path: Vec<NodeId> = tree.iter_ancestors(5).collect();
        assert_eq!(path, vec![2, 0]);
        assert_eq!(tree.iter_ancestors(0).count(), 0);
    }

    #[test]
    fn distances_and_heights() {
        let tree = sample_tree();
        assert!((tree.distance_to_root(6).unwrap() - 1.1).abs() < 1e-12);
        assert!((tree.distance_to_root(0).unwrap()).abs() < 1e-12);
        assert!((tree.root_height() - 1.1).abs() < 1e-12);
        assert!((tree.tree_length() - 2.1).abs() < 1e-12);
    }

    #[test]
    fn mrca_cases() {
        let tree = sample_tree();
        assert_eq!(tree.mrca(3, 4).unwrap(), 1);
        assert_eq!(tree.mrca(3, 5).unwrap(), 0);
        assert_eq!(tree.mrca(1, 3).unwrap(), 1);
        assert_eq!(tree.mrca(3, 3).unwrap(), 3);
        assert!(tree.mrca(3, 42).is_err());
    }

    #[test]
    fn find_leaf_by_name() {
        let tree = sample_tree();
        assert_eq!(tree.find_leaf("C"), Some(5));
        assert_eq!(tree.find_leaf("AB"), None);
        assert_eq!(tree.find_leaf("Z"), None);
    }

    #[test]
    fn set_branch_length_updates_node() {
        let mut tree = sample_tree();
        tree.set_branch_length(3, 0.9).unwrap();
        assert_eq!(tree.get_node(3).unwrap().branch_length, Some(0.9));
        assert!(tree.set_branch_length(70, 1.0).is_err());
    }

    #[test]
    fn from_nodes_rejects_broken_links() {
        let tree = sample_tree();
        let mut nodes: Vec<Node> = (0..tree.node_count())
            .map(|i| tree.get_node(i).unwrap().clone())
            .collect();
        nodes[4].parent = Some(2);
        assert!(PhyloTree::from_nodes(nodes, 0).is_err());
    }

    #[test]
    fn from_nodes_rejects_unreachable() {
        let mut nodes = vec![Node::detached(0, None), Node::detached(1, None)];
        nodes[0].name = Some("only".into());
        assert!(PhyloTree::from_nodes(nodes, 0).is_err());
    }

    #[test]
    fn leaf_names_sorted() {
        let tree = sample_tree();
        assert_eq!(tree.leaf_names(), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn summary_format() {
        let tree = sample_tree();
        assert_eq!(
            tree.summary(),
            "PhyloTree: 7 nodes (4 leaves, 3 internal), length 2.1000"
        );
    }
}
