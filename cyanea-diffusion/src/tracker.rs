//! Dirty-state bookkeeping for the belief cache.
//!
//! The tracker records which node beliefs are stale. Invalidating a node
//! invalidates every ancestor, so the set of stale nodes is always closed
//! upwards and a post-order sweep that skips valid nodes reproduces a full
//! recomputation exactly.

use cyanea_phylo::{NodeId, PhyloTree};

/// Whether the cached log-likelihood can be returned as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikelihoodState {
    Clean,
    Dirty,
}

/// Validity flags for the cached likelihood, node beliefs and ancestral draws.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyStateTracker {
    likelihood_known: bool,
    valid: Vec<bool>,
    states_drawn: bool,
}

impl DirtyStateTracker {
    /// Everything stale.
    pub fn new(node_count: usize) -> Self {
        Self {
            likelihood_known: false,
            valid: vec![false; node_count],
            states_drawn: false,
        }
    }

    pub fn state(&self) -> LikelihoodState {
        if self.likelihood_known {
            LikelihoodState::Clean
        } else {
            LikelihoodState::Dirty
        }
    }

    pub fn is_clean(&self) -> bool {
        self.likelihood_known
    }

    /// Invalidate every node.
    pub fn mark_all(&mut self) {
        self.valid.iter_mut().for_each(|v| *v = false);
        self.mark_likelihood();
    }

    /// Invalidate `node` and all of its ancestors.
    pub fn mark_path(&mut self, tree: &PhyloTree, node: NodeId) {
        if let Some(v) = self.valid.get_mut(node) {
            *v = false;
        }
        for id in tree.iter_ancestors(node) {
            if !self.valid[id] {
                // Ancestors of a stale node are already stale.
                break;
            }
            self.valid[id] = false;
        }
        self.mark_likelihood();
    }

    /// Invalidate only the scalar result (e.g. the root prior changed).
    pub fn mark_likelihood(&mut self) {
        self.likelihood_known = false;
        self.states_drawn = false;
    }

    pub fn needs_update(&self, node: NodeId) -> bool {
        !self.valid[node]
    }

    pub fn mark_valid(&mut self, node: NodeId) {
        self.valid[node] = true;
    }

    /// Number of nodes the next sweep will recompute.
    pub fn pending(&self) -> usize {
        self.valid.iter().filter(|v| !**v).count()
    }

    pub fn set_clean(&mut self) {
        self.likelihood_known = true;
        self.states_drawn = false;
    }

    pub fn states_drawn(&self) -> bool {
        self.states_drawn
    }

    pub fn set_states_drawn(&mut self, drawn: bool) {
        self.states_drawn = drawn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> PhyloTree {
        // ((A,B)AB,(C,D)CD)root; ids: root 0, AB 1, A 2, B 3, CD 4, C 5, D 6
        PhyloTree::from_newick("((A:1,B:1)AB:1,(C:1,D:1)CD:1)root;").unwrap()
    }

    fn all_valid(t: &PhyloTree) -> DirtyStateTracker {
        let mut tracker = DirtyStateTracker::new(t.node_count());
        for id in 0..t.node_count() {
            tracker.mark_valid(id);
        }
        tracker.set_clean();
        tracker
    }

    #[test]
    fn starts_dirty() {
        let tracker = DirtyStateTracker::new(4);
        assert_eq!(tracker.state(), LikelihoodState::Dirty);
        assert_eq!(tracker.pending(), 4);
    }

    #[test]
    fn mark_path_invalidates_ancestors_only() {
        let t = tree();
        let mut tracker = all_valid(&t);
        assert_eq!(tracker.pending(), 0);
        let c = t.find_leaf("C").unwrap();
        tracker.mark_path(&t, c);
        assert_eq!(tracker.state(), LikelihoodState::Dirty);
        let stale: Vec<NodeId> = (0..t.node_count()).filter(|&i| tracker.needs_update(i)).collect();
        let cd = t.get_node(c).unwrap().parent.unwrap();
        let mut expected = vec![t.root(), cd, c];
        expected.sort();
        assert_eq!(stale, expected);
    }

    #[test]
    fn mark_path_stops_at_stale_ancestor() {
        let t = tree();
        let mut tracker = all_valid(&t);
        let a = t.find_leaf("A").unwrap();
        let b = t.find_leaf("B").unwrap();
        tracker.mark_path(&t, a);
        tracker.mark_path(&t, b);
        assert_eq!(tracker.pending(), 4);
    }

    #[test]
    fn drawn_flag_cleared_by_changes() {
        let t = tree();
        let mut tracker = all_valid(&t);
        tracker.set_states_drawn(true);
        tracker.mark_likelihood();
        assert!(!tracker.states_drawn());
        tracker.set_clean();
        tracker.set_states_drawn(true);
        tracker.mark_all();
        assert!(!tracker.states_drawn());
        assert_eq!(tracker.pending(), t.node_count());
    }
}
