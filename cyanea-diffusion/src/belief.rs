//! Per-node conditional Gaussian beliefs, stored as an arena indexed by `NodeId`.

use nalgebra::DMatrix;

use cyanea_phylo::NodeId;

/// Conditional distribution of one node's trait given the tips below it.
///
/// Given its descendants the node value is `N(mean_k, (lower_precision · P)⁻¹)`
/// for every replicate column `k`. The message sent to the parent has the same
/// mean and precision `upper_precision`, the result of composing
/// `lower_precision` with the node's own branch.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeBelief {
    /// `dim_trait × dim_data`, one column per replicate.
    pub mean: DMatrix<f64>,
    /// Precision multiplier of the node value given its subtree (∞ for an observed tip).
    pub lower_precision: f64,
    /// Precision multiplier of the message to the parent (0 at the root and at missing tips).
    pub upper_precision: f64,
    /// Log normalizing constants produced while merging this node's children.
    pub log_remainder: f64,
    /// Precision-weighted outer products of the merged child differences.
    pub outer_product: Option<DMatrix<f64>>,
    /// Informative merges counted into `outer_product`, times replicates.
    pub outer_df: usize,
}

impl NodeBelief {
    /// An uninformative belief.
    pub fn empty(dim_trait: usize, dim_data: usize) -> Self {
        Self {
            mean: DMatrix::zeros(dim_trait, dim_data),
            lower_precision: 0.0,
            upper_precision: 0.0,
            log_remainder: 0.0,
            outer_product: None,
            outer_df: 0,
        }
    }
}

/// Sufficient statistics of the outer-product sums, for a Wishart update of `P`.
#[derive(Debug, Clone, PartialEq)]
pub struct WishartStatistics {
    /// `Σ r·(mA − mB)(mA − mB)ᵀ` over all merges and replicates.
    pub scale: DMatrix<f64>,
    /// One per informative merge and replicate.
    pub df: usize,
}

/// Arena of [`NodeBelief`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct BeliefCache {
    nodes: Vec<NodeBelief>,
    dim_trait: usize,
}

impl BeliefCache {
    /// One uninformative belief per node.
    pub fn new(node_count: usize, dim_trait: usize, dim_data: usize) -> Self {
        Self {
            nodes: vec![NodeBelief::empty(dim_trait, dim_data); node_count],
            dim_trait,
        }
    }

    /// Belief of `id`.
    pub fn get(&self, id: NodeId) -> Option<&NodeBelief> {
        self.nodes.get(id)
    }

    pub(crate) fn set(&mut self, id: NodeId, belief: NodeBelief) {
        self.nodes[id] = belief;
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for an empty arena.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total of all remainder terms, summed in node order.
    pub fn sum_remainders(&self) -> f64 {
        self.nodes.iter().map(|n| n.log_remainder).sum()
    }

    /// Tree-wide sums of the outer-product statistics.
    pub fn wishart_statistics(&self) -> WishartStatistics {
        let mut scale = DMatrix::zeros(self.dim_trait, self.dim_trait);
        let mut df = 0;
        for node in &self.nodes {
            if let Some(op) = node.outer_product.as_ref() {
                scale += op;
                df += node.outer_df;
            }
        }
        WishartStatistics { scale, df }
    }
}
