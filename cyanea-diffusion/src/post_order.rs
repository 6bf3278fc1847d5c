//! Tip-to-root Gaussian message passing.
//!
//! The continuous analogue of Felsenstein pruning. Each child sends its
//! parent a message `N(mean, (p · P)⁻¹)`; two messages merge by adding
//! precisions and precision-weighting the means, and every merge emits the
//! log-density of the two means agreeing:
//!
//! ```text
//! r         = pA·pB / (pA + pB)
//! remainder = -d·ln√(2π) + ½(d·ln r + ln|P|) - ½·r·(mA − mB)ᵀ P (mA − mB)
//! ```
//!
//! A node's message to its own parent composes its merged precision with
//! the branch precision `1/t` in series. Polytomies fold their children
//! pairwise; the merge is associative so the result does not depend on
//! child order beyond rounding.

use nalgebra::DMatrix;
use tracing::trace;

use cyanea_core::{CyaneaError, Result};
use cyanea_phylo::{NodeId, PhyloTree};

use crate::belief::{BeliefCache, NodeBelief};
use crate::data::TraitData;
use crate::diffusion::{BranchScaling, DiffusionModel};
use crate::gaussian::{series_precision, sum_quadratic, LOG_SQRT_2PI};
use crate::tracker::DirtyStateTracker;

/// One post-order sweep over a tree.
pub struct PostOrderAggregator<'a, D: DiffusionModel> {
    tree: &'a PhyloTree,
    diffusion: &'a D,
    data: &'a TraitData,
    scaling: &'a BranchScaling,
    outer_products: bool,
}

impl<'a, D: DiffusionModel> PostOrderAggregator<'a, D> {
    pub fn new(
        tree: &'a PhyloTree,
        diffusion: &'a D,
        data: &'a TraitData,
        scaling: &'a BranchScaling,
    ) -> Self {
        Self {
            tree,
            diffusion,
            data,
            scaling,
            outer_products: false,
        }
    }

    /// Also accumulate the outer-product statistic at every merge.
    pub fn with_outer_products(mut self, enabled: bool) -> Self {
        self.outer_products = enabled;
        self
    }

    /// Recompute every node the tracker marks stale. Returns how many were visited.
    pub fn aggregate(&self, cache: &mut BeliefCache, tracker: &mut DirtyStateTracker) -> Result<usize> {
        let normalizer = self.scaling.normalizer(self.tree)?;
        let mut visited = 0;
        for id in self.tree.iter_postorder() {
            if !tracker.needs_update(id) {
                continue;
            }
            let belief = if self.is_leaf(id) {
                self.visit_tip(id, normalizer)?
            } else {
                self.visit_internal(id, cache, normalizer)?
            };
            trace!(
                node = id,
                lower = belief.lower_precision,
                upper = belief.upper_precision,
                remainder = belief.log_remainder,
                "aggregated node"
            );
            cache.set(id, belief);
            tracker.mark_valid(id);
            visited += 1;
        }
        Ok(visited)
    }

    fn is_leaf(&self, id: NodeId) -> bool {
        self.tree.get_node(id).is_some_and(|n| n.is_leaf())
    }

    fn branch_precision(&self, id: NodeId, normalizer: f64) -> Result<f64> {
        // 1/0 is +∞: a zero-length branch transmits its value with certainty.
        Ok(1.0 / self.scaling.rescaled_length(self.tree, id, normalizer)?)
    }

    fn visit_tip(&self, id: NodeId, normalizer: f64) -> Result<NodeBelief> {
        let node = self
            .tree
            .get_node(id)
            .ok_or_else(|| CyaneaError::Contract(format!("node id {} out of range", id)))?;
        let tip = node
            .name
            .as_deref()
            .and_then(|name| self.data.get(name))
            .ok_or_else(|| CyaneaError::Contract(format!("leaf {} has no trait data", id)))?;

        if tip.is_missing() {
            return Ok(NodeBelief::empty(self.data.dim_trait(), self.data.dim_data()));
        }
        let upper_precision = if node.is_root() {
            0.0
        } else {
            self.branch_precision(id, normalizer)?
        };
        Ok(NodeBelief {
            mean: tip.values().clone(),
            lower_precision: f64::INFINITY,
            upper_precision,
            log_remainder: 0.0,
            outer_product: None,
            outer_df: 0,
        })
    }

    fn visit_internal(&self, id: NodeId, cache: &BeliefCache, normalizer: f64) -> Result<NodeBelief> {
        let node = self
            .tree
            .get_node(id)
            .ok_or_else(|| CyaneaError::Contract(format!("node id {} out of range", id)))?;
        let dim_trait = self.data.dim_trait();
        let dim_data = self.data.dim_data();
        let precision_matrix = self.diffusion.precision();
        let log_det = self.diffusion.log_det_precision();

        let mut mean = DMatrix::zeros(dim_trait, dim_data);
        let mut precision = 0.0;
        let mut log_remainder = 0.0;
        let mut merges = 0;
        let mut outer = self
            .outer_products
            .then(|| DMatrix::zeros(dim_trait, dim_trait));

        for &child in &node.children {
            let message = cache
                .get(child)
                .ok_or_else(|| CyaneaError::Contract(format!("node id {} out of range", child)))?;
            let pc = message.upper_precision;
            if pc == 0.0 {
                continue;
            }
            if precision == 0.0 {
                mean.copy_from(&message.mean);
                precision = pc;
                continue;
            }
            if precision.is_infinite() && pc.is_infinite() {
                return Err(CyaneaError::Numerical(format!(
                    "two certain messages meet at node {} (zero-length branches)",
                    id
                )));
            }

            let remainder_precision = series_precision(precision, pc);
            let diff = &mean - &message.mean;
            log_remainder += dim_data as f64
                * (-(dim_trait as f64) * LOG_SQRT_2PI
                    + 0.5 * (dim_trait as f64 * remainder_precision.ln() + log_det))
                - 0.5 * remainder_precision * sum_quadratic(precision_matrix, &diff);
            merges += 1;
            if let Some(o) = outer.as_mut() {
                *o += (&diff * diff.transpose()) * remainder_precision;
            }

            if pc.is_infinite() {
                mean.copy_from(&message.mean);
            } else if precision.is_finite() {
                let total = precision + pc;
                mean = (mean * precision + &message.mean * pc) / total;
            }
            precision += pc;
        }

        let upper_precision = if node.is_root() {
            0.0
        } else {
            series_precision(precision, self.branch_precision(id, normalizer)?)
        };
        Ok(NodeBelief {
            mean,
            lower_precision: precision,
            upper_precision,
            log_remainder,
            outer_product: outer,
            outer_df: merges * dim_data,
        })
    }
}
