//! Joint draws of internal (and missing) node states given the tips.
//!
//! A pre-order pass over the belief cache: the root comes from its
//! posterior, then every child `c` with parent value `v`, branch precision
//! `b` and lower belief `N(m, (l·P)⁻¹)` is drawn from
//!
//! ```text
//! N((b·v + l·m) / (b + l), ((b + l)·P)⁻¹)
//! ```
//!
//! Observed tips (`l = ∞`) are copied; a zero-length branch (`b = ∞`)
//! copies the parent.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use cyanea_core::{CyaneaError, Result};
use cyanea_phylo::{NodeId, PhyloTree};

use crate::belief::BeliefCache;
use crate::diffusion::{BranchScaling, DiffusionModel};
use crate::root::RootPosterior;

/// One trait matrix (`dim_trait × dim_data`) per node, indexed by `NodeId`.
#[derive(Debug, Clone, PartialEq)]
pub struct AncestralStates {
    states: Vec<DMatrix<f64>>,
}

impl AncestralStates {
    pub fn get(&self, id: NodeId) -> Option<&DMatrix<f64>> {
        self.states.get(id)
    }

    /// Replicate `k` of node `id`.
    pub fn replicate(&self, id: NodeId, k: usize) -> Option<DVector<f64>> {
        let m = self.states.get(id)?;
        (k < m.ncols()).then(|| m.column(k).into_owned())
    }

    /// Flat replicate-major values of node `id`, the layout tip data is given in.
    pub fn flat(&self, id: NodeId) -> Option<Vec<f64>> {
        self.states.get(id).map(|m| m.as_slice().to_vec())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Pre-order reconstruction over an evaluated belief cache.
pub struct AncestralSampler<'a, D: DiffusionModel> {
    tree: &'a PhyloTree,
    diffusion: &'a D,
    scaling: &'a BranchScaling,
    cache: &'a BeliefCache,
}

impl<'a, D: DiffusionModel> AncestralSampler<'a, D> {
    pub fn new(
        tree: &'a PhyloTree,
        diffusion: &'a D,
        scaling: &'a BranchScaling,
        cache: &'a BeliefCache,
    ) -> Self {
        Self {
            tree,
            diffusion,
            scaling,
            cache,
        }
    }

    /// One joint draw of every node state.
    pub fn sample<R: Rng + ?Sized>(&self, root: &RootPosterior, rng: &mut R) -> Result<AncestralStates> {
        self.walk(root, |factor, scale, n| {
            let z = DMatrix::<f64>::from_fn(factor.ncols(), n, |_, _| StandardNormal.sample(&mut *rng));
            Some(factor * z / scale.sqrt())
        })
    }

    /// Posterior means of every node state under the same recursion.
    pub fn expected(&self, root: &RootPosterior) -> Result<AncestralStates> {
        self.walk(root, |_, _, _| None)
    }

    fn walk<F>(&self, root: &RootPosterior, mut perturb: F) -> Result<AncestralStates>
    where
        F: FnMut(&DMatrix<f64>, f64, usize) -> Option<DMatrix<f64>>,
    {
        let normalizer = self.scaling.normalizer(self.tree)?;
        let root_id = self.tree.root();
        let shape = self
            .cache
            .get(root_id)
            .map(|b| b.mean.shape())
            .ok_or_else(|| CyaneaError::Contract("belief cache does not cover the tree".into()))?;
        if root.mean().shape() != shape {
            return Err(CyaneaError::Contract(format!(
                "root posterior is {:?}, beliefs are {:?}",
                root.mean().shape(),
                shape
            )));
        }

        let mut states = vec![DMatrix::zeros(shape.0, shape.1); self.tree.node_count()];
        for id in self.tree.iter_preorder() {
            let node = self
                .tree
                .get_node(id)
                .ok_or_else(|| CyaneaError::Contract(format!("node id {} out of range", id)))?;
            let Some(parent) = node.parent else {
                states[id] = match root {
                    RootPosterior::Point(m) => m.clone(),
                    RootPosterior::Gaussian { mean, factor, scale } => {
                        match perturb(factor, *scale, mean.ncols()) {
                            Some(offset) => mean + offset,
                            None => mean.clone(),
                        }
                    }
                };
                continue;
            };

            let belief = self
                .cache
                .get(id)
                .ok_or_else(|| CyaneaError::Contract(format!("no belief for node {}", id)))?;
            let lower = belief.lower_precision;
            if lower.is_infinite() {
                states[id] = belief.mean.clone();
                continue;
            }
            let branch = 1.0 / self.scaling.rescaled_length(self.tree, id, normalizer)?;
            if branch.is_infinite() {
                states[id] = states[parent].clone();
                continue;
            }
            let total = branch + lower;
            let mean = (&states[parent] * branch + &belief.mean * lower) / total;
            states[id] = match perturb(self.diffusion.draw_factor(), total, shape.1) {
                Some(offset) => mean + offset,
                None => mean,
            };
        }
        Ok(AncestralStates { states })
    }
}
