//! The integrated trait likelihood and its MCMC state lifecycle.
//!
//! [`IntegratedTraitLikelihood`] owns the tree, the diffusion parameters and
//! the tip data it was built from, so every mutation goes through it and is
//! reflected in the dirty-state tracker. Evaluation recomputes only the
//! nodes on paths from a change to the root.

use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::{debug, info, warn};

use cyanea_core::{CyaneaError, Result, StateStore, Summarizable};
use cyanea_phylo::{NodeId, PhyloTree};

use crate::ancestral::{AncestralSampler, AncestralStates};
use crate::belief::{BeliefCache, WishartStatistics};
use crate::data::TraitData;
use crate::dense;
use crate::diffusion::{BranchScaling, DiffusionModel, MultivariateDiffusion, TreeNormalization};
use crate::post_order::PostOrderAggregator;
use crate::root::{RootPosterior, RootPrior};
use crate::tracker::DirtyStateTracker;

/// Construction-time options.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraitLikelihoodConfig {
    pub root_prior: RootPrior,
    pub scaling: BranchScaling,
    /// Accumulate `Σ r·(mA − mB)(mA − mB)ᵀ` during evaluation.
    pub cache_outer_products: bool,
}

impl TraitLikelihoodConfig {
    pub fn new(root_prior: RootPrior) -> Self {
        Self {
            root_prior,
            scaling: BranchScaling::default(),
            cache_outer_products: false,
        }
    }

    pub fn with_scaling(mut self, scaling: BranchScaling) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_outer_products(mut self, enabled: bool) -> Self {
        self.cache_outer_products = enabled;
        self
    }
}

#[derive(Debug, Clone)]
struct Snapshot<D> {
    tree: PhyloTree,
    diffusion: D,
    data: TraitData,
    config: TraitLikelihoodConfig,
    cache: BeliefCache,
    tracker: DirtyStateTracker,
    log_likelihood: f64,
}

/// Marginal likelihood of tip traits under multivariate Brownian diffusion.
#[derive(Debug, Clone)]
pub struct IntegratedTraitLikelihood<D: DiffusionModel + Clone = MultivariateDiffusion> {
    tree: PhyloTree,
    diffusion: D,
    data: TraitData,
    config: TraitLikelihoodConfig,
    cache: BeliefCache,
    tracker: DirtyStateTracker,
    log_likelihood: f64,
    ancestral: Option<AncestralStates>,
    stored: Option<Box<Snapshot<D>>>,
}

impl<D: DiffusionModel + Clone> IntegratedTraitLikelihood<D> {
    /// Validate the inputs against each other and build an unevaluated likelihood.
    pub fn new(tree: PhyloTree, diffusion: D, data: TraitData, config: TraitLikelihoodConfig) -> Result<Self> {
        let dim = data.dim_trait();
        if diffusion.dim() != dim {
            return Err(CyaneaError::InvalidInput(format!(
                "diffusion precision is {}x{} but traits have dimension {}",
                diffusion.dim(),
                diffusion.dim(),
                dim
            )));
        }
        if config.root_prior.dim() != dim {
            return Err(CyaneaError::InvalidInput(format!(
                "root prior has dimension {} but traits have dimension {}",
                config.root_prior.dim(),
                dim
            )));
        }
        if !(config.scaling.tip_extension >= 0.0 && config.scaling.tip_extension.is_finite()) {
            return Err(CyaneaError::InvalidInput(format!(
                "tip extension must be a non-negative number, got {}",
                config.scaling.tip_extension
            )));
        }
        check_tree(&tree, &data).map_err(|e| match e {
            CyaneaError::Contract(msg) => CyaneaError::InvalidInput(msg),
            other => other,
        })?;

        let n = tree.node_count();
        info!(
            dim_trait = dim,
            dim_data = data.dim_data(),
            tips = data.len(),
            missing = data.len() - data.observed_count(),
            root_prior = config.root_prior.kind(),
            normalization = ?config.scaling.normalization,
            "integrated trait likelihood"
        );
        Ok(Self {
            cache: BeliefCache::new(n, dim, data.dim_data()),
            tracker: DirtyStateTracker::new(n),
            log_likelihood: f64::NAN,
            ancestral: None,
            stored: None,
            tree,
            diffusion,
            data,
            config,
        })
    }

    pub fn tree(&self) -> &PhyloTree {
        &self.tree
    }

    pub fn diffusion(&self) -> &D {
        &self.diffusion
    }

    pub fn data(&self) -> &TraitData {
        &self.data
    }

    pub fn config(&self) -> &TraitLikelihoodConfig {
        &self.config
    }

    pub fn beliefs(&self) -> &BeliefCache {
        &self.cache
    }

    pub fn tracker(&self) -> &DirtyStateTracker {
        &self.tracker
    }

    /// Log-likelihood, recomputing stale nodes first.
    ///
    /// Rejectable failures leave the likelihood dirty; see
    /// [`log_likelihood_or_reject`](Self::log_likelihood_or_reject).
    pub fn log_likelihood(&mut self) -> Result<f64> {
        if self.tracker.is_clean() {
            return Ok(self.log_likelihood);
        }
        let visited = PostOrderAggregator::new(&self.tree, &self.diffusion, &self.data, &self.config.scaling)
            .with_outer_products(self.config.cache_outer_products)
            .aggregate(&mut self.cache, &mut self.tracker)?;
        let root = self
            .cache
            .get(self.tree.root())
            .ok_or_else(|| CyaneaError::Contract("belief cache does not cover the root".into()))?;
        let value = self.cache.sum_remainders()
            + self
                .config
                .root_prior
                .log_marginal(&root.mean, root.lower_precision, &self.diffusion)?;
        if !value.is_finite() {
            return Err(CyaneaError::Numerical(format!("log-likelihood evaluated to {}", value)));
        }
        debug!(visited, log_likelihood = value, "recomputed trait likelihood");
        self.log_likelihood = value;
        self.ancestral = None;
        self.tracker.set_clean();
        Ok(value)
    }

    /// Like [`log_likelihood`](Self::log_likelihood), with rejectable failures mapped to `-∞`.
    pub fn log_likelihood_or_reject(&mut self) -> Result<f64> {
        match self.log_likelihood() {
            Err(e) if e.is_rejectable() => {
                debug!(reason = %e, "rejecting state");
                Ok(f64::NEG_INFINITY)
            }
            other => other,
        }
    }

    /// Invalidate everything.
    pub fn make_dirty(&mut self) {
        self.tracker.mark_all();
    }

    /// Swap in new diffusion parameters of the same dimension.
    pub fn set_diffusion(&mut self, diffusion: D) -> Result<()> {
        if diffusion.dim() != self.diffusion.dim() {
            return Err(CyaneaError::InvalidInput(format!(
                "diffusion dimension changed from {} to {}",
                self.diffusion.dim(),
                diffusion.dim()
            )));
        }
        self.diffusion = diffusion;
        self.tracker.mark_all();
        Ok(())
    }

    /// Change the root prior. Node beliefs stay valid.
    pub fn set_root_prior(&mut self, prior: RootPrior) -> Result<()> {
        if prior.dim() != self.data.dim_trait() {
            return Err(CyaneaError::InvalidInput(format!(
                "root prior has dimension {} but traits have dimension {}",
                prior.dim(),
                self.data.dim_trait()
            )));
        }
        self.config.root_prior = prior;
        self.tracker.mark_likelihood();
        Ok(())
    }

    /// Set the length of the branch above `node`.
    pub fn set_branch_length(&mut self, node: NodeId, length: f64) -> Result<()> {
        self.check_branch(node)?;
        self.tree.set_branch_length(node, length)?;
        self.mark_branch(node);
        Ok(())
    }

    /// Set the clock rate of the branch above `node`.
    pub fn set_branch_rate(&mut self, node: NodeId, rate: f64) -> Result<()> {
        self.check_branch(node)?;
        if let Some(n) = self.tree.get_node_mut(node) {
            n.rate = Some(rate);
        }
        self.mark_branch(node);
        Ok(())
    }

    /// Overwrite the observed values of `taxon`.
    pub fn set_tip_values(&mut self, taxon: &str, values: &[f64]) -> Result<()> {
        let leaf = self
            .tree
            .find_leaf(taxon)
            .ok_or_else(|| CyaneaError::InvalidInput(format!("unknown taxon {}", taxon)))?;
        self.data.set_values(taxon, values)?;
        self.tracker.mark_path(&self.tree, leaf);
        Ok(())
    }

    /// Replace the tree by one over the same taxa (a topology move).
    pub fn replace_tree(&mut self, tree: PhyloTree) -> Result<()> {
        check_tree(&tree, &self.data)?;
        let n = tree.node_count();
        self.tree = tree;
        self.cache = BeliefCache::new(n, self.data.dim_trait(), self.data.dim_data());
        self.tracker = DirtyStateTracker::new(n);
        self.ancestral = None;
        Ok(())
    }

    /// Draw every node state jointly from its posterior.
    pub fn redraw_ancestral_states(&mut self, seed: u64) -> Result<&AncestralStates> {
        if !self.tracker.is_clean() {
            return Err(CyaneaError::Contract(
                "ancestral states requested before the likelihood was evaluated".into(),
            ));
        }
        let posterior = self.root_posterior()?;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let states = AncestralSampler::new(&self.tree, &self.diffusion, &self.config.scaling, &self.cache)
            .sample(&posterior, &mut rng)?;
        self.tracker.set_states_drawn(true);
        Ok(self.ancestral.insert(states))
    }

    /// The current draw.
    pub fn ancestral_states(&self) -> Result<&AncestralStates> {
        match self.ancestral.as_ref() {
            Some(states) if self.tracker.states_drawn() => Ok(states),
            _ => Err(CyaneaError::Contract("no ancestral states drawn for the current state".into())),
        }
    }

    /// Flat replicate-major draw for `node`, evaluating and drawing with `seed` if needed.
    pub fn trait_for_node(&mut self, node: NodeId, seed: u64) -> Result<Vec<f64>> {
        if node >= self.tree.node_count() {
            return Err(CyaneaError::Contract(format!("node id {} out of range", node)));
        }
        if !self.tracker.states_drawn() {
            self.log_likelihood()?;
            self.redraw_ancestral_states(seed)?;
        }
        self.ancestral_states()?
            .flat(node)
            .ok_or_else(|| CyaneaError::Contract(format!("node id {} out of range", node)))
    }

    /// Posterior means of every node state.
    pub fn expected_ancestral_states(&self) -> Result<AncestralStates> {
        self.require_clean("expected ancestral states")?;
        let posterior = self.root_posterior()?;
        AncestralSampler::new(&self.tree, &self.diffusion, &self.config.scaling, &self.cache).expected(&posterior)
    }

    /// Lower precision of the root: how many units of `P` the tips pin it with.
    pub fn total_tree_precision(&self) -> Result<f64> {
        self.require_clean("tree precision")?;
        self.cache
            .get(self.tree.root())
            .map(|b| b.lower_precision)
            .ok_or_else(|| CyaneaError::Contract("belief cache does not cover the root".into()))
    }

    /// Number of observed scalar values.
    pub fn number_of_datum(&self) -> usize {
        self.data.observed_count() * self.data.dim_trait() * self.data.dim_data()
    }

    /// Tree-wide outer-product scale and degrees of freedom of the last evaluation.
    pub fn outer_products(&self) -> Result<WishartStatistics> {
        if !self.config.cache_outer_products {
            return Err(CyaneaError::Contract("outer products are not being cached".into()));
        }
        self.require_clean("outer products")?;
        Ok(self.cache.wishart_statistics())
    }

    /// Shared-path variance of the observed tips under the current scaling.
    pub fn tree_variance(&self) -> Result<(Vec<String>, DMatrix<f64>)> {
        dense::tree_variance(&self.tree, &self.data, &self.config.scaling)
    }

    /// Log-likelihood from the full tip covariance matrix.
    pub fn dense_log_likelihood(&self) -> Result<f64> {
        dense::dense_log_likelihood(
            &self.tree,
            &self.diffusion,
            &self.data,
            &self.config.scaling,
            &self.config.root_prior,
        )
    }

    fn root_posterior(&self) -> Result<RootPosterior> {
        let root = self
            .cache
            .get(self.tree.root())
            .ok_or_else(|| CyaneaError::Contract("belief cache does not cover the root".into()))?;
        self.config
            .root_prior
            .posterior(&root.mean, root.lower_precision, &self.diffusion)
    }

    fn require_clean(&self, what: &str) -> Result<()> {
        if self.tracker.is_clean() {
            Ok(())
        } else {
            Err(CyaneaError::Contract(format!("{} requested before the likelihood was evaluated", what)))
        }
    }

    fn check_branch(&self, node: NodeId) -> Result<()> {
        match self.tree.get_node(node) {
            None => Err(CyaneaError::Contract(format!("node id {} out of range", node))),
            Some(n) if n.is_root() => Err(CyaneaError::Contract("the root has no branch".into())),
            Some(_) => Ok(()),
        }
    }

    fn mark_branch(&mut self, node: NodeId) {
        if self.config.scaling.normalization == TreeNormalization::Off {
            self.tracker.mark_path(&self.tree, node);
        } else {
            self.tracker.mark_all();
        }
    }
}

impl IntegratedTraitLikelihood<MultivariateDiffusion> {
    /// Replace the diffusion precision matrix.
    pub fn set_diffusion_precision(&mut self, precision: DMatrix<f64>) -> Result<()> {
        self.diffusion.set_precision(precision)?;
        self.tracker.mark_all();
        Ok(())
    }
}

impl<D: DiffusionModel + Clone> StateStore for IntegratedTraitLikelihood<D> {
    /// Snapshot the current state, evaluating it first if it is dirty.
    ///
    /// A restored snapshot is therefore clean unless the stored state itself
    /// failed to evaluate.
    fn store_state(&mut self) {
        if !self.tracker.is_clean() {
            if let Err(e) = self.log_likelihood() {
                debug!(reason = %e, "storing a state that does not evaluate");
            }
        }
        debug!(log_likelihood = self.log_likelihood, clean = self.tracker.is_clean(), "store");
        self.stored = Some(Box::new(Snapshot {
            tree: self.tree.clone(),
            diffusion: self.diffusion.clone(),
            data: self.data.clone(),
            config: self.config.clone(),
            cache: self.cache.clone(),
            tracker: self.tracker.clone(),
            log_likelihood: self.log_likelihood,
        }));
    }

    fn restore_state(&mut self) -> Result<()> {
        let Some(snapshot) = self.stored.take() else {
            warn!("restore without a stored state");
            return Err(CyaneaError::Contract("restore_state called without store_state".into()));
        };
        let snapshot = *snapshot;
        self.tree = snapshot.tree;
        self.diffusion = snapshot.diffusion;
        self.data = snapshot.data;
        self.config = snapshot.config;
        self.cache = snapshot.cache;
        self.tracker = snapshot.tracker;
        self.tracker.set_states_drawn(false);
        self.log_likelihood = snapshot.log_likelihood;
        self.ancestral = None;
        debug!(log_likelihood = self.log_likelihood, "restore");
        Ok(())
    }

    fn accept_state(&mut self) {
        self.stored = None;
    }
}

impl<D: DiffusionModel + Clone> Summarizable for IntegratedTraitLikelihood<D> {
    fn summary(&self) -> String {
        let state = if self.tracker.is_clean() {
            format!("log L {:.6}", self.log_likelihood)
        } else {
            "dirty".to_string()
        };
        format!(
            "IntegratedTraitLikelihood: {} tips ({} missing), {} traits x {} replicates, {} root, {}",
            self.data.len(),
            self.data.len() - self.data.observed_count(),
            self.data.dim_trait(),
            self.data.dim_data(),
            self.config.root_prior.kind(),
            state
        )
    }
}

/// Leaves and taxa must match one to one, and every branch needs a length.
fn check_tree(tree: &PhyloTree, data: &TraitData) -> Result<()> {
    let mut names = Vec::with_capacity(tree.leaf_count());
    for id in tree.leaves() {
        let node = tree
            .get_node(id)
            .ok_or_else(|| CyaneaError::Contract(format!("node id {} out of range", id)))?;
        let name = node
            .name
            .as_deref()
            .ok_or_else(|| CyaneaError::InvalidInput(format!("leaf {} has no name", id)))?;
        names.push(name);
    }
    for node in tree.iter_preorder().filter_map(|id| tree.get_node(id)) {
        if !node.is_root() && node.branch_length.is_none() {
            return Err(CyaneaError::InvalidInput(format!("node {} has no branch length", node.id)));
        }
    }
    names.sort_unstable();
    if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
        return Err(CyaneaError::InvalidInput(format!("leaf name {} appears twice", w[0])));
    }
    let taxa: Vec<&str> = data.taxa().collect();
    if names != taxa {
        return Err(CyaneaError::Contract(format!(
            "tree leaves {:?} do not match the trait data taxa {:?}",
            names, taxa
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    const GOLDEN: f64 = -19.770479253240143;

    fn close(a: f64, b: f64, rel: f64) -> bool {
        (a - b).abs() <= rel * a.abs().max(b.abs()).max(1.0)
    }

    fn three_tip(prior: RootPrior) -> IntegratedTraitLikelihood {
        let tree = PhyloTree::from_newick("((A:1,B:1):2,C:3);").unwrap();
        let mut data = TraitData::new(1, 1).unwrap();
        data.insert("A", &[5.0]).unwrap();
        data.insert("B", &[7.0]).unwrap();
        data.insert("C", &[10.0]).unwrap();
        let diffusion = MultivariateDiffusion::isotropic(1, 1.0).unwrap();
        IntegratedTraitLikelihood::new(tree, diffusion, data, TraitLikelihoodConfig::new(prior)).unwrap()
    }

    fn conjugate_prior() -> RootPrior {
        RootPrior::fully_conjugate(DVector::from_vec(vec![0.0]), 1.0).unwrap()
    }

    /// Four tips, two traits, two replicates, one missing tip.
    fn bivariate(prior: RootPrior, scaling: BranchScaling) -> IntegratedTraitLikelihood {
        let tree = PhyloTree::from_newick("((A:0.7,B[&rate=1.5]:1.2):0.4,(C:2.1,D:0.3):0.9);").unwrap();
        let mut data = TraitData::new(2, 2).unwrap();
        data.insert("A", &[1.0, -0.5, 0.8, 0.1]).unwrap();
        data.insert("B", &[0.2, 0.4, -1.1, 2.0]).unwrap();
        data.insert("C", &[-2.0, 1.5, 0.0, 0.7]).unwrap();
        data.insert_missing("D").unwrap();
        let var = DMatrix::from_row_slice(2, 2, &[1.3, -0.4, -0.4, 0.6]);
        let diffusion = MultivariateDiffusion::from_variance(var).unwrap();
        let config = TraitLikelihoodConfig::new(prior)
            .with_scaling(scaling)
            .with_outer_products(true);
        IntegratedTraitLikelihood::new(tree, diffusion, data, config).unwrap()
    }

    fn bivariate_priors() -> Vec<RootPrior> {
        vec![
            RootPrior::fixed(DVector::from_vec(vec![0.3, -0.2])).unwrap(),
            RootPrior::fully_conjugate(DVector::from_vec(vec![0.5, 1.0]), 0.8).unwrap(),
            RootPrior::semi_conjugate(
                DVector::from_vec(vec![-0.5, 0.25]),
                DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]),
            )
            .unwrap(),
        ]
    }

    #[test]
    fn three_tip_golden_value() {
        let mut lik = three_tip(conjugate_prior());
        let value = lik.log_likelihood().unwrap();
        assert!((value - GOLDEN).abs() < 1e-10, "got {}", value);

        let a = lik.tree().find_leaf("A").unwrap();
        let cherry = lik.tree().get_node(a).unwrap().parent.unwrap();
        let belief = lik.beliefs().get(cherry).unwrap();
        assert!((belief.mean[(0, 0)] - 6.0).abs() < 1e-12);
        assert!((belief.lower_precision - 2.0).abs() < 1e-12);

        let dense = lik.dense_log_likelihood().unwrap();
        assert!(close(value, dense, 1e-8), "{} vs {}", value, dense);
    }

    #[test]
    fn single_tip_is_prior_predictive() {
        let tree = PhyloTree::from_newick("A:1;").unwrap();
        let mut data = TraitData::new(1, 1).unwrap();
        data.insert("A", &[2.0]).unwrap();
        let diffusion = MultivariateDiffusion::isotropic(1, 1.5).unwrap();
        let prior = RootPrior::fully_conjugate(DVector::from_vec(vec![0.5]), 2.0).unwrap();
        let mut lik =
            IntegratedTraitLikelihood::new(tree, diffusion, data, TraitLikelihoodConfig::new(prior)).unwrap();
        // tip sits on the root, so only the prior variance Σ/k remains
        let var = 1.5 / 2.0;
        let expected = -0.5 * (2.0 * std::f64::consts::PI * var).ln() - 0.5 * 1.5f64.powi(2) / var;
        assert!((lik.log_likelihood().unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn matches_dense_for_every_prior() {
        let scalings = [
            BranchScaling::default(),
            BranchScaling::default()
                .with_normalization(TreeNormalization::TreeHeight)
                .with_tip_extension(0.2),
            BranchScaling::default()
                .with_normalization(TreeNormalization::TreeLength)
                .with_reciprocal_rates(true),
        ];
        for prior in bivariate_priors() {
            for scaling in &scalings {
                let mut lik = bivariate(prior.clone(), scaling.clone());
                let bp = lik.log_likelihood().unwrap();
                let dense = lik.dense_log_likelihood().unwrap();
                assert!(close(bp, dense, 1e-8), "{}: {} vs {}", prior.kind(), bp, dense);
            }
        }
    }

    #[test]
    fn missing_tip_contributes_nothing() {
        let mut with_missing = bivariate(bivariate_priors().remove(1), BranchScaling::default());
        let tree = PhyloTree::from_newick("((A:0.7,B[&rate=1.5]:1.2):0.4,C:3.0);").unwrap();
        let mut data = TraitData::new(2, 2).unwrap();
        for taxon in ["A", "B", "C"] {
            let values = with_missing.data().get(taxon).unwrap().values().as_slice().to_vec();
            data.insert(taxon, &values).unwrap();
        }
        let mut pruned = IntegratedTraitLikelihood::new(
            tree,
            with_missing.diffusion().clone(),
            data,
            with_missing.config().clone(),
        )
        .unwrap();
        let a = with_missing.log_likelihood().unwrap();
        let b = pruned.log_likelihood().unwrap();
        assert!(close(a, b, 1e-12), "{} vs {}", a, b);
        assert_eq!(with_missing.number_of_datum(), 12);
    }

    #[test]
    fn cached_value_returned_when_clean() {
        let mut lik = three_tip(conjugate_prior());
        let first = lik.log_likelihood().unwrap();
        assert!(lik.tracker().is_clean());
        assert_eq!(lik.log_likelihood().unwrap().to_bits(), first.to_bits());
        lik.make_dirty();
        assert_eq!(lik.tracker().pending(), lik.tree().node_count());
        assert_eq!(lik.log_likelihood().unwrap().to_bits(), first.to_bits());
    }

    #[test]
    fn store_restore_is_bit_identical() {
        let mut lik = bivariate(bivariate_priors().remove(2), BranchScaling::default());
        let before = lik.log_likelihood().unwrap();
        lik.store_state();
        lik.set_diffusion_precision(DMatrix::from_row_slice(2, 2, &[3.0, 0.5, 0.5, 2.0]))
            .unwrap();
        let proposed = lik.log_likelihood().unwrap();
        assert_ne!(proposed, before);
        lik.restore_state().unwrap();
        assert!(lik.tracker().is_clean());
        assert_eq!(lik.log_likelihood().unwrap().to_bits(), before.to_bits());
        lik.make_dirty();
        assert_eq!(lik.log_likelihood().unwrap().to_bits(), before.to_bits());
    }

    #[test]
    fn store_while_dirty_restores_a_clean_state() {
        let mut lik = bivariate(bivariate_priors().remove(1), BranchScaling::default());
        lik.log_likelihood().unwrap();
        let c = lik.tree().find_leaf("C").unwrap();
        lik.set_branch_length(c, 3.0).unwrap();
        assert!(!lik.tracker().is_clean());
        lik.store_state();
        assert!(lik.tracker().is_clean());
        let stored = lik.log_likelihood().unwrap();

        lik.set_diffusion_precision(DMatrix::from_row_slice(2, 2, &[3.0, 0.5, 0.5, 2.0]))
            .unwrap();
        lik.log_likelihood().unwrap();
        lik.restore_state().unwrap();
        assert!(lik.tracker().is_clean());
        assert_eq!(lik.tree().get_node(c).unwrap().branch_length, Some(3.0));

        let mut fresh = IntegratedTraitLikelihood::new(
            lik.tree().clone(),
            lik.diffusion().clone(),
            lik.data().clone(),
            lik.config().clone(),
        )
        .unwrap();
        let full = fresh.log_likelihood().unwrap();
        assert_eq!(lik.log_likelihood().unwrap().to_bits(), stored.to_bits());
        assert!(close(stored, full, 1e-12), "{} vs {}", stored, full);
    }

    #[test]
    fn store_of_a_failing_state_stays_rejectable() {
        let mut lik = three_tip(conjugate_prior());
        lik.log_likelihood().unwrap();
        let a = lik.tree().find_leaf("A").unwrap();
        lik.set_branch_length(a, -1.0).unwrap();
        lik.store_state();
        assert!(!lik.tracker().is_clean());
        lik.set_branch_length(a, 1.0).unwrap();
        lik.log_likelihood().unwrap();
        lik.restore_state().unwrap();
        assert!(lik.log_likelihood().unwrap_err().is_rejectable());
    }

    #[test]
    fn restore_without_store_is_contract_error() {
        let mut lik = three_tip(conjugate_prior());
        assert!(matches!(lik.restore_state(), Err(CyaneaError::Contract(_))));
        lik.store_state();
        lik.accept_state();
        assert!(lik.restore_state().is_err());
    }

    #[test]
    fn incremental_updates_match_fresh_evaluation() {
        let mut lik = bivariate(bivariate_priors().remove(1), BranchScaling::default());
        lik.log_likelihood().unwrap();
        let moves: Vec<(&str, f64)> = vec![("A", 0.3), ("C", 1.7), ("B", 2.2), ("D", 0.05)];
        for (i, (taxon, length)) in moves.into_iter().enumerate() {
            lik.store_state();
            let id = lik.tree().find_leaf(taxon).unwrap();
            lik.set_branch_length(id, length).unwrap();
            if i == 2 {
                lik.set_tip_values("A", &[0.0, 0.0, 1.0, 1.0]).unwrap();
            }
            let pending = lik.tracker().pending();
            assert!(pending < lik.tree().node_count(), "{} nodes pending", pending);
            let incremental = lik.log_likelihood().unwrap();

            let mut fresh = IntegratedTraitLikelihood::new(
                lik.tree().clone(),
                lik.diffusion().clone(),
                lik.data().clone(),
                lik.config().clone(),
            )
            .unwrap();
            let full = fresh.log_likelihood().unwrap();
            assert!(close(incremental, full, 1e-12), "{} vs {}", incremental, full);

            if i == 1 {
                let proposed = lik.beliefs().clone();
                lik.restore_state().unwrap();
                assert_ne!(&proposed, lik.beliefs());
            } else {
                lik.accept_state();
            }
        }
    }

    #[test]
    fn normalized_branch_change_invalidates_everything() {
        let scaling = BranchScaling::default().with_normalization(TreeNormalization::TreeLength);
        let mut lik = bivariate(bivariate_priors().remove(0), scaling);
        lik.log_likelihood().unwrap();
        let c = lik.tree().find_leaf("C").unwrap();
        lik.set_branch_rate(c, 2.0).unwrap();
        assert_eq!(lik.tracker().pending(), lik.tree().node_count());
        let value = lik.log_likelihood().unwrap();
        assert!(close(value, lik.dense_log_likelihood().unwrap(), 1e-8));
    }

    #[test]
    fn negative_branch_is_rejected_not_fatal() {
        let mut lik = three_tip(conjugate_prior());
        lik.log_likelihood().unwrap();
        lik.store_state();
        let a = lik.tree().find_leaf("A").unwrap();
        lik.set_branch_length(a, -1.0).unwrap();
        assert!(lik.log_likelihood().unwrap_err().is_rejectable());
        assert_eq!(lik.log_likelihood_or_reject().unwrap(), f64::NEG_INFINITY);
        assert!(!lik.tracker().is_clean());
        lik.restore_state().unwrap();
        assert!((lik.log_likelihood().unwrap() - GOLDEN).abs() < 1e-10);
    }

    #[test]
    fn zero_length_cherry_under_fixed_root_is_rejectable() {
        let tree = PhyloTree::from_newick("(A:0,B:0);").unwrap();
        let mut data = TraitData::new(1, 1).unwrap();
        data.insert("A", &[1.0]).unwrap();
        data.insert("B", &[2.0]).unwrap();
        let diffusion = MultivariateDiffusion::isotropic(1, 1.0).unwrap();
        let config = TraitLikelihoodConfig::new(RootPrior::origin(1));
        let mut lik = IntegratedTraitLikelihood::new(tree, diffusion, data, config).unwrap();
        assert_eq!(lik.log_likelihood_or_reject().unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn ancestral_draw_requires_evaluation() {
        let mut lik = three_tip(conjugate_prior());
        assert!(matches!(lik.redraw_ancestral_states(1), Err(CyaneaError::Contract(_))));
        assert!(lik.ancestral_states().is_err());
        assert!(lik.expected_ancestral_states().is_err());

        lik.log_likelihood().unwrap();
        let c = lik.tree().find_leaf("C").unwrap();
        let drawn = lik.redraw_ancestral_states(1).unwrap().get(c).unwrap()[(0, 0)];
        assert_eq!(drawn, 10.0);
        assert!(lik.ancestral_states().is_ok());

        lik.set_branch_length(c, 2.5).unwrap();
        assert!(lik.ancestral_states().is_err());
    }

    #[test]
    fn redraws_over_seeds_center_on_posterior_mean() {
        let mut lik = three_tip(conjugate_prior());
        lik.log_likelihood().unwrap();
        let expected = lik.expected_ancestral_states().unwrap();
        let a = lik.tree().find_leaf("A").unwrap();
        let cherry = lik.tree().get_node(a).unwrap().parent.unwrap();
        let root = lik.tree().root();

        let draws = 10_000u64;
        let (mut sum_root, mut sum_cherry) = (0.0, 0.0);
        for seed in 0..draws {
            let states = lik.redraw_ancestral_states(seed).unwrap();
            sum_root += states.get(root).unwrap()[(0, 0)];
            sum_cherry += states.get(cherry).unwrap()[(0, 0)];
        }
        let n = draws as f64;
        let root_mean = expected.get(root).unwrap()[(0, 0)];
        let cherry_mean = expected.get(cherry).unwrap()[(0, 0)];
        assert!((sum_root / n - root_mean).abs() < 0.04, "root {} vs {}", sum_root / n, root_mean);
        assert!((sum_cherry / n - cherry_mean).abs() < 0.04, "cherry {} vs {}", sum_cherry / n, cherry_mean);
    }

    #[test]
    fn trait_for_node_draws_on_demand() {
        let mut lik = three_tip(conjugate_prior());
        let root = lik.tree().root();
        let first = lik.trait_for_node(root, 9).unwrap();
        assert_eq!(first.len(), 1);
        // a second call reuses the existing draw
        assert_eq!(lik.trait_for_node(root, 10).unwrap(), first);
        assert!(lik.trait_for_node(99, 1).is_err());
    }

    #[test]
    fn restore_clears_ancestral_draw() {
        let mut lik = three_tip(conjugate_prior());
        lik.log_likelihood().unwrap();
        lik.store_state();
        lik.redraw_ancestral_states(3).unwrap();
        lik.restore_state().unwrap();
        assert!(lik.ancestral_states().is_err());
    }

    #[test]
    fn expected_states_and_precision() {
        let tree = PhyloTree::from_newick("(A:1,B:1);").unwrap();
        let mut data = TraitData::new(1, 1).unwrap();
        data.insert("A", &[5.0]).unwrap();
        data.insert("B", &[7.0]).unwrap();
        let diffusion = MultivariateDiffusion::isotropic(1, 1.0).unwrap();
        let mut lik =
            IntegratedTraitLikelihood::new(tree, diffusion, data, TraitLikelihoodConfig::new(conjugate_prior()))
                .unwrap();
        lik.log_likelihood().unwrap();
        assert!((lik.total_tree_precision().unwrap() - 2.0).abs() < 1e-12);
        let expected = lik.expected_ancestral_states().unwrap();
        assert!((expected.get(lik.tree().root()).unwrap()[(0, 0)] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn outer_products_sum_over_merges() {
        let mut lik = bivariate(bivariate_priors().remove(0), BranchScaling::default());
        assert!(lik.outer_products().is_err());
        lik.log_likelihood().unwrap();
        let stats = lik.outer_products().unwrap();
        let op = &stats.scale;
        assert_eq!(op.shape(), (2, 2));
        assert!((op[(0, 1)] - op[(1, 0)]).abs() < 1e-12);
        assert!(op[(0, 0)] > 0.0 && op[(1, 1)] > 0.0);
        // A·B and (A,B)·C merge, D is missing; two replicates each
        assert_eq!(stats.df, 4);

        let mut plain = three_tip(conjugate_prior());
        plain.log_likelihood().unwrap();
        assert!(matches!(plain.outer_products(), Err(CyaneaError::Contract(_))));
    }

    #[test]
    fn outer_products_without_observations_have_no_df() {
        let tree = PhyloTree::from_newick("((A:1,B:1):0.5,C:2);").unwrap();
        let mut data = TraitData::new(2, 1).unwrap();
        for taxon in ["A", "B", "C"] {
            data.insert_missing(taxon).unwrap();
        }
        let config = TraitLikelihoodConfig::new(RootPrior::origin(2)).with_outer_products(true);
        let diffusion = MultivariateDiffusion::isotropic(2, 1.0).unwrap();
        let mut lik = IntegratedTraitLikelihood::new(tree, diffusion, data, config).unwrap();
        assert_eq!(lik.log_likelihood().unwrap(), 0.0);
        let stats = lik.outer_products().unwrap();
        assert_eq!(stats.df, 0);
        assert_eq!(stats.scale, DMatrix::zeros(2, 2));
    }

    #[test]
    fn root_prior_change_keeps_beliefs() {
        let mut lik = three_tip(conjugate_prior());
        lik.log_likelihood().unwrap();
        lik.set_root_prior(RootPrior::fully_conjugate(DVector::from_vec(vec![6.0]), 1.0).unwrap())
            .unwrap();
        assert_eq!(lik.tracker().pending(), 0);
        let moved = lik.log_likelihood().unwrap();
        assert!(moved > GOLDEN);
        assert!(close(moved, lik.dense_log_likelihood().unwrap(), 1e-8));
        assert!(lik.set_root_prior(RootPrior::origin(2)).is_err());
    }

    #[test]
    fn replace_tree_checks_taxa() {
        let mut lik = three_tip(conjugate_prior());
        lik.log_likelihood().unwrap();
        let other = PhyloTree::from_newick("((A:1,C:1):2,B:3);").unwrap();
        lik.replace_tree(other).unwrap();
        assert!(!lik.tracker().is_clean());
        let value = lik.log_likelihood().unwrap();
        assert!(close(value, lik.dense_log_likelihood().unwrap(), 1e-8));

        let wrong = PhyloTree::from_newick("((A:1,Z:1):2,B:3);").unwrap();
        assert!(matches!(lik.replace_tree(wrong), Err(CyaneaError::Contract(_))));
    }

    #[test]
    fn construction_rejects_mismatches() {
        let tree = || PhyloTree::from_newick("(A:1,B:1);").unwrap();
        let mut data = TraitData::new(2, 1).unwrap();
        data.insert("A", &[1.0, 2.0]).unwrap();
        data.insert("B", &[1.0, 2.0]).unwrap();
        let d1 = MultivariateDiffusion::isotropic(1, 1.0).unwrap();
        let d2 = MultivariateDiffusion::isotropic(2, 1.0).unwrap();

        let wrong_diffusion =
            IntegratedTraitLikelihood::new(tree(), d1, data.clone(), TraitLikelihoodConfig::new(RootPrior::origin(2)));
        assert!(matches!(wrong_diffusion, Err(CyaneaError::InvalidInput(_))));

        let wrong_prior =
            IntegratedTraitLikelihood::new(tree(), d2.clone(), data.clone(), TraitLikelihoodConfig::new(RootPrior::origin(1)));
        assert!(matches!(wrong_prior, Err(CyaneaError::InvalidInput(_))));

        let mut extra = data.clone();
        extra.insert("C", &[0.0, 0.0]).unwrap();
        let wrong_taxa =
            IntegratedTraitLikelihood::new(tree(), d2.clone(), extra, TraitLikelihoodConfig::new(RootPrior::origin(2)));
        assert!(matches!(wrong_taxa, Err(CyaneaError::InvalidInput(_))));

        let no_length = PhyloTree::from_newick("(A,B:1);").unwrap();
        let missing_length =
            IntegratedTraitLikelihood::new(no_length, d2, data, TraitLikelihoodConfig::new(RootPrior::origin(2)));
        assert!(matches!(missing_length, Err(CyaneaError::InvalidInput(_))));
    }

    #[test]
    fn summary_reports_state() {
        let mut lik = three_tip(conjugate_prior());
        assert!(lik.summary().ends_with("dirty"));
        lik.log_likelihood().unwrap();
        assert!(lik.summary().contains("fully-conjugate root"));
        assert!(lik.summary().contains("log L -19.770479"));
    }
}
