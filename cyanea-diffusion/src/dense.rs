//! Brute-force likelihood through the full tip covariance matrix.
//!
//! Under Brownian diffusion the observed tips are jointly Gaussian with
//! covariance `V ⊗ Σ + J ⊗ R`, where `V_ij` is the rescaled depth of the most
//! recent common ancestor of tips `i` and `j` and `R` is the prior covariance
//! of the root. One `O((tips·d)³)` factorization per evaluation, so this is
//! meant for checking the belief-propagation result on small trees.

use nalgebra::{DMatrix, DVector};

use cyanea_core::{CyaneaError, Result};
use cyanea_phylo::{NodeId, PhyloTree};

use crate::data::TraitData;
use crate::diffusion::{BranchScaling, DiffusionModel};
use crate::gaussian::{ln_det, LOG_SQRT_2PI};
use crate::root::RootPrior;

/// Shared-path variance of the observed tips, in sorted taxon order.
pub fn tree_variance(
    tree: &PhyloTree,
    data: &TraitData,
    scaling: &BranchScaling,
) -> Result<(Vec<String>, DMatrix<f64>)> {
    let depth = rescaled_depths(tree, scaling)?;
    let mut taxa = Vec::new();
    let mut ids: Vec<NodeId> = Vec::new();
    for taxon in data.taxa() {
        if data.get(taxon).is_some_and(|t| t.is_missing()) {
            continue;
        }
        let id = tree
            .find_leaf(taxon)
            .ok_or_else(|| CyaneaError::InvalidInput(format!("taxon {} is not a leaf of the tree", taxon)))?;
        taxa.push(taxon.to_string());
        ids.push(id);
    }

    let m = ids.len();
    let mut v = DMatrix::zeros(m, m);
    for i in 0..m {
        v[(i, i)] = depth[ids[i]];
        for j in (i + 1)..m {
            let shared = depth[tree.mrca(ids[i], ids[j])?];
            v[(i, j)] = shared;
            v[(j, i)] = shared;
        }
    }
    Ok((taxa, v))
}

/// Log-likelihood of all observed tips from the dense joint Gaussian.
pub fn dense_log_likelihood<D: DiffusionModel>(
    tree: &PhyloTree,
    diffusion: &D,
    data: &TraitData,
    scaling: &BranchScaling,
    prior: &RootPrior,
) -> Result<f64> {
    let (taxa, v) = tree_variance(tree, data, scaling)?;
    if taxa.is_empty() {
        return Ok(0.0);
    }
    let d = data.dim_trait();
    let m = taxa.len();

    let mut covariance = v.kronecker(diffusion.variance());
    if let Some(root) = prior.covariance(diffusion) {
        covariance += DMatrix::from_element(m, m, 1.0).kronecker(&root);
    }
    let chol = covariance.cholesky().ok_or_else(|| {
        CyaneaError::Numerical("dense tip covariance is not positive definite".into())
    })?;
    let log_det = ln_det(&chol);

    let prior_mean = prior.mean();
    let mut total = 0.0;
    for k in 0..data.dim_data() {
        let mut residual = DVector::zeros(m * d);
        for (t, taxon) in taxa.iter().enumerate() {
            let tip = data
                .get(taxon)
                .ok_or_else(|| CyaneaError::Contract(format!("taxon {} vanished", taxon)))?;
            for i in 0..d {
                residual[t * d + i] = tip.values()[(i, k)] - prior_mean[i];
            }
        }
        let solved = chol.solve(&residual);
        total += -((m * d) as f64) * LOG_SQRT_2PI - 0.5 * log_det - 0.5 * residual.dot(&solved);
    }
    Ok(total)
}

fn rescaled_depths(tree: &PhyloTree, scaling: &BranchScaling) -> Result<Vec<f64>> {
    let normalizer = scaling.normalizer(tree)?;
    let mut depth = vec![0.0; tree.node_count()];
    for id in tree.iter_preorder() {
        if let Some(parent) = tree.get_node(id).and_then(|n| n.parent) {
            depth[id] = depth[parent] + scaling.rescaled_length(tree, id, normalizer)?;
        }
    }
    Ok(depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::MultivariateDiffusion;

    #[test]
    fn variance_skips_missing_tips() {
        let tree = PhyloTree::from_newick("((A:1,B:2):0.5,(C:1,D:1):1);").unwrap();
        let mut data = TraitData::new(1, 1).unwrap();
        data.insert("A", &[0.0]).unwrap();
        data.insert("B", &[0.0]).unwrap();
        data.insert_missing("C").unwrap();
        data.insert("D", &[0.0]).unwrap();
        let (taxa, v) = tree_variance(&tree, &data, &BranchScaling::default()).unwrap();
        assert_eq!(taxa, vec!["A", "B", "D"]);
        let expected = DMatrix::from_row_slice(3, 3, &[1.5, 0.5, 0.0, 0.5, 2.5, 0.0, 0.0, 0.0, 2.0]);
        assert_eq!(v, expected);
    }

    #[test]
    fn variance_follows_tip_extension() {
        let tree = PhyloTree::from_newick("(A:1,B:1);").unwrap();
        let mut data = TraitData::new(1, 1).unwrap();
        data.insert("A", &[0.0]).unwrap();
        data.insert("B", &[0.0]).unwrap();
        let scaling = BranchScaling::default().with_tip_extension(0.5);
        let (_, v) = tree_variance(&tree, &data, &scaling).unwrap();
        assert_eq!(v[(0, 0)], 1.5);
        assert_eq!(v[(0, 1)], 0.0);
    }

    #[test]
    fn two_tips_fixed_root() {
        let tree = PhyloTree::from_newick("(A:1,B:3);").unwrap();
        let mut data = TraitData::new(1, 1).unwrap();
        data.insert("A", &[1.0]).unwrap();
        data.insert("B", &[-2.0]).unwrap();
        let diffusion = MultivariateDiffusion::isotropic(1, 2.0).unwrap();
        let got = dense_log_likelihood(&tree, &diffusion, &data, &BranchScaling::default(), &RootPrior::origin(1))
            .unwrap();
        // independent tips with variances 2 and 6
        let expected = -2.0 * LOG_SQRT_2PI - 0.5 * (2.0f64.ln() + 6.0f64.ln()) - 0.5 * (1.0 / 2.0 + 4.0 / 6.0);
        assert!((got - expected).abs() < 1e-12);
    }
}
