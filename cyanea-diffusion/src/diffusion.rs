//! Multivariate Brownian diffusion parameters and branch rescaling.
//!
//! The diffusion model supplies one trait-space precision matrix `P` shared
//! by every branch. A branch of rescaled length `t` contributes variance
//! `t · P⁻¹`; [`BranchScaling`] turns raw branch lengths into `t` by applying
//! clock rates, optional tree normalization and a tip extension.

use nalgebra::DMatrix;

use cyanea_core::{CyaneaError, Result};
use cyanea_phylo::{NodeId, PhyloTree};

use crate::gaussian::{ln_det, positive_definite, precision_to_draw_factor};

/// Source of the trait precision matrix and its derived quantities.
pub trait DiffusionModel {
    /// Trait-space precision matrix `P` (`dim × dim`).
    fn precision(&self) -> &DMatrix<f64>;

    /// `ln |P|`.
    fn log_det_precision(&self) -> f64;

    /// `P⁻¹`.
    fn variance(&self) -> &DMatrix<f64>;

    /// `L⁻ᵀ` where `P = L·Lᵀ`; maps standard normals to draws with precision `P`.
    fn draw_factor(&self) -> &DMatrix<f64>;

    /// Trait dimension.
    fn dim(&self) -> usize {
        self.precision().nrows()
    }
}

/// A diffusion model parameterized directly by its precision matrix.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MultivariateDiffusion {
    precision: DMatrix<f64>,
    log_det_precision: f64,
    variance: DMatrix<f64>,
    draw_factor: DMatrix<f64>,
}

impl MultivariateDiffusion {
    /// Build from a symmetric positive-definite precision matrix.
    pub fn new(precision: DMatrix<f64>) -> Result<Self> {
        let chol = positive_definite(&precision, "diffusion precision")?;
        if precision.nrows() == 1 {
            let p = precision[(0, 0)];
            return Ok(Self {
                log_det_precision: p.ln(),
                variance: DMatrix::from_element(1, 1, 1.0 / p),
                draw_factor: DMatrix::from_element(1, 1, 1.0 / p.sqrt()),
                precision,
            });
        }
        let draw_factor = precision_to_draw_factor(&chol)
            .map_err(|_| CyaneaError::InvalidInput("diffusion precision is singular".into()))?;
        Ok(Self {
            log_det_precision: ln_det(&chol),
            variance: chol.inverse(),
            draw_factor,
            precision,
        })
    }

    /// Build from a variance (covariance) matrix.
    pub fn from_variance(variance: DMatrix<f64>) -> Result<Self> {
        let chol = positive_definite(&variance, "diffusion variance")?;
        Self::new(chol.inverse())
    }

    /// Independent traits with a common per-unit-time variance.
    pub fn isotropic(dim: usize, variance: f64) -> Result<Self> {
        if !(variance > 0.0 && variance.is_finite()) {
            return Err(CyaneaError::InvalidInput(format!(
                "isotropic variance must be positive, got {}",
                variance
            )));
        }
        Self::new(DMatrix::identity(dim, dim) / variance)
    }

    /// Replace the precision matrix, keeping the old one if the new one is invalid.
    pub fn set_precision(&mut self, precision: DMatrix<f64>) -> Result<()> {
        if precision.nrows() != self.precision.nrows() {
            return Err(CyaneaError::InvalidInput(format!(
                "precision dimension changed from {} to {}",
                self.precision.nrows(),
                precision.nrows()
            )));
        }
        *self = Self::new(precision)?;
        Ok(())
    }
}

impl DiffusionModel for MultivariateDiffusion {
    fn precision(&self) -> &DMatrix<f64> {
        &self.precision
    }

    fn log_det_precision(&self) -> f64 {
        self.log_det_precision
    }

    fn variance(&self) -> &DMatrix<f64> {
        &self.variance
    }

    fn draw_factor(&self) -> &DMatrix<f64> {
        &self.draw_factor
    }
}

/// How raw branch lengths are normalized before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TreeNormalization {
    /// Use branch lengths as given.
    #[default]
    Off,
    /// Divide by the sum of all branch lengths.
    TreeLength,
    /// Divide by the root height.
    TreeHeight,
}

/// Branch-length-to-time rescaling applied before every evaluation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BranchScaling {
    /// Tree-wide normalization.
    pub normalization: TreeNormalization,
    /// Treat branch rates as precisions (divide) instead of variances (multiply).
    pub reciprocal_rates: bool,
    /// Extra time added to every external branch after rescaling.
    pub tip_extension: f64,
}

impl Default for BranchScaling {
    fn default() -> Self {
        Self {
            normalization: TreeNormalization::Off,
            reciprocal_rates: false,
            tip_extension: 0.0,
        }
    }
}

impl BranchScaling {
    /// Builder-style normalization.
    pub fn with_normalization(mut self, normalization: TreeNormalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Builder-style reciprocal rates.
    pub fn with_reciprocal_rates(mut self, reciprocal: bool) -> Self {
        self.reciprocal_rates = reciprocal;
        self
    }

    /// Builder-style tip extension.
    pub fn with_tip_extension(mut self, extension: f64) -> Self {
        self.tip_extension = extension;
        self
    }

    /// Tree-wide divisor for the configured normalization.
    pub fn normalizer(&self, tree: &PhyloTree) -> Result<f64> {
        let value = match self.normalization {
            TreeNormalization::Off => return Ok(1.0),
            TreeNormalization::TreeLength => tree.tree_length(),
            TreeNormalization::TreeHeight => tree.root_height(),
        };
        if value > 0.0 && value.is_finite() {
            Ok(value)
        } else {
            Err(CyaneaError::Numerical(format!(
                "cannot normalize by {:?} = {}",
                self.normalization, value
            )))
        }
    }

    /// Rescaled length of the branch above `node`.
    ///
    /// Negative or non-finite results are numerical errors: they come from
    /// proposals, not from configuration.
    pub fn rescaled_length(&self, tree: &PhyloTree, node: NodeId, normalizer: f64) -> Result<f64> {
        let n = tree
            .get_node(node)
            .ok_or_else(|| CyaneaError::Contract(format!("node id {} out of range", node)))?;
        if n.is_root() {
            return Err(CyaneaError::Contract("the root has no branch to rescale".into()));
        }
        let mut length = n.branch_length.ok_or_else(|| {
            CyaneaError::InvalidInput(format!("node {} has no branch length", node))
        })?;
        if let Some(rate) = n.rate {
            if !(rate > 0.0 && rate.is_finite()) {
                return Err(CyaneaError::Numerical(format!(
                    "branch rate {} above node {} is not positive",
                    rate, node
                )));
            }
            if self.reciprocal_rates {
                length /= rate;
            } else {
                length *= rate;
            }
        }
        length /= normalizer;
        if n.is_leaf() {
            length += self.tip_extension;
        }
        if length >= 0.0 && length.is_finite() {
            Ok(length)
        } else {
            Err(CyaneaError::Numerical(format!(
                "rescaled branch length {} above node {}",
                length, node
            )))
        }
    }
}
