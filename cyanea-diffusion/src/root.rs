//! Integration of the root state against its prior.
//!
//! After the post-order sweep the root carries `N(y_k, (r · P)⁻¹)` per
//! replicate. Three priors close the recursion:
//!
//! - **Fixed**: the root equals a known vector `v`.
//! - **Semi-conjugate**: `x ~ N(z, B⁻¹)` with an arbitrary precision `B`.
//! - **Fully conjugate**: `x ~ N(z, (k · P)⁻¹)`; the prior shares the diffusion
//!   precision, so integration reduces to one more series composition.

use nalgebra::{DMatrix, DVector};

use cyanea_core::{CyaneaError, Result};

use crate::diffusion::DiffusionModel;
use crate::gaussian::{
    broadcast, centered, ln_det, positive_definite, precision_to_draw_factor, series_precision,
    sum_quadratic, LOG_SQRT_2PI,
};

/// Gaussian prior with its own precision matrix `B`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SemiConjugatePrior {
    mean: DVector<f64>,
    precision: DMatrix<f64>,
    variance: DMatrix<f64>,
    log_det: f64,
    precision_mean: DVector<f64>,
    mean_quadratic: f64,
    draw_factor: DMatrix<f64>,
}

impl SemiConjugatePrior {
    pub fn new(mean: DVector<f64>, precision: DMatrix<f64>) -> Result<Self> {
        let chol = positive_definite(&precision, "root prior precision")?;
        if mean.len() != precision.nrows() {
            return Err(CyaneaError::InvalidInput(format!(
                "root prior mean has length {} but precision is {}x{}",
                mean.len(),
                precision.nrows(),
                precision.ncols()
            )));
        }
        check_finite(&mean, "root prior mean")?;
        let precision_mean = &precision * &mean;
        let mean_quadratic = mean.dot(&precision_mean);
        let draw_factor = precision_to_draw_factor(&chol)
            .map_err(|_| CyaneaError::InvalidInput("root prior precision is singular".into()))?;
        Ok(Self {
            log_det: ln_det(&chol),
            variance: chol.inverse(),
            precision_mean,
            mean_quadratic,
            draw_factor,
            mean,
            precision,
        })
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn precision(&self) -> &DMatrix<f64> {
        &self.precision
    }

    /// `B⁻¹`.
    pub fn variance(&self) -> &DMatrix<f64> {
        &self.variance
    }
}

/// Gaussian prior `N(mean, (sample_size · P)⁻¹)`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FullyConjugatePrior {
    mean: DVector<f64>,
    sample_size: f64,
}

impl FullyConjugatePrior {
    pub fn new(mean: DVector<f64>, sample_size: f64) -> Result<Self> {
        if !(sample_size > 0.0 && sample_size.is_finite()) {
            return Err(CyaneaError::InvalidInput(format!(
                "prior sample size must be positive, got {}",
                sample_size
            )));
        }
        check_finite(&mean, "root prior mean")?;
        Ok(Self { mean, sample_size })
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn sample_size(&self) -> f64 {
        self.sample_size
    }
}

/// Prior on the root trait vector.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RootPrior {
    Fixed(DVector<f64>),
    SemiConjugate(SemiConjugatePrior),
    FullyConjugate(FullyConjugatePrior),
}

/// Distribution of the root state given all tips, in draw-ready form.
#[derive(Debug, Clone, PartialEq)]
pub enum RootPosterior {
    /// The root is known exactly (one column per replicate).
    Point(DMatrix<f64>),
    /// Column `k` is `N(mean_k, (scale · F⁻ᵀF⁻¹))`-distributed; draw as
    /// `mean + factor · z / √scale` with `z ~ N(0, I)`.
    Gaussian {
        mean: DMatrix<f64>,
        factor: DMatrix<f64>,
        scale: f64,
    },
}

impl RootPosterior {
    /// Posterior mean per replicate.
    pub fn mean(&self) -> &DMatrix<f64> {
        match self {
            Self::Point(m) => m,
            Self::Gaussian { mean, .. } => mean,
        }
    }
}

impl RootPrior {
    /// Root pinned at `value`.
    pub fn fixed(value: DVector<f64>) -> Result<Self> {
        check_finite(&value, "fixed root value")?;
        Ok(Self::Fixed(value))
    }

    /// Root pinned at the origin of a `dim`-dimensional trait space.
    pub fn origin(dim: usize) -> Self {
        Self::Fixed(DVector::zeros(dim))
    }

    pub fn semi_conjugate(mean: DVector<f64>, precision: DMatrix<f64>) -> Result<Self> {
        SemiConjugatePrior::new(mean, precision).map(Self::SemiConjugate)
    }

    pub fn fully_conjugate(mean: DVector<f64>, sample_size: f64) -> Result<Self> {
        FullyConjugatePrior::new(mean, sample_size).map(Self::FullyConjugate)
    }

    /// Trait dimension of the prior.
    pub fn dim(&self) -> usize {
        match self {
            Self::Fixed(v) => v.len(),
            Self::SemiConjugate(p) => p.mean.len(),
            Self::FullyConjugate(p) => p.mean.len(),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fixed(_) => "fixed",
            Self::SemiConjugate(_) => "semi-conjugate",
            Self::FullyConjugate(_) => "fully-conjugate",
        }
    }

    /// Prior mean (or the fixed value).
    pub fn mean(&self) -> &DVector<f64> {
        match self {
            Self::Fixed(v) => v,
            Self::SemiConjugate(p) => &p.mean,
            Self::FullyConjugate(p) => &p.mean,
        }
    }

    /// Prior covariance of the root, `None` for a fixed root.
    pub fn covariance<D: DiffusionModel>(&self, diffusion: &D) -> Option<DMatrix<f64>> {
        match self {
            Self::Fixed(_) => None,
            Self::SemiConjugate(p) => Some(p.variance.clone()),
            Self::FullyConjugate(p) => Some(diffusion.variance() / p.sample_size),
        }
    }

    /// Log-density contributed by the root.
    ///
    /// `y` is the root's `dim_trait × dim_data` mean and `r` its lower precision.
    pub fn log_marginal<D: DiffusionModel>(&self, y: &DMatrix<f64>, r: f64, diffusion: &D) -> Result<f64> {
        if r == 0.0 {
            return Ok(0.0);
        }
        let d = y.nrows() as f64;
        let n = y.ncols() as f64;
        let p = diffusion.precision();
        let log_det_p = diffusion.log_det_precision();

        match self {
            Self::Fixed(v) => {
                if r.is_infinite() {
                    return Err(CyaneaError::Numerical(
                        "observed root state under a fixed root prior".into(),
                    ));
                }
                Ok(n * (-d * LOG_SQRT_2PI + 0.5 * (d * r.ln() + log_det_p))
                    - 0.5 * r * sum_quadratic(p, &centered(y, v)))
            }
            Self::FullyConjugate(prior) => {
                let s = series_precision(r, prior.sample_size);
                Ok(n * (-d * LOG_SQRT_2PI + 0.5 * (d * s.ln() + log_det_p))
                    - 0.5 * s * sum_quadratic(p, &centered(y, &prior.mean)))
            }
            Self::SemiConjugate(prior) => {
                if r.is_infinite() {
                    return Ok(n * (-d * LOG_SQRT_2PI + 0.5 * prior.log_det)
                        - 0.5 * sum_quadratic(&prior.precision, &centered(y, &prior.mean)));
                }
                let plain = n * (-d * LOG_SQRT_2PI + 0.5 * (log_det_p + d * r.ln()))
                    - 0.5 * r * sum_quadratic(p, y);
                let (log_det_sum, projected) = if p.nrows() == 1 {
                    let total = r * p[(0, 0)] + prior.precision[(0, 0)];
                    let projected: f64 = y
                        .iter()
                        .map(|&yk| {
                            let w = r * p[(0, 0)] * yk + prior.precision_mean[0];
                            w * w / total
                        })
                        .sum();
                    (total.ln(), projected)
                } else {
                    let combined = p * r + &prior.precision;
                    let chol = combined.cholesky().ok_or_else(|| {
                        CyaneaError::Numerical("combined root precision is not positive definite".into())
                    })?;
                    let w = weighted_sum(p, r, y, &prior.precision_mean);
                    let solved = chol.solve(&w);
                    (ln_det(&chol), w.component_mul(&solved).sum())
                };
                Ok(plain
                    + 0.5 * (n * (prior.log_det - log_det_sum - prior.mean_quadratic) + projected))
            }
        }
    }

    /// Posterior of the root state, for ancestral reconstruction.
    pub fn posterior<D: DiffusionModel>(&self, y: &DMatrix<f64>, r: f64, diffusion: &D) -> Result<RootPosterior> {
        let n = y.ncols();
        match self {
            Self::Fixed(v) => Ok(RootPosterior::Point(broadcast(v, n))),
            _ if r.is_infinite() => Ok(RootPosterior::Point(y.clone())),
            Self::FullyConjugate(prior) => {
                let k = prior.sample_size;
                let mean = (y * r + broadcast(&prior.mean, n) * k) / (r + k);
                Ok(RootPosterior::Gaussian {
                    mean,
                    factor: diffusion.draw_factor().clone(),
                    scale: r + k,
                })
            }
            Self::SemiConjugate(prior) => {
                if r == 0.0 {
                    return Ok(RootPosterior::Gaussian {
                        mean: broadcast(&prior.mean, n),
                        factor: prior.draw_factor.clone(),
                        scale: 1.0,
                    });
                }
                let p = diffusion.precision();
                let chol = (p * r + &prior.precision).cholesky().ok_or_else(|| {
                    CyaneaError::Numerical("combined root precision is not positive definite".into())
                })?;
                let mean = chol.solve(&weighted_sum(p, r, y, &prior.precision_mean));
                Ok(RootPosterior::Gaussian {
                    mean,
                    factor: precision_to_draw_factor(&chol)?,
                    scale: 1.0,
                })
            }
        }
    }
}

/// Columns `r·P·y_k + B·z`.
fn weighted_sum(p: &DMatrix<f64>, r: f64, y: &DMatrix<f64>, precision_mean: &DVector<f64>) -> DMatrix<f64> {
    let mut w = p * y * r;
    for mut col in w.column_iter_mut() {
        col += precision_mean;
    }
    w
}

fn check_finite(v: &DVector<f64>, what: &str) -> Result<()> {
    if v.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(CyaneaError::InvalidInput(format!("{} has non-finite entries", what)))
    }
}
