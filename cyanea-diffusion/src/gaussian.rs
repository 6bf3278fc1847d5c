//! Scalar-precision Gaussian helpers shared by the tree passes.
//!
//! Every node-level distribution in this crate has the form
//! `N(mean, (c · P)⁻¹)` for one shared trait precision `P` and a scalar `c`,
//! so most of the arithmetic reduces to sums of quadratic forms in `P`.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use cyanea_core::{CyaneaError, Result};

/// `ln √(2π)`.
pub(crate) const LOG_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Series composition of two scalar precisions: `a·b / (a + b)`.
///
/// Infinite precision is the identity (a zero-length branch adds no
/// variance) and a zero precision absorbs everything.
pub(crate) fn series_precision(a: f64, b: f64) -> f64 {
    if a.is_infinite() {
        b
    } else if b.is_infinite() {
        a
    } else if a == 0.0 || b == 0.0 {
        0.0
    } else {
        a * b / (a + b)
    }
}

/// `Σ_k x_kᵀ A x_k` over the columns of `x`.
pub(crate) fn sum_quadratic(a: &DMatrix<f64>, x: &DMatrix<f64>) -> f64 {
    if a.nrows() == 1 {
        return a[(0, 0)] * x.iter().map(|v| v * v).sum::<f64>();
    }
    (a * x).component_mul(x).sum()
}

/// Subtract `v` from every column of `x`.
pub(crate) fn centered(x: &DMatrix<f64>, v: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(x.nrows(), x.ncols(), |i, k| x[(i, k)] - v[i])
}

/// Repeat `v` as `n` columns.
pub(crate) fn broadcast(v: &DVector<f64>, n: usize) -> DMatrix<f64> {
    DMatrix::from_fn(v.len(), n, |i, _| v[i])
}

/// `ln |A|` from a Cholesky factorization.
pub(crate) fn ln_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// `L⁻ᵀ` for the lower factor `L` of a precision `Q = L·Lᵀ`.
///
/// `mean + L⁻ᵀ z` with `z ~ N(0, I)` is a draw with precision `Q`.
pub(crate) fn precision_to_draw_factor(chol: &Cholesky<f64, Dyn>) -> Result<DMatrix<f64>> {
    let dim = chol.l_dirty().nrows();
    chol.l()
        .transpose()
        .solve_upper_triangular(&DMatrix::identity(dim, dim))
        .ok_or_else(|| CyaneaError::Numerical("singular precision factor".into()))
}

/// Check that `m` is a finite, symmetric, positive-definite square matrix.
pub(crate) fn positive_definite(m: &DMatrix<f64>, what: &str) -> Result<Cholesky<f64, Dyn>> {
    if m.nrows() == 0 || !m.is_square() {
        return Err(CyaneaError::InvalidInput(format!(
            "{} must be a non-empty square matrix, got {}x{}",
            what,
            m.nrows(),
            m.ncols()
        )));
    }
    if m.iter().any(|v| !v.is_finite()) {
        return Err(CyaneaError::InvalidInput(format!("{} has non-finite entries", what)));
    }
    let scale = m.amax().max(1.0);
    for i in 0..m.nrows() {
        for j in (i + 1)..m.ncols() {
            if (m[(i, j)] - m[(j, i)]).abs() > 1e-10 * scale {
                return Err(CyaneaError::InvalidInput(format!(
                    "{} is not symmetric at ({}, {})",
                    what, i, j
                )));
            }
        }
    }
    m.clone().cholesky().ok_or_else(|| {
        CyaneaError::InvalidInput(format!("{} is not positive definite", what))
    })
}
