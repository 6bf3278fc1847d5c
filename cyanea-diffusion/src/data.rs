//! Tip trait observations with missing-data masks.
//!
//! Each taxon carries `dim_data` replicates of a `dim_trait`-dimensional
//! trait vector. Values are supplied flat and replicate-major, so
//! `values[k * dim_trait + i]` is dimension `i` of replicate `k`.
//!
//! A replicate is either fully observed or fully missing, and all
//! replicates of one taxon share the same pattern; the scalar-precision
//! recursion cannot represent a tip that is informative in only some
//! dimensions.

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use cyanea_core::{CyaneaError, Result};

/// Observations for one taxon.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TipTraits {
    values: DMatrix<f64>,
    missing: bool,
}

impl TipTraits {
    /// Trait values, one column per replicate (zeros when missing).
    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    /// True when the taxon carries no information.
    pub fn is_missing(&self) -> bool {
        self.missing
    }
}

/// All tip observations for one likelihood.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraitData {
    dim_trait: usize,
    dim_data: usize,
    tips: BTreeMap<String, TipTraits>,
}

impl TraitData {
    /// Empty store for `dim_data` replicates of a `dim_trait`-dimensional trait.
    pub fn new(dim_trait: usize, dim_data: usize) -> Result<Self> {
        if dim_trait == 0 || dim_data == 0 {
            return Err(CyaneaError::InvalidInput(format!(
                "trait and replicate dimensions must be positive, got {} and {}",
                dim_trait, dim_data
            )));
        }
        Ok(Self {
            dim_trait,
            dim_data,
            tips: BTreeMap::new(),
        })
    }

    /// Trait dimension.
    pub fn dim_trait(&self) -> usize {
        self.dim_trait
    }

    /// Number of replicates per taxon.
    pub fn dim_data(&self) -> usize {
        self.dim_data
    }

    /// Number of taxa.
    pub fn len(&self) -> usize {
        self.tips.len()
    }

    /// True when no taxa have been inserted.
    pub fn is_empty(&self) -> bool {
        self.tips.is_empty()
    }

    /// Observations for `taxon`.
    pub fn get(&self, taxon: &str) -> Option<&TipTraits> {
        self.tips.get(taxon)
    }

    /// Taxon names in sorted order.
    pub fn taxa(&self) -> impl Iterator<Item = &str> {
        self.tips.keys().map(String::as_str)
    }

    /// Taxa flagged as completely missing.
    pub fn missing_taxa(&self) -> impl Iterator<Item = &str> {
        self.tips
            .iter()
            .filter(|(_, t)| t.missing)
            .map(|(name, _)| name.as_str())
    }

    /// Number of taxa with observed values.
    pub fn observed_count(&self) -> usize {
        self.tips.values().filter(|t| !t.missing).count()
    }

    /// Insert a fully observed taxon.
    pub fn insert(&mut self, taxon: impl Into<String>, values: &[f64]) -> Result<()> {
        let taxon = taxon.into();
        let values = self.to_matrix(&taxon, values)?;
        self.insert_tip(taxon, values, false)
    }

    /// Insert a taxon with nothing observed.
    pub fn insert_missing(&mut self, taxon: impl Into<String>) -> Result<()> {
        let values = DMatrix::zeros(self.dim_trait, self.dim_data);
        self.insert_tip(taxon.into(), values, true)
    }

    /// Insert a taxon with one missing-index list per replicate.
    ///
    /// Each list must be empty or cover every trait dimension, and all
    /// lists must agree. Masked entries are ignored and may be NaN.
    pub fn insert_with_mask(
        &mut self,
        taxon: impl Into<String>,
        values: &[f64],
        missing: &[Vec<usize>],
    ) -> Result<()> {
        let taxon = taxon.into();
        if values.len() != self.dim_trait * self.dim_data {
            return Err(self.length_error(&taxon, values.len()));
        }
        if missing.len() != self.dim_data {
            return Err(CyaneaError::InvalidInput(format!(
                "taxon {}: expected {} replicate masks, got {}",
                taxon,
                self.dim_data,
                missing.len()
            )));
        }
        let mut fully_missing = None;
        for (k, mask) in missing.iter().enumerate() {
            let mut seen = vec![false; self.dim_trait];
            for &i in mask {
                if i >= self.dim_trait {
                    return Err(CyaneaError::InvalidInput(format!(
                        "taxon {}: mask index {} out of range for trait dimension {}",
                        taxon, i, self.dim_trait
                    )));
                }
                seen[i] = true;
            }
            let covered = seen.iter().filter(|&&s| s).count();
            let replicate_missing = match covered {
                0 => false,
                c if c == self.dim_trait => true,
                _ => {
                    return Err(CyaneaError::InvalidInput(format!(
                        "taxon {}: replicate {} is only partially observed",
                        taxon, k
                    )))
                }
            };
            match fully_missing {
                None => fully_missing = Some(replicate_missing),
                Some(prev) if prev != replicate_missing => {
                    return Err(CyaneaError::InvalidInput(format!(
                        "taxon {}: replicates disagree on missingness",
                        taxon
                    )))
                }
                Some(_) => {}
            }
        }
        if fully_missing.unwrap_or(false) {
            return self.insert_missing(taxon);
        }
        let values = self.to_matrix(&taxon, values)?;
        self.insert_tip(taxon, values, false)
    }

    /// Insert a taxon from optional entries, `None` marking a missing value.
    pub fn insert_optional(&mut self, taxon: impl Into<String>, values: &[Option<f64>]) -> Result<()> {
        let taxon = taxon.into();
        if values.len() != self.dim_trait * self.dim_data {
            return Err(self.length_error(&taxon, values.len()));
        }
        let masks: Vec<Vec<usize>> = values
            .chunks(self.dim_trait)
            .map(|rep| {
                rep.iter()
                    .enumerate()
                    .filter(|(_, v)| v.is_none())
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();
        let flat: Vec<f64> = values.iter().map(|v| v.unwrap_or(f64::NAN)).collect();
        self.insert_with_mask(taxon, &flat, &masks)
    }

    /// Overwrite the values of an observed taxon.
    pub fn set_values(&mut self, taxon: &str, values: &[f64]) -> Result<()> {
        let matrix = self.to_matrix(taxon, values)?;
        let tip = self.tips.get_mut(taxon).ok_or_else(|| {
            CyaneaError::InvalidInput(format!("unknown taxon {}", taxon))
        })?;
        if tip.missing {
            return Err(CyaneaError::InvalidInput(format!(
                "taxon {} is marked missing; its mask is fixed",
                taxon
            )));
        }
        tip.values = matrix;
        Ok(())
    }

    fn length_error(&self, taxon: &str, got: usize) -> CyaneaError {
        CyaneaError::InvalidInput(format!(
            "taxon {}: expected {} values ({} replicates x {} traits), got {}",
            taxon,
            self.dim_trait * self.dim_data,
            self.dim_data,
            self.dim_trait,
            got
        ))
    }

    fn to_matrix(&self, taxon: &str, values: &[f64]) -> Result<DMatrix<f64>> {
        if values.len() != self.dim_trait * self.dim_data {
            return Err(self.length_error(taxon, values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CyaneaError::InvalidInput(format!(
                "taxon {}: non-finite value outside the missing-data mask",
                taxon
            )));
        }
        Ok(DMatrix::from_column_slice(self.dim_trait, self.dim_data, values))
    }

    fn insert_tip(&mut self, taxon: String, values: DMatrix<f64>, missing: bool) -> Result<()> {
        if self.tips.contains_key(&taxon) {
            return Err(CyaneaError::InvalidInput(format!("duplicate taxon {}", taxon)));
        }
        self.tips.insert(taxon, TipTraits { values, missing });
        Ok(())
    }
}
