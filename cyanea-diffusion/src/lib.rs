//! Continuous trait evolution on phylogenies for the Cyanea bioinformatics ecosystem.
//!
//! Marginal likelihood of multivariate tip traits under Brownian diffusion,
//! with every internal node integrated out by Gaussian message passing:
//!
//! - **Post-order aggregation** — scalar-precision beliefs merged tip to root
//! - **Root integration** — fixed root, semi-conjugate or fully conjugate prior
//! - **Ancestral reconstruction** — seeded joint draws and posterior means
//! - **MCMC lifecycle** — incremental recomputation with store/restore/accept
//! - **Dense cross-check** — the same likelihood from the full tip covariance
//!
//! ```
//! use cyanea_diffusion::{IntegratedTraitLikelihood, MultivariateDiffusion, RootPrior, TraitData, TraitLikelihoodConfig};
//! use cyanea_phylo::PhyloTree;
//! use nalgebra::DVector;
//!
//! let tree = PhyloTree::from_newick("((A:1,B:1):2,C:3);")?;
//! let mut data = TraitData::new(1, 1)?;
//! data.insert("A", &[5.0])?;
//! data.insert("B", &[7.0])?;
//! data.insert("C", &[10.0])?;
//! let prior = RootPrior::fully_conjugate(DVector::from_vec(vec![0.0]), 1.0)?;
//! let mut lik = IntegratedTraitLikelihood::new(
//!     tree,
//!     MultivariateDiffusion::isotropic(1, 1.0)?,
//!     data,
//!     TraitLikelihoodConfig::new(prior),
//! )?;
//! assert!((lik.log_likelihood()? + 19.770479253240143).abs() < 1e-10);
//! # Ok::<(), cyanea_core::CyaneaError>(())
//! ```

pub mod ancestral;
pub mod belief;
pub mod data;
pub mod dense;
pub mod diffusion;
mod gaussian;
pub mod likelihood;
pub mod post_order;
pub mod root;
pub mod tracker;

pub use ancestral::{AncestralSampler, AncestralStates};
pub use belief::{BeliefCache, NodeBelief, WishartStatistics};
pub use data::{TipTraits, TraitData};
pub use diffusion::{BranchScaling, DiffusionModel, MultivariateDiffusion, TreeNormalization};
pub use likelihood::{IntegratedTraitLikelihood, TraitLikelihoodConfig};
pub use post_order::PostOrderAggregator;
pub use root::{FullyConjugatePrior, RootPosterior, RootPrior, SemiConjugatePrior};
pub use tracker::{DirtyStateTracker, LikelihoodState};
