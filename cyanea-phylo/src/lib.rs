//! Phylogenetic trees for the Cyanea bioinformatics ecosystem.
//!
//! - **Tree data structures** — arena-backed rooted trees with stable [`NodeId`]s
//! - **Traversals** — pre-order, post-order and ancestor walks
//! - **Geometry** — root-to-node distances, root height, tree length, MRCA
//! - **Newick** — read and write trees, including `[&rate=..]` branch annotations

pub mod newick;
pub mod tree;

pub use tree::{Node, NodeId, PhyloTree};
