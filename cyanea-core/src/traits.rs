//! Core trait definitions for the Cyanea ecosystem.
//!
//! These traits define the contracts that domain types implement across crates.

/// A type that can produce a summary of its contents.
pub trait Summarizable {
    /// A one-line summary suitable for display.
    fn summary(&self) -> String;
}

/// The store/restore/accept protocol driven once per MCMC iteration.
///
/// `store_state` snapshots everything needed to undo a proposal,
/// `restore_state` rolls back to that snapshot and `accept_state`
/// discards it. A `restore_state` is only valid after a `store_state`.
pub trait StateStore {
    /// Snapshot the current accepted state before a proposal.
    fn store_state(&mut self);

    /// Roll back to the last snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CyaneaError::Contract`](crate::CyaneaError::Contract) if no
    /// snapshot is held.
    fn restore_state(&mut self) -> crate::Result<()>;

    /// Keep the proposed state and drop the snapshot.
    fn accept_state(&mut self);
}
