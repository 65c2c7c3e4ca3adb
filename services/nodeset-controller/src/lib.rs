//! Slinky NodeSet controller.
//!
//! Keeps a fleet of per-node Slurm worker pods in step with each NodeSet:
//! stable ordinal identities, claim lifecycle, revision history, rolling
//! updates gated on Slurm drain state, and status aggregated from both the
//! object store and the scheduler.

pub mod api;
pub mod config;
pub mod events;
pub mod history;
pub mod nodeset;
pub mod podcontrol;
pub mod slurm;
pub mod slurmcontrol;
pub mod store;
pub mod worker;
