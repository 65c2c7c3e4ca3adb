//! NodeSet controller: reconciler, sync steps and informer handling.

pub mod claim;
pub mod controller;
pub mod eventhandler;
pub mod revision;
pub mod service;
pub mod sort;
pub mod status;
pub mod sync;
pub mod update;
pub mod utils;

pub use controller::{NodeSetReconciler, SyncError, SyncResult, SyncStats};
pub use eventhandler::EventHandler;
pub use revision::RevisionSet;
