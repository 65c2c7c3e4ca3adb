//! Slurm scheduler access.
//!
//! [`SlurmClient`] is the narrow slice of slurmrestd the controller needs:
//! node get/list/update and running jobs. [`rest::RestClient`] talks HTTP,
//! [`fake::FakeClient`] keeps nodes in memory for tests.

pub mod clientmap;
pub mod fake;
pub mod hostlist;
pub mod rest;
pub mod types;

use async_trait::async_trait;

pub use clientmap::ClientMap;
pub use types::{Job, JobState, NoVal, Node, NodeState, NodeUpdate, UpdateState};

/// Result type for scheduler calls.
pub type SlurmResult<T> = Result<T, SlurmError>;

/// Errors returned by a scheduler client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlurmError {
    #[error("slurm object not found: {0}")]
    NotFound(String),

    #[error("slurm returned no content")]
    NoContent,

    #[error("slurm API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("slurm transport error: {0}")]
    Transport(String),

    #[error("slurm decode error: {0}")]
    Decode(String),
}

impl SlurmError {
    /// NotFound and NoContent mean "nothing to act on" and count as success.
    pub fn is_tolerated(&self) -> bool {
        matches!(self, SlurmError::NotFound(_) | SlurmError::NoContent)
    }
}

/// Tolerate NotFound/NoContent, mapping them to `fallback`.
pub fn tolerate<T>(result: SlurmResult<T>, fallback: T) -> SlurmResult<T> {
    match result {
        Err(err) if err.is_tolerated() => Ok(fallback),
        other => other,
    }
}

#[async_trait]
pub trait SlurmClient: Send + Sync {
    /// List registered nodes, bypassing any cache when `refresh` is set.
    async fn list_nodes(&self, refresh: bool) -> SlurmResult<Vec<Node>>;

    async fn get_node(&self, name: &str) -> SlurmResult<Node>;

    async fn update_node(&self, name: &str, update: &NodeUpdate) -> SlurmResult<()>;

    async fn list_jobs(&self) -> SlurmResult<Vec<Job>>;
}
