//! Persistence contracts for experiments and deployments
//!
//! The orchestration core only depends on the `ExperimentStore` and
//! `DeploymentStore` traits. Two adapters are provided:
//! - `MemoryStore` for single-process use and tests
//! - `SqliteStore` for durable storage

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::model::{Deployment, Experiment, Phase};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// The incoming record is older than the stored one
    #[error("stale update for experiment {0}")]
    Conflict(String),

    /// Another writer moved the experiment to a different phase first
    #[error("experiment {id} is {actual}, expected {expected}")]
    PhaseChanged {
        id: String,
        expected: Phase,
        actual: Phase,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn experiment_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: "experiment",
            id: id.to_string(),
        }
    }

    pub fn deployment_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: "deployment",
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Filter for `ExperimentStore::list`
#[derive(Debug, Clone, PartialEq)]
pub struct ListFilter {
    pub phase: Option<Phase>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListFilter {
    fn default() -> Self {
        ListFilter {
            phase: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl ListFilter {
    pub fn phase(phase: Phase) -> Self {
        ListFilter {
            phase: Some(phase),
            ..Default::default()
        }
    }
}

/// Durable keyed storage for experiment records
///
/// `update` persists phase, status, metadata, description and `updated_at`.
/// The stored `config` is never overwritten. An update carrying an
/// `updated_at` older than the stored one fails with `StoreError::Conflict`.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn create(&self, experiment: &Experiment) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Experiment, StoreError>;

    async fn update(&self, experiment: &Experiment) -> Result<(), StoreError>;

    /// Like `update`, but only while the stored phase is still `from`
    ///
    /// Check and write happen atomically, so two writers racing from the
    /// same phase cannot both succeed.
    async fn transition(&self, experiment: &Experiment, from: Phase) -> Result<(), StoreError>;

    /// List experiments newest-first by creation time
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Experiment>, StoreError>;
}

/// Registry of variant deployments created during provisioning
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert or replace a deployment record
    async fn put_deployment(&self, deployment: &Deployment) -> Result<(), StoreError>;

    async fn get_deployment(&self, id: &str) -> Result<Deployment, StoreError>;

    async fn list_deployments(&self, experiment_id: &str) -> Result<Vec<Deployment>, StoreError>;
}

/// Store implementing both contracts
pub trait Store: ExperimentStore + DeploymentStore {}

impl<T: ExperimentStore + DeploymentStore> Store for T {}

/// Check an incoming update against the stored record
///
/// `from`, when set, must match the stored phase.
pub(crate) fn check_update(
    stored: &Experiment,
    incoming: &Experiment,
    from: Option<Phase>,
) -> Result<(), StoreError> {
    if let Some(expected) = from {
        if stored.phase != expected {
            return Err(StoreError::PhaseChanged {
                id: stored.id.clone(),
                expected,
                actual: stored.phase,
            });
        }
    }
    if incoming.updated_at < stored.updated_at {
        return Err(StoreError::Conflict(incoming.id.clone()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
