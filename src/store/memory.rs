use super::{check_update, DeploymentStore, ExperimentStore, ListFilter, StoreError};
use crate::model::{Deployment, Experiment, Phase};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process store backed by hash maps
#[derive(Default)]
pub struct MemoryStore {
    experiments: RwLock<HashMap<String, Experiment>>,
    deployments: RwLock<HashMap<String, Deployment>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update under the write lock; `config` is never replaced
    async fn write(&self, experiment: &Experiment, from: Option<Phase>) -> Result<(), StoreError> {
        let mut experiments = self.experiments.write().await;
        let stored = experiments
            .get_mut(&experiment.id)
            .ok_or_else(|| StoreError::experiment_not_found(&experiment.id))?;
        check_update(stored, experiment, from)?;

        stored.name = experiment.name.clone();
        stored.description = experiment.description.clone();
        stored.phase = experiment.phase;
        stored.status = experiment.status.clone();
        stored.metadata = experiment.metadata.clone();
        stored.updated_at = experiment.updated_at;
        Ok(())
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn create(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let mut experiments = self.experiments.write().await;
        if experiments.contains_key(&experiment.id) {
            return Err(StoreError::AlreadyExists {
                kind: "experiment",
                id: experiment.id.clone(),
            });
        }
        experiments.insert(experiment.id.clone(), experiment.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Experiment, StoreError> {
        self.experiments
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::experiment_not_found(id))
    }

    async fn update(&self, experiment: &Experiment) -> Result<(), StoreError> {
        self.write(experiment, None).await
    }

    async fn transition(&self, experiment: &Experiment, from: Phase) -> Result<(), StoreError> {
        self.write(experiment, Some(from)).await
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Experiment>, StoreError> {
        let experiments = self.experiments.read().await;
        let mut matching: Vec<&Experiment> = experiments
            .values()
            .filter(|e| filter.phase.map_or(true, |p| e.phase == p))
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn put_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        self.deployments
            .write()
            .await
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: &str) -> Result<Deployment, StoreError> {
        self.deployments
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::deployment_not_found(id))
    }

    async fn list_deployments(&self, experiment_id: &str) -> Result<Vec<Deployment>, StoreError> {
        let mut deployments: Vec<Deployment> = self
            .deployments
            .read()
            .await
            .values()
            .filter(|d| d.experiment_id == experiment_id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(deployments)
    }
}
