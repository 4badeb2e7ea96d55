//! Deployment plan persistence.
//!
//! Plans are stored before execution starts so a fresh leader can pick
//! up where the old one died, and expunged once they finish or fail.

use flotilla_state::{StateError, StateResult, StateStore, Table};
use tracing::debug;

use crate::plan::DeploymentPlan;

/// Plans keyed by deployment id.
#[derive(Clone)]
pub struct DeploymentRepository {
    store: StateStore,
}

impl DeploymentRepository {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self, plan: &DeploymentPlan) -> StateResult<()> {
        let value = serde_json::to_vec(plan).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.store.put(Table::Deployments, &plan.id, &value)?;
        debug!(deployment = %plan.id, "plan persisted");
        Ok(())
    }

    pub fn get(&self, id: &str) -> StateResult<Option<DeploymentPlan>> {
        match self.store.get(Table::Deployments, id)? {
            Some(bytes) => {
                let plan = serde_json::from_slice(&bytes)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?;
                Ok(Some(plan))
            }
            None => Ok(None),
        }
    }

    pub fn all(&self) -> StateResult<Vec<DeploymentPlan>> {
        let mut plans = Vec::new();
        for (_, bytes) in self.store.list_prefix(Table::Deployments, "")? {
            plans.push(
                serde_json::from_slice(&bytes)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?,
            );
        }
        Ok(plans)
    }

    pub fn expunge(&self, id: &str) -> StateResult<bool> {
        let removed = self.store.remove(Table::Deployments, id)?;
        debug!(deployment = id, removed, "plan expunged");
        Ok(removed)
    }
}
