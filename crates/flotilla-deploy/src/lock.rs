//! Advisory per-app deployment locks.
//!
//! A deployment holds the lock on every app it touches for its whole
//! lifetime. User mutations on a locked app fail with `AppLocked`
//! unless forced, in which case the overlapping deployments are
//! canceled and their locks stolen.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use flotilla_core::PathId;

/// app id → holding deployment id.
#[derive(Clone, Default)]
pub struct AppLockRegistry {
    locks: Arc<RwLock<HashMap<PathId, String>>>,
}

impl AppLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to lock every app for `deployment_id`. On conflict nothing
    /// is acquired and the holding deployment ids are returned.
    pub async fn acquire(&self, app_ids: &[PathId], deployment_id: &str) -> Result<(), Vec<String>> {
        let mut locks = self.locks.write().await;
        let mut holders: Vec<String> = app_ids
            .iter()
            .filter_map(|id| locks.get(id).cloned())
            .filter(|holder| holder != deployment_id)
            .collect();
        holders.sort();
        holders.dedup();
        if !holders.is_empty() {
            return Err(holders);
        }
        for id in app_ids {
            locks.insert(id.clone(), deployment_id.to_string());
        }
        debug!(deployment = deployment_id, apps = app_ids.len(), "locks acquired");
        Ok(())
    }

    /// Take the locks regardless of current holders. Returns the
    /// deployment ids that lost locks.
    pub async fn steal(&self, app_ids: &[PathId], deployment_id: &str) -> Vec<String> {
        let mut locks = self.locks.write().await;
        let mut losers: Vec<String> = app_ids
            .iter()
            .filter_map(|id| locks.get(id).cloned())
            .filter(|holder| holder != deployment_id)
            .collect();
        losers.sort();
        losers.dedup();
        for id in app_ids {
            locks.insert(id.clone(), deployment_id.to_string());
        }
        losers
    }

    /// Drop every lock held by a deployment.
    pub async fn release(&self, deployment_id: &str) {
        let mut locks = self.locks.write().await;
        locks.retain(|_, holder| holder != deployment_id);
        debug!(deployment = deployment_id, "locks released");
    }

    /// The deployment currently holding an app, if any.
    pub async fn holder(&self, app_id: &PathId) -> Option<String> {
        self.locks.read().await.get(app_id).cloned()
    }

    /// Deployment ids holding any of the given apps.
    pub async fn holders(&self, app_ids: &[PathId]) -> Vec<String> {
        let locks = self.locks.read().await;
        let mut holders: Vec<String> = app_ids
            .iter()
            .filter_map(|id| locks.get(id).cloned())
            .collect();
        holders.sort();
        holders.dedup();
        holders
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> PathId {
        PathId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn acquire_conflicts_report_holders() {
        let registry = AppLockRegistry::new();
        let apps = vec![path("/web"), path("/db")];
        registry.acquire(&apps, "d-1").await.unwrap();

        let err = registry.acquire(&[path("/web")], "d-2").await.unwrap_err();
        assert_eq!(err, vec!["d-1".to_string()]);

        // Nothing was partially acquired.
        assert_eq!(registry.holder(&path("/web")).await.as_deref(), Some("d-1"));
    }

    #[tokio::test]
    async fn reacquire_by_the_same_deployment_is_fine() {
        let registry = AppLockRegistry::new();
        registry.acquire(&[path("/web")], "d-1").await.unwrap();
        registry.acquire(&[path("/web")], "d-1").await.unwrap();
    }

    #[tokio::test]
    async fn release_frees_only_that_deployments_locks() {
        let registry = AppLockRegistry::new();
        registry.acquire(&[path("/web")], "d-1").await.unwrap();
        registry.acquire(&[path("/db")], "d-2").await.unwrap();

        registry.release("d-1").await;
        assert!(registry.holder(&path("/web")).await.is_none());
        assert_eq!(registry.holder(&path("/db")).await.as_deref(), Some("d-2"));
    }

    #[tokio::test]
    async fn steal_reports_losers() {
        let registry = AppLockRegistry::new();
        registry.acquire(&[path("/web")], "d-1").await.unwrap();

        let losers = registry.steal(&[path("/web"), path("/db")], "d-2").await;
        assert_eq!(losers, vec!["d-1".to_string()]);
        assert_eq!(registry.holder(&path("/web")).await.as_deref(), Some("d-2"));
        assert_eq!(registry.holder(&path("/db")).await.as_deref(), Some("d-2"));
    }
}
