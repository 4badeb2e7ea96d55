//! The launch queue — one entry per task waiting for an offer.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use flotilla_core::{AppDefinition, PathId, Timestamp};

/// One pending launch.
#[derive(Debug, Clone)]
pub struct QueuedLaunch {
    /// Snapshot of the definition to launch from.
    pub app: AppDefinition,
    /// When the launch was requested; FIFO tiebreaker for matching.
    pub launch_by: Timestamp,
}

/// FIFO queue of pending launches, shared between the deployment
/// executor (producer) and the offer matcher (consumer).
#[derive(Clone, Default)]
pub struct LaunchQueue {
    entries: Arc<RwLock<Vec<QueuedLaunch>>>,
}

impl LaunchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `count` launches of the given definition.
    pub async fn add(&self, app: &AppDefinition, count: u32, now: Timestamp) {
        if count == 0 {
            return;
        }
        let mut entries = self.entries.write().await;
        for _ in 0..count {
            entries.push(QueuedLaunch {
                app: app.clone(),
                launch_by: now,
            });
        }
        debug!(app = %app.id, count, queued = entries.len(), "launches queued");
    }

    /// Snapshot of all entries in FIFO order.
    pub async fn list(&self) -> Vec<QueuedLaunch> {
        self.entries.read().await.clone()
    }

    /// Drop entries failing the predicate (stale app versions, mostly).
    pub async fn retain<F>(&self, predicate: F) -> usize
    where
        F: Fn(&QueuedLaunch) -> bool,
    {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| predicate(e));
        before - entries.len()
    }

    /// Remove every entry for an app. Returns how many were dropped.
    pub async fn purge(&self, app_id: &PathId) -> usize {
        self.retain(|e| &e.app.id != app_id).await
    }

    /// Remove one entry for an app (a launch was matched). Returns the
    /// removed entry.
    pub async fn poll(&self, app_id: &PathId) -> Option<QueuedLaunch> {
        let mut entries = self.entries.write().await;
        let pos = entries.iter().position(|e| &e.app.id == app_id)?;
        Some(entries.remove(pos))
    }

    /// Like [`poll`](Self::poll), but only for one app version.
    pub async fn poll_matching(&self, app_id: &PathId, version: Timestamp) -> Option<QueuedLaunch> {
        let mut entries = self.entries.write().await;
        let pos = entries
            .iter()
            .position(|e| &e.app.id == app_id && e.app.version == version)?;
        Some(entries.remove(pos))
    }

    pub async fn count(&self, app_id: &PathId) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| &e.app.id == app_id)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: &str, version: u64) -> AppDefinition {
        let mut app = AppDefinition::new(PathId::parse(id).unwrap());
        app.cmd = Some("sleep 3600".to_string());
        app.version = Timestamp::from_millis(version);
        app
    }

    #[tokio::test]
    async fn add_and_poll_fifo() {
        let queue = LaunchQueue::new();
        queue.add(&app("/web", 1), 2, Timestamp::from_millis(10)).await;
        queue.add(&app("/db", 1), 1, Timestamp::from_millis(20)).await;
        assert_eq!(queue.len().await, 3);

        let web_id = PathId::parse("/web").unwrap();
        assert_eq!(queue.count(&web_id).await, 2);
        assert!(queue.poll(&web_id).await.is_some());
        assert_eq!(queue.count(&web_id).await, 1);
        assert!(queue.poll(&PathId::parse("/nope").unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn retain_drops_stale_versions() {
        let queue = LaunchQueue::new();
        queue.add(&app("/web", 1), 2, Timestamp::from_millis(10)).await;
        queue.add(&app("/web", 2), 1, Timestamp::from_millis(20)).await;

        let current = Timestamp::from_millis(2);
        let dropped = queue.retain(|e| e.app.version == current).await;
        assert_eq!(dropped, 2);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.list().await[0].app.version, current);
    }

    #[tokio::test]
    async fn purge_clears_one_app() {
        let queue = LaunchQueue::new();
        queue.add(&app("/web", 1), 2, Timestamp::from_millis(10)).await;
        queue.add(&app("/db", 1), 1, Timestamp::from_millis(10)).await;
        assert_eq!(queue.purge(&PathId::parse("/web").unwrap()).await, 2);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn zero_count_is_a_noop() {
        let queue = LaunchQueue::new();
        queue.add(&app("/web", 1), 0, Timestamp::from_millis(10)).await;
        assert!(queue.is_empty().await);
    }
}
