//! Typed repositories over the generic store.
//!
//! Apps are stored per version and never overwritten — running tasks
//! keep referencing the definition they were launched from until they
//! die. The group root is a single versioned document.

use flotilla_core::{AppDefinition, Group, PathId, Timestamp};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::tables::Table;

fn app_key(id: &PathId, version: Timestamp) -> String {
    // Zero-padded millis keep redb's key order aligned with version order.
    format!("{}:{:020}", id.safe_path(), version.millis())
}

/// Versioned app definitions.
#[derive(Clone)]
pub struct AppRepository {
    store: StateStore,
}

impl AppRepository {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store_version(&self, app: &AppDefinition) -> StateResult<()> {
        let key = app_key(&app.id, app.version);
        let value = serde_json::to_vec(app).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.store.put(Table::Apps, &key, &value)?;
        debug!(app = %app.id, version = %app.version, "app version stored");
        Ok(())
    }

    pub fn get(&self, id: &PathId, version: Timestamp) -> StateResult<Option<AppDefinition>> {
        match self.store.get(Table::Apps, &app_key(id, version))? {
            Some(bytes) => {
                let app = serde_json::from_slice(&bytes)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?;
                Ok(Some(app))
            }
            None => Ok(None),
        }
    }

    /// The newest stored version of an app, if any.
    pub fn current(&self, id: &PathId) -> StateResult<Option<AppDefinition>> {
        let prefix = format!("{}:", id.safe_path());
        let entries = self.store.list_prefix(Table::Apps, &prefix)?;
        match entries.last() {
            Some((_, bytes)) => {
                let app = serde_json::from_slice(bytes)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?;
                Ok(Some(app))
            }
            None => Ok(None),
        }
    }

    /// All stored versions of an app, oldest first.
    pub fn versions(&self, id: &PathId) -> StateResult<Vec<Timestamp>> {
        let prefix = format!("{}:", id.safe_path());
        let mut versions = Vec::new();
        for (key, _) in self.store.list_prefix(Table::Apps, &prefix)? {
            let millis: u64 = key
                .rsplit(':')
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| StateError::Deserialize(format!("bad app key {key:?}")))?;
            versions.push(Timestamp::from_millis(millis));
        }
        Ok(versions)
    }

    /// Remove every version of an app.
    pub fn expunge(&self, id: &PathId) -> StateResult<usize> {
        let prefix = format!("{}:", id.safe_path());
        let removed = self.store.remove_prefix(Table::Apps, &prefix)?;
        debug!(app = %id, removed, "app expunged");
        Ok(removed)
    }
}

/// The single group-tree root document.
#[derive(Clone)]
pub struct GroupRepository {
    store: StateStore,
}

const ROOT_KEY: &str = "root";

impl GroupRepository {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn root(&self) -> StateResult<Option<Group>> {
        match self.store.get(Table::Groups, ROOT_KEY)? {
            Some(bytes) => {
                let group = serde_json::from_slice(&bytes)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    pub fn store_root(&self, root: &Group) -> StateResult<()> {
        let value = serde_json::to_vec(root).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.store.put(Table::Groups, ROOT_KEY, &value)?;
        debug!(version = %root.version, "group root stored");
        Ok(())
    }
}

/// The persistent framework id handed out by the master.
#[derive(Clone)]
pub struct FrameworkIdRepository {
    store: StateStore,
}

const FRAMEWORK_KEY: &str = "framework-id";

impl FrameworkIdRepository {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn get(&self) -> StateResult<Option<String>> {
        match self.store.get(Table::Framework, FRAMEWORK_KEY)? {
            Some(bytes) => {
                let id = String::from_utf8(bytes)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    pub fn store(&self, framework_id: &str) -> StateResult<()> {
        self.store
            .put(Table::Framework, FRAMEWORK_KEY, framework_id.as_bytes())
    }

    /// Forget the framework id so a fresh leader registers anew.
    pub fn expunge(&self) -> StateResult<bool> {
        self.store.remove(Table::Framework, FRAMEWORK_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: &str, millis: u64) -> AppDefinition {
        let mut app = AppDefinition::new(PathId::parse(id).unwrap());
        app.cmd = Some("sleep 3600".to_string());
        app.version = Timestamp::from_millis(millis);
        app
    }

    #[test]
    fn app_versions_are_kept_side_by_side() {
        let repo = AppRepository::new(StateStore::open_in_memory().unwrap());
        let id = PathId::parse("/prod/web").unwrap();
        repo.store_version(&app("/prod/web", 100)).unwrap();
        repo.store_version(&app("/prod/web", 200)).unwrap();

        assert!(repo.get(&id, Timestamp::from_millis(100)).unwrap().is_some());
        assert_eq!(
            repo.current(&id).unwrap().unwrap().version,
            Timestamp::from_millis(200)
        );
        assert_eq!(
            repo.versions(&id).unwrap(),
            vec![Timestamp::from_millis(100), Timestamp::from_millis(200)]
        );
    }

    #[test]
    fn version_order_survives_wide_ranges() {
        let repo = AppRepository::new(StateStore::open_in_memory().unwrap());
        let id = PathId::parse("/a").unwrap();
        repo.store_version(&app("/a", 999)).unwrap();
        repo.store_version(&app("/a", 10_000)).unwrap();
        // Without zero padding "999" would sort after "10000".
        assert_eq!(
            repo.current(&id).unwrap().unwrap().version,
            Timestamp::from_millis(10_000)
        );
    }

    #[test]
    fn expunge_removes_all_versions() {
        let repo = AppRepository::new(StateStore::open_in_memory().unwrap());
        let id = PathId::parse("/a").unwrap();
        repo.store_version(&app("/a", 1)).unwrap();
        repo.store_version(&app("/a", 2)).unwrap();
        assert_eq!(repo.expunge(&id).unwrap(), 2);
        assert!(repo.current(&id).unwrap().is_none());
    }

    #[test]
    fn similar_app_ids_do_not_collide() {
        let repo = AppRepository::new(StateStore::open_in_memory().unwrap());
        repo.store_version(&app("/web", 1)).unwrap();
        repo.store_version(&app("/web/api", 1)).unwrap();
        let id = PathId::parse("/web").unwrap();
        assert_eq!(repo.versions(&id).unwrap().len(), 1);
    }

    #[test]
    fn group_root_round_trips() {
        let repo = GroupRepository::new(StateStore::open_in_memory().unwrap());
        assert!(repo.root().unwrap().is_none());

        let mut root = Group::empty_root();
        root.put_app(app("/x", 5), Timestamp::from_millis(5)).unwrap();
        repo.store_root(&root).unwrap();
        assert_eq!(repo.root().unwrap().unwrap(), root);
    }

    #[test]
    fn framework_id_lifecycle() {
        let repo = FrameworkIdRepository::new(StateStore::open_in_memory().unwrap());
        assert!(repo.get().unwrap().is_none());
        repo.store("fw-20260802-0001").unwrap();
        assert_eq!(repo.get().unwrap().as_deref(), Some("fw-20260802-0001"));
        assert!(repo.expunge().unwrap());
        assert!(repo.get().unwrap().is_none());
    }
}
