//! Task persistence over the generic store.

use flotilla_core::PathId;
use flotilla_state::{StateError, StateResult, StateStore, Table};
use tracing::debug;

use crate::task::Task;

fn task_key(app_id: &PathId, task_id: &str) -> String {
    format!("{}:{}", app_id.safe_path(), task_id)
}

/// Tasks keyed by `{safe_app_id}:{task_id}`.
#[derive(Clone)]
pub struct TaskRepository {
    store: StateStore,
}

impl TaskRepository {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self, task: &Task) -> StateResult<()> {
        let key = task_key(&task.app_id, &task.id);
        let value = serde_json::to_vec(task).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.store.put(Table::Tasks, &key, &value)
    }

    pub fn get(&self, app_id: &PathId, task_id: &str) -> StateResult<Option<Task>> {
        match self.store.get(Table::Tasks, &task_key(app_id, task_id))? {
            Some(bytes) => {
                let task = serde_json::from_slice(&bytes)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    pub fn tasks_for_app(&self, app_id: &PathId) -> StateResult<Vec<Task>> {
        let prefix = format!("{}:", app_id.safe_path());
        let mut tasks = Vec::new();
        for (_, bytes) in self.store.list_prefix(Table::Tasks, &prefix)? {
            tasks.push(
                serde_json::from_slice(&bytes)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?,
            );
        }
        Ok(tasks)
    }

    pub fn all(&self) -> StateResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for (_, bytes) in self.store.list_prefix(Table::Tasks, "")? {
            tasks.push(
                serde_json::from_slice(&bytes)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?,
            );
        }
        Ok(tasks)
    }

    pub fn expunge(&self, app_id: &PathId, task_id: &str) -> StateResult<bool> {
        let removed = self.store.remove(Table::Tasks, &task_key(app_id, task_id))?;
        debug!(app = %app_id, task = task_id, removed, "task expunged");
        Ok(removed)
    }

    pub fn expunge_app(&self, app_id: &PathId) -> StateResult<usize> {
        let prefix = format!("{}:", app_id.safe_path());
        self.store.remove_prefix(Table::Tasks, &prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::Timestamp;
    use flotilla_master::TaskState;

    fn task(app: &str, id: &str) -> Task {
        Task {
            id: id.to_string(),
            app_id: PathId::parse(app).unwrap(),
            app_version: Timestamp::from_millis(1),
            host: "node-1".to_string(),
            agent_id: "agent-1".to_string(),
            attributes: Default::default(),
            host_ports: vec![],
            staged_at: Timestamp::from_millis(10),
            started_at: None,
            status: TaskState::Staging,
            health_results: Vec::new(),
        }
    }

    #[test]
    fn store_and_fetch() {
        let repo = TaskRepository::new(StateStore::open_in_memory().unwrap());
        let t = task("/web", "web.t1");
        repo.store(&t).unwrap();

        let id = PathId::parse("/web").unwrap();
        assert_eq!(repo.get(&id, "web.t1").unwrap().unwrap(), t);
        assert_eq!(repo.tasks_for_app(&id).unwrap().len(), 1);
        assert!(repo.expunge(&id, "web.t1").unwrap());
        assert!(repo.get(&id, "web.t1").unwrap().is_none());
    }

    #[test]
    fn apps_are_separated() {
        let repo = TaskRepository::new(StateStore::open_in_memory().unwrap());
        repo.store(&task("/web", "web.t1")).unwrap();
        repo.store(&task("/db", "db.t1")).unwrap();

        assert_eq!(repo.all().unwrap().len(), 2);
        assert_eq!(
            repo.expunge_app(&PathId::parse("/web").unwrap()).unwrap(),
            1
        );
        assert_eq!(repo.all().unwrap().len(), 1);
    }
}
