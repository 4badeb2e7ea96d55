//! redb table definitions for the flotilla state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types). Composite keys follow `{safe_app_id}:{suffix}`.

use redb::TableDefinition;

/// Versioned app definitions keyed by `{safe_app_id}:{version_millis}`.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// The group tree, a single entry keyed `root`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Deployment plans keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Observed tasks keyed by `{safe_app_id}:{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// The framework id under the fixed key `framework-id`.
pub const FRAMEWORK: TableDefinition<&str, &[u8]> = TableDefinition::new("framework");

/// Logical table selector for the generic store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Apps,
    Groups,
    Deployments,
    Tasks,
    Framework,
}

impl Table {
    pub(crate) fn definition(&self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Table::Apps => APPS,
            Table::Groups => GROUPS,
            Table::Deployments => DEPLOYMENTS,
            Table::Tasks => TASKS,
            Table::Framework => FRAMEWORK,
        }
    }
}
