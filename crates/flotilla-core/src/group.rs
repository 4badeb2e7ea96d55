//! The group tree — recursive container of apps and sub-groups.
//!
//! Groups reference apps and other groups by [`PathId`], never by
//! pointer; parents are computed on traversal so the tree stays a
//! plain value type.

use serde::{Deserialize, Serialize};

use crate::app::{AppDefinition, ValidationError};
use crate::clock::Timestamp;
use crate::path::PathId;

/// A node in the declared-state tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: PathId,
    #[serde(default)]
    pub apps: Vec<AppDefinition>,
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Ids of apps or groups that must be deployed before anything in
    /// this group, absolute or relative to the parent group.
    #[serde(default)]
    pub dependencies: Vec<PathId>,
    pub version: Timestamp,
}

impl Group {
    /// An empty group at the given path.
    pub fn empty(id: PathId, version: Timestamp) -> Self {
        Self {
            id,
            apps: Vec::new(),
            groups: Vec::new(),
            dependencies: Vec::new(),
            version,
        }
    }

    /// An empty root group.
    pub fn empty_root() -> Self {
        Self::empty(PathId::root(), Timestamp::ZERO)
    }

    /// All apps in this group and every sub-group, depth first.
    pub fn transitive_apps(&self) -> Vec<&AppDefinition> {
        let mut apps: Vec<&AppDefinition> = self.apps.iter().collect();
        for group in &self.groups {
            apps.extend(group.transitive_apps());
        }
        apps
    }

    /// All groups in the subtree including this one.
    pub fn transitive_groups(&self) -> Vec<&Group> {
        let mut groups = vec![self];
        for group in &self.groups {
            groups.extend(group.transitive_groups());
        }
        groups
    }

    pub fn find_app(&self, id: &PathId) -> Option<&AppDefinition> {
        self.transitive_apps().into_iter().find(|a| &a.id == id)
    }

    pub fn find_group(&self, id: &PathId) -> Option<&Group> {
        self.transitive_groups().into_iter().find(|g| &g.id == id)
    }

    /// Insert or replace an app, creating intermediate groups on the
    /// way down. The app id must live underneath this group.
    pub fn put_app(&mut self, app: AppDefinition, version: Timestamp) -> Result<(), ValidationError> {
        if !self.id.contains(&app.id) || app.id == self.id {
            return Err(ValidationError(format!(
                "app {} is not below group {}",
                app.id, self.id
            )));
        }
        self.version = version;
        if app.id.parent() == self.id {
            if let Some(existing) = self.apps.iter_mut().find(|a| a.id == app.id) {
                *existing = app;
            } else {
                self.apps.push(app);
            }
            return Ok(());
        }
        let child_path = child_of(&self.id, &app.id);
        if let Some(group) = self.groups.iter_mut().find(|g| g.id == child_path) {
            return group.put_app(app, version);
        }
        let mut group = Group::empty(child_path, version);
        group.put_app(app, version)?;
        self.groups.push(group);
        Ok(())
    }

    /// Remove an app anywhere in the subtree. Returns the removed
    /// definition, if present.
    pub fn remove_app(&mut self, id: &PathId, version: Timestamp) -> Option<AppDefinition> {
        if let Some(pos) = self.apps.iter().position(|a| &a.id == id) {
            self.version = version;
            return Some(self.apps.remove(pos));
        }
        for group in &mut self.groups {
            if group.id.contains(id) {
                let removed = group.remove_app(id, version);
                if removed.is_some() {
                    self.version = version;
                }
                return removed;
            }
        }
        None
    }

    /// Remove a sub-group (and everything below it).
    pub fn remove_group(&mut self, id: &PathId, version: Timestamp) -> Option<Group> {
        if let Some(pos) = self.groups.iter().position(|g| &g.id == id) {
            self.version = version;
            return Some(self.groups.remove(pos));
        }
        for group in &mut self.groups {
            if group.id.contains(id) {
                let removed = group.remove_group(id, version);
                if removed.is_some() {
                    self.version = version;
                }
                return removed;
            }
        }
        None
    }

    /// Set the version on this node and every node below it.
    pub fn update_version(&mut self, version: Timestamp) {
        self.version = version;
        for app in &mut self.apps {
            app.version = version;
        }
        for group in &mut self.groups {
            group.update_version(version);
        }
    }

    /// Structural validation of the whole subtree: children must be
    /// direct children of the enclosing path, ids unique, and no app
    /// id may equal a group id at the same node.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for app in &self.apps {
            if app.id.parent() != self.id {
                return Err(ValidationError(format!(
                    "app {} is not a direct child of group {}",
                    app.id, self.id
                )));
            }
            app.validate()?;
        }
        for group in &self.groups {
            if group.id.parent() != self.id {
                return Err(ValidationError(format!(
                    "group {} is not a direct child of group {}",
                    group.id, self.id
                )));
            }
        }
        for (i, app) in self.apps.iter().enumerate() {
            if self.apps[..i].iter().any(|other| other.id == app.id) {
                return Err(ValidationError(format!("duplicate app id {}", app.id)));
            }
            if self.groups.iter().any(|g| g.id == app.id) {
                return Err(ValidationError(format!(
                    "id {} is used by both an app and a group",
                    app.id
                )));
            }
        }
        for (i, group) in self.groups.iter().enumerate() {
            if self.groups[..i].iter().any(|other| other.id == group.id) {
                return Err(ValidationError(format!("duplicate group id {}", group.id)));
            }
            group.validate()?;
        }
        Ok(())
    }

    /// Dependencies of an app including those inherited from every
    /// enclosing group, resolved to absolute paths against the
    /// declaring node's parent.
    pub fn resolved_dependencies(&self, app_id: &PathId) -> Result<Vec<PathId>, ValidationError> {
        let mut resolved = Vec::new();
        self.collect_dependencies(app_id, &mut resolved)?;
        Ok(resolved)
    }

    fn collect_dependencies(
        &self,
        app_id: &PathId,
        out: &mut Vec<PathId>,
    ) -> Result<(), ValidationError> {
        if !self.id.contains(app_id) {
            return Ok(());
        }
        for dep in &self.dependencies {
            let abs = dep
                .resolve(&self.id.parent())
                .map_err(|e| ValidationError(e.to_string()))?;
            if !out.contains(&abs) {
                out.push(abs);
            }
        }
        if let Some(app) = self.apps.iter().find(|a| &a.id == app_id) {
            for dep in &app.dependencies {
                let abs = dep
                    .resolve(&self.id)
                    .map_err(|e| ValidationError(e.to_string()))?;
                if !out.contains(&abs) {
                    out.push(abs);
                }
            }
        }
        for group in &self.groups {
            group.collect_dependencies(app_id, out)?;
        }
        Ok(())
    }
}

fn child_of(base: &PathId, descendant: &PathId) -> PathId {
    let next = &descendant.segments()[base.segments().len()];
    base.append(next).expect("descendant segments are validated")
}
