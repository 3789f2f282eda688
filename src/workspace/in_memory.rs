use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    error::{ServiceError, ServiceResult},
    workspace::{Applied, Workspace, WorkspaceOp, WorkspaceRules, WorkspaceStore},
};

/// Process-local store. Each op runs under the map entry's write lock, so
/// mutations of one workspace are serialized and readers see either the old
/// or the new version.
pub struct InMemoryWorkspaceStore {
    workspaces: DashMap<String, Workspace>,
    rules: WorkspaceRules,
}

impl InMemoryWorkspaceStore {
    pub fn new(rules: WorkspaceRules) -> Self {
        Self {
            workspaces: DashMap::new(),
            rules,
        }
    }
}

#[async_trait]
impl WorkspaceStore for InMemoryWorkspaceStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, workspace: Workspace) -> ServiceResult<Workspace> {
        match self.workspaces.entry(workspace.id.clone()) {
            Entry::Occupied(_) => Err(ServiceError::Conflict(format!(
                "workspace {} already exists",
                workspace.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(workspace.clone());
                Ok(workspace)
            }
        }
    }

    async fn load(&self, id: &str) -> ServiceResult<Option<Workspace>> {
        Ok(self.workspaces.get(id).map(|ws| ws.value().clone()))
    }

    async fn apply(&self, id: &str, owner: &str, op: &WorkspaceOp) -> ServiceResult<Applied> {
        let mut entry = self
            .workspaces
            .get_mut(id)
            .ok_or(ServiceError::NotFound("workspace"))?;
        entry.ensure_owner(owner)?;

        let mut next = entry.value().clone();
        let file = next.apply(op, &self.rules)?;
        *entry.value_mut() = next.clone();
        Ok(Applied {
            workspace: next,
            file,
        })
    }

    async fn delete(&self, id: &str, owner: &str) -> ServiceResult<()> {
        match self.workspaces.entry(id.to_string()) {
            Entry::Vacant(_) => Err(ServiceError::NotFound("workspace")),
            Entry::Occupied(slot) => {
                slot.get().ensure_owner(owner)?;
                slot.remove();
                Ok(())
            }
        }
    }
}
