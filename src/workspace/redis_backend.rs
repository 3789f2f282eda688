use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};

use crate::{
    error::{ServiceError, ServiceResult},
    workspace::{Applied, Workspace, WorkspaceOp, WorkspaceRules, WorkspaceStore},
};

const CREATE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'version', ARGV[1], 'data', ARGV[2])
return 1
"#;

// -1: missing, 0: version moved on, 1: swapped
const COMPARE_AND_SET_LUA: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
  return -1
end
if tonumber(current) ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'data', ARGV[3])
return 1
"#;

// same return codes as above
const COMPARE_AND_DELETE_LUA: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
  return -1
end
if tonumber(current) ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

const MAX_CAS_ATTEMPTS: usize = 8;

/// Shared store: each workspace is a hash with `version` and JSON `data`
/// fields. Ops are optimistic: read, apply locally, then swap only if the
/// version is unchanged.
pub struct RedisWorkspaceStore {
    manager: ConnectionManager,
    key_prefix: String,
    rules: WorkspaceRules,
    create_script: Script,
    cas_script: Script,
    delete_script: Script,
}

impl RedisWorkspaceStore {
    pub async fn new(url: &str, key_prefix: String, rules: WorkspaceRules) -> ServiceResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
            rules,
            create_script: Script::new(CREATE_LUA),
            cas_script: Script::new(COMPARE_AND_SET_LUA),
            delete_script: Script::new(COMPARE_AND_DELETE_LUA),
        })
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.key_prefix, id)
    }
}

#[async_trait]
impl WorkspaceStore for RedisWorkspaceStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn create(&self, workspace: Workspace) -> ServiceResult<Workspace> {
        let mut conn = self.manager.clone();
        let data = serde_json::to_string(&workspace)?;
        let created: i64 = self
            .create_script
            .key(self.key(&workspace.id))
            .arg(workspace.version)
            .arg(data)
            .invoke_async(&mut conn)
            .await?;
        if created == 1 {
            Ok(workspace)
        } else {
            Err(ServiceError::Conflict(format!(
                "workspace {} already exists",
                workspace.id
            )))
        }
    }

    async fn load(&self, id: &str) -> ServiceResult<Option<Workspace>> {
        let mut conn = self.manager.clone();
        let data: Option<String> = redis::cmd("HGET")
            .arg(self.key(id))
            .arg("data")
            .query_async(&mut conn)
            .await?;
        data.map(|raw| serde_json::from_str(&raw).map_err(ServiceError::from))
            .transpose()
    }

    async fn apply(&self, id: &str, owner: &str, op: &WorkspaceOp) -> ServiceResult<Applied> {
        let mut conn = self.manager.clone();
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self
                .load(id)
                .await?
                .ok_or(ServiceError::NotFound("workspace"))?;
            current.ensure_owner(owner)?;

            let mut next = current.clone();
            let file = next.apply(op, &self.rules)?;
            let data = serde_json::to_string(&next)?;
            let swapped: i64 = self
                .cas_script
                .key(self.key(id))
                .arg(current.version)
                .arg(next.version)
                .arg(data)
                .invoke_async(&mut conn)
                .await?;
            match swapped {
                1 => {
                    return Ok(Applied {
                        workspace: next,
                        file,
                    });
                }
                -1 => return Err(ServiceError::NotFound("workspace")),
                _ => tracing::debug!(workspace_id = id, attempt, "workspace version moved, retrying"),
            }
        }
        Err(ServiceError::Conflict(
            "workspace is being modified concurrently, retry the request".to_string(),
        ))
    }

    async fn delete(&self, id: &str, owner: &str) -> ServiceResult<()> {
        let mut conn = self.manager.clone();
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self
                .load(id)
                .await?
                .ok_or(ServiceError::NotFound("workspace"))?;
            current.ensure_owner(owner)?;

            let deleted: i64 = self
                .delete_script
                .key(self.key(id))
                .arg(current.version)
                .invoke_async(&mut conn)
                .await?;
            match deleted {
                1 => return Ok(()),
                -1 => return Err(ServiceError::NotFound("workspace")),
                _ => tracing::debug!(workspace_id = id, attempt, "workspace version moved, retrying delete"),
            }
        }
        Err(ServiceError::Conflict(
            "workspace is being modified concurrently, retry the request".to_string(),
        ))
    }
}
