//! Multi-file projects owned by one tenant.
//!
//! Every mutation is a [`WorkspaceOp`] applied to a copy of the workspace and
//! swapped in only when it succeeds, so a rejected rename or delete never
//! leaves a partial change behind. Backends differ only in how they make the
//! swap atomic.

pub mod in_memory;
pub mod redis_backend;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ServiceError, ServiceResult},
    languages::{LanguageProfile, LanguageRegistry},
};

pub use in_memory::InMemoryWorkspaceStore;
pub use redis_backend::RedisWorkspaceStore;

const MAX_FILE_NAME_LEN: usize = 128;
const MAX_WORKSPACE_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFile {
    pub name: String,
    pub content: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub owner: String,
    pub language: String,
    pub files: Vec<WorkspaceFile>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// A single atomic change to a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceOp {
    AddFile {
        name: Option<String>,
        content: String,
        language: Option<String>,
    },
    /// Rename and/or rewrite one file; all requested changes land together.
    EditFile {
        name: String,
        rename_to: Option<String>,
        content: Option<String>,
        language: Option<String>,
    },
    DeleteFile {
        name: String,
    },
}

/// Result of a successful [`WorkspaceOp`]: the new workspace and the file
/// the op touched (absent for deletes).
#[derive(Debug, Clone)]
pub struct Applied {
    pub workspace: Workspace,
    pub file: Option<WorkspaceFile>,
}

/// Limits and the language catalogue every mutation is checked against.
#[derive(Clone)]
pub struct WorkspaceRules {
    pub registry: Arc<LanguageRegistry>,
    pub max_files: usize,
    pub max_file_bytes: usize,
}

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stores a new workspace; `Conflict` if the id is taken.
    async fn create(&self, workspace: Workspace) -> ServiceResult<Workspace>;

    async fn load(&self, id: &str) -> ServiceResult<Option<Workspace>>;

    /// Applies `op` atomically on behalf of `owner`.
    async fn apply(&self, id: &str, owner: &str, op: &WorkspaceOp) -> ServiceResult<Applied>;

    /// Removes the workspace and all its files. Only `owner` may do this.
    async fn delete(&self, id: &str, owner: &str) -> ServiceResult<()>;
}

// Request bodies shared by the HTTP handlers and the client.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspaceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFileRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// `PATCH` body; `name` is the new name when renaming.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Workspace {
    /// A new workspace seeded with the language's sample program.
    pub fn seeded(id: String, owner: String, profile: &LanguageProfile) -> Self {
        Self {
            id,
            owner,
            language: profile.id.clone(),
            files: vec![WorkspaceFile {
                name: profile.default_entry(),
                content: profile.sample_code.clone(),
                language: profile.id.clone(),
            }],
            version: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn file(&self, name: &str) -> Option<&WorkspaceFile> {
        self.files.iter().find(|f| f.name == name)
    }

    fn position(&self, name: &str) -> ServiceResult<usize> {
        self.files
            .iter()
            .position(|f| f.name == name)
            .ok_or(ServiceError::NotFound("file"))
    }

    pub fn ensure_owner(&self, owner: &str) -> ServiceResult<()> {
        if self.owner == owner {
            Ok(())
        } else {
            Err(ServiceError::Forbidden)
        }
    }

    /// Applies `op` in place. All checks run before the first write, so an
    /// error leaves `self` untouched.
    pub fn apply(
        &mut self,
        op: &WorkspaceOp,
        rules: &WorkspaceRules,
    ) -> ServiceResult<Option<WorkspaceFile>> {
        let touched = match op {
            WorkspaceOp::AddFile {
                name,
                content,
                language,
            } => {
                if self.files.len() >= rules.max_files {
                    return Err(ServiceError::Validation(format!(
                        "workspace already holds the maximum of {} files",
                        rules.max_files
                    )));
                }
                check_content(content, rules)?;
                let name = match name {
                    Some(name) => {
                        validate_file_name(name)?;
                        if self.file(name).is_some() {
                            return Err(ServiceError::Conflict(format!(
                                "a file named {name} already exists"
                            )));
                        }
                        name.clone()
                    }
                    None => self.next_file_name(rules),
                };
                let file = WorkspaceFile {
                    language: self.resolve_language(&name, language.as_deref(), None, rules)?,
                    name,
                    content: content.clone(),
                };
                self.files.push(file.clone());
                Some(file)
            }
            WorkspaceOp::EditFile {
                name,
                rename_to,
                content,
                language,
            } => {
                let index = self.position(name)?;
                let target = match rename_to {
                    Some(new_name) if new_name != name => {
                        validate_file_name(new_name)?;
                        if self.file(new_name).is_some() {
                            return Err(ServiceError::Conflict(format!(
                                "a file named {new_name} already exists"
                            )));
                        }
                        Some(new_name.clone())
                    }
                    _ => None,
                };
                if let Some(content) = content {
                    check_content(content, rules)?;
                }
                let current = &self.files[index];
                let language = match (language, &target) {
                    (Some(_), _) | (None, Some(_)) => self.resolve_language(
                        target.as_deref().unwrap_or(name),
                        language.as_deref(),
                        Some(current.language.as_str()),
                        rules,
                    )?,
                    (None, None) => current.language.clone(),
                };

                let file = &mut self.files[index];
                if let Some(target) = target {
                    file.name = target;
                }
                if let Some(content) = content {
                    file.content = content.clone();
                }
                file.language = language;
                Some(file.clone())
            }
            WorkspaceOp::DeleteFile { name } => {
                let index = self.position(name)?;
                if self.files.len() == 1 {
                    return Err(ServiceError::InvariantViolation(
                        "a workspace must keep at least one file".to_string(),
                    ));
                }
                self.files.remove(index);
                None
            }
        };
        self.version += 1;
        self.updated_at = Utc::now();
        Ok(touched)
    }

    // file<N>.<ext>, N starting at the file count plus one
    fn next_file_name(&self, rules: &WorkspaceRules) -> String {
        let extension = rules
            .registry
            .get(&self.language)
            .map(|profile| profile.extension.clone())
            .unwrap_or_else(|| "txt".to_string());
        let mut n = self.files.len() + 1;
        loop {
            let candidate = format!("file{n}.{extension}");
            if self.file(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    fn resolve_language(
        &self,
        name: &str,
        explicit: Option<&str>,
        fallback: Option<&str>,
        rules: &WorkspaceRules,
    ) -> ServiceResult<String> {
        if let Some(language) = explicit {
            return rules
                .registry
                .get(language)
                .map(|profile| profile.id.clone())
                .ok_or_else(|| ServiceError::Validation(format!("unsupported language: {language}")));
        }
        Ok(rules
            .registry
            .for_file_name(name)
            .map(|profile| profile.id.clone())
            .or_else(|| fallback.map(str::to_string))
            .unwrap_or_else(|| self.language.clone()))
    }
}

fn check_content(content: &str, rules: &WorkspaceRules) -> ServiceResult<()> {
    if content.len() > rules.max_file_bytes {
        return Err(ServiceError::Validation(format!(
            "file content exceeds {} bytes",
            rules.max_file_bytes
        )));
    }
    Ok(())
}

/// File names are plain names: no separators, no traversal, no template
/// braces, at most 128 characters.
pub fn validate_file_name(name: &str) -> ServiceResult<()> {
    let invalid = |reason: &str| -> ServiceResult<()> {
        Err(ServiceError::Validation(format!(
            "invalid file name {name:?}: {reason}"
        )))
    };
    if name.is_empty() {
        return invalid("empty");
    }
    if name.chars().count() > MAX_FILE_NAME_LEN {
        return invalid("longer than 128 characters");
    }
    if name == "." || name == ".." {
        return invalid("reserved");
    }
    if name
        .chars()
        .any(|c| matches!(c, '/' | '\\' | '{' | '}') || c.is_control())
    {
        return invalid("contains a forbidden character");
    }
    if name.trim() != name {
        return invalid("leading or trailing whitespace");
    }
    Ok(())
}

pub fn validate_workspace_id(id: &str) -> ServiceResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_WORKSPACE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ServiceError::Validation(format!(
            "invalid workspace id {id:?}: expected 1-64 of [A-Za-z0-9_-]"
        )))
    }
}

#[cfg(test)]
pub(crate) fn test_rules() -> WorkspaceRules {
    WorkspaceRules {
        registry: Arc::new(LanguageRegistry::builtin()),
        max_files: 4,
        max_file_bytes: 1024,
    }
}
