use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use uuid::Uuid;

use crate::{
    api::{AppState, authenticate},
    error::{ServiceError, ServiceResult},
    models::{RunWorkspaceRequest, SubmissionAccepted},
    workspace::{
        AddFileRequest, CreateWorkspaceRequest, FilePatch, Workspace, WorkspaceFile, WorkspaceOp,
        validate_workspace_id,
    },
};

pub(super) async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateWorkspaceRequest>,
) -> Result<(StatusCode, Json<Workspace>), ServiceError> {
    let owner = authenticate(&state, &headers)?;
    let id = request.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    validate_workspace_id(&id)?;

    let registry = state.service.registry();
    let profile = match request.language.as_deref() {
        Some(language) => registry.get(language).ok_or_else(|| {
            ServiceError::Validation(format!("unsupported language: {language}"))
        })?,
        None => registry
            .get(&state.default_language)
            .or_else(|| registry.iter().next())
            .ok_or_else(|| ServiceError::Internal("language catalogue is empty".to_string()))?,
    };

    let workspace = state
        .workspaces
        .create(Workspace::seeded(id, owner.clone(), &profile))
        .await?;
    tracing::info!(workspace_id = %workspace.id, owner, language = %workspace.language, "workspace created");
    Ok((StatusCode::CREATED, Json(workspace)))
}

pub(super) async fn get_workspace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Workspace>, ServiceError> {
    let owner = authenticate(&state, &headers)?;
    Ok(Json(load_for_owner(&state, &id, &owner).await?))
}

pub(super) async fn delete_workspace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ServiceError> {
    let owner = authenticate(&state, &headers)?;
    state.workspaces.delete(&id, &owner).await?;
    tracing::info!(workspace_id = %id, owner, "workspace deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<WorkspaceFile>>, ServiceError> {
    let owner = authenticate(&state, &headers)?;
    Ok(Json(load_for_owner(&state, &id, &owner).await?.files))
}

pub(super) async fn add_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<AddFileRequest>,
) -> Result<(StatusCode, Json<WorkspaceFile>), ServiceError> {
    let owner = authenticate(&state, &headers)?;
    let op = WorkspaceOp::AddFile {
        name: request.name,
        content: request.content,
        language: request.language,
    };
    let file = apply_to_file(&state, &id, &owner, &op).await?;
    Ok((StatusCode::CREATED, Json(file)))
}

pub(super) async fn get_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<WorkspaceFile>, ServiceError> {
    let owner = authenticate(&state, &headers)?;
    let workspace = load_for_owner(&state, &id, &owner).await?;
    workspace
        .file(&name)
        .cloned()
        .map(Json)
        .ok_or(ServiceError::NotFound("file"))
}

pub(super) async fn update_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, name)): Path<(String, String)>,
    Json(patch): Json<FilePatch>,
) -> Result<Json<WorkspaceFile>, ServiceError> {
    let owner = authenticate(&state, &headers)?;
    let op = WorkspaceOp::EditFile {
        name,
        rename_to: patch.name,
        content: patch.content,
        language: patch.language,
    };
    Ok(Json(apply_to_file(&state, &id, &owner, &op).await?))
}

pub(super) async fn delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, name)): Path<(String, String)>,
) -> Result<StatusCode, ServiceError> {
    let owner = authenticate(&state, &headers)?;
    state
        .workspaces
        .apply(&id, &owner, &WorkspaceOp::DeleteFile { name })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<RunWorkspaceRequest>,
) -> Result<(StatusCode, Json<SubmissionAccepted>), ServiceError> {
    let owner = authenticate(&state, &headers)?;
    let workspace = load_for_owner(&state, &id, &owner).await?;
    let accepted = state
        .service
        .submit_workspace(&owner, &workspace, request)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn load_for_owner(state: &AppState, id: &str, owner: &str) -> ServiceResult<Workspace> {
    let workspace = state
        .workspaces
        .load(id)
        .await?
        .ok_or(ServiceError::NotFound("workspace"))?;
    workspace.ensure_owner(owner)?;
    Ok(workspace)
}

async fn apply_to_file(
    state: &AppState,
    id: &str,
    owner: &str,
    op: &WorkspaceOp,
) -> ServiceResult<WorkspaceFile> {
    state
        .workspaces
        .apply(id, owner, op)
        .await?
        .file
        .ok_or_else(|| ServiceError::Internal("workspace op returned no file".to_string()))
}
