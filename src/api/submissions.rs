use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use uuid::Uuid;

use crate::{
    api::{AppState, authenticate},
    error::ServiceError,
    models::{PollQuery, SubmissionAccepted, SubmissionRecord, SubmitRequest},
};

pub(super) async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmissionAccepted>), ServiceError> {
    let owner = authenticate(&state, &headers)?;
    let accepted = state.service.submit(&owner, request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub(super) async fn get_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<PollQuery>,
) -> Result<Json<SubmissionRecord>, ServiceError> {
    let owner = authenticate(&state, &headers)?;
    let wait = query.wait_ms.map(Duration::from_millis);
    Ok(Json(state.service.poll(&owner, id, wait).await?))
}

pub(super) async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    let owner = authenticate(&state, &headers)?;
    state.service.cancel(&owner, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
