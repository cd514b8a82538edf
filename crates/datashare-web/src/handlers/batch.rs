use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use datashare_batch::{BatchSearch, BatchSearchResult};
use datashare_common::{
    error::DatashareError,
    types::{Project, User},
};
use tracing::info;

use crate::{
    handlers::ApiError,
    router::WebState,
    types::{ResultsPage, SubmitBatchSearchRequest},
};

pub async fn submit_batch_search(
    State(state): State<Arc<WebState>>,
    Extension(user): Extension<User>,
    Path(project): Path<String>,
    Json(payload): Json<SubmitBatchSearchRequest>,
) -> Result<Json<BatchSearch>, ApiError> {
    let project = Project::new(project);
    if !user.is_granted(&project) {
        return Err(ApiError(DatashareError::AccessDenied(format!(
            "user {} is not granted project {project}",
            user.id
        ))));
    }

    let batch = BatchSearch::new(project, payload.name, payload.description, payload.queries);
    let saved = state.repository.save(&user, batch).await?;
    state.signal.notify();
    info!(
        batch = %saved.id,
        project = %saved.project,
        owner = %saved.owner,
        queries = saved.queries.len(),
        "batch search submitted"
    );
    Ok(Json(saved))
}

pub async fn list_batch_searches(
    State(state): State<Arc<WebState>>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<BatchSearch>>, ApiError> {
    Ok(Json(state.repository.get(&user).await?))
}

pub async fn get_batch_search(
    State(state): State<Arc<WebState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<BatchSearch>, ApiError> {
    state
        .repository
        .get_by_id(&user, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(DatashareError::NotFound(format!("batch search {id}"))))
}

pub async fn get_batch_search_results(
    State(state): State<Arc<WebState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    Query(page): Query<ResultsPage>,
) -> Result<Json<Vec<BatchSearchResult>>, ApiError> {
    let (from, size) = page.bounds();
    Ok(Json(
        state.repository.get_results(&user, &id, from, size).await?,
    ))
}

pub async fn delete_batch_search(
    State(state): State<Arc<WebState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.repository.delete(&user, &id).await? {
        info!(batch = %id, owner = %user.id, "batch search deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(DatashareError::NotFound(format!("batch search {id}"))))
    }
}
