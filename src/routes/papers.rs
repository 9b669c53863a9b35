use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use crate::auth::AdminAuth;
use crate::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::response::{ok, AppError};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_recent))
        .route("/search", get(search))
        .route("/:arxiv_id", get(get_paper).delete(delete_paper))
        .route("/:arxiv_id/recipients", get(recipients))
        .route("/:arxiv_id/enrich", post(reenrich))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    limit: Option<usize>,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

async fn list_recent(
    _admin: AdminAuth,
    Query(query): Query<ListQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let papers = state.store().recent_papers(clamp_limit(query.limit))?;
    Ok(ok(papers))
}

async fn search(
    _admin: AdminAuth,
    Query(query): Query<SearchQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let keyword = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| AppError::bad_request("MISSING_KEYWORD", "query parameter q is required"))?;
    let papers = state
        .store()
        .search_papers(keyword, clamp_limit(query.limit))?;
    Ok(ok(papers))
}

async fn get_paper(
    _admin: AdminAuth,
    Path(arxiv_id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let paper = state
        .store()
        .get_paper(&arxiv_id)?
        .ok_or_else(|| AppError::not_found("Paper not found"))?;
    Ok(ok(paper))
}

/// Ledger rows are kept, so a re-fetched paper is not delivered twice.
async fn delete_paper(
    _admin: AdminAuth,
    Path(arxiv_id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    if !state.store().delete_paper(&arxiv_id)? {
        return Err(AppError::not_found("Paper not found"));
    }
    tracing::info!(arxiv_id = %arxiv_id, "Paper deleted via admin API");
    Ok(ok(serde_json::json!({"deleted": true, "arxivId": arxiv_id})))
}

async fn recipients(
    _admin: AdminAuth,
    Path(arxiv_id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let recipients = state.store().recipients_for_paper(&arxiv_id)?;
    Ok(ok(recipients))
}

/// 重新生成标签与总结，覆盖已有字段
async fn reenrich(
    _admin: AdminAuth,
    Path(arxiv_id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let paper = state.pipeline().reenrich(&arxiv_id).await?;
    Ok(ok(paper))
}
