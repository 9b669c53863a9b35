use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AdminAuth;
use crate::constants::{DEFAULT_PAGE_SIZE, DEFAULT_QUERY_MAX_RESULTS, MAX_PAGE_SIZE, MAX_SINCE_DAYS};
use crate::extractors::JsonBody;
use crate::response::{created, ok, AppError};
use crate::schedule::Schedule;
use crate::state::AppState;
use crate::store::operations::subscribers::{
    validate_search_query, DeliveryPreferences, Platform, Recipient, SearchQuery, Subscriber,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_subscribers))
        .route(
            "/:platform/:chat_id",
            get(get_subscriber)
                .put(upsert_subscriber)
                .delete(delete_subscriber),
        )
        .route("/:platform/:chat_id/queries", post(add_query))
        .route("/:platform/:chat_id/queries/:index", delete(remove_query))
        .route("/:platform/:chat_id/fetch", post(fetch_now))
        .route("/:platform/:chat_id/deliveries", get(list_deliveries))
}

/// 订阅者视图，附带生效的推送计划和下次推送时间
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberView {
    #[serde(flatten)]
    subscriber: Subscriber,
    effective_schedule: String,
    next_due: DateTime<Utc>,
}

impl SubscriberView {
    fn new(subscriber: Subscriber, default_hours: u32) -> Self {
        let schedule = subscriber.effective_schedule(default_hours);
        let next_due = schedule.next_due(subscriber.last_check, Utc::now());
        Self {
            effective_schedule: schedule.to_string(),
            next_due,
            subscriber,
        }
    }
}

fn recipient_from_path(platform: &str, chat_id: &str) -> Result<Recipient, AppError> {
    let platform = Platform::from_str(platform)?;
    let chat_id = chat_id.trim();
    if chat_id.is_empty() {
        return Err(AppError::bad_request("INVALID_CHAT_ID", "chat_id must not be empty"));
    }
    if platform == Platform::Telegram && chat_id.parse::<i64>().is_err() {
        return Err(AppError::bad_request(
            "INVALID_CHAT_ID",
            "telegram chat_id must be an integer",
        ));
    }
    Ok(Recipient::new(platform, chat_id))
}

#[derive(Debug, Deserialize)]
struct ListSubscribersQuery {
    platform: Option<String>,
}

async fn list_subscribers(
    _admin: AdminAuth,
    Query(query): Query<ListSubscribersQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let subscribers = match query.platform.as_deref() {
        Some(p) => state.store().list_subscribers_by_platform(Platform::from_str(p)?)?,
        None => state.store().list_subscribers()?,
    };
    let default_hours = state.config().worker.fetch_interval_hours;
    let views: Vec<SubscriberView> = subscribers
        .into_iter()
        .map(|s| SubscriberView::new(s, default_hours))
        .collect();
    Ok(ok(views))
}

async fn get_subscriber(
    _admin: AdminAuth,
    Path((platform, chat_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let recipient = recipient_from_path(&platform, &chat_id)?;
    let subscriber = state
        .store()
        .get_subscriber(&recipient)?
        .ok_or_else(|| AppError::not_found("Subscriber not found"))?;
    Ok(ok(SubscriberView::new(
        subscriber,
        state.config().worker.fetch_interval_hours,
    )))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertSubscriberRequest {
    description: Option<String>,
    search_queries: Option<Vec<SearchQuery>>,
    /// `"6h"` or `"daily 08:00"`; an empty string clears it.
    schedule: Option<String>,
    preferences: Option<DeliveryPreferences>,
    since_days: Option<u32>,
}

async fn upsert_subscriber(
    _admin: AdminAuth,
    Path((platform, chat_id)): Path<(String, String)>,
    State(state): State<AppState>,
    JsonBody(req): JsonBody<UpsertSubscriberRequest>,
) -> Result<impl IntoResponse, AppError> {
    let recipient = recipient_from_path(&platform, &chat_id)?;
    let cap = state.config().arxiv.max_results;

    let queries = match req.search_queries {
        Some(queries) => {
            let mut normalized: Vec<SearchQuery> = Vec::with_capacity(queries.len());
            for q in queries {
                validate_search_query(&q.query, q.max_results, cap)?;
                let query = q.query.trim().to_string();
                if normalized.iter().any(|existing| existing.query == query) {
                    return Err(AppError::conflict(
                        "DUPLICATE_QUERY",
                        &format!("duplicate query: {query}"),
                    ));
                }
                normalized.push(SearchQuery {
                    query,
                    max_results: q.max_results,
                });
            }
            Some(normalized)
        }
        None => None,
    };

    let schedule = match req.schedule.as_deref().map(str::trim) {
        None => None,
        Some("") => Some(None),
        Some(raw) => Some(Some(Schedule::from_str(raw).map_err(|e| {
            AppError::bad_request("INVALID_SCHEDULE", &e.to_string())
        })?)),
    };

    if let Some(days) = req.since_days {
        if !(1..=MAX_SINCE_DAYS).contains(&days) {
            return Err(AppError::bad_request(
                "INVALID_SINCE_DAYS",
                &format!("sinceDays must be between 1 and {MAX_SINCE_DAYS}"),
            ));
        }
    }

    let subscriber = state.store().update_subscriber(&recipient, |sub| {
        if let Some(description) = &req.description {
            sub.description = Some(description.clone()).filter(|d| !d.trim().is_empty());
        }
        if let Some(queries) = &queries {
            sub.search_queries = queries.clone();
        }
        if let Some(schedule) = schedule {
            sub.schedule = schedule;
        }
        if let Some(prefs) = req.preferences {
            sub.preferences = prefs;
        }
        if let Some(days) = req.since_days {
            sub.since_days = days;
        }
    })?;

    tracing::info!(recipient = %recipient, "Subscriber upserted via admin API");
    Ok(ok(SubscriberView::new(
        subscriber,
        state.config().worker.fetch_interval_hours,
    )))
}

async fn delete_subscriber(
    _admin: AdminAuth,
    Path((platform, chat_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let recipient = recipient_from_path(&platform, &chat_id)?;
    if !state.store().delete_subscriber(&recipient)? {
        return Err(AppError::not_found("Subscriber not found"));
    }
    tracing::info!(recipient = %recipient, "Subscriber deleted via admin API");
    Ok(ok(serde_json::json!({"deleted": true, "recipient": recipient})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddQueryRequest {
    query: String,
    max_results: Option<u32>,
}

async fn add_query(
    _admin: AdminAuth,
    Path((platform, chat_id)): Path<(String, String)>,
    State(state): State<AppState>,
    JsonBody(req): JsonBody<AddQueryRequest>,
) -> Result<impl IntoResponse, AppError> {
    let recipient = recipient_from_path(&platform, &chat_id)?;
    let cap = state.config().arxiv.max_results;
    let max_results = req.max_results.unwrap_or(DEFAULT_QUERY_MAX_RESULTS.min(cap));
    let queries = state
        .store()
        .add_search_query(&recipient, &req.query, max_results, cap)?;
    Ok(created(queries))
}

async fn remove_query(
    _admin: AdminAuth,
    Path((platform, chat_id, index)): Path<(String, String, usize)>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let recipient = recipient_from_path(&platform, &chat_id)?;
    let removed = state.store().remove_search_query(&recipient, index)?;
    Ok(ok(removed))
}

async fn fetch_now(
    _admin: AdminAuth,
    Path((platform, chat_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let recipient = recipient_from_path(&platform, &chat_id)?;
    let report = state.pipeline().fetch_now(&recipient).await?;
    Ok(ok(report))
}

#[derive(Debug, Deserialize)]
struct DeliveriesQuery {
    limit: Option<usize>,
}

async fn list_deliveries(
    _admin: AdminAuth,
    Path((platform, chat_id)): Path<(String, String)>,
    Query(query): Query<DeliveriesQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let recipient = recipient_from_path(&platform, &chat_id)?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let records = state.store().deliveries_for_recipient(&recipient, limit)?;
    Ok(ok(records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_path_validation() {
        assert!(recipient_from_path("telegram", "12345").is_ok());
        assert!(recipient_from_path("telegram", "-100123").is_ok());
        assert!(recipient_from_path("telegram", "abc").is_err());
        assert!(recipient_from_path("matrix", "!room:example.org").is_ok());
        assert!(recipient_from_path("irc", "1").is_err());
        assert!(recipient_from_path("matrix", " ").is_err());
    }

    #[test]
    fn view_exposes_effective_schedule() {
        let sub = Subscriber::new(Recipient::telegram(1));
        let view = SubscriberView::new(sub, 6);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["effectiveSchedule"], "6h");
        assert_eq!(json["recipient"]["platform"], "telegram");
        assert!(json.get("nextDue").is_some());
    }
}
