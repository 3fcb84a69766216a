use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Map, Value};

use crate::auth;
use crate::error::{AppError, AppResult};
use crate::repository::table_service;
use crate::schemas::{
    clamp_limit_in_range, validate_input, ClearPdcInput, CreatePdcInput, PdcPath, PdcsQuery,
    ReplacePdcInput,
};
use crate::services::pdc_ledger;
use crate::state::AppState;
use crate::tenancy;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pdcs", post(register_check).get(list_checks))
        .route("/pdcs/{pdc_id}/clear", post(clear_check))
        .route("/pdcs/{pdc_id}/bounce", post(bounce_check))
        .route("/pdcs/{pdc_id}/replace", post(replace_check))
}

async fn register_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreatePdcInput>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    validate_input(&input)?;
    let check = pdc_ledger::register_check(&state, &user_id, &input).await?;
    Ok(Json(check))
}

async fn clear_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<PdcPath>,
    Json(input): Json<ClearPdcInput>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    let check = pdc_ledger::mark_cleared(
        &state,
        &user_id,
        &path.pdc_id,
        input.billing_statement_id.as_deref(),
    )
    .await?;
    Ok(Json(check))
}

async fn bounce_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<PdcPath>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    let check = pdc_ledger::mark_bounced(&state, &user_id, &path.pdc_id).await?;
    Ok(Json(check))
}

async fn replace_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<PdcPath>,
    Json(input): Json<ReplacePdcInput>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    validate_input(&input)?;
    let replacement = pdc_ledger::replace_check(&state, &user_id, &path.pdc_id, &input).await?;
    Ok(Json(replacement))
}

async fn list_checks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PdcsQuery>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    tenancy::assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(query.org_id));
    if let Some(lease_id) = &query.lease_id {
        filters.insert("lease_id".to_string(), json!(lease_id));
    }
    if let Some(status) = &query.status {
        filters.insert("status".to_string(), json!(status));
    }
    if let Some(start) = &query.period_start {
        let start = pdc_ledger::parse_date(start, "period_start")?;
        filters.insert("due_date__gte".to_string(), json!(start.to_string()));
    }
    if let Some(end) = &query.period_end {
        let end = pdc_ledger::parse_date(end, "period_end")?;
        filters.insert("due_date__lte".to_string(), json!(end.to_string()));
    }

    let limit = clamp_limit_in_range(query.limit, 1, 500);
    let rows = table_service::list_rows(
        pool,
        "post_dated_checks",
        Some(&filters),
        limit,
        0,
        "due_date",
        true,
    )
    .await?;
    let count = rows.len();
    Ok(Json(json!({ "items": rows, "count": count })))
}

fn db_pool(state: &AppState) -> Result<&sqlx::PgPool, AppError> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
