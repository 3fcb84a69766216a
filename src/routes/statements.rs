use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};

use crate::auth;
use crate::error::{AppError, AppResult};
use crate::repository::table_service;
use crate::schemas::{
    clamp_limit_in_range, CreateStatementInput, StatementPath, StatementsQuery,
};
use crate::services::billing;
use crate::state::AppState;
use crate::tenancy;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/statements", post(create_statement).get(list_statements))
        .route("/statements/{statement_id}", get(get_statement))
        .route(
            "/internal/statements/mark-overdue",
            post(mark_overdue),
        )
}

async fn create_statement(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateStatementInput>,
) -> AppResult<Json<Value>> {
    if !state.config.settlement_enabled {
        return Err(AppError::Forbidden(
            "Settlement is disabled for this deployment.".to_string(),
        ));
    }
    let user_id = auth::require_user_id(&state, &headers).await?;
    let statement = billing::create_statement(&state, &user_id, &input).await?;
    Ok(Json(statement))
}

async fn get_statement(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<StatementPath>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let statement =
        table_service::get_row(pool, "billing_statements", &path.statement_id, "id").await?;
    let org_id = statement
        .get("organization_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    tenancy::assert_org_member(&state, &user_id, &org_id).await?;

    Ok(Json(statement))
}

async fn list_statements(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatementsQuery>,
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

    let limit = clamp_limit_in_range(query.limit, 1, 500);
    let rows = table_service::list_rows(
        pool,
        "billing_statements",
        Some(&filters),
        limit,
        0,
        "period_start",
        false,
    )
    .await?;

    let total_outstanding: f64 = rows
        .iter()
        .filter(|row| {
            matches!(
                row.get("status").and_then(Value::as_str),
                Some("unpaid") | Some("overdue")
            )
        })
        .filter_map(|row| {
            let due = row.get("total_amount_due").and_then(Value::as_f64)?;
            let paid = row
                .get("amount_paid")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            Some(due - paid)
        })
        .sum();

    let count = rows.len();
    Ok(Json(json!({
        "items": rows,
        "count": count,
        "total_outstanding": billing::round2(total_outstanding),
    })))
}

async fn mark_overdue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    auth::require_internal_api_key(&state, &headers)?;
    let flipped = billing::mark_overdue_sweep(&state).await?;
    Ok(Json(json!({ "marked_overdue": flipped })))
}

fn db_pool(state: &AppState) -> Result<&sqlx::PgPool, AppError> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
