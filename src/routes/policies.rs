use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{json, Map, Value};

use crate::auth;
use crate::error::{AppError, AppResult};
use crate::repository::table_service;
use crate::schemas::{clamp_limit_in_range, PoliciesQuery, PolicyPath, UpsertPolicyInput};
use crate::services::audit;
use crate::services::policy;
use crate::state::AppState;
use crate::tenancy;

const POLICY_WRITER_ROLES: &[&str] = &["owner", "admin", "manager"];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/billing-policies", get(list_policies))
        .route("/billing-policies/{property_id}", put(upsert_policy))
}

async fn list_policies(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PoliciesQuery>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    tenancy::assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(query.org_id));
    if let Some(property_id) = &query.property_id {
        filters.insert("property_id".to_string(), json!(property_id));
    }

    let limit = clamp_limit_in_range(query.limit, 1, 500);
    let rows = table_service::list_rows(
        pool,
        "billing_policies",
        Some(&filters),
        limit,
        0,
        "created_at",
        false,
    )
    .await?;
    let count = rows.len();
    Ok(Json(json!({ "items": rows, "count": count })))
}

/// Write-through upsert: the cached policy for the property is dropped
/// after the row is committed, so the next statement sees fresh rates.
async fn upsert_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<PolicyPath>,
    Json(input): Json<UpsertPolicyInput>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    tenancy::assert_org_role(&state, &user_id, &input.organization_id, POLICY_WRITER_ROLES)
        .await?;
    let pool = db_pool(&state)?;

    for (utility, rate) in &input.utility_rates {
        if *rate < 0.0 {
            return Err(AppError::Validation(format!(
                "Rate for '{utility}' cannot be negative."
            )));
        }
    }
    if let Some(fee_type) = input.late_fee_type.as_deref() {
        if fee_type != "fixed" && fee_type != "percent" {
            return Err(AppError::Validation(
                "late_fee_type must be 'fixed' or 'percent'.".to_string(),
            ));
        }
    }
    if input.late_fee_amount.is_some_and(|amount| amount < 0.0) {
        return Err(AppError::Validation(
            "late_fee_amount cannot be negative.".to_string(),
        ));
    }
    if input.grace_period_days.is_some_and(|days| days < 0) {
        return Err(AppError::Validation(
            "grace_period_days cannot be negative.".to_string(),
        ));
    }

    let property = table_service::get_row(pool, "properties", &path.property_id, "id").await?;
    if property.get("organization_id").and_then(Value::as_str)
        != Some(input.organization_id.as_str())
    {
        return Err(AppError::Forbidden(
            "Property does not belong to this organization.".to_string(),
        ));
    }

    let mut payload = Map::new();
    payload.insert("organization_id".to_string(), json!(input.organization_id));
    payload.insert("property_id".to_string(), json!(path.property_id));
    payload.insert(
        "utility_rates".to_string(),
        serde_json::to_value(&input.utility_rates).unwrap_or(Value::Null),
    );
    if let Some(fee_type) = &input.late_fee_type {
        payload.insert("late_fee_type".to_string(), json!(fee_type));
    }
    if let Some(amount) = input.late_fee_amount {
        payload.insert("late_fee_amount".to_string(), json!(amount));
    }
    if let Some(days) = input.grace_period_days {
        payload.insert("grace_period_days".to_string(), json!(days));
    }
    if let Some(timezone) = &input.timezone {
        payload.insert("timezone".to_string(), json!(timezone));
    }

    // Parse before writing so a broken policy never lands in the table.
    policy::parse_policy(&Value::Object(payload.clone()))?;

    let mut existing_filter = Map::new();
    existing_filter.insert("property_id".to_string(), json!(path.property_id));
    let existing = table_service::list_rows(
        pool,
        "billing_policies",
        Some(&existing_filter),
        1,
        0,
        "created_at",
        false,
    )
    .await?;

    let (saved, previous) = match existing.into_iter().next() {
        Some(current) => {
            let policy_id = current
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::Internal("Policy row lacks id.".to_string()))?
                .to_string();
            let updated =
                table_service::update_row(pool, "billing_policies", &policy_id, &payload, "id")
                    .await?;
            (updated, Some(current))
        }
        None => {
            let created = table_service::create_row(pool, "billing_policies", &payload).await?;
            (created, None)
        }
    };

    state.invalidate_billing_policy(&path.property_id).await;

    audit::write_audit_log(
        &state,
        Some(&user_id),
        Some(&input.organization_id),
        "billing_policy.upserted",
        "billing_policy",
        saved.get("id").and_then(Value::as_str).unwrap_or_default(),
        previous,
        Some(saved.clone()),
    )
    .await;

    Ok(Json(saved))
}

fn db_pool(state: &AppState) -> Result<&sqlx::PgPool, AppError> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
