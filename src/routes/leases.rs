use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::auth;
use crate::error::{AppError, AppResult};
use crate::repository::table_service;
use crate::schemas::{
    clamp_limit_in_range, validate_input, CreateLeaseInput, LeasePath, LeasesQuery,
};
use crate::services::audit;
use crate::services::lease_authorization;
use crate::services::pdc_ledger::parse_date;
use crate::state::AppState;
use crate::tenancy;

const LEASE_WRITER_ROLES: &[&str] = &["owner", "admin", "manager"];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/leases", post(create_lease).get(list_leases))
        .route("/leases/{lease_id}/status", get(lease_status))
        .route(
            "/internal/leases/lifecycle-sweep",
            post(lifecycle_sweep),
        )
}

async fn create_lease(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateLeaseInput>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    validate_input(&input)?;
    tenancy::assert_org_role(&state, &user_id, &input.organization_id, LEASE_WRITER_ROLES).await?;

    let starts_on = parse_date(&input.starts_on, "starts_on")?;
    let ends_on = input
        .ends_on
        .as_deref()
        .map(|text| parse_date(text, "ends_on"))
        .transpose()?;
    if let Some(end) = ends_on {
        if end <= starts_on {
            return Err(AppError::Validation(
                "ends_on must be after starts_on.".to_string(),
            ));
        }
    }
    if input.rent_amount <= 0.0 {
        return Err(AppError::Validation(
            "rent_amount must be positive.".to_string(),
        ));
    }
    if input.security_deposit_amount < 0.0 || input.advance_payment_amount < 0.0 {
        return Err(AppError::Validation(
            "Deposit and advance amounts cannot be negative.".to_string(),
        ));
    }

    let pool = db_pool(&state)?;

    // The unit must sit in the property, and the property in the org.
    let property = table_service::get_row(pool, "properties", &input.property_id, "id").await?;
    if property.get("organization_id").and_then(Value::as_str)
        != Some(input.organization_id.as_str())
    {
        return Err(AppError::Forbidden(
            "Property does not belong to this organization.".to_string(),
        ));
    }
    let unit = table_service::get_row(pool, "units", &input.unit_id, "id").await?;
    if unit.get("property_id").and_then(Value::as_str) != Some(input.property_id.as_str()) {
        return Err(AppError::Validation(
            "Unit does not belong to this property.".to_string(),
        ));
    }

    let mut payload = Map::new();
    payload.insert("organization_id".to_string(), json!(input.organization_id));
    payload.insert("property_id".to_string(), json!(input.property_id));
    payload.insert("unit_id".to_string(), json!(input.unit_id));
    payload.insert("tenant_full_name".to_string(), json!(input.tenant_full_name));
    if let Some(email) = &input.tenant_email {
        payload.insert("tenant_email".to_string(), json!(email));
    }
    if let Some(phone) = &input.tenant_phone_e164 {
        payload.insert("tenant_phone_e164".to_string(), json!(phone));
    }
    payload.insert("starts_on".to_string(), json!(starts_on.to_string()));
    if let Some(end) = ends_on {
        payload.insert("ends_on".to_string(), json!(end.to_string()));
    }
    payload.insert("rent_amount".to_string(), json!(input.rent_amount));
    payload.insert(
        "security_deposit_amount".to_string(),
        json!(input.security_deposit_amount),
    );
    payload.insert(
        "advance_payment_amount".to_string(),
        json!(input.advance_payment_amount),
    );
    payload.insert(
        "advance_payment_consumed".to_string(),
        json!(false),
    );
    payload.insert("currency".to_string(), json!(input.currency));
    payload.insert("status".to_string(), json!("draft"));
    payload.insert("created_by_user_id".to_string(), json!(user_id));

    let lease = table_service::create_row(pool, "leases", &payload).await?;

    audit::write_audit_log(
        &state,
        Some(&user_id),
        Some(&input.organization_id),
        "lease.created",
        "lease",
        lease.get("id").and_then(Value::as_str).unwrap_or_default(),
        None,
        Some(lease.clone()),
    )
    .await;

    Ok(Json(lease))
}

async fn list_leases(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LeasesQuery>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    tenancy::assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(query.org_id));
    if let Some(status) = &query.status {
        filters.insert("status".to_string(), json!(status));
    }
    if let Some(unit_id) = &query.unit_id {
        filters.insert("unit_id".to_string(), json!(unit_id));
    }

    let limit = clamp_limit_in_range(query.limit, 1, 500);
    let rows =
        table_service::list_rows(pool, "leases", Some(&filters), limit, 0, "created_at", false)
            .await?;
    let count = rows.len();
    Ok(Json(json!({ "items": rows, "count": count })))
}

async fn lease_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<LeasePath>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let lease = table_service::get_row(pool, "leases", &path.lease_id, "id").await?;
    let org_id = lease
        .get("organization_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    tenancy::assert_org_member(&state, &user_id, &org_id).await?;

    let mut filters = Map::new();
    filters.insert("lease_id".to_string(), json!(path.lease_id));
    let signatures = table_service::list_rows(
        pool,
        "lease_signatures",
        Some(&filters),
        50,
        0,
        "created_at",
        false,
    )
    .await?;

    let roles: Vec<Value> = signatures
        .iter()
        .filter(|row| row.get("status").and_then(Value::as_str) != Some("superseded"))
        .map(|row| {
            json!({
                "role": row.get("role").cloned().unwrap_or(Value::Null),
                "status": row.get("status").cloned().unwrap_or(Value::Null),
                "signed_at": row.get("signed_at").cloned().unwrap_or(Value::Null),
            })
        })
        .collect();

    Ok(Json(json!({
        "lease_id": path.lease_id,
        "status": lease.get("status").cloned().unwrap_or(Value::Null),
        "signatures": roles,
    })))
}

async fn lifecycle_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    auth::require_internal_api_key(&state, &headers)?;
    let today = Utc::now().date_naive();
    let moved = lease_authorization::lifecycle_sweep(&state, today).await?;
    Ok(Json(json!({ "transitioned": moved })))
}

fn db_pool(state: &AppState) -> Result<&sqlx::PgPool, AppError> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
