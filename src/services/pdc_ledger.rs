use chrono::{NaiveDate, Utc};
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::error::AppError;
use crate::repository::table_service;
use crate::schemas::{CreatePdcInput, ReplacePdcInput};
use crate::services::audit;
use crate::state::AppState;
use crate::tenancy;

/// Register a post-dated check against a lease. The check starts in
/// `received` and moves through `cleared` or `bounced` by the operations
/// below; corrections are append-only.
pub async fn register_check(
    state: &AppState,
    user_id: &str,
    input: &CreatePdcInput,
) -> Result<Value, AppError> {
    tenancy::assert_org_member(state, user_id, &input.organization_id).await?;
    let pool = db_pool(state)?;

    if input.amount <= 0.0 {
        return Err(AppError::Validation(
            "Check amount must be positive.".to_string(),
        ));
    }
    let due_date = parse_date(&input.due_date, "due_date")?;

    let lease = table_service::get_row(pool, "leases", &input.lease_id, "id").await?;
    if value_str(&lease, "organization_id") != Some(input.organization_id.as_str()) {
        return Err(AppError::Forbidden(
            "Lease does not belong to this organization.".to_string(),
        ));
    }

    let mut payload = Map::new();
    payload.insert("organization_id".to_string(), json!(input.organization_id));
    payload.insert("lease_id".to_string(), json!(input.lease_id));
    payload.insert("check_number".to_string(), json!(input.check_number));
    payload.insert("bank_name".to_string(), json!(input.bank_name));
    payload.insert("amount".to_string(), json!(input.amount));
    payload.insert("due_date".to_string(), json!(due_date.to_string()));
    payload.insert("status".to_string(), json!("received"));
    payload.insert("created_by_user_id".to_string(), json!(user_id));

    let check = table_service::create_row(pool, "post_dated_checks", &payload).await?;

    audit::write_audit_log(
        state,
        Some(user_id),
        Some(&input.organization_id),
        "pdc.registered",
        "post_dated_check",
        value_str(&check, "id").unwrap_or_default(),
        None,
        Some(check.clone()),
    )
    .await;

    Ok(check)
}

/// Mark a received check `cleared`, optionally binding it to a billing
/// statement. A check binds to at most one statement, ever.
pub async fn mark_cleared(
    state: &AppState,
    user_id: &str,
    pdc_id: &str,
    billing_statement_id: Option<&str>,
) -> Result<Value, AppError> {
    let pool = db_pool(state)?;
    let mut tx = pool.begin().await.map_err(begin_failed)?;

    let check = table_service::get_row_for_update(&mut *tx, "post_dated_checks", pdc_id, "id").await?;
    let org_id = require_str(&check, "organization_id")?.to_string();
    tenancy::assert_org_member(state, user_id, &org_id).await?;

    match value_str(&check, "status") {
        Some("received") => {}
        Some("cleared") => {
            return Err(AppError::StateConflict(
                "Check is already cleared.".to_string(),
            ))
        }
        _ => {
            return Err(AppError::StateConflict(
                "Only a received check can be cleared.".to_string(),
            ))
        }
    }

    let mut updates = Map::new();
    updates.insert("status".to_string(), json!("cleared"));
    updates.insert("cleared_at".to_string(), json!(Utc::now().to_rfc3339()));

    if let Some(statement_id) = billing_statement_id {
        if value_str(&check, "billing_statement_id").is_some() {
            return Err(AppError::StateConflict(
                "Check is already applied to a statement.".to_string(),
            ));
        }
        let statement =
            table_service::get_row(&mut *tx, "billing_statements", statement_id, "id").await?;
        if value_str(&statement, "lease_id") != value_str(&check, "lease_id") {
            return Err(AppError::Validation(
                "Statement belongs to a different lease.".to_string(),
            ));
        }
        // The statement's frozen breakdown must already carry this
        // check's credit; a late bind cannot change a frozen total.
        ensure_statement_references_check(value_str(&statement, "pdc_id"), pdc_id)?;
        updates.insert("billing_statement_id".to_string(), json!(statement_id));
    }

    let updated = table_service::update_row(&mut *tx, "post_dated_checks", pdc_id, &updates, "id").await?;
    tx.commit().await.map_err(commit_failed)?;

    audit::write_audit_log(
        state,
        Some(user_id),
        Some(&org_id),
        "pdc.cleared",
        "post_dated_check",
        pdc_id,
        Some(check),
        Some(updated.clone()),
    )
    .await;

    Ok(updated)
}

/// Mark a received check `bounced`. `cleared` and `bounced` are both
/// terminal for the instance; a cleared check's credit may already be
/// consumed, so it can never bounce afterwards.
pub async fn mark_bounced(
    state: &AppState,
    user_id: &str,
    pdc_id: &str,
) -> Result<Value, AppError> {
    let pool = db_pool(state)?;
    let mut tx = pool.begin().await.map_err(begin_failed)?;

    let check = table_service::get_row_for_update(&mut *tx, "post_dated_checks", pdc_id, "id").await?;
    let org_id = require_str(&check, "organization_id")?.to_string();
    tenancy::assert_org_member(state, user_id, &org_id).await?;

    ensure_bounceable(value_str(&check, "status"))?;

    let mut updates = Map::new();
    updates.insert("status".to_string(), json!("bounced"));
    updates.insert("bounced_at".to_string(), json!(Utc::now().to_rfc3339()));

    let updated = table_service::update_row(&mut *tx, "post_dated_checks", pdc_id, &updates, "id").await?;
    tx.commit().await.map_err(commit_failed)?;

    audit::write_audit_log(
        state,
        Some(user_id),
        Some(&org_id),
        "pdc.bounced",
        "post_dated_check",
        pdc_id,
        Some(check),
        Some(updated.clone()),
    )
    .await;

    Ok(updated)
}

/// Replace a bounced check with a fresh one. The original row is never
/// deleted; it points at its replacement, and only once.
pub async fn replace_check(
    state: &AppState,
    user_id: &str,
    pdc_id: &str,
    input: &ReplacePdcInput,
) -> Result<Value, AppError> {
    let pool = db_pool(state)?;

    if input.amount <= 0.0 {
        return Err(AppError::Validation(
            "Check amount must be positive.".to_string(),
        ));
    }
    let due_date = parse_date(&input.due_date, "due_date")?;

    let mut tx = pool.begin().await.map_err(begin_failed)?;

    let original = table_service::get_row_for_update(&mut *tx, "post_dated_checks", pdc_id, "id").await?;
    let org_id = require_str(&original, "organization_id")?.to_string();
    tenancy::assert_org_member(state, user_id, &org_id).await?;

    ensure_replaceable(
        value_str(&original, "status"),
        value_str(&original, "replaced_by_pdc_id"),
    )?;

    let mut payload = Map::new();
    payload.insert("organization_id".to_string(), json!(org_id));
    payload.insert(
        "lease_id".to_string(),
        original.get("lease_id").cloned().unwrap_or(Value::Null),
    );
    payload.insert("check_number".to_string(), json!(input.check_number));
    payload.insert("bank_name".to_string(), json!(input.bank_name));
    payload.insert("amount".to_string(), json!(input.amount));
    payload.insert("due_date".to_string(), json!(due_date.to_string()));
    payload.insert("status".to_string(), json!("received"));
    payload.insert("created_by_user_id".to_string(), json!(user_id));

    let replacement = table_service::create_row(&mut *tx, "post_dated_checks", &payload).await?;
    let replacement_id = require_str(&replacement, "id")?.to_string();

    let mut updates = Map::new();
    updates.insert("replaced_by_pdc_id".to_string(), json!(replacement_id));
    table_service::update_row(&mut *tx, "post_dated_checks", pdc_id, &updates, "id").await?;

    tx.commit().await.map_err(commit_failed)?;

    audit::write_audit_log(
        state,
        Some(user_id),
        Some(&org_id),
        "pdc.replaced",
        "post_dated_check",
        pdc_id,
        Some(original),
        Some(replacement.clone()),
    )
    .await;

    Ok(replacement)
}

/// The cleared, unbound checks whose due date falls inside the billing
/// period. The billing computer consumes at most one of these per
/// statement.
pub async fn available_checks<'e, E>(
    executor: E,
    lease_id: &str,
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> Result<Vec<Value>, AppError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let mut filters = Map::new();
    filters.insert("lease_id".to_string(), json!(lease_id));
    filters.insert("status".to_string(), json!("cleared"));
    filters.insert("billing_statement_id__is_null".to_string(), Value::Null);
    filters.insert("due_date__gte".to_string(), json!(period_start.to_string()));
    filters.insert("due_date__lte".to_string(), json!(period_end.to_string()));

    table_service::list_rows(executor, "post_dated_checks", Some(&filters), 50, 0, "due_date", true)
        .await
}

pub fn due_in_period(due_date: NaiveDate, period_start: NaiveDate, period_end: NaiveDate) -> bool {
    due_date >= period_start && due_date <= period_end
}

/// A check funds a statement only when cleared and not yet bound.
pub fn ensure_bindable(
    status: Option<&str>,
    existing_binding: Option<&str>,
) -> Result<(), AppError> {
    if status != Some("cleared") {
        return Err(AppError::StateConflict(
            "Only a cleared check can fund a statement.".to_string(),
        ));
    }
    if existing_binding.is_some() {
        return Err(AppError::StateConflict(
            "Check is already applied to a statement.".to_string(),
        ));
    }
    Ok(())
}

/// Only a received check can bounce; `cleared` and `bounced` are
/// terminal states.
pub fn ensure_bounceable(status: Option<&str>) -> Result<(), AppError> {
    match status {
        Some("received") => Ok(()),
        Some("bounced") => Err(AppError::StateConflict(
            "Check is already bounced.".to_string(),
        )),
        _ => Err(AppError::StateConflict(
            "Only a received check can bounce.".to_string(),
        )),
    }
}

/// A late bind is only a reconciliation of records: the statement's
/// frozen breakdown must already reference the check.
pub fn ensure_statement_references_check(
    statement_pdc_id: Option<&str>,
    check_id: &str,
) -> Result<(), AppError> {
    if statement_pdc_id == Some(check_id) {
        return Ok(());
    }
    Err(AppError::StateConflict(
        "Statement breakdown does not reference this check.".to_string(),
    ))
}

/// Only a bounced check can be replaced, and only once.
pub fn ensure_replaceable(
    status: Option<&str>,
    replaced_by: Option<&str>,
) -> Result<(), AppError> {
    if status != Some("bounced") {
        return Err(AppError::StateConflict(
            "Only a bounced check can be replaced.".to_string(),
        ));
    }
    if replaced_by.is_some() {
        return Err(AppError::StateConflict(
            "Check was already replaced.".to_string(),
        ));
    }
    Ok(())
}

pub fn parse_date(text: &str, field: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::Validation(format!("Field '{field}' must be a YYYY-MM-DD date.")))
}

fn db_pool(state: &AppState) -> Result<&PgPool, AppError> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn begin_failed(error: sqlx::Error) -> AppError {
    AppError::Dependency(format!("Could not open transaction: {error}"))
}

fn commit_failed(error: sqlx::Error) -> AppError {
    AppError::Dependency(format!("Could not commit transaction: {error}"))
}

fn value_str<'a>(row: &'a Value, key: &str) -> Option<&'a str> {
    row.get(key).and_then(Value::as_str)
}

fn require_str<'a>(row: &'a Value, key: &str) -> Result<&'a str, AppError> {
    value_str(row, key)
        .ok_or_else(|| AppError::Internal(format!("Record is missing field '{key}'.")))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{due_in_period, parse_date};

    fn date(text: &str) -> NaiveDate {
        NaiveDate::parse_from_str(text, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn period_bounds_are_inclusive() {
        let start = date("2026-01-01");
        let end = date("2026-01-31");
        assert!(due_in_period(date("2026-01-01"), start, end));
        assert!(due_in_period(date("2026-01-31"), start, end));
        assert!(due_in_period(date("2026-01-15"), start, end));
        assert!(!due_in_period(date("2025-12-31"), start, end));
        assert!(!due_in_period(date("2026-02-01"), start, end));
    }

    #[test]
    fn cleared_unbound_checks_bind_exactly_once() {
        use super::ensure_bindable;
        use crate::error::AppError;

        // A 5000 cleared check is usable once; the second attempt
        // conflicts because the binding is already recorded.
        assert!(ensure_bindable(Some("cleared"), None).is_ok());
        assert!(matches!(
            ensure_bindable(Some("cleared"), Some("statement-1")),
            Err(AppError::StateConflict(_))
        ));
        assert!(matches!(
            ensure_bindable(Some("received"), None),
            Err(AppError::StateConflict(_))
        ));
        assert!(matches!(
            ensure_bindable(Some("bounced"), None),
            Err(AppError::StateConflict(_))
        ));
    }

    #[test]
    fn only_received_checks_bounce() {
        use super::ensure_bounceable;
        use crate::error::AppError;

        assert!(ensure_bounceable(Some("received")).is_ok());
        assert!(matches!(
            ensure_bounceable(Some("cleared")),
            Err(AppError::StateConflict(_))
        ));
        assert!(matches!(
            ensure_bounceable(Some("bounced")),
            Err(AppError::StateConflict(_))
        ));
        assert!(matches!(
            ensure_bounceable(None),
            Err(AppError::StateConflict(_))
        ));
    }

    #[test]
    fn late_binds_must_match_the_frozen_breakdown() {
        use super::ensure_statement_references_check;
        use crate::error::AppError;

        // The statement froze this check's credit at creation.
        assert!(ensure_statement_references_check(Some("pdc-1"), "pdc-1").is_ok());
        // A statement that never carried the credit cannot absorb it
        // after the fact; its totals are immutable.
        assert!(matches!(
            ensure_statement_references_check(None, "pdc-1"),
            Err(AppError::StateConflict(_))
        ));
        assert!(matches!(
            ensure_statement_references_check(Some("pdc-2"), "pdc-1"),
            Err(AppError::StateConflict(_))
        ));
    }

    #[test]
    fn replacement_chain_is_append_only() {
        use super::ensure_replaceable;
        use crate::error::AppError;

        assert!(ensure_replaceable(Some("bounced"), None).is_ok());
        assert!(matches!(
            ensure_replaceable(Some("bounced"), Some("pdc-2")),
            Err(AppError::StateConflict(_))
        ));
        assert!(matches!(
            ensure_replaceable(Some("received"), None),
            Err(AppError::StateConflict(_))
        ));
        assert!(matches!(
            ensure_replaceable(Some("cleared"), None),
            Err(AppError::StateConflict(_))
        ));
    }

    #[test]
    fn dates_parse_strictly() {
        assert!(parse_date("2026-01-05", "due_date").is_ok());
        assert!(parse_date(" 2026-01-05 ", "due_date").is_ok());
        assert!(parse_date("05/01/2026", "due_date").is_err());
        assert!(parse_date("", "due_date").is_err());
    }
}
