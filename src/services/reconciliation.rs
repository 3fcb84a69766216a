use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::error::AppError;
use crate::repository::table_service;
use crate::schemas::GatewayPaymentInput;
use crate::services::audit;
use crate::services::billing::round2;
use crate::services::notifications;
use crate::state::AppState;

/// Gateway amounts and our totals are both rounded to cents; anything
/// within one cent counts as the same amount.
const TOLERANCE_CENTS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    ExactMatch,
    Partial,
    Overpayment,
    DuplicateReference,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactMatch => "exact_match",
            Self::Partial => "partial",
            Self::Overpayment => "overpayment",
            Self::DuplicateReference => "duplicate_reference",
        }
    }
}

/// Amounts are compared in whole cents so the tolerance boundary does
/// not fall victim to f64 representation error.
pub fn amounts_match(left: f64, right: f64) -> bool {
    (to_cents(left) - to_cents(right)).abs() <= TOLERANCE_CENTS
}

fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Classify a payment against the statement's remaining balance.
pub fn classify_payment(total_due: f64, already_paid: f64, amount: f64) -> ReconcileOutcome {
    let paid_after = round2(already_paid + amount);
    if amounts_match(paid_after, total_due) {
        ReconcileOutcome::ExactMatch
    } else if paid_after < total_due {
        ReconcileOutcome::Partial
    } else {
        ReconcileOutcome::Overpayment
    }
}

/// Record a gateway payment against a statement, idempotently on the
/// gateway reference. Replays return the original payment without a
/// second effect; blind retries from the gateway are harmless.
pub async fn reconcile_payment(
    state: &AppState,
    input: &GatewayPaymentInput,
) -> Result<Value, AppError> {
    if input.amount <= 0.0 {
        return Err(AppError::Validation(
            "Payment amount must be positive.".to_string(),
        ));
    }

    let pool = db_pool(state)?;
    let mut tx = pool.begin().await.map_err(begin_failed)?;

    let statement = table_service::get_row_for_update(
        &mut *tx,
        "billing_statements",
        &input.billing_statement_id,
        "id",
    )
    .await?;

    let mut reference_filter = Map::new();
    reference_filter.insert("reference".to_string(), json!(input.reference));
    let duplicates = table_service::list_rows(
        &mut *tx,
        "payments",
        Some(&reference_filter),
        1,
        0,
        "created_at",
        false,
    )
    .await?;
    if let Some(existing) = duplicates.into_iter().next() {
        tx.commit().await.map_err(commit_failed)?;
        return Ok(json!({
            "outcome": ReconcileOutcome::DuplicateReference.as_str(),
            "payment": existing,
        }));
    }

    let total_due = value_f64(&statement, "total_amount_due").unwrap_or(0.0);
    let already_paid = value_f64(&statement, "amount_paid").unwrap_or(0.0);
    let outcome = classify_payment(total_due, already_paid, input.amount);
    let paid_after = round2(already_paid + input.amount);

    let mut payment_payload = Map::new();
    payment_payload.insert(
        "organization_id".to_string(),
        statement
            .get("organization_id")
            .cloned()
            .unwrap_or(Value::Null),
    );
    payment_payload.insert(
        "billing_statement_id".to_string(),
        json!(input.billing_statement_id),
    );
    payment_payload.insert("amount".to_string(), json!(round2(input.amount)));
    payment_payload.insert("reference".to_string(), json!(input.reference));
    payment_payload.insert(
        "method".to_string(),
        json!(input.method.clone().unwrap_or_else(|| "gateway".to_string())),
    );
    payment_payload.insert("status".to_string(), json!("confirmed"));
    payment_payload.insert("received_at".to_string(), json!(Utc::now().to_rfc3339()));
    let payment = table_service::create_row(&mut *tx, "payments", &payment_payload).await?;

    let fully_paid = !matches!(outcome, ReconcileOutcome::Partial);
    let mut statement_updates = Map::new();
    statement_updates.insert("amount_paid".to_string(), json!(paid_after));
    if fully_paid {
        statement_updates.insert("status".to_string(), json!("paid"));
        statement_updates.insert("paid_at".to_string(), json!(Utc::now().to_rfc3339()));
    }
    let updated_statement = table_service::update_row(
        &mut *tx,
        "billing_statements",
        &input.billing_statement_id,
        &statement_updates,
        "id",
    )
    .await?;

    tx.commit().await.map_err(commit_failed)?;

    if fully_paid {
        notifications::dispatch(
            state,
            notifications::receipt_message(&updated_statement, input.amount),
        )
        .await;
    }
    audit::write_audit_log(
        state,
        None,
        updated_statement
            .get("organization_id")
            .and_then(Value::as_str),
        "payment.reconciled",
        "billing_statement",
        &input.billing_statement_id,
        Some(statement),
        Some(json!({"outcome": outcome.as_str(), "amount": input.amount})),
    )
    .await;

    Ok(json!({
        "outcome": outcome.as_str(),
        "payment": payment,
        "statement": updated_statement,
    }))
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

fn value_f64(row: &Value, key: &str) -> Option<f64> {
    match row.get(key) {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{amounts_match, classify_payment, ReconcileOutcome};

    #[test]
    fn tolerance_is_one_cent() {
        assert!(amounts_match(100.0, 100.0));
        // The boundary itself must match despite f64 representation:
        // (100.0 - 100.01).abs() is slightly above 0.01 as a float.
        assert!(amounts_match(100.0, 100.01));
        assert!(amounts_match(100.0, 99.99));
        assert!(!amounts_match(100.0, 100.02));
        assert!(amounts_match(11400.0, 11400.01));
    }

    #[test]
    fn classifies_against_remaining_balance() {
        assert_eq!(
            classify_payment(11400.0, 0.0, 11400.0),
            ReconcileOutcome::ExactMatch
        );
        assert_eq!(
            classify_payment(11400.0, 0.0, 5000.0),
            ReconcileOutcome::Partial
        );
        assert_eq!(
            classify_payment(11400.0, 5000.0, 6400.0),
            ReconcileOutcome::ExactMatch
        );
        assert_eq!(
            classify_payment(11400.0, 0.0, 12000.0),
            ReconcileOutcome::Overpayment
        );
        // Within tolerance counts as exact, not overpayment.
        assert_eq!(
            classify_payment(11400.0, 0.0, 11400.01),
            ReconcileOutcome::ExactMatch
        );
    }
}
