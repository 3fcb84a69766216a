use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::error::AppError;
use crate::repository::table_service;
use crate::schemas::CreateStatementInput;
use crate::services::audit;
use crate::services::pdc_ledger;
use crate::services::policy::{self, LateFeePolicy, LateFeeType};
use crate::state::AppState;
use crate::tenancy;

#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub previous: f64,
    pub current: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeLine {
    pub charge_type: String,
    pub amount: f64,
}

/// Everything `compute_breakdown` needs, already resolved. Keeping the
/// function pure over this struct is what makes the arithmetic testable
/// and the frozen breakdown re-derivable.
#[derive(Debug, Clone, Default)]
pub struct BreakdownInputs {
    pub rent_amount: f64,
    pub meter_readings: BTreeMap<String, MeterReading>,
    pub rates: BTreeMap<String, f64>,
    pub additional_charges: Vec<ChargeLine>,
    pub discounts: Vec<ChargeLine>,
    pub late_fee: f64,
    pub advance_credit: f64,
    pub pdc_credit: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatementBreakdown {
    pub utility_subtotal: f64,
    pub charge_subtotal: f64,
    pub late_fee: f64,
    pub advance_credit_amount: f64,
    pub pdc_credit_amount: f64,
    pub total_before_clamp: f64,
    pub total_amount_due: f64,
}

/// Pure statement arithmetic. Deterministic over its inputs; the
/// transactional shell resolves credits and rates before calling in.
pub fn compute_breakdown(inputs: &BreakdownInputs) -> Result<StatementBreakdown, AppError> {
    let mut utility_subtotal = 0.0;
    for (utility, reading) in &inputs.meter_readings {
        let consumption = reading.current - reading.previous;
        if consumption < 0.0 {
            return Err(AppError::Validation(format!(
                "Invalid meter reading for '{utility}': current is below previous."
            )));
        }
        let Some(rate) = inputs.rates.get(utility) else {
            return Err(AppError::ConfigurationMissing(format!(
                "No rate configured for utility '{utility}'."
            )));
        };
        utility_subtotal += consumption * rate;
    }
    let utility_subtotal = round2(utility_subtotal);

    let charges: f64 = inputs.additional_charges.iter().map(|line| line.amount).sum();
    let discounts: f64 = inputs.discounts.iter().map(|line| line.amount).sum();
    // Discounts never push the charge subtotal below zero.
    let charge_subtotal = round2((charges - discounts).max(0.0));

    let total_before_clamp = round2(
        inputs.rent_amount + charge_subtotal + utility_subtotal + inputs.late_fee
            - inputs.advance_credit
            - inputs.pdc_credit,
    );
    let total_amount_due = total_before_clamp.max(0.0);

    Ok(StatementBreakdown {
        utility_subtotal,
        charge_subtotal,
        late_fee: round2(inputs.late_fee),
        advance_credit_amount: round2(inputs.advance_credit),
        pdc_credit_amount: round2(inputs.pdc_credit),
        total_before_clamp,
        total_amount_due,
    })
}

/// Advance credit is a one-shot resource on the lease: once the flag is
/// set it never applies again.
pub fn ensure_advance_available(
    already_consumed: bool,
    advance_payment_amount: f64,
) -> Result<(), AppError> {
    if already_consumed {
        return Err(AppError::StateConflict(
            "Advance credit was already consumed for this lease.".to_string(),
        ));
    }
    if advance_payment_amount <= 0.0 {
        return Err(AppError::Validation(
            "Lease has no advance payment to credit.".to_string(),
        ));
    }
    Ok(())
}

/// The late fee owed given the policy, the prior overdue statement's
/// unpaid balance and how many days past due it is.
pub fn late_fee_amount(policy: &LateFeePolicy, overdue_balance: f64, days_past_due: i64) -> f64 {
    if days_past_due <= policy.grace_period_days || overdue_balance <= 0.0 {
        return 0.0;
    }
    match policy.fee_type {
        LateFeeType::Fixed => round2(policy.amount),
        LateFeeType::Percent => round2(overdue_balance * policy.amount / 100.0),
    }
}

/// Compute and persist a billing statement as one unit of work. Locks
/// the lease row so concurrent statement creation, signature flips and
/// credit consumption for the same lease serialize.
pub async fn create_statement(
    state: &AppState,
    user_id: &str,
    input: &CreateStatementInput,
) -> Result<Value, AppError> {
    let period_start = pdc_ledger::parse_date(&input.period_start, "period_start")?;
    let period_end = pdc_ledger::parse_date(&input.period_end, "period_end")?;
    if period_end < period_start {
        return Err(AppError::Validation(
            "period_end must not be before period_start.".to_string(),
        ));
    }
    let due_date = match &input.due_date {
        Some(text) => pdc_ledger::parse_date(text, "due_date")?,
        None => period_end,
    };

    let pool = db_pool(state)?;
    let mut tx = pool.begin().await.map_err(begin_failed)?;

    let lease = table_service::get_row_for_update(&mut *tx, "leases", &input.lease_id, "id").await?;
    let org_id = require_str(&lease, "organization_id")?.to_string();
    tenancy::assert_org_member(state, user_id, &org_id).await?;

    let mut duplicate_filter = Map::new();
    duplicate_filter.insert("lease_id".to_string(), json!(input.lease_id));
    duplicate_filter.insert("period_start".to_string(), json!(period_start.to_string()));
    let existing =
        table_service::count_rows(&mut *tx, "billing_statements", Some(&duplicate_filter)).await?;
    if existing > 0 {
        return Err(AppError::StateConflict(format!(
            "A statement already exists for period starting {period_start}."
        )));
    }

    let property_id = require_str(&lease, "property_id")?.to_string();
    let billing_policy = policy::get_billing_policy(state, &property_id).await?;

    let rent_amount = value_f64(&lease, "rent_amount").unwrap_or(0.0);

    // Advance credit consumes the lease's one-time flag in this same
    // transaction.
    let advance_credit = if input.apply_advance_credit {
        ensure_advance_available(
            lease
                .get("advance_payment_consumed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            value_f64(&lease, "advance_payment_amount").unwrap_or(0.0),
        )?;
        rent_amount
    } else {
        0.0
    };

    let bound_check = resolve_pdc(&mut tx, input, period_start, period_end).await?;
    let pdc_credit = bound_check
        .as_ref()
        .and_then(|check| value_f64(check, "amount"))
        .unwrap_or(0.0);

    let late_fee = prior_period_late_fee(state, &mut tx, input, &billing_policy).await?;

    let inputs = BreakdownInputs {
        rent_amount,
        meter_readings: input
            .meter_readings
            .iter()
            .map(|(utility, reading)| {
                (
                    utility.clone(),
                    MeterReading {
                        previous: reading.previous,
                        current: reading.current,
                    },
                )
            })
            .collect(),
        rates: billing_policy.utility_rates.clone(),
        additional_charges: input
            .additional_charges
            .iter()
            .map(|line| ChargeLine {
                charge_type: line.charge_type.clone(),
                amount: line.amount,
            })
            .collect(),
        discounts: input
            .discounts
            .iter()
            .map(|line| ChargeLine {
                charge_type: line.charge_type.clone(),
                amount: line.amount,
            })
            .collect(),
        late_fee,
        advance_credit,
        pdc_credit,
    };
    let breakdown = compute_breakdown(&inputs)?;

    let mut payload = Map::new();
    payload.insert("organization_id".to_string(), json!(org_id));
    payload.insert("lease_id".to_string(), json!(input.lease_id));
    payload.insert("period_start".to_string(), json!(period_start.to_string()));
    payload.insert("period_end".to_string(), json!(period_end.to_string()));
    payload.insert("due_date".to_string(), json!(due_date.to_string()));
    payload.insert("rent_amount".to_string(), json!(rent_amount));
    payload.insert(
        "meter_readings".to_string(),
        serde_json::to_value(&input.meter_readings).unwrap_or(Value::Null),
    );
    payload.insert(
        "rates".to_string(),
        serde_json::to_value(&billing_policy.utility_rates).unwrap_or(Value::Null),
    );
    payload.insert(
        "additional_charges".to_string(),
        serde_json::to_value(&input.additional_charges).unwrap_or(Value::Null),
    );
    payload.insert(
        "discounts".to_string(),
        serde_json::to_value(&input.discounts).unwrap_or(Value::Null),
    );
    payload.insert("utility_subtotal".to_string(), json!(breakdown.utility_subtotal));
    payload.insert("charge_subtotal".to_string(), json!(breakdown.charge_subtotal));
    payload.insert("late_fee".to_string(), json!(breakdown.late_fee));
    payload.insert(
        "advance_credit_applied".to_string(),
        json!(advance_credit > 0.0),
    );
    payload.insert(
        "advance_credit_amount".to_string(),
        json!(breakdown.advance_credit_amount),
    );
    payload.insert(
        "pdc_credit_amount".to_string(),
        json!(breakdown.pdc_credit_amount),
    );
    if let Some(check) = &bound_check {
        payload.insert(
            "pdc_id".to_string(),
            check.get("id").cloned().unwrap_or(Value::Null),
        );
    }
    payload.insert(
        "total_before_clamp".to_string(),
        json!(breakdown.total_before_clamp),
    );
    payload.insert(
        "total_amount_due".to_string(),
        json!(breakdown.total_amount_due),
    );
    payload.insert("amount_paid".to_string(), json!(0.0));
    payload.insert("status".to_string(), json!("unpaid"));
    payload.insert("created_by_user_id".to_string(), json!(user_id));

    let statement = table_service::create_row(&mut *tx, "billing_statements", &payload).await?;
    let statement_id = require_str(&statement, "id")?.to_string();

    if let Some(check) = &bound_check {
        let check_id = require_str(check, "id")?;
        let mut updates = Map::new();
        updates.insert("billing_statement_id".to_string(), json!(statement_id));
        table_service::update_row(&mut *tx, "post_dated_checks", check_id, &updates, "id").await?;
    }

    if advance_credit > 0.0 {
        let mut updates = Map::new();
        updates.insert("advance_payment_consumed".to_string(), json!(true));
        table_service::update_row(&mut *tx, "leases", &input.lease_id, &updates, "id").await?;
    }

    tx.commit().await.map_err(commit_failed)?;

    audit::write_audit_log(
        state,
        Some(user_id),
        Some(&org_id),
        "statement.created",
        "billing_statement",
        &statement_id,
        None,
        Some(statement.clone()),
    )
    .await;

    Ok(statement)
}

/// Recompute the total from a statement's frozen breakdown. Used to
/// verify that the stored total is still a pure function of the record.
pub fn rederive_total(statement: &Value) -> Result<StatementBreakdown, AppError> {
    let mut meter_readings = BTreeMap::new();
    if let Some(readings) = statement.get("meter_readings").and_then(Value::as_object) {
        for (utility, reading) in readings {
            meter_readings.insert(
                utility.clone(),
                MeterReading {
                    previous: value_f64(reading, "previous").unwrap_or(0.0),
                    current: value_f64(reading, "current").unwrap_or(0.0),
                },
            );
        }
    }

    let mut rates = BTreeMap::new();
    if let Some(rate_map) = statement.get("rates").and_then(Value::as_object) {
        for (utility, rate) in rate_map {
            if let Some(value) = rate.as_f64() {
                rates.insert(utility.clone(), value);
            }
        }
    }

    let inputs = BreakdownInputs {
        rent_amount: value_f64(statement, "rent_amount").unwrap_or(0.0),
        meter_readings,
        rates,
        additional_charges: charge_lines(statement, "additional_charges"),
        discounts: charge_lines(statement, "discounts"),
        late_fee: value_f64(statement, "late_fee").unwrap_or(0.0),
        advance_credit: value_f64(statement, "advance_credit_amount").unwrap_or(0.0),
        pdc_credit: value_f64(statement, "pdc_credit_amount").unwrap_or(0.0),
    };
    compute_breakdown(&inputs)
}

/// Flip unpaid statements past their due date to `overdue`. Invoked by
/// the external scheduler through the internal endpoint.
pub async fn mark_overdue_sweep(state: &AppState) -> Result<u64, AppError> {
    let pool = db_pool(state)?;
    let today = today_in_timezone(&state.config.default_timezone);

    let mut filters = Map::new();
    filters.insert("status".to_string(), json!("unpaid"));
    filters.insert("due_date__lt".to_string(), json!(today.to_string()));

    let stale = table_service::list_rows(
        pool,
        "billing_statements",
        Some(&filters),
        500,
        0,
        "due_date",
        true,
    )
    .await?;

    let mut flipped = 0u64;
    for statement in stale {
        let Some(statement_id) = statement.get("id").and_then(Value::as_str) else {
            continue;
        };
        let mut updates = Map::new();
        updates.insert("status".to_string(), json!("overdue"));
        match table_service::update_row(pool, "billing_statements", statement_id, &updates, "id")
            .await
        {
            Ok(_) => flipped += 1,
            Err(error) => {
                tracing::warn!(%statement_id, error = %error, "Overdue flip failed");
            }
        }
    }

    tracing::info!(count = flipped, "Marked statements overdue");
    Ok(flipped)
}

async fn resolve_pdc(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    input: &CreateStatementInput,
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> Result<Option<Value>, AppError> {
    if let Some(pdc_id) = &input.pdc_id {
        let check =
            table_service::get_row_for_update(&mut **tx, "post_dated_checks", pdc_id, "id").await?;
        if value_str(&check, "lease_id") != Some(input.lease_id.as_str()) {
            return Err(AppError::Validation(
                "Check belongs to a different lease.".to_string(),
            ));
        }
        pdc_ledger::ensure_bindable(
            value_str(&check, "status"),
            value_str(&check, "billing_statement_id"),
        )?;
        return Ok(Some(check));
    }

    let candidates =
        pdc_ledger::available_checks(&mut **tx, &input.lease_id, period_start, period_end).await?;
    Ok(candidates.into_iter().next())
}

async fn prior_period_late_fee(
    state: &AppState,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    input: &CreateStatementInput,
    billing_policy: &policy::BillingPolicy,
) -> Result<f64, AppError> {
    let Some(late_policy) = &billing_policy.late_fee else {
        return Ok(0.0);
    };

    let mut filters = Map::new();
    filters.insert("lease_id".to_string(), json!(input.lease_id));
    filters.insert("status".to_string(), json!("overdue"));
    let overdue = table_service::list_rows(
        &mut **tx,
        "billing_statements",
        Some(&filters),
        1,
        0,
        "due_date",
        false,
    )
    .await?;
    let Some(prior) = overdue.into_iter().next() else {
        return Ok(0.0);
    };

    let Some(due_date) = value_str(&prior, "due_date")
        .and_then(|text| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok())
    else {
        return Ok(0.0);
    };

    let timezone = billing_policy
        .timezone
        .clone()
        .unwrap_or_else(|| state.config.default_timezone.clone());
    let today = today_in_timezone(&timezone);
    let days_past_due = (today - due_date).num_days();

    let balance = value_f64(&prior, "total_amount_due").unwrap_or(0.0)
        - value_f64(&prior, "amount_paid").unwrap_or(0.0);

    Ok(late_fee_amount(late_policy, balance, days_past_due))
}

fn today_in_timezone(name: &str) -> NaiveDate {
    match Tz::from_str(name) {
        Ok(tz) => Utc::now().with_timezone(&tz).date_naive(),
        Err(_) => {
            tracing::warn!(timezone = name, "Unknown timezone, falling back to UTC");
            Utc::now().date_naive()
        }
    }
}

fn charge_lines(statement: &Value, key: &str) -> Vec<ChargeLine> {
    statement
        .get(key)
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .map(|line| ChargeLine {
                    charge_type: value_str(line, "charge_type").unwrap_or_default().to_string(),
                    amount: value_f64(line, "amount").unwrap_or(0.0),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
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

fn value_f64(row: &Value, key: &str) -> Option<f64> {
    match row.get(key) {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{
        compute_breakdown, late_fee_amount, rederive_total, round2, BreakdownInputs, ChargeLine,
        MeterReading,
    };
    use crate::error::AppError;
    use crate::services::policy::{LateFeePolicy, LateFeeType};

    fn reading(previous: f64, current: f64) -> MeterReading {
        MeterReading { previous, current }
    }

    fn line(charge_type: &str, amount: f64) -> ChargeLine {
        ChargeLine {
            charge_type: charge_type.to_string(),
            amount,
        }
    }

    #[test]
    fn full_breakdown_adds_up() {
        // 10000 rent + 500 water + 800 electricity + 200 parking
        // - 100 promo = 11400.
        let mut meter_readings = BTreeMap::new();
        meter_readings.insert("water".to_string(), reading(1000.0, 1200.0));
        meter_readings.insert("electricity".to_string(), reading(500.0, 700.0));
        let mut rates = BTreeMap::new();
        rates.insert("water".to_string(), 2.5);
        rates.insert("electricity".to_string(), 4.0);

        let inputs = BreakdownInputs {
            rent_amount: 10000.0,
            meter_readings,
            rates,
            additional_charges: vec![line("parking", 200.0)],
            discounts: vec![line("promo", 100.0)],
            ..BreakdownInputs::default()
        };

        let breakdown = compute_breakdown(&inputs).unwrap();
        assert_eq!(breakdown.utility_subtotal, 1300.0);
        assert_eq!(breakdown.charge_subtotal, 100.0);
        assert_eq!(breakdown.total_amount_due, 11400.0);
        assert_eq!(breakdown.total_before_clamp, 11400.0);
    }

    #[test]
    fn breakdown_is_deterministic() {
        let mut meter_readings = BTreeMap::new();
        meter_readings.insert("water".to_string(), reading(10.0, 43.7));
        let mut rates = BTreeMap::new();
        rates.insert("water".to_string(), 3.17);

        let inputs = BreakdownInputs {
            rent_amount: 7200.0,
            meter_readings,
            rates,
            additional_charges: vec![line("cleaning", 150.0)],
            discounts: vec![],
            late_fee: 75.5,
            advance_credit: 0.0,
            pdc_credit: 500.0,
        };

        let first = compute_breakdown(&inputs).unwrap();
        let second = compute_breakdown(&inputs).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn negative_consumption_is_rejected() {
        let mut meter_readings = BTreeMap::new();
        meter_readings.insert("water".to_string(), reading(500.0, 480.0));
        let mut rates = BTreeMap::new();
        rates.insert("water".to_string(), 2.5);

        let inputs = BreakdownInputs {
            rent_amount: 10000.0,
            meter_readings,
            rates,
            ..BreakdownInputs::default()
        };

        match compute_breakdown(&inputs) {
            Err(AppError::Validation(message)) => assert!(message.contains("water")),
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn missing_rate_is_configuration_missing() {
        let mut meter_readings = BTreeMap::new();
        meter_readings.insert("gas".to_string(), reading(0.0, 10.0));

        let inputs = BreakdownInputs {
            rent_amount: 10000.0,
            meter_readings,
            rates: BTreeMap::new(),
            ..BreakdownInputs::default()
        };

        assert!(matches!(
            compute_breakdown(&inputs),
            Err(AppError::ConfigurationMissing(_))
        ));
    }

    #[test]
    fn discounts_never_drive_charges_negative() {
        let inputs = BreakdownInputs {
            rent_amount: 10000.0,
            additional_charges: vec![line("parking", 100.0)],
            discounts: vec![line("promo", 400.0)],
            ..BreakdownInputs::default()
        };
        let breakdown = compute_breakdown(&inputs).unwrap();
        assert_eq!(breakdown.charge_subtotal, 0.0);
        assert_eq!(breakdown.total_amount_due, 10000.0);
    }

    #[test]
    fn totals_clamp_at_zero_but_record_preclamp() {
        let inputs = BreakdownInputs {
            rent_amount: 1000.0,
            advance_credit: 1000.0,
            pdc_credit: 600.0,
            ..BreakdownInputs::default()
        };
        let breakdown = compute_breakdown(&inputs).unwrap();
        assert_eq!(breakdown.total_amount_due, 0.0);
        assert_eq!(breakdown.total_before_clamp, -600.0);
    }

    #[test]
    fn advance_credit_applies_at_most_once() {
        use super::ensure_advance_available;

        // First designated period: the credit is available.
        assert!(ensure_advance_available(false, 10000.0).is_ok());
        // Second attempt finds the flag set and conflicts.
        assert!(matches!(
            ensure_advance_available(true, 10000.0),
            Err(AppError::StateConflict(_))
        ));
        // No advance was ever held for this lease.
        assert!(matches!(
            ensure_advance_available(false, 0.0),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn late_fee_honors_grace_and_type() {
        let fixed = LateFeePolicy {
            fee_type: LateFeeType::Fixed,
            amount: 250.0,
            grace_period_days: 3,
        };
        assert_eq!(late_fee_amount(&fixed, 5000.0, 3), 0.0);
        assert_eq!(late_fee_amount(&fixed, 5000.0, 4), 250.0);
        assert_eq!(late_fee_amount(&fixed, 0.0, 10), 0.0);

        let percent = LateFeePolicy {
            fee_type: LateFeeType::Percent,
            amount: 5.0,
            grace_period_days: 0,
        };
        assert_eq!(late_fee_amount(&percent, 5000.0, 1), 250.0);
    }

    #[test]
    fn rederives_frozen_statement() {
        let statement = json!({
            "rent_amount": 10000.0,
            "meter_readings": {
                "water": {"previous": 1000.0, "current": 1200.0},
                "electricity": {"previous": 500.0, "current": 700.0},
            },
            "rates": {"water": 2.5, "electricity": 4.0},
            "additional_charges": [{"charge_type": "parking", "amount": 200.0}],
            "discounts": [{"charge_type": "promo", "amount": 100.0}],
            "late_fee": 0.0,
            "advance_credit_amount": 0.0,
            "pdc_credit_amount": 0.0,
            "total_amount_due": 11400.0,
        });
        let breakdown = rederive_total(&statement).unwrap();
        assert_eq!(breakdown.total_amount_due, 11400.0);
    }

    #[test]
    fn rounds_to_cents() {
        assert_eq!(round2(10.006), 10.01);
        assert_eq!(round2(10.004), 10.0);
        assert_eq!(round2(1300.0), 1300.0);
    }
}
