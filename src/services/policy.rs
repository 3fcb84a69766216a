use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::error::AppError;
use crate::repository::table_service;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateFeeType {
    Fixed,
    Percent,
}

#[derive(Debug, Clone)]
pub struct LateFeePolicy {
    pub fee_type: LateFeeType,
    pub amount: f64,
    pub grace_period_days: i64,
}

/// The billing configuration for a property, parsed out of its
/// `billing_policies` row.
#[derive(Debug, Clone)]
pub struct BillingPolicy {
    pub property_id: String,
    pub organization_id: String,
    pub utility_rates: BTreeMap<String, f64>,
    pub late_fee: Option<LateFeePolicy>,
    pub timezone: Option<String>,
}

/// Policy reads sit behind the TTL cache in `AppState`; writers call
/// `AppState::invalidate_billing_policy` after committing.
pub async fn get_billing_policy(
    state: &AppState,
    property_id: &str,
) -> Result<BillingPolicy, AppError> {
    if let Some(cached) = state
        .billing_policy_cache
        .get(&property_id.to_string())
        .await
    {
        return parse_policy(&cached);
    }

    let pool = state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })?;

    let mut filters = Map::new();
    filters.insert("property_id".to_string(), json!(property_id));
    let rows = table_service::list_rows(pool, "billing_policies", Some(&filters), 1, 0, "created_at", false)
        .await?;
    let Some(row) = rows.into_iter().next() else {
        return Err(AppError::ConfigurationMissing(format!(
            "No billing policy configured for property {property_id}."
        )));
    };

    state
        .billing_policy_cache
        .insert(property_id.to_string(), row.clone())
        .await;
    parse_policy(&row)
}

pub fn parse_policy(row: &Value) -> Result<BillingPolicy, AppError> {
    let property_id = row
        .get("property_id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Internal("Billing policy row lacks property_id.".to_string()))?
        .to_string();
    let organization_id = row
        .get("organization_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut utility_rates = BTreeMap::new();
    if let Some(rates) = row.get("utility_rates").and_then(Value::as_object) {
        for (utility, rate) in rates {
            if let Some(value) = rate.as_f64() {
                utility_rates.insert(utility.clone(), value);
            }
        }
    }

    let late_fee = parse_late_fee(row)?;
    let timezone = row
        .get("timezone")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(BillingPolicy {
        property_id,
        organization_id,
        utility_rates,
        late_fee,
        timezone,
    })
}

fn parse_late_fee(row: &Value) -> Result<Option<LateFeePolicy>, AppError> {
    let Some(raw_type) = row.get("late_fee_type").and_then(Value::as_str) else {
        return Ok(None);
    };
    let fee_type = match raw_type {
        "fixed" => LateFeeType::Fixed,
        "percent" => LateFeeType::Percent,
        other => {
            return Err(AppError::ConfigurationMissing(format!(
                "Unknown late fee type '{other}'."
            )))
        }
    };
    let amount = row
        .get("late_fee_amount")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let grace_period_days = row
        .get("grace_period_days")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        .max(0);

    Ok(Some(LateFeePolicy {
        fee_type,
        amount,
        grace_period_days,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_policy, LateFeeType};

    #[test]
    fn parses_rates_and_late_fee() {
        let row = json!({
            "property_id": "550e8400-e29b-41d4-a716-446655440000",
            "organization_id": "6fa459ea-ee8a-3ca4-894e-db77e160355e",
            "utility_rates": {"water": 2.5, "electricity": 4.0},
            "late_fee_type": "percent",
            "late_fee_amount": 5.0,
            "grace_period_days": 3,
            "timezone": "America/Asuncion",
        });
        let policy = parse_policy(&row).unwrap();
        assert_eq!(policy.utility_rates.get("water"), Some(&2.5));
        assert_eq!(policy.utility_rates.get("gas"), None);
        let late_fee = policy.late_fee.unwrap();
        assert_eq!(late_fee.fee_type, LateFeeType::Percent);
        assert_eq!(late_fee.grace_period_days, 3);
    }

    #[test]
    fn missing_late_fee_is_none_and_bad_type_fails() {
        let plain = json!({"property_id": "p", "utility_rates": {}});
        assert!(parse_policy(&plain).unwrap().late_fee.is_none());

        let broken = json!({"property_id": "p", "late_fee_type": "compounding"});
        assert!(parse_policy(&broken).is_err());
    }
}
