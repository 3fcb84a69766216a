use std::collections::BTreeMap;

use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::Validation(format!("Validation failed: {errors}")))
}

fn default_currency_pyg() -> String {
    "PYG".to_string()
}
fn default_false() -> bool {
    false
}
fn default_limit_100() -> i64 {
    100
}
fn default_limit_200() -> i64 {
    200
}

// ===== Leases =====

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateLeaseInput {
    pub organization_id: String,
    pub property_id: String,
    pub unit_id: String,
    #[validate(length(min = 1, max = 255))]
    pub tenant_full_name: String,
    #[validate(email)]
    pub tenant_email: Option<String>,
    pub tenant_phone_e164: Option<String>,
    pub starts_on: String,
    pub ends_on: Option<String>,
    pub rent_amount: f64,
    #[serde(default)]
    pub security_deposit_amount: f64,
    #[serde(default)]
    pub advance_payment_amount: f64,
    #[serde(default = "default_currency_pyg")]
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LeasePath {
    pub lease_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LeasesQuery {
    pub org_id: String,
    pub status: Option<String>,
    pub unit_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

// ===== Signatures =====

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct SignaturePath {
    pub lease_id: String,
    pub role: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct VerifyOtpInput {
    #[validate(length(min = 4, max = 12))]
    pub code: String,
}

// ===== Billing statements =====

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct MeterReadingInput {
    pub previous: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ChargeLineInput {
    pub charge_type: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct CreateStatementInput {
    pub lease_id: String,
    pub period_start: String,
    pub period_end: String,
    /// Utility name -> previous/current readings. BTreeMap keeps the
    /// frozen breakdown deterministic across recomputations.
    #[serde(default)]
    pub meter_readings: BTreeMap<String, MeterReadingInput>,
    #[serde(default)]
    pub additional_charges: Vec<ChargeLineInput>,
    #[serde(default)]
    pub discounts: Vec<ChargeLineInput>,
    /// Designates this period as the first applicable one for the
    /// lease's advance-payment credit.
    #[serde(default = "default_false")]
    pub apply_advance_credit: bool,
    /// Explicitly bind this cleared check; when absent, any cleared
    /// unbound check due in the period is picked up.
    pub pdc_id: Option<String>,
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct StatementPath {
    pub statement_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct StatementsQuery {
    pub org_id: String,
    pub lease_id: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

// ===== Post-dated checks =====

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePdcInput {
    pub organization_id: String,
    pub lease_id: String,
    #[validate(length(min = 1, max = 64))]
    pub check_number: String,
    #[validate(length(min = 1, max = 255))]
    pub bank_name: String,
    pub amount: f64,
    pub due_date: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PdcPath {
    pub pdc_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ClearPdcInput {
    pub billing_statement_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct ReplacePdcInput {
    #[validate(length(min = 1, max = 64))]
    pub check_number: String,
    #[validate(length(min = 1, max = 255))]
    pub bank_name: String,
    pub amount: f64,
    pub due_date: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PdcsQuery {
    pub org_id: String,
    pub lease_id: Option<String>,
    pub status: Option<String>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

// ===== Billing policies =====

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PoliciesQuery {
    pub org_id: String,
    pub property_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PolicyPath {
    pub property_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpsertPolicyInput {
    pub organization_id: String,
    /// Utility name -> unit rate.
    #[serde(default)]
    pub utility_rates: BTreeMap<String, f64>,
    pub late_fee_type: Option<String>,
    pub late_fee_amount: Option<f64>,
    pub grace_period_days: Option<i32>,
    pub timezone: Option<String>,
}

// ===== Payments (gateway webhook) =====

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct GatewayPaymentInput {
    pub billing_statement_id: String,
    pub amount: f64,
    #[validate(length(min = 1, max = 128))]
    pub reference: String,
    pub method: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentsQuery {
    pub org_id: String,
    pub billing_statement_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

// ===== Shared helpers =====

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{clamp_limit_in_range, CreateStatementInput};

    #[test]
    fn clamps_limits() {
        assert_eq!(clamp_limit_in_range(0, 1, 100), 1);
        assert_eq!(clamp_limit_in_range(50, 1, 100), 50);
        assert_eq!(clamp_limit_in_range(5000, 1, 100), 100);
    }

    #[test]
    fn statement_input_defaults() {
        let input: CreateStatementInput = serde_json::from_value(json!({
            "lease_id": "550e8400-e29b-41d4-a716-446655440000",
            "period_start": "2026-01-01",
            "period_end": "2026-01-31"
        }))
        .expect("minimal statement input");
        assert!(input.meter_readings.is_empty());
        assert!(input.additional_charges.is_empty());
        assert!(!input.apply_advance_credit);
        assert!(input.pdc_id.is_none());
    }
}
