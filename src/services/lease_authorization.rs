use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::error::AppError;
use crate::repository::table_service;
use crate::services::audit;
use crate::services::notifications;
use crate::services::sealed::SealedValue;
use crate::state::AppState;
use crate::tenancy;

pub const ROLE_LANDLORD: &str = "landlord";
pub const ROLE_TENANT: &str = "tenant";

/// Who verified the code, for the audit trail. Values may arrive sealed
/// from upstream; they are stored as-is with their explicit tag.
#[derive(Debug, Clone, Default)]
pub struct VerifierMetadata {
    pub ip: Option<SealedValue>,
    pub agent: Option<SealedValue>,
}

/// Outcome of checking a presented code against the stored record.
/// Precedence is fixed: a used code is rejected before expiry is even
/// considered, an expired code before the digits are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpDecision {
    Accept,
    AlreadyUsed,
    Expired,
    Mismatch,
}

pub fn decide_otp(
    record_status: &str,
    otp_expires_at: DateTime<Utc>,
    stored_code: &str,
    presented_code: &str,
    now: DateTime<Utc>,
) -> OtpDecision {
    if record_status == "signed" {
        return OtpDecision::AlreadyUsed;
    }
    if now > otp_expires_at {
        return OtpDecision::Expired;
    }
    if stored_code != presented_code.trim() {
        return OtpDecision::Mismatch;
    }
    OtpDecision::Accept
}

/// True when the latest record for each role is `signed`.
pub fn both_roles_signed(signatures: &[Value]) -> bool {
    latest_status_for_role(signatures, ROLE_LANDLORD) == Some("signed".to_string())
        && latest_status_for_role(signatures, ROLE_TENANT) == Some("signed".to_string())
}

fn latest_status_for_role(signatures: &[Value], role: &str) -> Option<String> {
    signatures
        .iter()
        .filter(|row| value_str(row, "role") == Some(role))
        .filter(|row| value_str(row, "status") != Some("superseded"))
        .max_by_key(|row| value_str(row, "created_at").unwrap_or_default().to_string())
        .and_then(|row| value_str(row, "status"))
        .map(str::to_string)
}

pub fn parse_role(role: &str) -> Result<&str, AppError> {
    match role.trim() {
        ROLE_LANDLORD => Ok(ROLE_LANDLORD),
        ROLE_TENANT => Ok(ROLE_TENANT),
        _ => Err(AppError::Validation(
            "Role must be 'landlord' or 'tenant'.".to_string(),
        )),
    }
}

/// Issue a fresh OTP for a role. Any prior pending record for the role
/// is superseded; only the newest record is ever authoritative. The
/// code travels to the signer through the notification queue, never in
/// the HTTP response.
pub async fn request_signature(
    state: &AppState,
    user_id: &str,
    lease_id: &str,
    role: &str,
) -> Result<Value, AppError> {
    let role = parse_role(role)?;
    let pool = db_pool(state)?;
    let mut tx = pool.begin().await.map_err(begin_failed)?;

    let lease = table_service::get_row_for_update(&mut *tx, "leases", lease_id, "id").await?;
    let org_id = require_str(&lease, "organization_id")?.to_string();
    tenancy::assert_org_member(state, user_id, &org_id).await?;

    let lease_status = value_str(&lease, "status").unwrap_or_default().to_string();
    if lease_status != "draft" && lease_status != "pending_signature" {
        return Err(AppError::StateConflict(format!(
            "Lease in status '{lease_status}' cannot collect signatures."
        )));
    }

    if lease_status == "draft" {
        let mut updates = Map::new();
        updates.insert("status".to_string(), json!("pending_signature"));
        table_service::update_row(&mut *tx, "leases", lease_id, &updates, "id").await?;
    }

    let mut role_filter = Map::new();
    role_filter.insert("lease_id".to_string(), json!(lease_id));
    role_filter.insert("role".to_string(), json!(role));
    let role_records = table_service::list_rows(
        &mut *tx,
        "lease_signatures",
        Some(&role_filter),
        20,
        0,
        "created_at",
        false,
    )
    .await?;

    // A completed signature stays completed; issuing a fresh OTP would
    // displace the signed record and silently block activation.
    if latest_status_for_role(&role_records, role).as_deref() == Some("signed") {
        return Err(AppError::StateConflict(
            "This role has already signed.".to_string(),
        ));
    }

    // Supersede any still-pending record for this role.
    for record in role_records {
        if value_str(&record, "status") != Some("pending") {
            continue;
        }
        if let Some(record_id) = value_str(&record, "id") {
            let mut updates = Map::new();
            updates.insert("status".to_string(), json!("superseded"));
            table_service::update_row(&mut *tx, "lease_signatures", record_id, &updates, "id")
                .await?;
        }
    }

    let code = generate_otp();
    let ttl_minutes = state.config.otp_ttl_minutes;
    let expires_at = Utc::now() + Duration::minutes(ttl_minutes);

    let mut payload = Map::new();
    payload.insert("lease_id".to_string(), json!(lease_id));
    payload.insert("role".to_string(), json!(role));
    payload.insert("otp_code".to_string(), json!(code));
    payload.insert("otp_expires_at".to_string(), json!(expires_at.to_rfc3339()));
    payload.insert("status".to_string(), json!("pending"));

    let signature = table_service::create_row(&mut *tx, "lease_signatures", &payload).await?;
    tx.commit().await.map_err(commit_failed)?;

    // The code leaves the service only through the message queue.
    notifications::dispatch(state, notifications::otp_message(&lease, role, &code, ttl_minutes))
        .await;
    audit::write_audit_log(
        state,
        Some(user_id),
        Some(&org_id),
        "signature.requested",
        "lease_signature",
        value_str(&signature, "id").unwrap_or_default(),
        None,
        Some(json!({"lease_id": lease_id, "role": role})),
    )
    .await;

    Ok(mask_otp(signature))
}

/// Verify a presented code. On success the role is `signed`; when both
/// roles are signed the lease flips to `active` inside the same
/// transaction. Failures never reveal whether a lease or role exists —
/// only used/expired/mismatch.
pub async fn verify_otp(
    state: &AppState,
    user_id: &str,
    lease_id: &str,
    role: &str,
    presented_code: &str,
    verifier: &VerifierMetadata,
) -> Result<Value, AppError> {
    let role = parse_role(role)?;
    let pool = db_pool(state)?;
    let mut tx = pool.begin().await.map_err(begin_failed)?;

    let lease = table_service::get_row_for_update(&mut *tx, "leases", lease_id, "id").await?;
    let org_id = require_str(&lease, "organization_id")?.to_string();
    tenancy::assert_org_member(state, user_id, &org_id).await?;

    let lease_status = value_str(&lease, "status").unwrap_or_default().to_string();
    if lease_status != "pending_signature" {
        return Err(AppError::StateConflict(format!(
            "Lease in status '{lease_status}' cannot collect signatures."
        )));
    }

    let mut filter = Map::new();
    filter.insert("lease_id".to_string(), json!(lease_id));
    filter.insert("role".to_string(), json!(role));
    let records = table_service::list_rows(
        &mut *tx,
        "lease_signatures",
        Some(&filter),
        20,
        0,
        "created_at",
        false,
    )
    .await?;
    let Some(record) = records
        .into_iter()
        .find(|row| value_str(row, "status") != Some("superseded"))
    else {
        return Err(AppError::Validation("Code mismatch.".to_string()));
    };

    let record_status = value_str(&record, "status").unwrap_or_default().to_string();
    let stored_code = value_str(&record, "otp_code").unwrap_or_default().to_string();
    let expires_at = value_str(&record, "otp_expires_at")
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|stamp| stamp.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    match decide_otp(&record_status, expires_at, &stored_code, presented_code, Utc::now()) {
        OtpDecision::Accept => {}
        OtpDecision::AlreadyUsed => {
            return Err(AppError::StateConflict("Code already used.".to_string()))
        }
        OtpDecision::Expired => {
            return Err(AppError::ExpiredToken("Code expired.".to_string()))
        }
        OtpDecision::Mismatch => {
            return Err(AppError::Validation("Code mismatch.".to_string()))
        }
    }

    let record_id = require_str(&record, "id")?.to_string();
    let mut updates = Map::new();
    updates.insert("status".to_string(), json!("signed"));
    updates.insert("signed_at".to_string(), json!(Utc::now().to_rfc3339()));
    if let Some(ip) = &verifier.ip {
        updates.insert("verifier_ip".to_string(), ip.to_json());
    }
    if let Some(agent) = &verifier.agent {
        updates.insert("verifier_agent".to_string(), agent.to_json());
    }
    let signed = table_service::update_row(&mut *tx, "lease_signatures", &record_id, &updates, "id")
        .await?;

    // Re-read both roles inside the transaction; the lease row lock
    // serializes the two verifications.
    let mut all_filter = Map::new();
    all_filter.insert("lease_id".to_string(), json!(lease_id));
    let all_records = table_service::list_rows(
        &mut *tx,
        "lease_signatures",
        Some(&all_filter),
        50,
        0,
        "created_at",
        false,
    )
    .await?;

    let mut final_status = lease_status;
    if both_roles_signed(&all_records) {
        let mut lease_updates = Map::new();
        lease_updates.insert("status".to_string(), json!("active"));
        lease_updates.insert("activated_at".to_string(), json!(Utc::now().to_rfc3339()));
        table_service::update_row(&mut *tx, "leases", lease_id, &lease_updates, "id").await?;
        final_status = "active".to_string();
    }

    tx.commit().await.map_err(commit_failed)?;

    if final_status == "active" {
        notifications::dispatch(state, notifications::activation_message(&lease)).await;
    }
    audit::write_audit_log(
        state,
        Some(user_id),
        Some(&org_id),
        "signature.verified",
        "lease_signature",
        &record_id,
        Some(record),
        Some(json!({"lease_id": lease_id, "role": role, "lease_status": final_status})),
    )
    .await;

    Ok(json!({
        "signature": mask_otp(signed),
        "lease_status": final_status,
    }))
}

/// Move active leases past their end date to a terminal status:
/// `completed` when nothing is left owing, `expired` when an unpaid or
/// overdue statement remains. Invoked by the external scheduler through
/// the internal endpoint.
pub async fn lifecycle_sweep(state: &AppState, today: chrono::NaiveDate) -> Result<u64, AppError> {
    let pool = db_pool(state)?;

    let mut filters = Map::new();
    filters.insert("status".to_string(), json!("active"));
    filters.insert("ends_on__lt".to_string(), json!(today.to_string()));
    let ended = table_service::list_rows(pool, "leases", Some(&filters), 500, 0, "ends_on", true)
        .await?;

    let mut moved = 0u64;
    for lease in ended {
        let Some(lease_id) = value_str(&lease, "id") else {
            continue;
        };

        let mut owing_filter = Map::new();
        owing_filter.insert("lease_id".to_string(), json!(lease_id));
        owing_filter.insert(
            "status__in".to_string(),
            json!(["unpaid", "overdue"]),
        );
        let owing = table_service::count_rows(pool, "billing_statements", Some(&owing_filter))
            .await?;
        let next_status = if owing > 0 { "expired" } else { "completed" };

        let mut updates = Map::new();
        updates.insert("status".to_string(), json!(next_status));
        match table_service::update_row(pool, "leases", lease_id, &updates, "id").await {
            Ok(_) => moved += 1,
            Err(error) => {
                tracing::warn!(%lease_id, error = %error, "Lifecycle transition failed");
            }
        }
    }

    tracing::info!(count = moved, "Lease lifecycle sweep finished");
    Ok(moved)
}

/// Six decimal digits derived from a v4 UUID's random bytes.
fn generate_otp() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let mut accumulator: u32 = 0;
    for byte in bytes {
        accumulator = accumulator.wrapping_mul(31).wrapping_add(byte as u32);
    }
    format!("{:06}", accumulator % 1_000_000)
}

fn mask_otp(mut signature: Value) -> Value {
    if let Some(object) = signature.as_object_mut() {
        object.remove("otp_code");
    }
    signature
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
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{
        both_roles_signed, decide_otp, generate_otp, mask_otp, parse_role, OtpDecision,
    };

    #[test]
    fn otp_precedence_is_used_then_expired_then_mismatch() {
        let now = Utc::now();
        let future = now + Duration::minutes(5);
        let past = now - Duration::minutes(5);

        // A used code is rejected even before expiry, with the right code.
        assert_eq!(
            decide_otp("signed", future, "482913", "482913", now),
            OtpDecision::AlreadyUsed
        );
        // An expired code is rejected even when the digits match.
        assert_eq!(
            decide_otp("pending", past, "482913", "482913", now),
            OtpDecision::Expired
        );
        assert_eq!(
            decide_otp("pending", future, "482913", "000000", now),
            OtpDecision::Mismatch
        );
        assert_eq!(
            decide_otp("pending", future, "482913", " 482913 ", now),
            OtpDecision::Accept
        );
    }

    #[test]
    fn activation_requires_both_roles() {
        let landlord_signed = json!({
            "role": "landlord", "status": "signed", "created_at": "2026-01-02T10:00:00Z",
        });
        let tenant_pending = json!({
            "role": "tenant", "status": "pending", "created_at": "2026-01-02T10:05:00Z",
        });
        let tenant_signed = json!({
            "role": "tenant", "status": "signed", "created_at": "2026-01-02T11:00:00Z",
        });

        // One signature alone never activates, in either order.
        assert!(!both_roles_signed(&[landlord_signed.clone()]));
        assert!(!both_roles_signed(&[
            landlord_signed.clone(),
            tenant_pending.clone()
        ]));
        assert!(both_roles_signed(&[landlord_signed, tenant_pending, tenant_signed]));
    }

    #[test]
    fn signed_roles_cannot_be_displaced_by_a_new_request() {
        use super::latest_status_for_role;

        let landlord_signed = json!({
            "role": "landlord", "status": "signed", "created_at": "2026-01-02T10:00:00Z",
        });
        let tenant_signed = json!({
            "role": "tenant", "status": "signed", "created_at": "2026-01-02T11:00:00Z",
        });

        // The request guard fires on exactly this condition.
        assert_eq!(
            latest_status_for_role(&[landlord_signed.clone()], "landlord").as_deref(),
            Some("signed")
        );

        // Without the guard, a later pending record would become the
        // latest for the role and un-activate a fully signed pair.
        let displaced = json!({
            "role": "landlord", "status": "pending", "created_at": "2026-01-02T12:00:00Z",
        });
        assert!(both_roles_signed(&[
            landlord_signed.clone(),
            tenant_signed.clone()
        ]));
        assert!(!both_roles_signed(&[landlord_signed, tenant_signed, displaced]));
    }

    #[test]
    fn superseded_records_are_not_authoritative() {
        let old_signed = json!({
            "role": "tenant", "status": "superseded", "created_at": "2026-01-02T09:00:00Z",
        });
        let fresh_pending = json!({
            "role": "tenant", "status": "pending", "created_at": "2026-01-02T10:00:00Z",
        });
        let landlord = json!({
            "role": "landlord", "status": "signed", "created_at": "2026-01-02T08:00:00Z",
        });
        assert!(!both_roles_signed(&[landlord, old_signed, fresh_pending]));
    }

    #[test]
    fn roles_are_strict() {
        assert!(parse_role("landlord").is_ok());
        assert!(parse_role("tenant").is_ok());
        assert!(parse_role("broker").is_err());
        assert!(parse_role("").is_err());
    }

    #[test]
    fn otp_is_six_digits() {
        for _ in 0..50 {
            let code = generate_otp();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|character| character.is_ascii_digit()));
        }
    }

    #[test]
    fn responses_never_carry_the_code() {
        let masked = mask_otp(json!({"id": "s1", "otp_code": "482913", "status": "pending"}));
        assert!(masked.get("otp_code").is_none());
        assert_eq!(masked["status"], "pending");
    }
}
