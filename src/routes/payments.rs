use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;

use crate::auth;
use crate::error::{AppError, AppResult};
use crate::repository::table_service;
use crate::schemas::{clamp_limit_in_range, validate_input, GatewayPaymentInput, PaymentsQuery};
use crate::services::reconciliation;
use crate::state::AppState;
use crate::tenancy;

type HmacSha256 = Hmac<Sha256>;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/gateway", post(gateway_webhook))
        .route("/payments", get(list_payments))
}

/// Payment confirmation from the gateway collaborator. Authenticated by
/// the HMAC-SHA256 signature over the raw body, not by a user token.
async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let secret = state.config.gateway_webhook_secret.as_deref().ok_or_else(|| {
        AppError::Forbidden("Gateway webhook is not configured.".to_string())
    })?;

    let provided = headers
        .get("x-gateway-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !signature_is_valid(secret, &body, provided) {
        return Err(AppError::Unauthorized(
            "Invalid webhook signature.".to_string(),
        ));
    }

    let input: GatewayPaymentInput = serde_json::from_slice(&body)
        .map_err(|_| AppError::Validation("Malformed webhook payload.".to_string()))?;
    validate_input(&input)?;

    let result = reconciliation::reconcile_payment(&state, &input).await?;
    Ok(Json(result))
}

async fn list_payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PaymentsQuery>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    tenancy::assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(query.org_id));
    if let Some(statement_id) = &query.billing_statement_id {
        filters.insert("billing_statement_id".to_string(), json!(statement_id));
    }

    let limit = clamp_limit_in_range(query.limit, 1, 500);
    let rows =
        table_service::list_rows(pool, "payments", Some(&filters), limit, 0, "received_at", false)
            .await?;
    let count = rows.len();
    Ok(Json(json!({ "items": rows, "count": count })))
}

fn signature_is_valid(secret: &str, body: &[u8], provided_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex_encode(&mac.finalize().into_bytes());
    constant_time_eq(expected.as_bytes(), provided_hex.trim().as_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(encoded, "{byte:02x}");
    }
    encoded
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    use super::{hex_encode, signature_is_valid};

    #[test]
    fn accepts_matching_signature() {
        let secret = "topsecret";
        let body = br#"{"billing_statement_id":"s1","amount":11400,"reference":"gw-1"}"#;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex_encode(&mac.finalize().into_bytes());

        assert!(signature_is_valid(secret, body, &signature));
        assert!(signature_is_valid(secret, body, &format!(" {signature} ")));
    }

    #[test]
    fn rejects_tampered_body_or_signature() {
        let secret = "topsecret";
        let body = b"{\"amount\":11400}";

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex_encode(&mac.finalize().into_bytes());

        assert!(!signature_is_valid(secret, b"{\"amount\":99999}", &signature));
        assert!(!signature_is_valid(secret, body, "deadbeef"));
        assert!(!signature_is_valid("othersecret", body, &signature));
    }

    #[test]
    fn hex_is_lowercase_two_chars_per_byte() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x0a]), "00ff0a");
    }
}
