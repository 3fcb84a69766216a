use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use crate::auth;
use crate::error::AppResult;
use crate::schemas::{validate_input, SignaturePath, VerifyOtpInput};
use crate::services::lease_authorization::{self, VerifierMetadata};
use crate::services::sealed::SealedValue;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/leases/{lease_id}/signatures/{role}/request",
            post(request_signature),
        )
        .route(
            "/leases/{lease_id}/signatures/{role}/verify",
            post(verify_otp),
        )
}

async fn request_signature(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<SignaturePath>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    let signature =
        lease_authorization::request_signature(&state, &user_id, &path.lease_id, &path.role)
            .await?;
    Ok(Json(signature))
}

async fn verify_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<SignaturePath>,
    Json(input): Json<VerifyOtpInput>,
) -> AppResult<Json<Value>> {
    let user_id = auth::require_user_id(&state, &headers).await?;
    validate_input(&input)?;

    let verifier = verifier_from_headers(&headers);
    let result = lease_authorization::verify_otp(
        &state,
        &user_id,
        &path.lease_id,
        &path.role,
        &input.code,
        &verifier,
    )
    .await?;
    Ok(Json(result))
}

fn verifier_from_headers(headers: &HeaderMap) -> VerifierMetadata {
    let ip = header_value(headers, "x-forwarded-for")
        .map(|raw| raw.split(',').next().unwrap_or(&raw).trim().to_string())
        .filter(|value| !value.is_empty())
        .map(SealedValue::plain);
    let agent = header_value(headers, "user-agent").map(SealedValue::plain);
    VerifierMetadata { ip, agent }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;

    use super::verifier_from_headers;

    #[test]
    fn takes_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "181.120.4.18, 10.0.0.1".parse().unwrap());
        headers.insert("user-agent", "Mozilla/5.0".parse().unwrap());

        let verifier = verifier_from_headers(&headers);
        assert_eq!(verifier.ip.unwrap().expose_plain(), Some("181.120.4.18"));
        assert_eq!(verifier.agent.unwrap().expose_plain(), Some("Mozilla/5.0"));
    }

    #[test]
    fn missing_headers_stay_absent() {
        let verifier = verifier_from_headers(&HeaderMap::new());
        assert!(verifier.ip.is_none());
        assert!(verifier.agent.is_none());
    }
}
