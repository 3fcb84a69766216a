use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::state::AppState;

/// Reject requests whose Host header is not in the trusted list.
/// A `*` entry disables the check (useful behind a trusted proxy).
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let trusted = &state.config.trusted_hosts;
    if trusted.iter().any(|host| host.trim() == "*") {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port)
        .unwrap_or_default()
        .to_string();

    let allowed = trusted
        .iter()
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(&host));

    if !allowed {
        return AppError::Forbidden("Host not allowed.".to_string()).into_response();
    }

    next.run(request).await
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':')
        .map(|(name, port)| {
            if port.chars().all(|character| character.is_ascii_digit()) {
                name
            } else {
                host
            }
        })
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::strip_port;

    #[test]
    fn strips_numeric_ports_only() {
        assert_eq!(strip_port("localhost:8000"), "localhost");
        assert_eq!(strip_port("api.rentavia.co"), "api.rentavia.co");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }
}
