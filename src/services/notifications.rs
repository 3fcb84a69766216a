use serde_json::{json, Value};

use crate::repository::table_service;
use crate::state::AppState;

/// An outbound message queued for the delivery service. Rows land in
/// `message_logs`; actual email/push delivery happens elsewhere.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub organization_id: Option<String>,
    pub recipient: Option<String>,
    pub channel: &'static str,
    pub template: &'static str,
    pub subject: String,
    pub body: String,
    pub metadata: Value,
}

pub fn otp_message(
    lease: &Value,
    role: &str,
    code: &str,
    ttl_minutes: i64,
) -> NotificationRequest {
    NotificationRequest {
        organization_id: value_str(lease, "organization_id").map(str::to_string),
        recipient: value_str(lease, "tenant_email").map(str::to_string),
        channel: "email",
        template: "lease_signature_otp",
        subject: "Código de firma de contrato".to_string(),
        body: format!(
            "Tu código para firmar el contrato como {role} es {code}. \
             Vence en {ttl_minutes} minutos."
        ),
        metadata: json!({
            "lease_id": lease.get("id").cloned().unwrap_or(Value::Null),
            "role": role,
        }),
    }
}

pub fn activation_message(lease: &Value) -> NotificationRequest {
    NotificationRequest {
        organization_id: value_str(lease, "organization_id").map(str::to_string),
        recipient: value_str(lease, "tenant_email").map(str::to_string),
        channel: "email",
        template: "lease_activated",
        subject: "Contrato de alquiler activado".to_string(),
        body: "Ambas partes firmaron el contrato. El contrato ya está activo.".to_string(),
        metadata: json!({
            "lease_id": lease.get("id").cloned().unwrap_or(Value::Null),
        }),
    }
}

pub fn receipt_message(statement: &Value, amount: f64) -> NotificationRequest {
    NotificationRequest {
        organization_id: value_str(statement, "organization_id").map(str::to_string),
        recipient: None,
        channel: "email",
        template: "payment_receipt",
        subject: "Pago recibido".to_string(),
        body: format!(
            "Registramos tu pago de {amount:.0}. Gracias por mantener tu cuenta al día."
        ),
        metadata: json!({
            "billing_statement_id": statement.get("id").cloned().unwrap_or(Value::Null),
            "lease_id": statement.get("lease_id").cloned().unwrap_or(Value::Null),
            "amount": amount,
        }),
    }
}

/// Fire-and-forget dispatch. Callers invoke this only after their own
/// transaction has committed; a rollback must never leave a misleading
/// message behind. Failures are logged and swallowed.
pub async fn dispatch(state: &AppState, request: NotificationRequest) {
    let Some(pool) = state.db_pool.as_ref() else {
        return;
    };

    let mut payload = serde_json::Map::new();
    if let Some(org) = &request.organization_id {
        payload.insert("organization_id".to_string(), json!(org));
    }
    if let Some(recipient) = &request.recipient {
        payload.insert("recipient".to_string(), json!(recipient));
    }
    payload.insert("channel".to_string(), json!(request.channel));
    payload.insert("template".to_string(), json!(request.template));
    payload.insert("subject".to_string(), json!(request.subject));
    payload.insert("body".to_string(), json!(request.body));
    payload.insert("metadata".to_string(), request.metadata.clone());
    payload.insert("status".to_string(), json!("queued"));

    if let Err(error) = table_service::create_row(pool, "message_logs", &payload).await {
        tracing::warn!(template = request.template, error = %error, "Message log write failed");
    }

    let Some(webhook_url) = state.config.notification_webhook_url.as_ref() else {
        return;
    };
    let result = state
        .http_client
        .post(webhook_url.clone())
        .json(&json!({
            "channel": request.channel,
            "template": request.template,
            "recipient": request.recipient,
            "subject": request.subject,
            "body": request.body,
            "metadata": request.metadata,
        }))
        .send()
        .await;
    if let Err(error) = result {
        tracing::warn!(template = request.template, error = %error, "Notification webhook failed");
    }
}

fn value_str<'a>(row: &'a Value, key: &str) -> Option<&'a str> {
    row.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{activation_message, otp_message};

    #[test]
    fn otp_message_carries_code_and_ttl() {
        let lease = json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "organization_id": "6fa459ea-ee8a-3ca4-894e-db77e160355e",
            "tenant_email": "inquilino@example.com",
        });
        let message = otp_message(&lease, "tenant", "482913", 10);
        assert!(message.body.contains("482913"));
        assert!(message.body.contains("10 minutos"));
        assert_eq!(message.recipient.as_deref(), Some("inquilino@example.com"));
        assert_eq!(message.metadata["role"], "tenant");
    }

    #[test]
    fn activation_message_targets_lease() {
        let lease = json!({"id": "abc", "organization_id": "org"});
        let message = activation_message(&lease);
        assert_eq!(message.template, "lease_activated");
        assert_eq!(message.metadata["lease_id"], "abc");
    }
}
