use serde_json::{json, Value};

use crate::repository::table_service;
use crate::state::AppState;

/// Best-effort audit trail. A failed audit write is logged and swallowed;
/// it never rolls back the state transition it describes.
pub async fn write_audit_log(
    state: &AppState,
    actor_user_id: Option<&str>,
    organization_id: Option<&str>,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    before: Option<Value>,
    after: Option<Value>,
) {
    let Some(pool) = state.db_pool.as_ref() else {
        return;
    };

    let mut payload = serde_json::Map::new();
    payload.insert("action".to_string(), json!(action));
    payload.insert("entity_type".to_string(), json!(entity_type));
    payload.insert("entity_id".to_string(), json!(entity_id));
    if let Some(actor) = actor_user_id {
        payload.insert("actor_user_id".to_string(), json!(actor));
    }
    if let Some(org) = organization_id {
        payload.insert("organization_id".to_string(), json!(org));
    }
    if let Some(snapshot) = before {
        payload.insert("before_snapshot".to_string(), snapshot);
    }
    if let Some(snapshot) = after {
        payload.insert("after_snapshot".to_string(), snapshot);
    }

    if let Err(error) = table_service::create_row(pool, "audit_logs", &payload).await {
        tracing::warn!(%action, %entity_type, %entity_id, error = %error, "Audit log write failed");
    }
}
