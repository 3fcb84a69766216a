#![allow(dead_code)]

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{Executor, Postgres, QueryBuilder, Row};

use crate::error::AppError;

/// Tables the settlement core is allowed to touch. Everything else on
/// the platform belongs to other services.
const ALLOWED_TABLES: &[&str] = &[
    "app_users",
    "audit_logs",
    "billing_policies",
    "billing_statements",
    "lease_signatures",
    "leases",
    "message_logs",
    "organization_members",
    "organizations",
    "payments",
    "post_dated_checks",
    "properties",
    "units",
];

/// Every function takes any executor, so the same call works against the
/// pool or inside a transaction (`&mut *tx`).
pub async fn list_rows<'e, E>(
    executor: E,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    query.push(" ORDER BY t.").push(order_name);
    query.push(if ascending { " ASC" } else { " DESC" });
    query
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query
        .build()
        .fetch_all(executor)
        .await
        .map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn get_row<'e, E>(
    executor: E,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    fetch_row(executor, table, row_id, id_field, false).await
}

/// Like `get_row` but takes a `FOR UPDATE` row lock. Must run inside a
/// transaction; this is how all mutations for a lease serialize.
pub async fn get_row_for_update<'e, E>(
    executor: E,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    fetch_row(executor, table, row_id, id_field, true).await
}

async fn fetch_row<'e, E>(
    executor: E,
    table: &str,
    row_id: &str,
    id_field: &str,
    lock: bool,
) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    // row_to_json over a locked row needs the subquery form; FOR UPDATE
    // is not valid next to a set-returning select of the json itself.
    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM (SELECT * FROM ");
    query.push(table_name).push(" WHERE ");
    push_scalar_filter(
        &mut query,
        id_name,
        FilterOperator::Eq,
        &infer_scalar_filter(id_name, &Value::String(row_id.to_string())),
        false,
    );
    query.push(" LIMIT 1");
    if lock {
        query.push(" FOR UPDATE");
    }
    query.push(") t");

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn create_row<'e, E>(
    executor: E,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    if payload.is_empty() {
        return Err(AppError::Validation(format!(
            "Could not create {table_name} record."
        )));
    }

    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }

    // jsonb_populate_record lets PostgreSQL resolve column types (uuid,
    // enum, boolean, numeric) from the table definition.
    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(validate_identifier(key)?);
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push("r.");
            separated.push_unseparated(validate_identifier(key)?);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

pub async fn update_row<'e, E>(
    executor: E,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    if payload.is_empty() {
        return Err(AppError::Validation("No fields to update.".to_string()));
    }

    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            let col = validate_identifier(key)?;
            separated.push(col);
            separated.push_unseparated(" = r.");
            separated.push_unseparated(col);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_scalar_filter(
        &mut query,
        id_name,
        FilterOperator::Eq,
        &infer_scalar_filter(id_name, &Value::String(row_id.to_string())),
        true,
    );
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn count_rows<'e, E>(
    executor: E,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    let row = query
        .build()
        .fetch_one(executor)
        .await
        .map_err(map_db_error)?;

    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    if !trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    }) {
        return Err(AppError::Validation(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    if trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit())
    {
        return Err(AppError::Validation(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone)]
enum ScalarFilter {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
}

fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    let mut column = filter_key;
    let mut operator = FilterOperator::Eq;

    if let Some((candidate_column, suffix)) = filter_key.rsplit_once("__") {
        operator = match suffix {
            "gt" => FilterOperator::Gt,
            "gte" => FilterOperator::Gte,
            "lt" => FilterOperator::Lt,
            "lte" => FilterOperator::Lte,
            "is_null" => FilterOperator::IsNull,
            "in" => FilterOperator::Eq,
            _ => FilterOperator::Eq,
        };
        if !matches!(operator, FilterOperator::Eq) || suffix == "in" {
            column = candidate_column;
        }
    }

    Ok((validate_identifier(column)?, operator))
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    if matches!(operator, FilterOperator::IsNull) {
        let should_be_null = matches!(value, Value::Null | Value::Bool(true));
        query.push(" AND t.").push(column);
        query.push(if should_be_null {
            " IS NULL"
        } else {
            " IS NOT NULL"
        });
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if !matches!(operator, FilterOperator::Eq) {
                return Err(AppError::Validation(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            if items.is_empty() {
                return Ok(());
            }
            if is_uuid_identifier(column) {
                let mut parsed = Vec::with_capacity(items.len());
                for item in items {
                    let Some(as_uuid) = item
                        .as_str()
                        .and_then(|text| uuid::Uuid::parse_str(text.trim()).ok())
                    else {
                        return Err(AppError::Validation(format!(
                            "Filter '{filter_key}' expects uuid values."
                        )));
                    };
                    parsed.push(as_uuid);
                }
                query
                    .push(" AND t.")
                    .push(column)
                    .push(" = ANY(")
                    .push_bind(parsed)
                    .push(")");
            } else {
                let texts = items
                    .iter()
                    .map(render_scalar)
                    .collect::<Vec<String>>();
                query
                    .push(" AND t.")
                    .push(column)
                    .push("::text = ANY(")
                    .push_bind(texts)
                    .push(")");
            }
            Ok(())
        }
        _ => {
            query.push(" AND ");
            let filter = infer_scalar_filter(column, value);
            push_scalar_filter(query, column, operator, &filter, true);
            Ok(())
        }
    }
}

fn push_scalar_filter(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    operator: FilterOperator,
    value: &ScalarFilter,
    qualify: bool,
) {
    if qualify {
        query.push("t.");
    }
    query.push(column);
    let sql_operator = match operator {
        FilterOperator::Eq => " = ",
        FilterOperator::Gt => " > ",
        FilterOperator::Gte => " >= ",
        FilterOperator::Lt => " < ",
        FilterOperator::Lte => " <= ",
        FilterOperator::IsNull => return,
    };
    match value {
        ScalarFilter::Text(text) => {
            query.push("::text").push(sql_operator).push_bind(text.clone());
        }
        ScalarFilter::Uuid(id) => {
            query.push(sql_operator).push_bind(*id);
        }
        ScalarFilter::Bool(flag) => {
            query.push(sql_operator).push_bind(*flag);
        }
        ScalarFilter::I64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::F64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::Date(date) => {
            query.push(sql_operator).push_bind(*date);
        }
        ScalarFilter::Timestamp(stamp) => {
            query.push(sql_operator).push_bind(stamp.to_owned());
        }
    }
}

fn infer_scalar_filter(filter_key: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::Number(number) => {
            if let Some(as_i64) = number.as_i64() {
                return ScalarFilter::I64(as_i64);
            }
            if let Some(as_f64) = number.as_f64() {
                return ScalarFilter::F64(as_f64);
            }
            ScalarFilter::Text(number.to_string())
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(filter_key) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return ScalarFilter::Uuid(parsed);
                }
            }
            if is_timestamp_identifier(filter_key) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return ScalarFilter::Timestamp(parsed);
                }
            }
            if is_date_identifier(filter_key) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        _ => ScalarFilter::Text(render_scalar(value)),
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn is_uuid_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized == "id" || normalized.ends_with("_id")
}

fn is_date_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized.ends_with("_date")
        || normalized.ends_with("_on")
        || matches!(normalized, "period_start" | "period_end")
}

fn is_timestamp_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_at")
}

fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::StateConflict(
            "Duplicate value violates a unique constraint.".to_string(),
        );
    }
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{parse_filter_key, validate_identifier, validate_table, FilterOperator};

    #[test]
    fn table_allow_list_holds() {
        assert!(validate_table("billing_statements").is_ok());
        assert!(validate_table("post_dated_checks").is_ok());
        assert!(validate_table("reservations").is_err());
        assert!(validate_table("billing_statements; DROP TABLE leases").is_err());
    }

    #[test]
    fn identifiers_are_strict() {
        assert!(validate_identifier("due_date").is_ok());
        assert!(validate_identifier("1bad").is_err());
        assert!(validate_identifier("Bad").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn filter_keys_carry_operators() {
        assert_eq!(
            parse_filter_key("due_date__gte").unwrap(),
            ("due_date", FilterOperator::Gte)
        );
        assert_eq!(
            parse_filter_key("status").unwrap(),
            ("status", FilterOperator::Eq)
        );
        assert_eq!(
            parse_filter_key("billing_statement_id__is_null").unwrap(),
            ("billing_statement_id", FilterOperator::IsNull)
        );
    }

    #[test]
    fn insert_sql_uses_jsonb_populate_record() {
        let mut payload = Map::new();
        payload.insert("amount".to_string(), Value::from(5000));
        payload.insert(
            "lease_id".to_string(),
            Value::String("550e8400-e29b-41d4-a716-446655440000".to_string()),
        );
        payload.insert("status".to_string(), Value::String("received".to_string()));

        let mut keys = payload.keys().cloned().collect::<Vec<_>>();
        keys.sort_unstable();

        let mut query = QueryBuilder::<Postgres>::new("INSERT INTO post_dated_checks (");
        {
            let mut separated = query.separated(", ");
            for key in &keys {
                separated.push(key.as_str());
            }
        }
        query.push(") SELECT ");
        {
            let mut separated = query.separated(", ");
            for key in &keys {
                separated.push("r.");
                separated.push_unseparated(key.as_str());
            }
        }
        query.push(" FROM jsonb_populate_record(NULL::post_dated_checks, ");
        query.push_bind(Value::Object(payload));
        query.push(") r");

        let sql = query.sql();
        assert!(
            sql.contains("jsonb_populate_record(NULL::post_dated_checks"),
            "Expected jsonb_populate_record in SQL but got: {sql}"
        );
        assert!(
            sql.contains("SELECT r.amount, r.lease_id, r.status"),
            "Expected r.col references in SQL but got: {sql}"
        );
    }
}
