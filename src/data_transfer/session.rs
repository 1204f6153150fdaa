use crate::db_types::{ConnectionConfig, QueryResult};
use serde_json::Value;

/// A single, exclusively owned connection to one database engine.
#[async_trait::async_trait]
pub trait EngineSession: Send {
    /// Runs a row-returning statement.
    async fn query(&mut self, sql: &str) -> Result<Vec<QueryResult>, String>;

    /// Runs DDL/DML and returns the number of rows affected.
    async fn execute(&mut self, sql: &str) -> Result<u64, String>;

    async fn close(self: Box<Self>) -> Result<(), String>;
}

#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn EngineSession>, String>;
}

pub async fn query_count(session: &mut dyn EngineSession, sql: &str) -> Result<u64, String> {
    let results = session.query(sql).await?;
    let first = results
        .first()
        .ok_or_else(|| "Count query returned no result set".to_string())?;
    let value = first
        .rows
        .first()
        .and_then(|row| row.first())
        .ok_or_else(|| "Count query returned no rows".to_string())?;
    value_to_u64(value)
}

fn value_to_u64(value: &Value) -> Result<u64, String> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_i64().and_then(|v| u64::try_from(v).ok()))
            .ok_or_else(|| format!("Count value '{}' is not a non-negative integer", number)),
        Value::String(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("Count value '{}' is not an integer: {}", raw, e)),
        other => Err(format!("Unexpected count value: {}", other)),
    }
}
