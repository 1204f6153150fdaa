// =====================================================
// POSTGRESQL / GREENPLUM SESSIONS
// =====================================================

use crate::data_transfer::session::{ConnectionFactory, EngineSession};
use crate::db_types::*;
use futures::StreamExt;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo};
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 10;

// --- Connection ---

pub fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.username);

    if let Some(pwd) = &config.password {
        options = options.password(pwd);
    }

    if let Some(db) = &config.database {
        if !db.is_empty() {
            options = options.database(db);
        }
    }

    if let Some(ssl) = &config.ssl_mode {
        options = match ssl.as_str() {
            "disable" => options.ssl_mode(sqlx::postgres::PgSslMode::Disable),
            "prefer" => options.ssl_mode(sqlx::postgres::PgSslMode::Prefer),
            "require" => options.ssl_mode(sqlx::postgres::PgSslMode::Require),
            _ => options,
        };
    }

    options.log_statements(log::LevelFilter::Debug)
}

pub async fn connect(config: &ConnectionConfig) -> Result<PgConnection, String> {
    let options = connect_options(config);
    let attempt = tokio::time::timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        options.connect(),
    )
    .await
    .map_err(|_| {
        format!(
            "Connection Timed Out\n\nThe server at {}:{} did not respond within {} seconds.",
            config.host, config.port, CONNECT_TIMEOUT_SECS
        )
    })?;

    attempt.map_err(|e| {
        let err_msg = e.to_string();
        if err_msg.contains("connection refused") {
            return format!(
                "Connection Refused\n\nCheck if PostgreSQL is running on {}:{}",
                config.host, config.port
            );
        }
        format!("Connection failed: {}", e)
    })
}

// --- Query Execution ---

/// Runs `query` as a simple (unprepared) statement and collects every result set.
pub async fn execute_query(
    conn: &mut PgConnection,
    query: &str,
) -> Result<Vec<QueryResult>, String> {
    let mut results = Vec::new();
    let mut stream = sqlx::raw_sql(query).fetch_many(&mut *conn);

    let mut current_rows = Vec::new();
    let mut current_columns = Vec::new();

    while let Some(result) = stream.next().await {
        use sqlx::Either;
        match result.map_err(|e| format!("Query failed: {}", e))? {
            Either::Left(_done) => {
                if !current_rows.is_empty() || !current_columns.is_empty() {
                    results.push(QueryResult {
                        columns: std::mem::take(&mut current_columns),
                        rows: std::mem::take(&mut current_rows),
                    });
                }
            }
            Either::Right(row) => {
                if current_columns.is_empty() {
                    current_columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                current_rows.push(row_to_values(&row));
            }
        }
    }

    if !current_rows.is_empty() || !current_columns.is_empty() {
        results.push(QueryResult {
            columns: current_columns,
            rows: current_rows,
        });
    }

    Ok(results)
}

fn row_to_values(row: &PgRow) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let decoded = match column.type_info().name() {
                "INT2" | "INT4" | "INT8" | "OID" => row
                    .try_get_unchecked::<Option<i64>, _>(i)
                    .map(|v| serde_json::json!(v)),
                "FLOAT4" | "FLOAT8" | "NUMERIC" => row
                    .try_get_unchecked::<Option<f64>, _>(i)
                    .map(|v| serde_json::json!(v)),
                "BOOL" => row
                    .try_get_unchecked::<Option<bool>, _>(i)
                    .map(|v| serde_json::json!(v)),
                _ => row
                    .try_get_unchecked::<Option<String>, _>(i)
                    .map(|v| serde_json::json!(v)),
            };
            decoded.unwrap_or(Value::Null)
        })
        .collect()
}

/// Runs DDL/DML and sums `rows_affected` over every statement in `statement`.
pub async fn execute_statement(conn: &mut PgConnection, statement: &str) -> Result<u64, String> {
    let mut affected = 0;
    let mut stream = sqlx::raw_sql(statement).fetch_many(&mut *conn);

    while let Some(result) = stream.next().await {
        use sqlx::Either;
        if let Either::Left(done) = result.map_err(|e| format!("Statement failed: {}", e))? {
            affected += done.rows_affected();
        }
    }

    Ok(affected)
}

// --- Session ---

pub struct PostgresSession {
    conn: PgConnection,
    label: String,
}

impl PostgresSession {
    pub async fn open(config: &ConnectionConfig) -> Result<Self, String> {
        let conn = connect(config).await?;
        Ok(Self {
            conn,
            label: config.endpoint_label(),
        })
    }
}

#[async_trait::async_trait]
impl EngineSession for PostgresSession {
    async fn query(&mut self, sql: &str) -> Result<Vec<QueryResult>, String> {
        execute_query(&mut self.conn, sql)
            .await
            .map_err(|e| format!("{} ({})", e, self.label))
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, String> {
        execute_statement(&mut self.conn, sql)
            .await
            .map_err(|e| format!("{} ({})", e, self.label))
    }

    async fn close(self: Box<Self>) -> Result<(), String> {
        let label = self.label;
        self.conn
            .close()
            .await
            .map_err(|e| format!("Failed to close connection to {}: {}", label, e))
    }
}

/// Opens one dedicated, unpooled connection per call.
#[derive(Debug, Default, Clone)]
pub struct PostgresConnectionFactory;

#[async_trait::async_trait]
impl ConnectionFactory for PostgresConnectionFactory {
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn EngineSession>, String> {
        let session = PostgresSession::open(config).await?;
        log::debug!("Opened session to {}", session.label);
        Ok(Box::new(session))
    }
}
