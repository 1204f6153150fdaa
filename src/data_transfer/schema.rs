use crate::data_transfer::errors::TransferError;
use crate::db_types::{ColumnDefinition, QueryResult, TableRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How many distribution columns the destination engine accepts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKeyArity {
    #[default]
    Multiple,
    Single,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Vec<String>,
    pub distribution_key: Vec<String>,
}

impl TableDefinition {
    pub fn new(
        columns: Vec<ColumnDefinition>,
        primary_key: &[String],
        distribution_key: &[String],
    ) -> Self {
        Self {
            columns,
            primary_key: normalize_key_columns(primary_key),
            distribution_key: normalize_key_columns(distribution_key),
        }
    }

    /// Column list plus an optional primary key, ready for `CREATE TABLE t (...)`.
    pub fn table_clause(&self) -> String {
        let mut clause = column_clause(&self.columns);
        if !self.primary_key.is_empty() {
            clause.push_str(", PRIMARY KEY(");
            clause.push_str(&quoted_list(&self.primary_key));
            clause.push(')');
        }
        clause
    }

    pub fn distribution_clause(&self, arity: DistributionKeyArity) -> Option<String> {
        let keys: &[String] = match arity {
            DistributionKeyArity::Multiple => &self.distribution_key,
            DistributionKeyArity::Single => self
                .distribution_key
                .get(..1)
                .unwrap_or(&[]),
        };
        if keys.is_empty() {
            return None;
        }
        Some(format!("DISTRIBUTED BY ({})", quoted_list(keys)))
    }
}

pub fn normalize_key_columns(columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn qualified_table_name(table: &TableRef) -> String {
    format!(
        "{}.{}",
        quote_identifier(&table.schema),
        quote_identifier(&table.table)
    )
}

/// `"name" type, "name" type, ...` in source column order.
pub fn column_clause(columns: &[ColumnDefinition]) -> String {
    columns
        .iter()
        .map(|column| format!("{} {}", quote_identifier(&column.name), column.data_type))
        .collect::<Vec<String>>()
        .join(", ")
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| quote_identifier(column))
        .collect::<Vec<String>>()
        .join(", ")
}

// --- Catalog Queries ---

pub fn row_count_query(table: &TableRef) -> String {
    format!("SELECT count(*) AS cnt FROM {}", qualified_table_name(table))
}

pub fn column_metadata_query(table: &TableRef) -> String {
    format!(
        "SELECT a.attname::text AS column_name, \
         pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type \
         FROM pg_catalog.pg_attribute a \
         JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
         JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
         WHERE n.nspname = {} AND c.relname = {} \
         AND a.attnum > 0 AND NOT a.attisdropped \
         ORDER BY a.attnum",
        quote_literal(&table.schema),
        quote_literal(&table.table)
    )
}

pub fn table_exists_query(table: &TableRef) -> String {
    format!(
        "SELECT count(*) AS cnt FROM pg_catalog.pg_tables WHERE schemaname = {} AND tablename = {}",
        quote_literal(&table.schema),
        quote_literal(&table.table)
    )
}

// --- DDL / DML ---

pub fn create_table_statement(
    table: &TableRef,
    definition: &TableDefinition,
    arity: DistributionKeyArity,
) -> String {
    let mut statement = format!(
        "CREATE TABLE {} ({})",
        qualified_table_name(table),
        definition.table_clause()
    );
    if let Some(distribution) = definition.distribution_clause(arity) {
        statement.push(' ');
        statement.push_str(&distribution);
    }
    statement
}

pub fn truncate_table_statement(table: &TableRef) -> String {
    format!("TRUNCATE TABLE {}", qualified_table_name(table))
}

pub fn drop_table_statement(table: &TableRef) -> String {
    format!("DROP TABLE IF EXISTS {}", qualified_table_name(table))
}

/// Turns the rows of [`column_metadata_query`] into ordered column definitions.
pub fn column_definitions_from_results(
    table: &TableRef,
    results: &[QueryResult],
) -> Result<Vec<ColumnDefinition>, TransferError> {
    let introspection_error = |reason: String| TransferError::SchemaIntrospection {
        table: table.to_string(),
        reason,
    };

    let Some(result) = results.first() else {
        return Err(introspection_error("catalog returned no result set".to_string()));
    };
    let name_index = result
        .column_index("column_name")
        .ok_or_else(|| introspection_error("missing column_name in catalog result".to_string()))?;
    let type_index = result
        .column_index("data_type")
        .ok_or_else(|| introspection_error("missing data_type in catalog result".to_string()))?;

    let mut columns = Vec::with_capacity(result.rows.len());
    for (position, row) in result.rows.iter().enumerate() {
        let name = row.get(name_index).and_then(non_empty_text);
        let data_type = row.get(type_index).and_then(non_empty_text);
        match (name, data_type) {
            (Some(name), Some(data_type)) => columns.push(ColumnDefinition::new(name, data_type)),
            _ => {
                return Err(introspection_error(format!(
                    "column {} has an empty name or data type",
                    position + 1
                )))
            }
        }
    }

    if columns.is_empty() {
        return Err(introspection_error("table has no columns or does not exist".to_string()));
    }
    Ok(columns)
}

fn non_empty_text(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
