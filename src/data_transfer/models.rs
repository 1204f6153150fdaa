use crate::data_transfer::errors::TransferError;
use crate::db_types::{ConnectionConfig, TableRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransferOptions {
    #[serde(default)]
    pub new_table: bool,
    #[serde(default)]
    pub truncate: bool,
    pub sample_count: Option<u64>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub distribution_key: Vec<String>,
}

impl TransferOptions {
    /// Rows the producer will emit given `source_rows` in the source table.
    pub fn effective_row_count(&self, source_rows: u64) -> u64 {
        match self.sample_count {
            Some(limit) => source_rows.min(limit),
            None => source_rows,
        }
    }
}

/// One table copy between two engine instances. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub source: TableRef,
    pub source_connection: ConnectionConfig,
    pub destination: TableRef,
    pub destination_connection: ConnectionConfig,
    pub options: TransferOptions,
}

impl TransferRequest {
    pub fn validate(&self) -> Result<(), TransferError> {
        let invalid = |message: String| Err(TransferError::InvalidRequest(message));

        for (label, table) in [("source", &self.source), ("destination", &self.destination)] {
            if table.schema.trim().is_empty() {
                return invalid(format!("{} schema name is required", label));
            }
            if table.table.trim().is_empty() {
                return invalid(format!("{} table name is required", label));
            }
        }
        if let Err(e) = self.source_connection.validate() {
            return invalid(format!("source connection: {}", e));
        }
        if let Err(e) = self.destination_connection.validate() {
            return invalid(format!("destination connection: {}", e));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Succeeded {
        rows_transferred: u64,
        destination: TableRef,
        /// The source was empty (or sampled to zero) and no pipe was staged.
        fast_path: bool,
        cleanup_warnings: Vec<String>,
    },
    Failed {
        error: TransferError,
        created_destination: bool,
        cleanup_warnings: Vec<String>,
    },
}

impl TransferOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, TransferOutcome::Succeeded { .. })
    }

    pub fn rows_transferred(&self) -> Option<u64> {
        match self {
            TransferOutcome::Succeeded {
                rows_transferred, ..
            } => Some(*rows_transferred),
            TransferOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&TransferError> {
        match self {
            TransferOutcome::Succeeded { .. } => None,
            TransferOutcome::Failed { error, .. } => Some(error),
        }
    }

    pub fn cleanup_warnings(&self) -> &[String] {
        match self {
            TransferOutcome::Succeeded {
                cleanup_warnings, ..
            }
            | TransferOutcome::Failed {
                cleanup_warnings, ..
            } => cleanup_warnings,
        }
    }
}

// --- Job Files ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableLocator {
    pub instance: String,
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl TableLocator {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.schema.trim(), self.table.trim())
    }
}

/// A transfer as described in a job file, before accounts are resolved.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferJobSpec {
    pub source: TableLocator,
    pub destination: TableLocator,
    #[serde(flatten)]
    pub options: TransferOptions,
}

impl TransferJobSpec {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read job '{}': {}", path, e))?;
        serde_json::from_str(&contents).map_err(|e| format!("Invalid job '{}': {}", path, e))
    }
}

// --- Run Report ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferRunStatus {
    #[default]
    Running,
    Success,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub operation_id: String,
    pub status: TransferRunStatus,
    pub source: TableRef,
    pub destination: TableRef,
    pub rows_transferred: Option<u64>,
    pub fast_path: bool,
    pub created_destination: bool,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferReport {
    pub fn start(request: &TransferRequest) -> Self {
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            status: TransferRunStatus::Running,
            source: request.source.clone(),
            destination: request.destination.clone(),
            rows_transferred: None,
            fast_path: false,
            created_destination: false,
            warnings: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(mut self, outcome: &TransferOutcome) -> Self {
        self.finished_at = Some(Utc::now());
        self.warnings = outcome.cleanup_warnings().to_vec();
        match outcome {
            TransferOutcome::Succeeded {
                rows_transferred,
                fast_path,
                ..
            } => {
                self.status = TransferRunStatus::Success;
                self.rows_transferred = Some(*rows_transferred);
                self.fast_path = *fast_path;
            }
            TransferOutcome::Failed {
                error,
                created_destination,
                ..
            } => {
                self.status = TransferRunStatus::Failed;
                self.created_destination = *created_destination;
                self.error = Some(error.to_string());
            }
        }
        self
    }
}
