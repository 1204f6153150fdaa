// =====================================================
// PIPE TRANSFER ENGINE
// Bulk table copies between engine instances through gpfdist
// =====================================================

pub mod connection_resolver;
pub mod engine;
pub mod errors;
pub mod external_table;
pub mod guard;
pub mod models;
pub mod pipe;
pub mod schema;
pub mod session;

#[cfg(test)]
mod testing;

pub use engine::{PipeTransfer, TransferState};
pub use errors::{TransferError, TransferResult};
pub use models::{TransferOptions, TransferOutcome, TransferReport, TransferRequest};
