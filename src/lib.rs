pub mod config;
pub mod data_transfer;
pub mod db_types;
pub mod postgres;

pub use config::{CliArgs, TransferConfig};
pub use data_transfer::{
    PipeTransfer, TransferError, TransferOptions, TransferOutcome, TransferReport,
    TransferRequest,
};
