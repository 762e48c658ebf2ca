//! I/O module
//!
//! Handles replay CSV parsing and output.
//!
//! # Components
//!
//! - `csv_format` - CSV format handling (row conversion, output serialization)
//! - `sync_reader` - Streaming transfer reader and balance seed loader

pub mod csv_format;
pub mod sync_reader;

pub use csv_format::{
    convert_balance_row, convert_transfer_row, write_balances_csv, write_history_csv, BalanceRow,
    ReplayAction, TransferRow,
};
pub use sync_reader::{read_balances, SyncReader};
