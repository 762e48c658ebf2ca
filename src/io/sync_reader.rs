//! Synchronous CSV readers for replay input
//!
//! [`SyncReader`] streams replay actions from a transfer CSV one row at a
//! time; [`read_balances`] loads a (small) balance seed file in one go.
//! Parsing and conversion are delegated to the csv_format module.
//!
//! # Error Handling
//!
//! - Fatal errors (file not found, I/O errors) are returned from `new()`
//! - Individual row errors are yielded as Err variants in the iterator
//! - Line numbers are included in error messages for debugging

use std::fs::File;
use std::path::Path;

use csv::{ReaderBuilder, Trim};
use rust_decimal::Decimal;

use crate::io::csv_format::{
    convert_balance_row, convert_transfer_row, BalanceRow, ReplayAction, TransferRow,
};
use crate::types::{AccountId, CurrencyCode};

fn open_csv(path: &Path) -> Result<csv::Reader<File>, String> {
    let file =
        File::open(path).map_err(|e| format!("Failed to open file '{}': {}", path.display(), e))?;

    Ok(ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .buffer_capacity(8 * 1024)
        .from_reader(file))
}

/// Streaming reader over a transfer CSV
///
/// ```no_run
/// use rust_transfer_engine::io::SyncReader;
/// use std::path::Path;
///
/// let reader = SyncReader::new(Path::new("transfers.csv")).unwrap();
/// for result in reader {
///     match result {
///         Ok(action) => println!("{:?}", action),
///         Err(e) => eprintln!("Error: {}", e),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct SyncReader {
    reader: csv::Reader<File>,
    line_num: usize,
}

impl SyncReader {
    /// Open a transfer CSV for streaming iteration
    ///
    /// Fields are trimmed and trailing columns may be omitted (a `confirm`
    /// row only needs `action,sender`).
    pub fn new(path: &Path) -> Result<Self, String> {
        Ok(Self {
            reader: open_csv(path)?,
            line_num: 0,
        })
    }
}

impl Iterator for SyncReader {
    type Item = Result<ReplayAction, String>;

    /// Next replay action, errors tagged with the 1-based file line
    /// (the header is line 1)
    fn next(&mut self) -> Option<Self::Item> {
        let mut deserializer = self.reader.deserialize::<TransferRow>();
        let row = deserializer.next()?;
        self.line_num += 1;
        let line = self.line_num + 1;

        Some(match row {
            Ok(row) => convert_transfer_row(row).map_err(|e| format!("Line {}: {}", line, e)),
            Err(e) => Err(format!("Line {}: CSV parse error: {}", line, e)),
        })
    }
}

/// Load a balance seed file (`account,currency,balance`)
///
/// Unlike the transfer stream, a bad seed row is fatal: replaying against
/// a partially seeded ledger would give meaningless results.
pub fn read_balances(path: &Path) -> Result<Vec<(AccountId, CurrencyCode, Decimal)>, String> {
    let mut reader = open_csv(path)?;
    reader
        .deserialize::<BalanceRow>()
        .enumerate()
        .map(|(index, row)| {
            let line = index + 2;
            row.map_err(|e| format!("Line {}: CSV parse error: {}", line, e))
                .and_then(|row| convert_balance_row(row).map_err(|e| format!("Line {}: {}", line, e)))
        })
        .collect()
}
