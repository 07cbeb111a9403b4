//! File I/O for input records and merged reports.

mod records;

pub use records::{read_records, write_report, FileFormat};
