//! File naming shared by the scatter writer and the reader.

use std::path::{Path, PathBuf};

/// Local metadata SSTable: `<db_path>/<dbname>/<number>.ldb`.
pub fn table_file_name(db_path: &Path, dbname: &str, number: u64) -> PathBuf {
    db_path.join(dbname).join(format!("{number:06}.ldb"))
}

/// The name a table's blocks are registered under inside StoC segments.
pub fn sstable_name(dbname: &str, number: u64) -> String {
    format!("{dbname}/{number:06}")
}
