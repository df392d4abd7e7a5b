/// Rows per atomic batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Largest accepted upload (5 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

/// Progress is persisted once the percentage advanced by this many points
pub const PROGRESS_PERSIST_STEP: u8 = 10;

/// Upper bound on jobs tracked by the progress throttle
pub const MAX_TRACKED_JOBS: usize = 10_000;

/// Spreadsheet formats the reader accepts
pub const SUPPORTED_EXTENSIONS: &[&str] = &["xlsx", "xls", "csv"];
