//! Default values for engine configuration.

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_PUSH_CONCURRENCY: usize = 4;
pub const DEFAULT_SETTLE_WINDOW_MS: u64 = 2_000;
