/// Keel engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum number of queue entries drained in a single batch.
pub const MAX_BATCH_SIZE: usize = 500;

/// Maximum number of push attempts a config may request.
pub const MAX_CONFIGURABLE_ATTEMPTS: u32 = 20;

/// Upper bound on concurrent per-resource push transmissions.
pub const MAX_PUSH_CONCURRENCY: usize = 16;

/// Upper bound on configured retry backoff delays (one hour).
pub const MAX_CONFIGURABLE_BACKOFF_MS: u64 = 3_600_000;
