//! Shared constants.

/// Environment variable overriding the storage root.
pub const STORAGE_ENV: &str = "SW_STORAGE";

/// Environment variable forbidding remote registry passes.
pub const NO_NETWORK_ENV: &str = "SW_NO_NETWORK";

/// Length of truncated hex hashes used in store paths and object ids.
pub const HASH_PREFIX_LEN: usize = 20;

/// Directory name under the XDG data dir when `SW_STORAGE` is not set.
pub const APP_NAME: &str = "sw";

/// Registry RPC retry schedule: initial delay, growth factor, attempt cap.
pub const RETRY_INITIAL_MS: u64 = 500;
pub const RETRY_FACTOR: u32 = 2;
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Serialized argv length above which a command with a response-file rule
/// gets its arguments moved into an `@file`.
#[cfg(windows)]
pub const RESPONSE_FILE_THRESHOLD: usize = 30 * 1024;
#[cfg(not(windows))]
pub const RESPONSE_FILE_THRESHOLD: usize = 120 * 1024;
