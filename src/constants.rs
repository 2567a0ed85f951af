//! Default tunables and well-known names.
//!
//! Every value here has a matching field on
//! [`RuntimeConfig`](crate::config::RuntimeConfig); these are only the
//! fallbacks used when a field is not configured.

/// Name of the node that hosts the owner process.
///
/// Inlined payloads live here and are never lost to worker node failure.
pub const OWNER_NODE: &str = "owner";

/// Worker node registered when the configuration names none.
pub const DEFAULT_WORKER_NODE: &str = "worker-1";

/// Default number of re-executions (retries plus reconstructions) per task.
pub const DEFAULT_MAX_TASK_RETRIES: u32 = 3;

/// Default delay before a retry or reconstruction is submitted.
pub const DEFAULT_TASK_RETRY_DELAY_MS: u64 = 0;

/// Default upper bound on concurrently running task attempts.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 64;

/// Payloads at or below this size (serialized bytes) are stored at the owner.
pub const DEFAULT_MAX_INLINE_BYTES: usize = 100 * 1024;

/// Prefix for environment variable overrides (`REFGEN_MAX_TASK_RETRIES`, ...).
pub const ENV_PREFIX: &str = "REFGEN_";

/// Default configuration file consulted by [`RuntimeConfig::load`](crate::config::RuntimeConfig::load).
pub const DEFAULT_CONFIG_FILE: &str = ".refgen.toml";
