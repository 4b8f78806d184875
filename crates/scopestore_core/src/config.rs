//! Context and connection configuration.
//!
//! # Responsibility
//! - Carry the connection descriptor through to the storage driver.
//! - Hold commit retry policy and session strategy switches.
//!
//! # Invariants
//! - Retries only ever apply to failures classified as transient.
//! - Connection descriptors are opaque; nothing here parses them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Path of the SQLite in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Opaque connection descriptor handed to the storage driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    path: String,
}

impl ConnectionInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY_PATH)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY_PATH
    }
}

/// Fixed-delay retry policy for transient commit failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    /// Single attempt, failures surface immediately.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

/// Options applied to one persistence context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    pub retry: RetryPolicy,
}

/// Options for the single-use session strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleUseOptions {
    /// Detach everything tracked before the first write scope opens.
    pub detach_on_first_write: bool,
}

impl Default for SingleUseOptions {
    fn default() -> Self {
        Self {
            detach_on_first_write: true,
        }
    }
}
