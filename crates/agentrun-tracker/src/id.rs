//! Execution identity generation
//!
//! IDs come from an injected source so tests and embedders can control the
//! format. The only hard contract is global uniqueness for the process
//! lifetime and the stable `exec-` prefix used in logs and debugging.

use uuid::Uuid;

/// Stable, parseable prefix carried by every execution id
pub const EXECUTION_ID_PREFIX: &str = "exec-";

/// Injected source of unique execution ids
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Default generator: `exec-<uuid-v4>`
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        format!("{}{}", EXECUTION_ID_PREFIX, Uuid::new_v4())
    }
}
