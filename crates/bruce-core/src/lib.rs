//! Core domain types for Bruce: phase-file task storage, work-session tracking and
//! hand-off context.

pub mod checksum;
pub mod clock;
pub mod config;
pub mod context;
pub mod decisions;
pub mod git;
pub mod handoff;
pub mod history;
pub mod relevance;
pub mod resources;
pub mod session;
pub mod store;
pub mod task;
pub mod tracker;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Serializes tests that touch process environment variables.
    pub fn lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
