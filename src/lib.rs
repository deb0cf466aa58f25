//! tallyflow: counts upstream event records into aligned 1/5/15/60-minute
//! buckets, persists the counts idempotently and verifies them on demand.
//!
//! ```text
//! time_window → record_source → buckets → verifier | updater → store
//! ```

pub mod backoff;
pub mod buckets;
pub mod config;
pub mod record_source;
pub mod record_types;
pub mod sqlite_pragma;
pub mod store;
pub mod time_window;
pub mod updater;
pub mod upsert_pool;
pub mod verifier;
