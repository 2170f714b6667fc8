//! sea-orm persistence for every table relaygate owns: routing
//! configuration (`groups`, `proxy_keys`), key-state durability
//! (`key_validation`, `key_usage_stats`), the request log
//! (`request_logs`), and health-scanner output (`health_check_results`,
//! `health_check_stats`).
//!
//! Schema is synced at boot (`Storage::sync`), not migrated; persistent
//! config CRUD beyond the dispatcher's read path is out of scope, so
//! `seed_if_empty` plus the snapshot poller stand in for it.

pub mod db;
pub mod entities;
pub mod routing;
pub mod sinks;
pub mod storage;

pub use routing::{hydrate_key_state, load_and_publish, spawn_snapshot_poller};
pub use storage::{Storage, StorageError, StorageResult};
