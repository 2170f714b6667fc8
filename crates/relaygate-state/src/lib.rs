//! Routing snapshot (component A) and key-state store (component B).
//!
//! These two subsystems are grouped in one crate because they share the
//! same domain model (`Group`, `ProxyKey`, `KeyValidity`, `KeyUsage`) and
//! because the dispatcher reads both on every selection — splitting them
//! further would just mean two crates importing each other's types.

pub mod keystate;
pub mod model;
pub mod snapshot;

pub use keystate::{Admission, KeyStateSink, KeyStateStore};
pub use model::{
    Group, HealthAnalysis, HealthCheckResult, HealthCheckStats, HealthCheckType, KeyUsage,
    KeyValidity, ProxyKey, Validity,
};
pub use snapshot::{Snapshot, SnapshotPublisher};
