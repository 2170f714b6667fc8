//! The health scanner (component D): periodic background probing of
//! provider reachability, per-key validity, and per-model availability,
//! independent of any live dispatch traffic.

pub mod probe;
pub mod scanner;
pub mod store;

pub use probe::ProbeOutcome;
pub use scanner::{HealthScanner, HealthScannerConfig, HealthSink, ManualTrigger};
pub use store::HealthStore;
