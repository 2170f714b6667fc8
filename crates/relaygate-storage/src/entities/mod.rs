pub mod groups;
pub mod health_check_results;
pub mod health_check_stats;
pub mod key_usage_stats;
pub mod key_validation;
pub mod proxy_keys;
pub mod request_logs;

pub use groups::Entity as Groups;
pub use health_check_results::Entity as HealthCheckResults;
pub use health_check_stats::Entity as HealthCheckStats;
pub use key_usage_stats::Entity as KeyUsageStats;
pub use key_validation::Entity as KeyValidation;
pub use proxy_keys::Entity as ProxyKeys;
pub use request_logs::Entity as RequestLogs;
