// src/config.rs

/// Construction-time configuration for a `LedgerSystem`. Every field has an
/// explicit default here rather than being read from process-wide mutable
/// state — compile-time fallbacks for governance parameters live in
/// `governance::FallbackTable`, not in this struct.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// `sqlite:path/to/file.db` or `sqlite::memory:`.
    pub database_url: String,
    pub max_connections: u32,
    /// Delays between BUSY-retry attempts on a locked store.
    pub busy_retry_schedule_ms: Vec<u64>,
    pub busy_timeout_ms: u64,
    pub default_reservation_ttl_seconds: i64,
    pub idempotency_key_ttl_hours: i64,
    pub sweeper_batch_size: u32,
    pub sweeper_interval_seconds: u64,
    pub governance_activator_interval_seconds: u64,
    pub discount_expiry_interval_seconds: u64,
    pub settlement_batch_size: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_retry_schedule_ms: vec![10, 50, 200],
            busy_timeout_ms: 5_000,
            default_reservation_ttl_seconds: 300,
            idempotency_key_ttl_hours: 24,
            sweeper_batch_size: 100,
            sweeper_interval_seconds: 2,
            governance_activator_interval_seconds: 3_600,
            discount_expiry_interval_seconds: 3_600,
            settlement_batch_size: 50,
        }
    }
}

impl LedgerConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            database_url: format!("sqlite:{}", path.into()),
            max_connections: 5,
            ..Self::default()
        }
    }
}
