use crate::storage::RetryPolicy;

/// Server-level configuration for the provisioning pipeline.
///
/// Controls the broker queue, submission timeouts and concurrency, coordinator
/// supervision and redelivery limits, cache sizes, and the store retry policy.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique identifier for this server node.
    pub node_id: String,
    /// Broker queue carrying provisioning envelopes.
    pub queue_name: String,
    /// How long a caller waits for its completion signal, in milliseconds.
    pub submit_timeout_ms: u64,
    /// Maximum number of in-flight submissions before load shedding.
    pub max_concurrent_submissions: u32,
    /// Delay before the first coordinator restart, in milliseconds.
    pub restart_backoff_ms: u64,
    /// Upper bound of the restart delay, in milliseconds.
    pub max_restart_backoff_ms: u64,
    /// Request ids whose outcome is remembered for redelivery dedup.
    pub outcome_cache_capacity: usize,
    /// Users kept in the read cache.
    pub user_cache_capacity: usize,
    /// Deliveries of one request before the coordinator dead-letters it.
    pub max_delivery_attempts: u32,
    /// Transaction retry policy the stores are opened with.
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            queue_name: "provisioning".to_string(),
            submit_timeout_ms: 10_000,
            max_concurrent_submissions: 1000,
            restart_backoff_ms: 100,
            max_restart_backoff_ms: 5_000,
            outcome_cache_capacity: 10_000,
            user_cache_capacity: 10_000,
            max_delivery_attempts: 5,
            retry: RetryPolicy::default(),
        }
    }
}
