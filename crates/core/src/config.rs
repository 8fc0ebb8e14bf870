use serde::Deserialize;

/// Root application configuration. Loaded from environment variables with
/// the prefix `VOYAGE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Process role: "worker", "scheduler" or "all".
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_workers_per_node")]
    pub workers_per_node: usize,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_queue_group")]
    pub queue_group: String,
    #[serde(default = "default_nats_max_reconnects")]
    pub max_reconnects: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// One URL per independent lock endpoint; quorum is a strict majority.
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Lease duration; must exceed expected step time with margin.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    /// How often a long-running effect renews its lease.
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
    #[serde(default = "default_effect_timeout_ms")]
    pub effect_timeout_ms: u64,
    /// Cap on the advancement-request attempt counter.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_busy_requeue_ms")]
    pub busy_requeue_ms: u64,
    #[serde(default = "default_pause_requeue_ms")]
    pub pause_requeue_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Idle wait between broker polls that return nothing.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_scan_batch_size")]
    pub batch_size: usize,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_role() -> String {
    "all".to_string()
}
fn default_workers_per_node() -> usize {
    8
}
fn default_nats_urls() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}
fn default_subject_prefix() -> String {
    "voyage".to_string()
}
fn default_queue_group() -> String {
    "journey-workers".to_string()
}
fn default_nats_max_reconnects() -> usize {
    60
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_lease_ms() -> u64 {
    30_000
}
fn default_renew_interval_ms() -> u64 {
    10_000
}
fn default_effect_timeout_ms() -> u64 {
    20_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_busy_requeue_ms() -> u64 {
    500
}
fn default_pause_requeue_ms() -> u64 {
    30_000
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    60_000
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_scan_interval_ms() -> u64 {
    5_000
}
fn default_scan_batch_size() -> usize {
    500
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: default_nats_urls(),
            subject_prefix: default_subject_prefix(),
            queue_group: default_queue_group(),
            max_reconnects: default_nats_max_reconnects(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ms: default_lease_ms(),
            renew_interval_ms: default_renew_interval_ms(),
            effect_timeout_ms: default_effect_timeout_ms(),
            max_attempts: default_max_attempts(),
            busy_requeue_ms: default_busy_requeue_ms(),
            pause_requeue_ms: default_pause_requeue_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            batch_size: default_scan_batch_size(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            role: default_role(),
            workers_per_node: default_workers_per_node(),
            nats: NatsConfig::default(),
            redis: RedisConfig::default(),
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("VOYAGE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
