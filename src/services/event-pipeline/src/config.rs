//! # Configuration Module
//!
//! Configuration tree for the event pipeline service. Every tunable named by
//! the pipeline components lives here with its default; values are layered
//! from config files and `EVENT_PIPELINE`-prefixed environment variables.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Main configuration structure for the event pipeline service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Queue manager configuration
    pub queue: QueueConfig,

    /// Router configuration
    pub router: RouterConfig,

    /// Prioritizer configuration
    pub prioritizer: PrioritizerConfig,

    /// Dispatcher configuration
    pub dispatch: DispatchConfig,

    /// Performance monitor configuration
    pub monitor: MonitorConfig,

    /// Capacity manager configuration
    pub capacity: CapacityConfig,

    /// Source adapter configuration
    pub adapters: AdaptersConfig,

    /// Logging and environment settings
    pub environment: EnvironmentConfig,
}

impl Config {
    /// Load configuration from the default files and environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load configuration, optionally from an explicit config file
    ///
    /// With a path the named file is required and replaces the default file
    /// pair; environment variables still layer on top either way.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        builder = match config_path {
            Some(path) => builder.add_source(config::File::with_name(path).required(true)),
            None => builder
                .add_source(config::File::with_name("config/event-pipeline").required(false))
                .add_source(
                    config::File::with_name("config/event-pipeline.local").required(false),
                ),
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix("EVENT_PIPELINE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::InvalidValue(
                "queue.max_queue_size must be positive".to_string(),
            ));
        }
        if self.queue.partition_count == 0 {
            return Err(ConfigError::InvalidValue(
                "queue.partition_count must be positive".to_string(),
            ));
        }
        if self.queue.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "queue.max_batch_size must be positive".to_string(),
            ));
        }
        for (kind, threshold) in self
            .router
            .update_thresholds
            .iter()
            .chain(self.router.notification_thresholds.iter())
        {
            if !(0.0..=1.0).contains(threshold) {
                return Err(ConfigError::InvalidValue(format!(
                    "router threshold for {kind} must be in [0, 1], got {threshold}"
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.capacity.load_shedding_threshold) {
            return Err(ConfigError::InvalidValue(
                "capacity.load_shedding_threshold must be a percentage".to_string(),
            ));
        }
        for rule in &self.capacity.scaling_rules {
            if rule.min_capacity > rule.max_capacity {
                return Err(ConfigError::InvalidValue(format!(
                    "scaling rule {} has min_capacity > max_capacity",
                    rule.name
                )));
            }
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
    pub graceful_shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_seconds: 30,
            graceful_shutdown_timeout_seconds: 30,
        }
    }
}

/// Queue manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bounded capacity per topic; full-queue enqueues fail fast
    pub max_queue_size: usize,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub enable_batching: bool,
    pub enable_deduplication: bool,
    pub enable_conflation: bool,
    pub max_batch_size: usize,
    /// Drain workers per topic; events hash to a partition by entity
    pub partition_count: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_retry_attempts: 3,
            retry_base_delay_ms: 1_000,
            enable_batching: true,
            enable_deduplication: true,
            enable_conflation: true,
            max_batch_size: 25,
            partition_count: num_cpus::get().clamp(2, 8),
        }
    }
}

/// Gate mode used by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Uniform draw against the adjusted thresholds
    Probabilistic,
    /// Deterministic token bucket per `(entityType, eventKind)`
    TokenBucket,
}

/// Router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Per-kind probability that an admitted event triggers an update
    pub update_thresholds: HashMap<String, f64>,

    /// Per-kind probability that an update also triggers a notification
    pub notification_thresholds: HashMap<String, f64>,

    pub default_update_threshold: f64,
    pub default_notification_threshold: f64,

    /// Content-aware threshold reductions
    pub enable_smart_routing: bool,

    /// Minimum interval between admitted updates, per entity type (ms)
    pub cooldown_periods_ms: HashMap<String, u64>,

    pub mode: RoutingMode,

    /// Seed for the probabilistic gate; random when absent
    pub seed: Option<u64>,

    /// Sustained admission rate per key in token-bucket mode (events/minute)
    pub token_bucket_per_minute: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut update_thresholds = HashMap::new();
        let mut notification_thresholds = HashMap::new();
        for (kind, update, notify) in [
            ("nft_transfer", 0.80, 0.30),
            ("nft_sale", 0.90, 0.60),
            ("nft_mint", 0.80, 0.40),
            ("contract_update", 0.90, 0.50),
            ("creator_activity", 0.70, 0.30),
            ("collection_price_update", 0.80, 0.40),
            ("fraud_image_analysis", 0.90, 0.70),
            ("fraud_similarity_score", 0.80, 0.50),
            ("fraud_wash_trading", 0.95, 0.80),
            ("fraud_metadata_validation", 0.80, 0.50),
            ("social_mention_frequency", 0.60, 0.30),
            ("social_sentiment_shift", 0.70, 0.40),
            ("social_follower_change", 0.60, 0.30),
            ("social_creator_announcement", 0.60, 0.30),
            ("social_community_growth", 0.60, 0.30),
            ("market_floor_price_change", 0.85, 0.60),
            ("market_volume_anomaly", 0.80, 0.50),
            ("market_trend_shift", 0.70, 0.40),
            ("market_similar_nft_sale", 0.60, 0.30),
            ("market_creator_portfolio_change", 0.60, 0.30),
        ] {
            update_thresholds.insert(kind.to_string(), update);
            notification_thresholds.insert(kind.to_string(), notify);
        }

        let cooldown_periods_ms = HashMap::from([
            ("nft".to_string(), 60_000),
            ("collection".to_string(), 300_000),
            ("creator".to_string(), 600_000),
            ("market".to_string(), 900_000),
        ]);

        Self {
            update_thresholds,
            notification_thresholds,
            default_update_threshold: 0.75,
            default_notification_threshold: 0.40,
            enable_smart_routing: true,
            cooldown_periods_ms,
            mode: RoutingMode::Probabilistic,
            seed: None,
            token_bucket_per_minute: 30,
        }
    }
}

/// Prioritizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritizerConfig {
    pub base_priorities: HashMap<String, u8>,
    pub default_base_priority: u8,
    pub entity_type_modifiers: HashMap<String, i8>,
    pub source_modifiers: HashMap<String, i8>,
    /// Content-aware boosts on top of the static tables
    pub enable_dynamic_priority: bool,
    /// Sale price above which an `nft_sale` gains a boost
    pub significant_price_change_threshold: f64,
    /// Fraud confidence at which fraud kinds gain a boost
    pub significant_fraud_confidence_threshold: f64,
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        let base_priorities = HashMap::from(
            [
                ("nft_transfer", 6),
                ("nft_sale", 8),
                ("nft_mint", 6),
                ("contract_update", 7),
                ("creator_activity", 5),
                ("collection_price_update", 6),
                ("fraud_image_analysis", 7),
                ("fraud_similarity_score", 6),
                ("fraud_wash_trading", 8),
                ("fraud_metadata_validation", 6),
                ("social_mention_frequency", 4),
                ("social_sentiment_shift", 5),
                ("social_follower_change", 3),
                ("social_creator_announcement", 5),
                ("social_community_growth", 3),
                ("market_floor_price_change", 7),
                ("market_volume_anomaly", 6),
                ("market_trend_shift", 5),
                ("market_similar_nft_sale", 5),
                ("market_creator_portfolio_change", 4),
            ]
            .map(|(kind, priority)| (kind.to_string(), priority)),
        );

        let entity_type_modifiers = HashMap::from([
            ("nft".to_string(), 0),
            ("collection".to_string(), -1),
            ("creator".to_string(), -1),
            ("market".to_string(), -2),
        ]);

        let source_modifiers = HashMap::from([
            ("blockchain".to_string(), 1),
            ("fraudDetection".to_string(), 0),
            ("socialMedia".to_string(), -1),
            ("marketCondition".to_string(), 0),
        ]);

        Self {
            base_priorities,
            default_base_priority: 5,
            entity_type_modifiers,
            source_modifiers,
            enable_dynamic_priority: true,
            significant_price_change_threshold: 10.0,
            significant_fraud_confidence_threshold: 0.8,
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Deadline for the whole async fan-out of one dispatch
    pub dispatch_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 5_000,
        }
    }
}

/// Two-level alerting threshold for one monitored metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub warning: f64,
    pub critical: f64,
    /// Throughput metrics alert when the value falls below the threshold
    pub invert_comparison: bool,
}

/// Performance monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub collection_frequency_ms: u64,
    /// How long raw samples are retained
    pub retention_period_ms: u64,
    /// Window for linear-regression trend detection
    pub trend_window_ms: u64,
    /// Samples considered by the σ-based anomaly detector
    pub anomaly_window: usize,
    pub anomaly_sigma: f64,
    /// |slope| in value/second above which a trend signal fires
    pub trend_slope_threshold: f64,
    pub thresholds: HashMap<String, MetricThreshold>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let mut thresholds = HashMap::new();
        for (metric, warning, critical, invert) in [
            ("event_ingestion_rate", 50.0, 10.0, true),
            ("event_ingestion_latency", 500.0, 2_000.0, false),
            ("queue_depth", 5_000.0, 8_000.0, false),
            ("queue_throughput", 20.0, 5.0, true),
            ("update_calculation_time", 1_000.0, 5_000.0, false),
            ("end_to_end_latency", 2_000.0, 10_000.0, false),
            ("cpu_utilization", 75.0, 90.0, false),
            ("memory_utilization", 75.0, 90.0, false),
            ("network_utilization", 75.0, 90.0, false),
        ] {
            thresholds.insert(
                metric.to_string(),
                MetricThreshold {
                    warning,
                    critical,
                    invert_comparison: invert,
                },
            );
        }

        Self {
            collection_frequency_ms: 5_000,
            retention_period_ms: 24 * 60 * 60 * 1_000,
            trend_window_ms: 60 * 60 * 1_000,
            anomaly_window: 10,
            anomaly_sigma: 3.0,
            trend_slope_threshold: 0.01,
            thresholds,
        }
    }
}

/// Initial worker-pool allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub processing_units: u32,
    pub memory_mb: u32,
    pub concurrency_level: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            processing_units: 4,
            memory_mb: 2_048,
            concurrency_level: 8,
        }
    }
}

/// Metric-driven auto-scaling rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRuleConfig {
    pub name: String,
    pub metric: String,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown_ms: u64,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub increment: u32,
}

/// Capacity manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub check_interval_ms: u64,
    pub initial_allocation: AllocationConfig,
    /// CPU/memory percentage beyond which load shedding engages
    pub load_shedding_threshold: f64,
    pub scaling_rules: Vec<ScalingRuleConfig>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            initial_allocation: AllocationConfig::default(),
            load_shedding_threshold: 90.0,
            scaling_rules: vec![
                ScalingRuleConfig {
                    name: "cpu".to_string(),
                    metric: "cpu_utilization".to_string(),
                    scale_up_threshold: 75.0,
                    scale_down_threshold: 30.0,
                    cooldown_ms: 60_000,
                    min_capacity: 1,
                    max_capacity: 16,
                    increment: 1,
                },
                ScalingRuleConfig {
                    name: "queue_depth".to_string(),
                    metric: "queue_depth".to_string(),
                    scale_up_threshold: 5_000.0,
                    scale_down_threshold: 500.0,
                    cooldown_ms: 120_000,
                    min_capacity: 1,
                    max_capacity: 16,
                    increment: 2,
                },
            ],
        }
    }
}

/// Fraud-detection webhook adapter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudWebhookConfig {
    /// Update kinds accepted from the webhook; others are dropped
    pub enabled_kinds: Vec<String>,
    /// Pending-queue bound; the oldest entry is dropped when full
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub backoff_multiplier: u32,
}

impl Default for FraudWebhookConfig {
    fn default() -> Self {
        Self {
            enabled_kinds: vec![
                "image_analysis".to_string(),
                "similarity_score".to_string(),
                "wash_trading".to_string(),
                "metadata_validation".to_string(),
            ],
            max_queue_size: 1_000,
            batch_size: 20,
            flush_interval_ms: 500,
            max_retries: 3,
            backoff_multiplier: 2,
        }
    }
}

/// One upstream provider polled by a polling adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub endpoint: String,
    pub enabled: bool,
}

/// An entity watched by the polling adapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredEntity {
    pub entity_type: String,
    pub entity_id: String,
}

/// Per-metric significance thresholds for the polling adapters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignificanceThresholds {
    /// Floor-price change in percent
    pub floor_price_pct: f64,
    /// Volume deviation in standard deviations
    pub volume_sigma: f64,
    /// Trend change in percent
    pub trend_pct: f64,
    /// Mention-frequency change in percent
    pub mention_frequency_pct: f64,
    /// Absolute sentiment shift
    pub sentiment_abs: f64,
    /// Follower-count change in percent
    pub followers_pct: f64,
    /// Community-size change in percent
    pub community_pct: f64,
    /// Creator portfolio value change in percent
    pub portfolio_pct: f64,
}

impl Default for SignificanceThresholds {
    fn default() -> Self {
        Self {
            floor_price_pct: 10.0,
            volume_sigma: 2.0,
            trend_pct: 15.0,
            mention_frequency_pct: 20.0,
            sentiment_abs: 0.2,
            followers_pct: 10.0,
            community_pct: 10.0,
            portfolio_pct: 10.0,
        }
    }
}

/// Polling adapter configuration, shared by the social and market pollers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub poll_interval_ms: u64,
    pub providers: Vec<ProviderConfig>,
    pub entities: Vec<MonitoredEntity>,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub thresholds: SignificanceThresholds,
    /// Rolling history length for σ-based metrics
    pub history_window: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            providers: Vec::new(),
            entities: Vec::new(),
            max_retries: 3,
            backoff_base_ms: 1_000,
            thresholds: SignificanceThresholds::default(),
            history_window: 20,
        }
    }
}

/// Source adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AdaptersConfig {
    pub fraud_webhook: FraudWebhookConfig,
    pub social_media: PollerConfig,
    pub market_condition: PollerConfig,
}

/// Environment-specific configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub name: String,
    pub log_level: String,
    pub log_format: String,
    pub debug: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: "development".to_string(),
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            debug: cfg!(debug_assertions),
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<ConfigError> for crate::error::PipelineError {
    fn from(err: ConfigError) -> Self {
        crate::error::PipelineError::configuration(err.to_string())
    }
}
