//! # Recovery Manager
//!
//! Central error ledger with per-category retry policies and registered
//! fallback strategies. Errors are classified by keyword matching over their
//! message, retried through an implementation-supplied callback with
//! exponential backoff, and handed to the first matching fallback once the
//! retry budget is exhausted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCategory, ErrorSeverity, PipelineError, Result};
use crate::metrics::MetricsCollector;
use crate::signals::{AlertLevel, PipelineSignal, SignalBus};
use crate::types::TopicStats;

/// Async operation re-invoked by scheduled retries
pub type RetryOperation = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Per-category retry policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based), capped at `max_delay_ms`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

/// Recovery manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// How long resolved errors stay in the ledger
    pub retention_period_ms: u64,
    pub policies: HashMap<ErrorCategory, RetryPolicy>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        let policies = HashMap::from([
            (
                ErrorCategory::Connection,
                RetryPolicy {
                    max_retries: 5,
                    initial_delay_ms: 1_000,
                    backoff_factor: 2.0,
                    max_delay_ms: 60_000,
                },
            ),
            (
                ErrorCategory::Processing,
                RetryPolicy {
                    max_retries: 3,
                    initial_delay_ms: 2_000,
                    backoff_factor: 1.5,
                    max_delay_ms: 30_000,
                },
            ),
            (
                ErrorCategory::Data,
                RetryPolicy {
                    max_retries: 2,
                    initial_delay_ms: 3_000,
                    backoff_factor: 1.5,
                    max_delay_ms: 15_000,
                },
            ),
            (
                ErrorCategory::System,
                RetryPolicy {
                    max_retries: 4,
                    initial_delay_ms: 5_000,
                    backoff_factor: 2.0,
                    max_delay_ms: 120_000,
                },
            ),
            (
                ErrorCategory::Timeout,
                RetryPolicy {
                    max_retries: 3,
                    initial_delay_ms: 500,
                    backoff_factor: 3.0,
                    max_delay_ms: 30_000,
                },
            ),
            (
                ErrorCategory::Validation,
                RetryPolicy {
                    max_retries: 1,
                    initial_delay_ms: 1_000,
                    backoff_factor: 1.0,
                    max_delay_ms: 1_000,
                },
            ),
            (
                ErrorCategory::Dependency,
                RetryPolicy {
                    max_retries: 4,
                    initial_delay_ms: 2_000,
                    backoff_factor: 1.5,
                    max_delay_ms: 45_000,
                },
            ),
        ]);

        Self {
            retention_period_ms: 7 * 24 * 60 * 60 * 1_000,
            policies,
        }
    }
}

/// Context captured alongside an error
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub event_id: Option<String>,
    pub priority: Option<u8>,
    pub component: Option<String>,
}

/// One entry in the error ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub context: ErrorContext,
    pub retry_count: u32,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_strategy: Option<String>,
}

/// Aggregated ledger statistics for the status report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total: u64,
    pub unresolved: u64,
    pub resolved: u64,
    pub by_category: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
}

/// Result of the state consistency cross-checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVerification {
    pub consistent: bool,
    pub issues: Vec<String>,
}

/// A named recovery action attempted after retries are exhausted
pub struct FallbackStrategy {
    pub name: String,
    pub condition: Arc<dyn Fn(&ErrorRecord) -> bool + Send + Sync>,
    pub action: Arc<dyn Fn(ErrorRecord) -> BoxFuture<'static, Result<()>> + Send + Sync>,
}

/// Central error ledger and retry/fallback engine
pub struct RecoveryManager {
    config: RecoveryConfig,
    records: RwLock<HashMap<Uuid, ErrorRecord>>,
    /// Index from event id to its ledger record
    by_event: DashMap<String, Uuid>,
    operations: DashMap<Uuid, RetryOperation>,
    fallbacks: RwLock<Vec<FallbackStrategy>>,
    retry_tasks: Mutex<Vec<JoinHandle<()>>>,
    signals: SignalBus,
    metrics: Arc<MetricsCollector>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig, signals: SignalBus, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
            by_event: DashMap::new(),
            operations: DashMap::new(),
            fallbacks: RwLock::new(Vec::new()),
            retry_tasks: Mutex::new(Vec::new()),
            signals,
            metrics,
        }
    }

    /// Classify a raw error message into the taxonomy by keyword matching
    pub fn classify_message(message: &str) -> ErrorCategory {
        let lower = message.to_lowercase();
        let contains_any = |keywords: &[&str]| keywords.iter().any(|kw| lower.contains(kw));

        if contains_any(&["validation", "invalid", "schema", "missing field", "required field"]) {
            ErrorCategory::Validation
        } else if contains_any(&["timeout", "timed out", "deadline"]) {
            ErrorCategory::Timeout
        } else if contains_any(&["connection", "connect", "network", "unreachable", "refused"]) {
            ErrorCategory::Connection
        } else if contains_any(&["dependency", "upstream", "provider", "service unavailable"]) {
            ErrorCategory::Dependency
        } else if contains_any(&["parse", "malformed", "deserialize", "decode", "data error"]) {
            ErrorCategory::Data
        } else if contains_any(&["system", "memory", "resource", "capacity", "internal"]) {
            ErrorCategory::System
        } else {
            ErrorCategory::Processing
        }
    }

    /// Record an error in the ledger and return its id
    pub async fn record(
        &self,
        error: &PipelineError,
        event_id: Option<String>,
        priority: Option<u8>,
    ) -> Uuid {
        let message = error.to_string();
        let category = Self::classify_message(&message);
        let severity = severity_for(category, priority);

        let id = Uuid::new_v4();
        let record = ErrorRecord {
            id,
            category,
            severity,
            message: message.clone(),
            timestamp: Utc::now(),
            context: ErrorContext {
                event_id: event_id.clone(),
                priority,
                component: None,
            },
            retry_count: 0,
            resolved: false,
            resolved_at: None,
            resolution_strategy: None,
        };

        self.records.write().insert(id, record);
        if let Some(event_id) = event_id {
            self.by_event.insert(event_id, id);
        }
        self.metrics.errors_recorded_total.inc();
        self.signals.publish(PipelineSignal::ErrorRecorded {
            error_id: id.to_string(),
            category,
            severity,
        });

        if severity == ErrorSeverity::Critical {
            error!(error_id = %id, %message, "critical error recorded");
            self.signals.publish(PipelineSignal::AlertRaised {
                metric: format!("error:{category}"),
                level: AlertLevel::Critical,
                value: 1.0,
                threshold: 0.0,
            });
        } else {
            warn!(error_id = %id, %category, %severity, %message, "error recorded");
        }

        id
    }

    /// Record a dispatch failure for an event, tracking its retry count
    ///
    /// Successive failures of the same event update one ledger record so the
    /// record's `retry_count` reflects the queue manager's attempts.
    pub async fn record_dispatch_failure(
        &self,
        event_id: &str,
        attempts: u32,
        message: &str,
    ) -> Uuid {
        if let Some(existing) = self.by_event.get(event_id).map(|entry| *entry.value()) {
            let mut records = self.records.write();
            if let Some(record) = records.get_mut(&existing) {
                record.retry_count = attempts;
                record.message = message.to_string();
                return existing;
            }
        }

        let error = PipelineError::processing(message.to_string(), Some(event_id.to_string()));
        let id = self.record(&error, Some(event_id.to_string()), None).await;
        if let Some(record) = self.records.write().get_mut(&id) {
            record.retry_count = attempts;
        }
        id
    }

    /// Retry policy for a category
    pub fn policy(&self, category: ErrorCategory) -> RetryPolicy {
        self.config
            .policies
            .get(&category)
            .copied()
            .unwrap_or(RetryPolicy {
                max_retries: 3,
                initial_delay_ms: 1_000,
                backoff_factor: 2.0,
                max_delay_ms: 30_000,
            })
    }

    /// Schedule retries of the original operation for a recorded error
    ///
    /// The operation is re-invoked with the category's backoff schedule until
    /// it succeeds or the retry budget is exhausted, at which point the first
    /// matching fallback strategy is applied.
    pub fn schedule_retry(self: Arc<Self>, error_id: Uuid, operation: RetryOperation) {
        self.operations.insert(error_id, operation.clone());

        let manager = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let Some((category, policy)) = manager
                .get(error_id)
                .map(|record| (record.category, manager.policy(record.category)))
            else {
                return;
            };

            for attempt in 1..=policy.max_retries {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;

                match (*operation)().await {
                    Ok(()) => {
                        manager.resolve(error_id, "retry");
                        info!(error_id = %error_id, attempt, "retry succeeded");
                        return;
                    }
                    Err(err) => {
                        warn!(error_id = %error_id, attempt, error = %err, "retry failed");
                        let mut records = manager.records.write();
                        if let Some(record) = records.get_mut(&error_id) {
                            record.retry_count = attempt;
                        }
                    }
                }
            }

            info!(error_id = %error_id, category = %category, "retry budget exhausted, applying fallbacks");
            manager.apply_fallbacks(error_id).await;
        });

        let mut tasks = self.retry_tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Register a fallback strategy; strategies are tried in registration order
    pub fn register_fallback(&self, strategy: FallbackStrategy) {
        self.fallbacks.write().push(strategy);
    }

    /// Apply the first fallback whose condition matches the record
    pub async fn apply_fallbacks(&self, error_id: Uuid) -> bool {
        let Some(record) = self.get(error_id) else {
            return false;
        };

        let candidate = {
            let fallbacks = self.fallbacks.read();
            fallbacks
                .iter()
                .find(|strategy| (*strategy.condition)(&record))
                .map(|strategy| (strategy.name.clone(), strategy.action.clone()))
        };

        let Some((name, action)) = candidate else {
            return false;
        };

        match (*action)(record).await {
            Ok(()) => {
                self.resolve(error_id, &name);
                info!(error_id = %error_id, strategy = %name, "fallback resolved error");
                true
            }
            Err(err) => {
                warn!(error_id = %error_id, strategy = %name, error = %err, "fallback failed");
                false
            }
        }
    }

    /// Manually re-invoke the stored operation for an error
    pub async fn retry_error(&self, error_id: Uuid) -> Result<()> {
        let operation = self
            .operations
            .get(&error_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                PipelineError::data(format!("no retryable operation recorded for {error_id}"))
            })?;

        (*operation)().await?;
        self.resolve(error_id, "manual_retry");
        Ok(())
    }

    pub fn resolve(&self, error_id: Uuid, strategy: &str) {
        let mut records = self.records.write();
        if let Some(record) = records.get_mut(&error_id) {
            record.resolved = true;
            record.resolved_at = Some(Utc::now());
            record.resolution_strategy = Some(strategy.to_string());
        }
    }

    pub fn get(&self, error_id: Uuid) -> Option<ErrorRecord> {
        self.records.read().get(&error_id).cloned()
    }

    /// Ledger record currently associated with an event, if any
    pub fn record_for_event(&self, event_id: &str) -> Option<ErrorRecord> {
        let id = *self.by_event.get(event_id)?.value();
        self.get(id)
    }

    pub fn stats(&self) -> ErrorStats {
        let records = self.records.read();
        let mut stats = ErrorStats {
            total: records.len() as u64,
            ..ErrorStats::default()
        };
        for record in records.values() {
            if record.resolved {
                stats.resolved += 1;
            } else {
                stats.unresolved += 1;
            }
            *stats
                .by_category
                .entry(record.category.to_string())
                .or_insert(0) += 1;
            *stats
                .by_severity
                .entry(record.severity.to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Most recent records, newest first
    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let records = self.records.read();
        let mut recent: Vec<ErrorRecord> = records.values().cloned().collect();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(limit);
        recent
    }

    /// Evict resolved records older than the retention period
    pub fn evict_expired(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(self.config.retention_period_ms as i64);
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| {
            !(record.resolved && record.resolved_at.map(|at| at < cutoff).unwrap_or(false))
        });
        let evicted = before - records.len();
        if evicted > 0 {
            let live: std::collections::HashSet<Uuid> = records.keys().copied().collect();
            drop(records);
            self.by_event.retain(|_, id| live.contains(id));
        }
        evicted
    }

    /// Cross-check pipeline state for consistency
    pub fn verify_system_state(
        &self,
        queue_stats: &HashMap<crate::types::Topic, TopicStats>,
        max_queue_size: usize,
        is_live_event: &dyn Fn(&str) -> bool,
    ) -> StateVerification {
        let mut issues = Vec::new();

        for (topic, stats) in queue_stats {
            if stats.depth > max_queue_size {
                issues.push(format!(
                    "topic {topic} depth {} exceeds capacity {max_queue_size}",
                    stats.depth
                ));
            }
        }

        let records = self.records.read();
        for record in records.values() {
            if record.resolved {
                continue;
            }
            if let Some(event_id) = &record.context.event_id {
                if !is_live_event(event_id) && record.retry_count == 0 {
                    issues.push(format!(
                        "unresolved error {} references unknown event {event_id}",
                        record.id
                    ));
                }
            }
        }

        StateVerification {
            consistent: issues.is_empty(),
            issues,
        }
    }

    /// Cancel all pending retry timers
    pub fn shutdown(&self) {
        let mut tasks = self.retry_tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub fn pending_retry_tasks(&self) -> usize {
        let mut tasks = self.retry_tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.len()
    }
}

/// Severity rules: system errors and high-priority contexts are critical,
/// connection failures high, processing/data medium, the rest low.
fn severity_for(category: ErrorCategory, priority: Option<u8>) -> ErrorSeverity {
    if category == ErrorCategory::System || priority.map(|p| p >= 8).unwrap_or(false) {
        ErrorSeverity::Critical
    } else if category == ErrorCategory::Connection {
        ErrorSeverity::High
    } else if matches!(category, ErrorCategory::Processing | ErrorCategory::Data) {
        ErrorSeverity::Medium
    } else {
        ErrorSeverity::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager() -> Arc<RecoveryManager> {
        Arc::new(RecoveryManager::new(
            RecoveryConfig::default(),
            SignalBus::default(),
            Arc::new(MetricsCollector::new().unwrap()),
        ))
    }

    #[test]
    fn test_keyword_classification() {
        assert_eq!(
            RecoveryManager::classify_message("Connection error: host unreachable"),
            ErrorCategory::Connection
        );
        assert_eq!(
            RecoveryManager::classify_message("operation timed out after 5s"),
            ErrorCategory::Timeout
        );
        assert_eq!(
            RecoveryManager::classify_message("Validation error: missing field nftId"),
            ErrorCategory::Validation
        );
        assert_eq!(
            RecoveryManager::classify_message("failed to parse payload"),
            ErrorCategory::Data
        );
        assert_eq!(
            RecoveryManager::classify_message("handler refused the event"),
            ErrorCategory::Processing
        );
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay_ms: 1_000,
            backoff_factor: 3.0,
            max_delay_ms: 5_000,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(3_000));
        // 9 s exceeds the cap
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_record_and_stats() {
        let manager = manager();
        let id = manager
            .record(&PipelineError::connection("broker unreachable"), None, None)
            .await;

        let record = manager.get(id).unwrap();
        assert_eq!(record.category, ErrorCategory::Connection);
        assert_eq!(record.severity, ErrorSeverity::High);
        assert!(!record.resolved);

        let stats = manager.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.unresolved, 1);
        assert_eq!(stats.by_category["connection_error"], 1);
    }

    #[tokio::test]
    async fn test_high_priority_context_is_critical() {
        let manager = manager();
        let id = manager
            .record(
                &PipelineError::processing("handler refused", None),
                Some("evt-1".to_string()),
                Some(9),
            )
            .await;
        assert_eq!(manager.get(id).unwrap().severity, ErrorSeverity::Critical);
    }

    #[tokio::test]
    async fn test_dispatch_failure_updates_one_record() {
        let manager = manager();
        let first = manager
            .record_dispatch_failure("evt-7", 1, "handler refused")
            .await;
        let second = manager
            .record_dispatch_failure("evt-7", 2, "handler refused again")
            .await;

        assert_eq!(first, second);
        assert_eq!(manager.get(first).unwrap().retry_count, 2);
        assert_eq!(manager.stats().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let manager = manager();
        let id = manager
            .record(&PipelineError::connection("flaky provider"), None, None)
            .await;

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        Arc::clone(&manager).schedule_retry(
            id,
            Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                        Err(PipelineError::connection("still flaky"))
                    } else {
                        Ok(())
                    }
                })
            }),
        );

        // two connection-policy delays: 1 s then 2 s
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(manager.get(id).unwrap().resolved);
        assert_eq!(
            manager.get(id).unwrap().resolution_strategy.as_deref(),
            Some("retry")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_after_exhaustion() {
        let manager = manager();
        let id = manager
            .record(
                &PipelineError::validation("missing field nftId"),
                None,
                None,
            )
            .await;

        let fallback_ran = Arc::new(AtomicU32::new(0));
        let ran = fallback_ran.clone();
        manager.register_fallback(FallbackStrategy {
            name: "drop_invalid".to_string(),
            condition: Arc::new(|record| record.category == ErrorCategory::Validation),
            action: Arc::new(move |_record| {
                let ran = ran.clone();
                Box::pin(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        });

        Arc::clone(&manager).schedule_retry(
            id,
            Arc::new(|| Box::pin(async { Err(PipelineError::validation("still invalid")) })),
        );

        // validation policy: single 1 s retry, then fallback
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fallback_ran.load(Ordering::SeqCst), 1);

        let record = manager.get(id).unwrap();
        assert!(record.resolved);
        assert_eq!(record.resolution_strategy.as_deref(), Some("drop_invalid"));
    }

    #[tokio::test]
    async fn test_state_verification_flags_unknown_events() {
        let manager = manager();
        manager
            .record(
                &PipelineError::processing("handler refused", None),
                Some("ghost-event".to_string()),
                None,
            )
            .await;

        let verification =
            manager.verify_system_state(&HashMap::new(), 10_000, &|_id: &str| false);
        assert!(!verification.consistent);
        assert_eq!(verification.issues.len(), 1);

        let verification = manager.verify_system_state(&HashMap::new(), 10_000, &|_id: &str| true);
        assert!(verification.consistent);
    }

    #[tokio::test]
    async fn test_eviction_of_resolved_records() {
        let manager = Arc::new(RecoveryManager::new(
            RecoveryConfig {
                retention_period_ms: 0,
                ..RecoveryConfig::default()
            },
            SignalBus::default(),
            Arc::new(MetricsCollector::new().unwrap()),
        ));

        let id = manager
            .record(&PipelineError::data("malformed payload"), None, None)
            .await;
        manager.resolve(id, "manual");

        assert_eq!(manager.evict_expired(), 1);
        assert!(manager.get(id).is_none());
    }
}
