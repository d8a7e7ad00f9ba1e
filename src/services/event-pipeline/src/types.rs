//! # Pipeline Types
//!
//! Core types shared across the pipeline components: topic queues, priority
//! levels, per-topic statistics and health reporting structures.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trustscore_shared::Source;

/// Named topic queues owned by the queue manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Blockchain,
    FraudDetection,
    SocialMedia,
    MarketCondition,
    HighPriority,
    DeadLetter,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Blockchain,
        Topic::FraudDetection,
        Topic::SocialMedia,
        Topic::MarketCondition,
        Topic::HighPriority,
        Topic::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Blockchain => "blockchain",
            Topic::FraudDetection => "fraud_detection",
            Topic::SocialMedia => "social_media",
            Topic::MarketCondition => "market_condition",
            Topic::HighPriority => "high_priority",
            Topic::DeadLetter => "dead_letter",
        }
    }

    /// Topic an update event lands in, derived from its source
    ///
    /// Events at priority 9 or above bypass their source topic and land in
    /// the high-priority queue.
    pub fn for_event(source: Source, priority: u8) -> Topic {
        if priority >= 9 {
            return Topic::HighPriority;
        }
        match source {
            Source::Blockchain => Topic::Blockchain,
            Source::FraudDetection => Topic::FraudDetection,
            Source::SocialMedia => Topic::SocialMedia,
            Source::MarketCondition => Topic::MarketCondition,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum-priority floor applied on enqueue during load shedding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityFloor {
    /// Accept everything
    Low,
    /// Reject events below priority 4
    Medium,
    /// Reject events below priority 7
    High,
}

impl PriorityFloor {
    pub fn min_priority(&self) -> u8 {
        match self {
            PriorityFloor::Low => 0,
            PriorityFloor::Medium => 4,
            PriorityFloor::High => 7,
        }
    }
}

impl fmt::Display for PriorityFloor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityFloor::Low => write!(f, "low"),
            PriorityFloor::Medium => write!(f, "medium"),
            PriorityFloor::High => write!(f, "high"),
        }
    }
}

/// Urgency level derived by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Functional category assigned by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    OwnershipChange,
    MarketActivity,
    CreationActivity,
    MetadataChange,
    RiskAssessment,
    MarketManipulation,
    SocialActivity,
    CreatorActivity,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventCategory::OwnershipChange => "ownership_change",
            EventCategory::MarketActivity => "market_activity",
            EventCategory::CreationActivity => "creation_activity",
            EventCategory::MetadataChange => "metadata_change",
            EventCategory::RiskAssessment => "risk_assessment",
            EventCategory::MarketManipulation => "market_manipulation",
            EventCategory::SocialActivity => "social_activity",
            EventCategory::CreatorActivity => "creator_activity",
        };
        f.write_str(name)
    }
}

/// Per-topic queue statistics
///
/// `avg_processing_ms` is an exponentially weighted moving average with
/// α = 0.3 applied to each new observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicStats {
    pub depth: usize,
    pub avg_processing_ms: f64,
    pub throughput_eps: f64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub deduplicated: u64,
    pub conflated: u64,
}

impl TopicStats {
    /// Fold a processing-time observation into the EWMA
    pub fn observe_processing_ms(&mut self, elapsed_ms: f64) {
        const ALPHA: f64 = 0.3;
        if self.processed == 0 && self.avg_processing_ms == 0.0 {
            self.avg_processing_ms = elapsed_ms;
        } else {
            self.avg_processing_ms = ALPHA * elapsed_ms + (1.0 - ALPHA) * self.avg_processing_ms;
        }
    }
}

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Component health information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    pub details: HashMap<String, String>,
}

impl ComponentHealth {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            last_check: Utc::now(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

/// A single named metric observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub labels: HashMap<String, String>,
}

impl MetricSample {
    pub fn now(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: Utc::now(),
            labels: HashMap::new(),
        }
    }
}

/// Latest value of every collected metric, published to the capacity manager
/// after each collection tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub collected_at: Option<DateTime<Utc>>,
    pub values: HashMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_for_event() {
        assert_eq!(Topic::for_event(Source::Blockchain, 5), Topic::Blockchain);
        assert_eq!(
            Topic::for_event(Source::SocialMedia, 3),
            Topic::SocialMedia
        );
        assert_eq!(Topic::for_event(Source::MarketCondition, 9), Topic::HighPriority);
    }

    #[test]
    fn test_priority_floor_thresholds() {
        assert_eq!(PriorityFloor::Low.min_priority(), 0);
        assert_eq!(PriorityFloor::Medium.min_priority(), 4);
        assert_eq!(PriorityFloor::High.min_priority(), 7);
        assert!(PriorityFloor::Low < PriorityFloor::Medium);
    }

    #[test]
    fn test_ewma_processing_time() {
        let mut stats = TopicStats::default();
        stats.observe_processing_ms(100.0);
        assert_eq!(stats.avg_processing_ms, 100.0);

        stats.processed = 1;
        stats.observe_processing_ms(200.0);
        assert!((stats.avg_processing_ms - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_urgency_ordering() {
        assert!(Urgency::Low < Urgency::Medium);
        assert!(Urgency::Medium < Urgency::High);
    }
}
