//! # Signal Bus
//!
//! Typed cross-component notifications over a bounded broadcast channel.
//! Components publish lifecycle and operational signals here instead of
//! calling each other back directly; slow subscribers lag rather than block
//! publishers.

use tokio::sync::broadcast;

use crate::error::{ErrorCategory, ErrorSeverity};
use crate::types::PriorityFloor;

/// Operational signals emitted by pipeline components
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineSignal {
    EventDeadLettered {
        event_id: String,
        topic: String,
        attempts: u32,
    },
    QueueFull {
        topic: String,
        event_id: String,
    },
    ErrorRecorded {
        error_id: String,
        category: ErrorCategory,
        severity: ErrorSeverity,
    },
    AlertRaised {
        metric: String,
        level: AlertLevel,
        value: f64,
        threshold: f64,
    },
    AnomalyDetected {
        metric: String,
        value: f64,
        mean: f64,
        std_dev: f64,
    },
    TrendDetected {
        metric: String,
        slope_per_second: f64,
        rising: bool,
    },
    CapacityScaled {
        rule: String,
        previous_units: u32,
        new_units: u32,
    },
    LoadSheddingChanged {
        floor: PriorityFloor,
    },
    AdapterStarted {
        adapter: String,
    },
    AdapterStopped {
        adapter: String,
    },
    AdapterRetryScheduled {
        adapter: String,
        reference: String,
        attempts: u32,
        delay_ms: u64,
    },
    AdapterUpdateFailed {
        adapter: String,
        reference: String,
        attempts: u32,
    },
}

/// Alert level for threshold breaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Shared broadcast bus for [`PipelineSignal`]s
#[derive(Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<PipelineSignal>,
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a signal; dropped silently when nobody is subscribed
    pub fn publish(&self, signal: PipelineSignal) {
        let _ = self.sender.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineSignal> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = SignalBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(PipelineSignal::AdapterStarted {
            adapter: "fraud_webhook".to_string(),
        });

        let signal = rx.recv().await.unwrap();
        assert_eq!(
            signal,
            PipelineSignal::AdapterStarted {
                adapter: "fraud_webhook".to_string()
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = SignalBus::new(4);
        bus.publish(PipelineSignal::LoadSheddingChanged {
            floor: PriorityFloor::Medium,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
