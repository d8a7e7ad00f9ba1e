//! # Fraud Detection Webhook Adapter
//!
//! Push adapter for the fraud-detection service. Raw webhook payloads are
//! deduplicated and buffered in a bounded pending list (oldest dropped when
//! full); a periodic worker validates each item against its per-kind schema,
//! normalizes it into an event and submits it to the pipeline. Per-item
//! failures retry with exponential backoff until the budget is exhausted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trustscore_shared::{
    EntityType, Event, EventData, EventKind, FraudAnalysisData, MetadataValidationData,
    SimilarityData, Source, WashTradingData,
};
use validator::Validate;

use crate::adapters::{EventSink, SourceAdapter};
use crate::config::FraudWebhookConfig;
use crate::error::{PipelineError, Result};
use crate::recovery::RecoveryManager;
use crate::signals::{PipelineSignal, SignalBus};
use crate::types::{ComponentHealth, HealthStatus};

/// Raw webhook body: `{id, type, timestamp, data}`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WebhookPayload {
    #[validate(length(min = 1))]
    pub id: String,

    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub kind: String,

    /// Milliseconds since epoch at the source
    pub timestamp: Option<i64>,

    #[serde(default)]
    pub data: serde_json::Value,
}

struct PendingUpdate {
    payload: WebhookPayload,
    attempts: u32,
    ready_at: Instant,
}

/// Webhook push adapter for fraud-detection updates
#[derive(Clone)]
pub struct FraudWebhookAdapter {
    config: Arc<FraudWebhookConfig>,
    sink: Arc<dyn EventSink>,
    recovery: Arc<RecoveryManager>,
    signals: SignalBus,
    pending: Arc<Mutex<VecDeque<PendingUpdate>>>,
    processed: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown: broadcast::Sender<()>,
}

impl FraudWebhookAdapter {
    pub fn new(
        config: FraudWebhookConfig,
        sink: Arc<dyn EventSink>,
        recovery: Arc<RecoveryManager>,
        signals: SignalBus,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            sink,
            recovery,
            signals,
            pending: Arc::new(Mutex::new(VecDeque::new())),
            processed: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: Arc::new(Mutex::new(None)),
            shutdown,
        }
    }

    /// Accept one raw webhook payload into the pending list
    pub fn ingest(&self, payload: WebhookPayload) -> Result<()> {
        payload.validate().map_err(|err| PipelineError::Validation {
            message: format!("webhook payload failed validation: {err}"),
            field: None,
            payload_id: None,
        })?;

        if !self.config.enabled_kinds.contains(&payload.kind) {
            debug!(kind = %payload.kind, "webhook kind disabled, dropping");
            return Ok(());
        }

        let mut pending = self.pending.lock();
        if pending.iter().any(|item| item.payload.id == payload.id) {
            debug!(payload_id = %payload.id, "duplicate webhook payload dropped");
            return Ok(());
        }

        if pending.len() >= self.config.max_queue_size {
            if let Some(oldest) = pending.pop_front() {
                warn!(
                    payload_id = %oldest.payload.id,
                    "pending webhook queue full, dropping oldest"
                );
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        pending.push_back(PendingUpdate {
            payload,
            attempts: 0,
            ready_at: Instant::now(),
        });
        Ok(())
    }

    /// Drain one batch of due pending items
    pub async fn flush_once(&self) {
        let now = Instant::now();
        let batch_size = self.config.batch_size.max(1);

        let due: Vec<PendingUpdate> = {
            let mut pending = self.pending.lock();
            let mut due = Vec::new();
            let mut remaining = VecDeque::with_capacity(pending.len());
            while let Some(item) = pending.pop_front() {
                if due.len() < batch_size && item.ready_at <= now {
                    due.push(item);
                } else {
                    remaining.push_back(item);
                }
            }
            *pending = remaining;
            due
        };

        for item in due {
            let outcome = match self.normalize(&item.payload) {
                Ok(event) => self.sink.submit(event).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => self.retry_item(item, err).await,
            }
        }
    }

    async fn retry_item(&self, mut item: PendingUpdate, err: PipelineError) {
        item.attempts += 1;

        if item.attempts > self.config.max_retries {
            warn!(
                payload_id = %item.payload.id,
                attempts = item.attempts,
                error = %err,
                "webhook update dropped after retry exhaustion"
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.recovery
                .record(
                    &PipelineError::dependency(
                        format!(
                            "fraud webhook update {} failed permanently: {err}",
                            item.payload.id
                        ),
                        "fraud_detection",
                    ),
                    None,
                    None,
                )
                .await;
            self.signals.publish(PipelineSignal::AdapterUpdateFailed {
                adapter: "fraud_webhook".to_string(),
                reference: item.payload.id,
                attempts: item.attempts,
            });
            return;
        }

        let delay_ms =
            1_000u64.saturating_mul((self.config.backoff_multiplier as u64).pow(item.attempts));
        debug!(
            payload_id = %item.payload.id,
            attempts = item.attempts,
            delay_ms,
            error = %err,
            "webhook update scheduled for retry"
        );
        self.signals.publish(PipelineSignal::AdapterRetryScheduled {
            adapter: "fraud_webhook".to_string(),
            reference: item.payload.id.clone(),
            attempts: item.attempts,
            delay_ms,
        });

        item.ready_at = Instant::now() + Duration::from_millis(delay_ms);
        self.pending.lock().push_back(item);
    }

    /// Validate a payload against its per-kind schema and normalize it
    fn normalize(&self, payload: &WebhookPayload) -> Result<Event> {
        let nft_id = require_str(payload, "nftId")?;

        let (kind, data) = match payload.kind.as_str() {
            "image_analysis" => {
                let results = require_value(payload, "analysisResults")?;
                (
                    EventKind::FraudImageAnalysis,
                    EventData::FraudAnalysis(FraudAnalysisData {
                        nft_id: nft_id.clone(),
                        confidence: optional_f64(payload, "confidence"),
                        flags: optional_str_array(payload, "flags"),
                        results,
                    }),
                )
            }
            "similarity_score" => {
                let similarity_score = require_f64(payload, "similarityScore")?;
                (
                    EventKind::FraudSimilarityScore,
                    EventData::Similarity(SimilarityData {
                        nft_id: nft_id.clone(),
                        similarity_score,
                        similar_nfts: optional_str_array(payload, "similarNfts"),
                        threshold: optional_f64(payload, "threshold"),
                    }),
                )
            }
            "wash_trading" => {
                let results = require_value(payload, "detectionResults")?;
                (
                    EventKind::FraudWashTrading,
                    EventData::WashTrading(WashTradingData {
                        nft_id: nft_id.clone(),
                        confidence: optional_f64(payload, "confidence"),
                        involved_addresses: optional_str_array(payload, "involvedAddresses"),
                        results,
                    }),
                )
            }
            "metadata_validation" => {
                let results = require_value(payload, "validationResults")?;
                (
                    EventKind::FraudMetadataValidation,
                    EventData::MetadataValidation(MetadataValidationData {
                        nft_id: nft_id.clone(),
                        issues: optional_str_array(payload, "issues"),
                        results,
                    }),
                )
            }
            other => {
                return Err(PipelineError::Validation {
                    message: format!("unsupported webhook type: {other}"),
                    field: Some("type".to_string()),
                    payload_id: Some(payload.id.clone()),
                })
            }
        };

        let mut event = Event::new(kind, EntityType::Nft, nft_id, Source::FraudDetection, data);
        // the source id carries through so downstream deduplication holds
        event.id = payload.id.clone();
        if let Some(ts) = payload.timestamp {
            if let Some(timestamp) = Utc.timestamp_millis_opt(ts).single() {
                event.timestamp = timestamp;
            }
        }
        Ok(event)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

fn require_str(payload: &WebhookPayload, field: &str) -> Result<String> {
    payload
        .data
        .get(field)
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
        .ok_or_else(|| PipelineError::Validation {
            message: format!("missing required field {field}"),
            field: Some(field.to_string()),
            payload_id: Some(payload.id.clone()),
        })
}

fn require_f64(payload: &WebhookPayload, field: &str) -> Result<f64> {
    payload
        .data
        .get(field)
        .and_then(|value| value.as_f64())
        .ok_or_else(|| PipelineError::Validation {
            message: format!("missing required field {field}"),
            field: Some(field.to_string()),
            payload_id: Some(payload.id.clone()),
        })
}

fn require_value(payload: &WebhookPayload, field: &str) -> Result<serde_json::Value> {
    payload
        .data
        .get(field)
        .cloned()
        .ok_or_else(|| PipelineError::Validation {
            message: format!("missing required field {field}"),
            field: Some(field.to_string()),
            payload_id: Some(payload.id.clone()),
        })
}

fn optional_f64(payload: &WebhookPayload, field: &str) -> Option<f64> {
    payload.data.get(field).and_then(|value| value.as_f64())
}

fn optional_str_array(payload: &WebhookPayload, field: &str) -> Vec<String> {
    payload
        .data
        .get(field)
        .and_then(|value| value.as_array())
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SourceAdapter for FraudWebhookAdapter {
    fn name(&self) -> &str {
        "fraud_webhook"
    }

    fn source(&self) -> Source {
        Source::FraudDetection
    }

    async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval_ms = self.config.flush_interval_ms.max(10);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.flush_once().await,
                    _ = shutdown.recv() => break,
                }
            }
            debug!("fraud webhook flush loop stopped");
        });
        *worker = Some(handle);

        info!(interval_ms, "fraud webhook adapter started");
        self.signals.publish(PipelineSignal::AdapterStarted {
            adapter: "fraud_webhook".to_string(),
        });
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        self.signals.publish(PipelineSignal::AdapterStopped {
            adapter: "fraud_webhook".to_string(),
        });
    }

    fn health(&self) -> ComponentHealth {
        let pending = self.pending.lock().len();
        let mut health = ComponentHealth::healthy("fraud_webhook");
        if pending >= self.config.max_queue_size {
            health.status = HealthStatus::Degraded;
        }
        health
            .with_detail("pending", pending)
            .with_detail("processed", self.processed.load(Ordering::Relaxed))
            .with_detail("dropped", self.dropped.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use crate::recovery::RecoveryConfig;
    use tokio::sync::mpsc;

    struct ChannelSink {
        tx: mpsc::UnboundedSender<Event>,
    }

    #[async_trait]
    impl EventSink for ChannelSink {
        async fn submit(&self, event: Event) -> Result<()> {
            self.tx
                .send(event)
                .map_err(|_| PipelineError::system("sink closed"))
        }
    }

    fn adapter(
        config: FraudWebhookConfig,
    ) -> (FraudWebhookAdapter, mpsc::UnboundedReceiver<Event>, SignalBus) {
        let (tx, rx) = mpsc::unbounded_channel();
        let signals = SignalBus::default();
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let recovery = Arc::new(RecoveryManager::new(
            RecoveryConfig::default(),
            signals.clone(),
            metrics,
        ));
        (
            FraudWebhookAdapter::new(config, Arc::new(ChannelSink { tx }), recovery, signals.clone()),
            rx,
            signals,
        )
    }

    fn wash_trading_payload(id: &str) -> WebhookPayload {
        WebhookPayload {
            id: id.to_string(),
            kind: "wash_trading".to_string(),
            timestamp: Some(Utc::now().timestamp_millis()),
            data: serde_json::json!({
                "nftId": "token-9",
                "detectionResults": {"pattern": "circular"},
                "confidence": 0.92,
                "involvedAddresses": ["0xa", "0xb"],
            }),
        }
    }

    #[tokio::test]
    async fn test_normalizes_wash_trading_payload() {
        let (adapter, mut rx, _signals) = adapter(FraudWebhookConfig::default());

        adapter.ingest(wash_trading_payload("wh-1")).unwrap();
        adapter.flush_once().await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.id, "wh-1");
        assert_eq!(event.kind, EventKind::FraudWashTrading);
        assert_eq!(event.entity_type, EntityType::Nft);
        assert_eq!(event.entity_id, "token-9");
        assert_eq!(event.fraud_confidence(), Some(0.92));
    }

    #[tokio::test]
    async fn test_duplicate_payload_ids_collapse() {
        let (adapter, _rx, _signals) = adapter(FraudWebhookConfig::default());

        adapter.ingest(wash_trading_payload("wh-1")).unwrap();
        adapter.ingest(wash_trading_payload("wh-1")).unwrap();
        assert_eq!(adapter.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_kind_is_dropped() {
        let (adapter, _rx, _signals) = adapter(FraudWebhookConfig {
            enabled_kinds: vec!["image_analysis".to_string()],
            ..FraudWebhookConfig::default()
        });

        adapter.ingest(wash_trading_payload("wh-1")).unwrap();
        assert_eq!(adapter.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_bounded_pending_drops_oldest() {
        let (adapter, _rx, _signals) = adapter(FraudWebhookConfig {
            max_queue_size: 2,
            ..FraudWebhookConfig::default()
        });

        adapter.ingest(wash_trading_payload("wh-1")).unwrap();
        adapter.ingest(wash_trading_payload("wh-2")).unwrap();
        adapter.ingest(wash_trading_payload("wh-3")).unwrap();

        assert_eq!(adapter.pending_len(), 2);
        let pending = adapter.pending.lock();
        assert!(pending.iter().all(|item| item.payload.id != "wh-1"));
    }

    #[tokio::test]
    async fn test_missing_required_field_exhausts_retries() {
        let (adapter, mut rx, signals) = adapter(FraudWebhookConfig {
            max_retries: 1,
            backoff_multiplier: 0,
            ..FraudWebhookConfig::default()
        });
        let mut signal_rx = signals.subscribe();

        let payload = WebhookPayload {
            id: "wh-bad".to_string(),
            kind: "wash_trading".to_string(),
            timestamp: None,
            data: serde_json::json!({"confidence": 0.5}),
        };
        adapter.ingest(payload).unwrap();

        // attempt 1 fails and requeues with zero backoff; attempt 2 drops
        adapter.flush_once().await;
        adapter.flush_once().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(adapter.pending_len(), 0);

        let mut saw_retry = false;
        let mut saw_failure = false;
        while let Ok(signal) = signal_rx.try_recv() {
            match signal {
                PipelineSignal::AdapterRetryScheduled { reference, .. } => {
                    assert_eq!(reference, "wh-bad");
                    saw_retry = true;
                }
                PipelineSignal::AdapterUpdateFailed {
                    reference, attempts, ..
                } => {
                    assert_eq!(reference, "wh-bad");
                    assert_eq!(attempts, 2);
                    saw_failure = true;
                }
                _ => {}
            }
        }
        assert!(saw_retry);
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_empty_id_rejected() {
        let (adapter, _rx, _signals) = adapter(FraudWebhookConfig::default());
        let payload = WebhookPayload {
            id: String::new(),
            kind: "wash_trading".to_string(),
            timestamp: None,
            data: serde_json::json!({}),
        };
        assert!(matches!(
            adapter.ingest(payload),
            Err(PipelineError::Validation { .. })
        ));
    }
}
