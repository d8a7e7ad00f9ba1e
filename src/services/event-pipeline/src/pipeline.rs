//! # Pipeline Orchestrator
//!
//! Wires the pipeline components together and owns the single entry point
//! [`EventPipeline::process_event`]: classify, prioritize, route, enqueue on
//! the source topic, and dispatch synthesized notifications directly. The
//! orchestrator itself is stateless and re-entrant; all state lives in the
//! injected components.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trustscore_shared::Event;
use uuid::Uuid;

use crate::adapters::EventSink;
use crate::capacity::{CapacityManager, ResourceAllocation, ScheduledChange};
use crate::classifier::EventClassifier;
use crate::config::Config;
use crate::dispatch::EventDispatcher;
use crate::error::{PipelineError, Result};
use crate::metrics::MetricsCollector;
use crate::monitor::PerformanceMonitor;
use crate::prioritizer::EventPrioritizer;
use crate::queue::{EnqueueOutcome, QueueManager};
use crate::recovery::{ErrorRecord, ErrorStats, RecoveryManager, StateVerification};
use crate::routing::{RouteDecision, UpdateRouter};
use crate::signals::SignalBus;
use crate::types::{ComponentHealth, MetricSample, Topic, TopicStats};

/// Result of pushing one event through the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub decision: RouteDecision,
    pub enqueued: Option<EnqueueOutcome>,
    pub notified: bool,
}

/// Aggregated operational status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatusReport {
    pub performance: PerformanceReport,
    pub errors: ErrorReport,
    pub capacity: CapacityReport,
    pub queues: HashMap<Topic, TopicStats>,
    pub system_state: StateVerification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub latest_metrics: Vec<MetricSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub stats: ErrorStats,
    pub recent: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityReport {
    pub current_allocation: ResourceAllocation,
    pub scheduled_changes: Vec<ScheduledChange>,
}

/// Operator actions accepted by `handle_manual_intervention`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManualIntervention {
    RetryError {
        error_id: Uuid,
    },
    ScaleCapacity {
        processing_units: u32,
        memory_mb: u32,
        concurrency_level: u32,
    },
    VerifySystemState,
}

/// The assembled event pipeline
pub struct EventPipeline {
    classifier: Arc<EventClassifier>,
    prioritizer: Arc<EventPrioritizer>,
    router: Arc<UpdateRouter>,
    queue: Arc<QueueManager>,
    dispatcher: Arc<EventDispatcher>,
    monitor: Arc<PerformanceMonitor>,
    recovery: Arc<RecoveryManager>,
    capacity: Arc<CapacityManager>,
    metrics: Arc<MetricsCollector>,
    signals: SignalBus,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl EventPipeline {
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        config.validate()?;

        let signals = SignalBus::default();
        let metrics = Arc::new(MetricsCollector::new()?);
        let classifier = Arc::new(EventClassifier::new());
        let prioritizer = Arc::new(EventPrioritizer::new(config.prioritizer.clone()));
        let router = Arc::new(UpdateRouter::new(config.router.clone()));
        let recovery = Arc::new(RecoveryManager::new(
            Default::default(),
            signals.clone(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            config.dispatch.clone(),
            recovery.clone(),
            metrics.clone(),
        ));
        let queue = Arc::new(QueueManager::new(
            config.queue.clone(),
            config.capacity.initial_allocation.concurrency_level,
            dispatcher.clone(),
            classifier.clone(),
            recovery.clone(),
            metrics.clone(),
            signals.clone(),
        ));
        let monitor = Arc::new(PerformanceMonitor::new(
            config.monitor.clone(),
            queue.clone(),
            metrics.clone(),
            signals.clone(),
        ));
        let capacity = Arc::new(CapacityManager::new(
            config.capacity.clone(),
            queue.clone(),
            monitor.clone(),
            signals.clone(),
            metrics.clone(),
        ));

        Ok(Arc::new(Self {
            classifier,
            prioritizer,
            router,
            queue,
            dispatcher,
            monitor,
            recovery,
            capacity,
            metrics,
            signals,
            janitor: Mutex::new(None),
        }))
    }

    /// Start the drain workers and control loops
    pub fn start(self: Arc<Self>) {
        Arc::clone(&self.queue).start();
        Arc::clone(&self.monitor).start();
        Arc::clone(&self.capacity).start();

        let mut janitor = self.janitor.lock();
        if janitor.is_none() {
            let pipeline = Arc::clone(&self);
            *janitor = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(3_600));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    pipeline.router.evict_stale_cooldowns();
                    let evicted = pipeline.recovery.evict_expired();
                    if evicted > 0 {
                        debug!(evicted, "expired error records evicted");
                    }
                }
            }));
        }
        info!("event pipeline started");
    }

    /// Stop loops, cancel retry timers and drain best-effort
    pub async fn stop(&self) {
        if let Some(janitor) = self.janitor.lock().take() {
            janitor.abort();
        }
        self.capacity.stop().await;
        self.monitor.stop().await;
        self.queue.stop().await;
        self.recovery.shutdown();
        info!("event pipeline stopped");
    }

    /// Classify, prioritize, route and act on one event
    pub async fn process_event(&self, event: Event) -> Result<ProcessOutcome> {
        let started = Instant::now();
        self.metrics.events_ingested_total.inc();

        let outcome = self.process_inner(event).await;

        self.monitor.record(
            "update_calculation_time",
            started.elapsed().as_secs_f64() * 1_000.0,
        );

        outcome
    }

    async fn process_inner(&self, mut event: Event) -> Result<ProcessOutcome> {
        let classification = self.classifier.classify(&event);
        let priority = self.prioritizer.prioritize(&mut event);
        let decision = self.router.route(&event);

        debug!(
            event_id = %event.id,
            kind = %event.kind,
            category = %classification.category,
            impact = classification.impact,
            priority,
            should_update = decision.should_update,
            should_notify = decision.should_notify,
            "event routed"
        );

        if !decision.should_update {
            return Ok(ProcessOutcome {
                decision,
                enqueued: None,
                notified: false,
            });
        }

        let topic = Topic::for_event(event.source, priority);
        let notification = decision
            .should_notify
            .then(|| event.to_notification(decision.notification_priority));
        let event_id = event.id.clone();

        let enqueued = match self.queue.enqueue(event, topic) {
            Ok(outcome) => outcome,
            Err(err) => {
                let recorded = self
                    .recovery
                    .record(&err, Some(event_id.clone()), Some(priority))
                    .await;
                warn!(event_id = %event_id, error_id = %recorded, error = %err, "enqueue failed");
                return Err(err);
            }
        };

        let mut notified = false;
        if let Some(notification) = notification {
            // notifications bypass the queue entirely
            match self.dispatcher.dispatch(&notification).await {
                Ok(result) if !result.all_failed() => {
                    self.metrics.notifications_dispatched_total.inc();
                    notified = true;
                }
                Ok(_) => {
                    warn!(event_id = %event_id, "all notification handlers failed");
                }
                Err(err) => {
                    let wrapped = PipelineError::processing(
                        format!("notification dispatch failed: {err}"),
                        Some(notification.id.clone()),
                    );
                    self.recovery
                        .record(&wrapped, Some(notification.id.clone()), Some(priority))
                        .await;
                    return Err(wrapped);
                }
            }
        }

        Ok(ProcessOutcome {
            decision,
            enqueued: Some(enqueued),
            notified,
        })
    }

    /// Cross-check queue and ledger state
    pub fn verify_state(&self) -> StateVerification {
        let stats = self.queue.stats();
        let queue = self.queue.clone();
        self.recovery
            .verify_system_state(&stats, self.queue.max_queue_size(), &move |event_id| {
                queue.is_live(event_id)
            })
    }

    /// Assemble the operational status report
    pub fn status_report(&self) -> SystemStatusReport {
        SystemStatusReport {
            performance: PerformanceReport {
                latest_metrics: self.monitor.latest_all(),
            },
            errors: ErrorReport {
                stats: self.recovery.stats(),
                recent: self.recovery.recent(20),
            },
            capacity: CapacityReport {
                current_allocation: self.capacity.current_allocation(),
                scheduled_changes: self.capacity.scheduled_changes(),
            },
            queues: self.queue.stats(),
            system_state: self.verify_state(),
        }
    }

    /// Execute an operator intervention
    pub async fn handle_manual_intervention(
        &self,
        intervention: ManualIntervention,
    ) -> Result<serde_json::Value> {
        match intervention {
            ManualIntervention::RetryError { error_id } => {
                self.recovery.retry_error(error_id).await?;
                Ok(serde_json::json!({ "retried": error_id }))
            }
            ManualIntervention::ScaleCapacity {
                processing_units,
                memory_mb,
                concurrency_level,
            } => {
                let applied = self.capacity.scale_manual(ResourceAllocation {
                    processing_units,
                    memory_mb,
                    concurrency_level,
                });
                Ok(serde_json::to_value(applied)?)
            }
            ManualIntervention::VerifySystemState => Ok(serde_json::to_value(self.verify_state())?),
        }
    }

    /// Per-component health for the health endpoint
    pub fn component_health(&self) -> Vec<ComponentHealth> {
        let queue_stats = self.queue.stats();
        let total_depth: usize = queue_stats.values().map(|stats| stats.depth).sum();
        let dead_lettered: u64 = queue_stats.values().map(|stats| stats.dead_lettered).sum();

        vec![
            ComponentHealth::healthy("queue_manager")
                .with_detail("depth", total_depth)
                .with_detail("dead_lettered", dead_lettered)
                .with_detail("priority_floor", self.queue.priority_floor()),
            ComponentHealth::healthy("dispatcher")
                .with_detail("handlers", self.dispatcher.handler_count()),
            ComponentHealth::healthy("recovery")
                .with_detail("unresolved_errors", self.recovery.stats().unresolved),
            ComponentHealth::healthy("capacity")
                .with_detail(
                    "processing_units",
                    self.capacity.current_allocation().processing_units,
                )
                .with_detail("load_shedding", self.capacity.is_shedding()),
        ]
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn capacity(&self) -> &Arc<CapacityManager> {
        &self.capacity
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }
}

#[async_trait]
impl EventSink for EventPipeline {
    async fn submit(&self, event: Event) -> Result<()> {
        self.process_event(event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingMode;
    use crate::dispatch::{EventHandler, HandlerFilter, HandlerSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trustscore_shared::{EntityType, EventData, EventKind, SaleData, Source};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn always_admit_config() -> Config {
        let mut config = Config::default();
        for threshold in config.router.update_thresholds.values_mut() {
            *threshold = 1.0;
        }
        for threshold in config.router.notification_thresholds.values_mut() {
            *threshold = 1.0;
        }
        config.router.enable_smart_routing = false;
        config.router.seed = Some(11);
        config.router.mode = RoutingMode::Probabilistic;
        config
    }

    fn sale(entity_id: &str) -> Event {
        Event::new(
            EventKind::NftSale,
            EntityType::Nft,
            entity_id,
            Source::Blockchain,
            EventData::Sale(SaleData {
                token_id: entity_id.to_string(),
                price: 2.0,
                currency: "ETH".to_string(),
                buyer: "0xb".to_string(),
                seller: "0xs".to_string(),
                marketplace: None,
                tx_hash: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_admitted_event_is_enqueued_and_notified() {
        let pipeline = EventPipeline::new(&always_admit_config()).unwrap();

        let notification_calls = Arc::new(AtomicUsize::new(0));
        pipeline.dispatcher().register(HandlerSpec {
            name: "notifier".to_string(),
            event_kinds: HandlerFilter::Only(vec![EventKind::Notification(Box::new(
                EventKind::NftSale,
            ))]),
            entity_types: HandlerFilter::All,
            requires_sync: true,
            priority: 0,
            handler: Arc::new(CountingHandler {
                calls: notification_calls.clone(),
            }),
        });

        let outcome = pipeline.process_event(sale("token-1")).await.unwrap();
        assert!(outcome.decision.should_update);
        assert!(outcome.decision.should_notify);
        assert_eq!(outcome.enqueued, Some(EnqueueOutcome::Enqueued));
        assert!(outcome.notified);
        assert_eq!(notification_calls.load(Ordering::SeqCst), 1);

        // priority 9 events land in the high-priority topic
        assert_eq!(pipeline.queue().topic_stats(Topic::HighPriority).depth, 1);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_second_event() {
        let pipeline = EventPipeline::new(&always_admit_config()).unwrap();

        let first = pipeline.process_event(sale("token-1")).await.unwrap();
        assert!(first.decision.should_update);

        let second = pipeline.process_event(sale("token-1")).await.unwrap();
        assert!(!second.decision.should_update);
        assert_eq!(second.enqueued, None);
        assert!(!second.notified);
    }

    #[tokio::test]
    async fn test_priority_is_fixed_once_assigned() {
        let pipeline = EventPipeline::new(&always_admit_config()).unwrap();

        let mut event = sale("token-1");
        event.priority = Some(3);
        pipeline.process_event(event).await.unwrap();

        let queued = pipeline.queue().peek(Topic::Blockchain, 1);
        assert_eq!(queued[0].priority, Some(3));
    }

    #[tokio::test]
    async fn test_status_report_shape() {
        let pipeline = EventPipeline::new(&always_admit_config()).unwrap();
        pipeline.process_event(sale("token-1")).await.unwrap();

        let report = pipeline.status_report();
        assert!(report.system_state.consistent);
        assert_eq!(report.errors.stats.total, 0);
        assert!(report.capacity.current_allocation.processing_units >= 1);
        assert!(report.queues.contains_key(&Topic::Blockchain));
    }

    #[tokio::test]
    async fn test_manual_scale_intervention() {
        let pipeline = EventPipeline::new(&always_admit_config()).unwrap();

        let result = pipeline
            .handle_manual_intervention(ManualIntervention::ScaleCapacity {
                processing_units: 9,
                memory_mb: 4_096,
                concurrency_level: 12,
            })
            .await
            .unwrap();

        assert_eq!(result["processing_units"], 9);
        assert_eq!(
            pipeline.capacity().current_allocation().concurrency_level,
            12
        );
        assert_eq!(pipeline.queue().concurrency(), 12);
    }
}
