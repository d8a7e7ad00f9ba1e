//! # Event Dispatcher
//!
//! Registry of downstream handlers and the fan-out that invokes them. Handler
//! registrations declare the event kinds and entity types they accept (with
//! `*` wildcards), whether they run synchronously, and a priority that orders
//! invocation. Sync handlers run serially; async handlers run concurrently
//! under a shared per-dispatch timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, warn};
use trustscore_shared::{EntityType, Event, EventKind};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::MetricsCollector;
use crate::recovery::RecoveryManager;

/// Downstream handler contract
///
/// Handlers recompute per-entity scores and emit notifications; their
/// internals are outside the pipeline. A handler failure never fails its
/// peers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Filter over event kinds or entity types; `All` is the `*` wildcard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerFilter<T> {
    All,
    Only(Vec<T>),
}

impl<T: PartialEq> HandlerFilter<T> {
    fn accepts(&self, value: &T) -> bool {
        match self {
            HandlerFilter::All => true,
            HandlerFilter::Only(values) => values.contains(value),
        }
    }
}

/// Specification supplied when registering a handler
pub struct HandlerSpec {
    pub name: String,
    pub event_kinds: HandlerFilter<EventKind>,
    pub entity_types: HandlerFilter<EntityType>,
    /// Sync handlers block the dispatch loop; async handlers run concurrently
    pub requires_sync: bool,
    /// Higher-priority handlers are invoked first
    pub priority: i32,
    pub handler: Arc<dyn EventHandler>,
}

struct Registration {
    id: Uuid,
    spec: HandlerSpec,
    /// Monotonic registration sequence; ties on priority keep this order
    sequence: u64,
}

/// Outcome of one handler invocation
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub handler: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Outcome of dispatching one event
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub event_id: String,
    pub matched: usize,
    pub outcomes: Vec<HandlerOutcome>,
}

impl DispatchResult {
    /// All matched handlers failed; the event escalates to the retry path
    pub fn all_failed(&self) -> bool {
        self.matched > 0 && self.outcomes.iter().all(|outcome| !outcome.ok)
    }
}

/// Handler registry and dispatch fan-out
pub struct EventDispatcher {
    config: DispatchConfig,
    /// Read-mostly registry; updates swap a fresh Arc (copy-on-write)
    registry: RwLock<Arc<Vec<Arc<Registration>>>>,
    sequence: AtomicU64,
    recovery: Arc<RecoveryManager>,
    metrics: Arc<MetricsCollector>,
}

impl EventDispatcher {
    pub fn new(
        config: DispatchConfig,
        recovery: Arc<RecoveryManager>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            registry: RwLock::new(Arc::new(Vec::new())),
            sequence: AtomicU64::new(0),
            recovery,
            metrics,
        }
    }

    /// Register a handler; returns the registration id used to unregister
    pub fn register(&self, spec: HandlerSpec) -> Uuid {
        let id = Uuid::new_v4();
        let registration = Arc::new(Registration {
            id,
            spec,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        });

        let mut guard = self.registry.write();
        let mut next: Vec<Arc<Registration>> = guard.as_ref().clone();
        next.push(registration);
        *guard = Arc::new(next);
        id
    }

    pub fn unregister(&self, id: Uuid) -> bool {
        let mut guard = self.registry.write();
        let before = guard.len();
        let next: Vec<Arc<Registration>> = guard
            .as_ref()
            .iter()
            .filter(|registration| registration.id != id)
            .cloned()
            .collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    pub fn handler_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Dispatch one event to every matching handler
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchResult> {
        let snapshot = self.registry.read().clone();

        let mut matching: Vec<&Arc<Registration>> = snapshot
            .iter()
            .filter(|registration| {
                registration.spec.event_kinds.accepts(&event.kind)
                    && registration.spec.entity_types.accepts(&event.entity_type)
            })
            .collect();
        // priority descending, stable by registration order within ties
        matching.sort_by(|a, b| {
            b.spec
                .priority
                .cmp(&a.spec.priority)
                .then(a.sequence.cmp(&b.sequence))
        });

        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(matching.len());

        let (sync_handlers, async_handlers): (Vec<&Arc<Registration>>, Vec<&Arc<Registration>>) =
            matching
                .iter()
                .cloned()
                .partition(|registration| registration.spec.requires_sync);

        for registration in &sync_handlers {
            outcomes.push(self.invoke(registration, event).await);
        }

        if !async_handlers.is_empty() {
            let timeout = Duration::from_millis(self.config.dispatch_timeout_ms);
            let fanout = join_all(
                async_handlers
                    .iter()
                    .map(|registration| self.invoke(registration, event)),
            );
            match tokio::time::timeout(timeout, fanout).await {
                Ok(async_outcomes) => outcomes.extend(async_outcomes),
                Err(_) => {
                    warn!(
                        event_id = %event.id,
                        timeout_ms = self.config.dispatch_timeout_ms,
                        "async handler fan-out timed out"
                    );
                    for registration in &async_handlers {
                        let error = PipelineError::timeout(
                            format!(
                                "handler {} exceeded the dispatch deadline",
                                registration.spec.name
                            ),
                            "dispatch",
                            self.config.dispatch_timeout_ms,
                        );
                        self.recovery
                            .record(&error, Some(event.id.clone()), event.priority)
                            .await;
                        outcomes.push(HandlerOutcome {
                            handler: registration.spec.name.clone(),
                            ok: false,
                            error: Some(error.to_string()),
                        });
                    }
                }
            }
        }

        let result = DispatchResult {
            event_id: event.id.clone(),
            matched: matching.len(),
            outcomes,
        };

        let elapsed = started.elapsed();
        self.metrics.observe_dispatch(elapsed, !result.all_failed());
        let end_to_end = (Utc::now() - event.received_at)
            .to_std()
            .unwrap_or_default();
        self.metrics.observe_end_to_end(end_to_end);

        debug!(
            event_id = %event.id,
            matched = result.matched,
            failed = result.outcomes.iter().filter(|o| !o.ok).count(),
            elapsed_ms = elapsed.as_millis() as u64,
            "dispatch completed"
        );

        Ok(result)
    }

    async fn invoke(&self, registration: &Registration, event: &Event) -> HandlerOutcome {
        match registration.spec.handler.handle(event).await {
            Ok(()) => HandlerOutcome {
                handler: registration.spec.name.clone(),
                ok: true,
                error: None,
            },
            Err(error) => {
                self.recovery
                    .record(&error, Some(event.id.clone()), event.priority)
                    .await;
                HandlerOutcome {
                    handler: registration.spec.name.clone(),
                    ok: false,
                    error: Some(error.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalBus;
    use std::sync::atomic::AtomicUsize;
    use trustscore_shared::{CreatorActionData, EventData, Source};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(PipelineError::processing("handler refused", None))
            } else {
                Ok(())
            }
        }
    }

    struct OrderedHandler {
        label: &'static str,
        order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventHandler for OrderedHandler {
        async fn handle(&self, _event: &Event) -> Result<()> {
            self.order.lock().push(self.label);
            Ok(())
        }
    }

    fn dispatcher() -> EventDispatcher {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let recovery = Arc::new(RecoveryManager::new(
            Default::default(),
            SignalBus::default(),
            metrics.clone(),
        ));
        EventDispatcher::new(DispatchConfig::default(), recovery, metrics)
    }

    fn event(kind: EventKind, entity_type: EntityType) -> Event {
        Event::new(
            kind,
            entity_type,
            "entity-1",
            Source::Blockchain,
            EventData::CreatorAction(CreatorActionData {
                creator_id: "c".to_string(),
                action: "test".to_string(),
                details: serde_json::json!({}),
            }),
        )
    }

    fn spec(
        name: &str,
        kinds: HandlerFilter<EventKind>,
        entities: HandlerFilter<EntityType>,
        priority: i32,
        handler: Arc<dyn EventHandler>,
    ) -> HandlerSpec {
        HandlerSpec {
            name: name.to_string(),
            event_kinds: kinds,
            entity_types: entities,
            requires_sync: true,
            priority,
            handler,
        }
    }

    #[tokio::test]
    async fn test_wildcard_and_exact_matching() {
        let dispatcher = dispatcher();
        let wildcard_calls = Arc::new(AtomicUsize::new(0));
        let exact_calls = Arc::new(AtomicUsize::new(0));

        dispatcher.register(spec(
            "wildcard",
            HandlerFilter::All,
            HandlerFilter::All,
            0,
            Arc::new(CountingHandler {
                calls: wildcard_calls.clone(),
                fail: false,
            }),
        ));
        dispatcher.register(spec(
            "sales-only",
            HandlerFilter::Only(vec![EventKind::NftSale]),
            HandlerFilter::Only(vec![EntityType::Nft]),
            0,
            Arc::new(CountingHandler {
                calls: exact_calls.clone(),
                fail: false,
            }),
        ));

        let result = dispatcher
            .dispatch(&event(EventKind::NftMint, EntityType::Nft))
            .await
            .unwrap();
        assert_eq!(result.matched, 1);
        assert_eq!(wildcard_calls.load(Ordering::SeqCst), 1);
        assert_eq!(exact_calls.load(Ordering::SeqCst), 0);

        let result = dispatcher
            .dispatch(&event(EventKind::NftSale, EntityType::Nft))
            .await
            .unwrap();
        assert_eq!(result.matched, 2);
        assert_eq!(exact_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_priority_ordering_with_stable_ties() {
        let dispatcher = dispatcher();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for (label, priority) in [("low", 1), ("first-high", 5), ("second-high", 5)] {
            dispatcher.register(spec(
                label,
                HandlerFilter::All,
                HandlerFilter::All,
                priority,
                Arc::new(OrderedHandler {
                    label,
                    order: order.clone(),
                }),
            ));
        }

        dispatcher
            .dispatch(&event(EventKind::NftSale, EntityType::Nft))
            .await
            .unwrap();
        assert_eq!(*order.lock(), vec!["first-high", "second-high", "low"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_fail_peers() {
        let dispatcher = dispatcher();
        let good_calls = Arc::new(AtomicUsize::new(0));

        dispatcher.register(spec(
            "failing",
            HandlerFilter::All,
            HandlerFilter::All,
            10,
            Arc::new(CountingHandler {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: true,
            }),
        ));
        dispatcher.register(spec(
            "healthy",
            HandlerFilter::All,
            HandlerFilter::All,
            0,
            Arc::new(CountingHandler {
                calls: good_calls.clone(),
                fail: false,
            }),
        ));

        let result = dispatcher
            .dispatch(&event(EventKind::NftSale, EntityType::Nft))
            .await
            .unwrap();
        assert!(!result.all_failed());
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.outcomes.iter().filter(|o| !o.ok).count(), 1);
    }

    #[tokio::test]
    async fn test_all_failed_escalates() {
        let dispatcher = dispatcher();
        dispatcher.register(spec(
            "failing",
            HandlerFilter::All,
            HandlerFilter::All,
            0,
            Arc::new(CountingHandler {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: true,
            }),
        ));

        let result = dispatcher
            .dispatch(&event(EventKind::NftSale, EntityType::Nft))
            .await
            .unwrap();
        assert!(result.all_failed());
    }

    #[tokio::test]
    async fn test_no_matching_handlers_is_success() {
        let dispatcher = dispatcher();
        let result = dispatcher
            .dispatch(&event(EventKind::NftSale, EntityType::Nft))
            .await
            .unwrap();
        assert_eq!(result.matched, 0);
        assert!(!result.all_failed());
    }

    #[tokio::test]
    async fn test_unregister_revokes() {
        let dispatcher = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let id = dispatcher.register(spec(
            "temp",
            HandlerFilter::All,
            HandlerFilter::All,
            0,
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail: false,
            }),
        ));

        assert!(dispatcher.unregister(id));
        assert!(!dispatcher.unregister(id));

        dispatcher
            .dispatch(&event(EventKind::NftSale, EntityType::Nft))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
