//! # Queue Manager
//!
//! Topic-keyed bounded FIFO queues with deduplication, conflation,
//! partitioned drain workers, retry with exponential backoff and a terminal
//! dead-letter topic. Events hash to a partition by `(entityType, entityId)`
//! so all events for one entity serialize even when a topic drains in
//! parallel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trustscore_shared::Event;

use crate::classifier::EventClassifier;
use crate::config::QueueConfig;
use crate::dispatch::EventDispatcher;
use crate::error::{PipelineError, Result};
use crate::metrics::MetricsCollector;
use crate::recovery::RecoveryManager;
use crate::signals::{PipelineSignal, SignalBus};
use crate::types::{PriorityFloor, Topic, TopicStats};

/// How an accepted enqueue was absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// An event with this id is already queued; treated as processed
    Deduplicated,
    /// Replaced an older event with the same semantic key in place
    Conflated,
}

struct TopicState {
    partitions: Vec<VecDeque<Event>>,
    ids: HashSet<String>,
}

impl TopicState {
    fn new(partition_count: usize) -> Self {
        Self {
            partitions: (0..partition_count).map(|_| VecDeque::new()).collect(),
            ids: HashSet::new(),
        }
    }

    fn depth(&self) -> usize {
        self.partitions.iter().map(|partition| partition.len()).sum()
    }
}

struct ThroughputWindow {
    started: Instant,
    count: u64,
    rate: f64,
}

impl ThroughputWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
            rate: 0.0,
        }
    }

    fn observe(&mut self) {
        self.count += 1;
        let elapsed = self.started.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.rate = self.count as f64 / elapsed.as_secs_f64();
            self.count = 0;
            self.started = Instant::now();
        }
    }
}

struct TopicQueue {
    state: Mutex<TopicState>,
    stats: Mutex<TopicStats>,
    throughput: Mutex<ThroughputWindow>,
    notify: Notify,
}

impl TopicQueue {
    fn new(partition_count: usize) -> Self {
        Self {
            state: Mutex::new(TopicState::new(partition_count)),
            stats: Mutex::new(TopicStats::default()),
            throughput: Mutex::new(ThroughputWindow::new()),
            notify: Notify::new(),
        }
    }
}

/// Multi-topic queue manager with partitioned drain workers
pub struct QueueManager {
    config: QueueConfig,
    max_batch_size: AtomicUsize,
    topics: DashMap<Topic, Arc<TopicQueue>>,
    dispatcher: Arc<EventDispatcher>,
    classifier: Arc<EventClassifier>,
    recovery: Arc<RecoveryManager>,
    metrics: Arc<MetricsCollector>,
    signals: SignalBus,
    priority_floor: RwLock<PriorityFloor>,
    /// Events tracked from enqueue until dispatch completion or dead-letter
    live_events: DashMap<String, ()>,
    /// Failed-dispatch attempts by event id
    retry_ledger: DashMap<String, u32>,
    dispatch_permits: Arc<Semaphore>,
    concurrency: Mutex<u32>,
    shutdown: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    retry_timers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl QueueManager {
    pub fn new(
        config: QueueConfig,
        initial_concurrency: u32,
        dispatcher: Arc<EventDispatcher>,
        classifier: Arc<EventClassifier>,
        recovery: Arc<RecoveryManager>,
        metrics: Arc<MetricsCollector>,
        signals: SignalBus,
    ) -> Self {
        let topics = DashMap::new();
        for topic in Topic::ALL {
            topics.insert(topic, Arc::new(TopicQueue::new(config.partition_count)));
        }

        let initial_concurrency = initial_concurrency.max(1);
        let (shutdown, _) = broadcast::channel(1);
        metrics.concurrency_level.set(initial_concurrency as i64);

        Self {
            max_batch_size: AtomicUsize::new(config.max_batch_size),
            config,
            topics,
            dispatcher,
            classifier,
            recovery,
            metrics,
            signals,
            priority_floor: RwLock::new(PriorityFloor::Low),
            live_events: DashMap::new(),
            retry_ledger: DashMap::new(),
            dispatch_permits: Arc::new(Semaphore::new(initial_concurrency as usize)),
            concurrency: Mutex::new(initial_concurrency),
            shutdown,
            workers: Mutex::new(Vec::new()),
            retry_timers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the drain workers; one per partition per drainable topic
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();
        for topic in Topic::ALL {
            if topic == Topic::DeadLetter {
                continue;
            }
            for partition in 0..self.config.partition_count {
                let manager = Arc::clone(&self);
                workers.push(tokio::spawn(async move {
                    manager.worker_loop(topic, partition).await;
                }));
            }
        }
        info!(
            partitions = self.config.partition_count,
            "queue manager started"
        );
    }

    /// Stop workers and cancel pending retry timers
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());

        for timer in self.retry_timers.lock().drain(..) {
            timer.abort();
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for mut worker in workers {
            if tokio::time::timeout(Duration::from_millis(500), &mut worker)
                .await
                .is_err()
            {
                worker.abort();
            }
        }
        info!("queue manager stopped");
    }

    /// Enqueue an event, applying the load-shedding priority floor
    pub fn enqueue(&self, event: Event, topic: Topic) -> Result<EnqueueOutcome> {
        if topic != Topic::DeadLetter {
            let floor = *self.priority_floor.read();
            let priority = event.priority_or_default();
            if priority < floor.min_priority() {
                self.metrics.events_shed_total.inc();
                return Err(PipelineError::LoadShed {
                    topic: topic.as_str().to_string(),
                    priority,
                    floor: floor.to_string(),
                });
            }
        }
        self.enqueue_inner(event, topic)
    }

    /// Enqueue bypassing the priority floor (retries and dead-lettering)
    fn enqueue_inner(&self, event: Event, topic: Topic) -> Result<EnqueueOutcome> {
        let queue = self.topic_queue(topic);
        let event_id = event.id.clone();

        let outcome = {
            let mut state = queue.state.lock();
            if state.depth() >= self.config.max_queue_size {
                drop(state);
                self.metrics.queue_rejections_total.inc();
                self.signals.publish(PipelineSignal::QueueFull {
                    topic: topic.as_str().to_string(),
                    event_id: event_id.clone(),
                });
                return Err(PipelineError::QueueFull {
                    topic: topic.as_str().to_string(),
                    depth: self.config.max_queue_size,
                    capacity: self.config.max_queue_size,
                });
            }

            if self.config.enable_deduplication && state.ids.contains(&event.id) {
                EnqueueOutcome::Deduplicated
            } else {
                let partition = partition_of(&event, state.partitions.len());
                let conflation_index = if self.config.enable_conflation {
                    state.partitions[partition].iter().position(|queued| {
                        queued.entity_type == event.entity_type
                            && queued.entity_id == event.entity_id
                            && queued.kind == event.kind
                    })
                } else {
                    None
                };

                match conflation_index {
                    Some(index) => {
                        let replaced_id = state.partitions[partition][index].id.clone();
                        state.ids.remove(&replaced_id);
                        state.ids.insert(event.id.clone());
                        state.partitions[partition][index] = event;
                        self.live_events.remove(&replaced_id);
                        EnqueueOutcome::Conflated
                    }
                    None => {
                        state.ids.insert(event.id.clone());
                        state.partitions[partition].push_back(event);
                        EnqueueOutcome::Enqueued
                    }
                }
            }
        };

        match outcome {
            EnqueueOutcome::Deduplicated => {
                self.metrics.events_deduplicated_total.inc();
                queue.stats.lock().deduplicated += 1;
                debug!(event_id = %event_id, topic = %topic, "duplicate event absorbed");
            }
            EnqueueOutcome::Conflated => {
                self.metrics.events_conflated_total.inc();
                queue.stats.lock().conflated += 1;
                self.live_events.insert(event_id, ());
                queue.notify.notify_waiters();
            }
            EnqueueOutcome::Enqueued => {
                self.live_events.insert(event_id, ());
                queue.notify.notify_waiters();
            }
        }

        Ok(outcome)
    }

    async fn worker_loop(self: Arc<Self>, topic: Topic, partition: usize) {
        let queue = self.topic_queue(topic);
        let mut shutdown = self.shutdown.subscribe();
        debug!(topic = %topic, partition, "drain worker started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = queue.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }

            loop {
                let batch = self.take_batch(&queue, partition);
                if batch.is_empty() {
                    break;
                }
                Arc::clone(&self).process_batch(&queue, topic, batch).await;

                use broadcast::error::TryRecvError;
                match shutdown.try_recv() {
                    Ok(_) | Err(TryRecvError::Closed) => {
                        debug!(topic = %topic, partition, "drain worker stopping");
                        return;
                    }
                    Err(_) => {}
                }
            }
        }
        debug!(topic = %topic, partition, "drain worker stopped");
    }

    /// Pop up to `maxBatchSize` events from one partition, dependency-ordered
    fn take_batch(&self, queue: &TopicQueue, partition: usize) -> Vec<Event> {
        let limit = if self.config.enable_batching {
            self.max_batch_size.load(Ordering::Relaxed).max(1)
        } else {
            1
        };

        let mut state = queue.state.lock();
        let mut batch: Vec<Event> = {
            let deque = &mut state.partitions[partition];
            let take = limit.min(deque.len());
            deque.drain(..take).collect()
        };
        for event in &batch {
            state.ids.remove(&event.id);
        }
        drop(state);

        // dependent kinds run after their prerequisites within the batch
        batch.sort_by_key(|event| self.classifier.dependency_rank(&event.kind));
        batch
    }

    async fn process_batch(self: Arc<Self>, queue: &TopicQueue, topic: Topic, batch: Vec<Event>) {
        for event in batch {
            let permit = match Arc::clone(&self.dispatch_permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let started = Instant::now();
            let result = self.dispatcher.dispatch(&event).await;
            drop(permit);

            let elapsed_ms = started.elapsed().as_millis() as f64;
            let ok = match &result {
                Ok(dispatch) => !dispatch.all_failed(),
                Err(_) => false,
            };

            {
                let mut stats = queue.stats.lock();
                stats.observe_processing_ms(elapsed_ms);
                if ok {
                    stats.processed += 1;
                } else {
                    stats.failed += 1;
                }
            }

            if ok {
                queue.throughput.lock().observe();
                self.live_events.remove(&event.id);
                self.retry_ledger.remove(&event.id);
            } else {
                let message = match &result {
                    Ok(dispatch) => {
                        format!("all {} matched handlers failed", dispatch.matched)
                    }
                    Err(err) => err.to_string(),
                };
                Arc::clone(&self)
                    .handle_dispatch_failure(queue, topic, event, message)
                    .await;
            }
        }
    }

    async fn handle_dispatch_failure(
        self: Arc<Self>,
        queue: &TopicQueue,
        topic: Topic,
        event: Event,
        message: String,
    ) {
        let attempts = {
            let mut entry = self.retry_ledger.entry(event.id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        self.recovery
            .record_dispatch_failure(&event.id, attempts, &message)
            .await;

        if attempts > self.config.max_retry_attempts {
            let event_id = event.id.clone();
            warn!(
                event_id = %event_id,
                topic = %topic,
                attempts,
                "retry budget exhausted, dead-lettering"
            );
            queue.stats.lock().dead_lettered += 1;
            self.metrics.events_dead_letter_total.inc();
            self.retry_ledger.remove(&event_id);
            self.live_events.remove(&event_id);
            if let Err(err) = self.enqueue_inner(event, Topic::DeadLetter) {
                warn!(event_id = %event_id, error = %err, "dead-letter enqueue failed, dropping");
            }
            self.signals.publish(PipelineSignal::EventDeadLettered {
                event_id,
                topic: topic.as_str().to_string(),
                attempts,
            });
        } else {
            queue.stats.lock().retried += 1;
            let delay = Duration::from_millis(
                self.config.retry_base_delay_ms * 2u64.pow(attempts.saturating_sub(1)),
            );
            debug!(
                event_id = %event.id,
                topic = %topic,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling dispatch retry"
            );

            let manager = Arc::clone(&self);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let event_id = event.id.clone();
                if let Err(err) = manager.enqueue_inner(event, topic) {
                    warn!(event_id = %event_id, error = %err, "retry re-enqueue failed");
                }
            });

            let mut timers = self.retry_timers.lock();
            timers.retain(|timer| !timer.is_finished());
            timers.push(handle);
        }
    }

    fn topic_queue(&self, topic: Topic) -> Arc<TopicQueue> {
        self.topics
            .entry(topic)
            .or_insert_with(|| Arc::new(TopicQueue::new(self.config.partition_count)))
            .clone()
    }

    /// Per-topic statistics with current depth and throughput
    pub fn stats(&self) -> HashMap<Topic, TopicStats> {
        let mut all = HashMap::new();
        let mut total_depth = 0usize;
        for entry in self.topics.iter() {
            let mut stats = entry.value().stats.lock().clone();
            stats.depth = entry.value().state.lock().depth();
            stats.throughput_eps = entry.value().throughput.lock().rate;
            total_depth += stats.depth;
            all.insert(*entry.key(), stats);
        }
        self.metrics.queue_depth.set(total_depth as i64);
        all
    }

    pub fn topic_stats(&self, topic: Topic) -> TopicStats {
        let queue = self.topic_queue(topic);
        let mut stats = queue.stats.lock().clone();
        stats.depth = queue.state.lock().depth();
        stats.throughput_eps = queue.throughput.lock().rate;
        stats
    }

    pub fn total_depth(&self) -> usize {
        self.topics
            .iter()
            .map(|entry| entry.value().state.lock().depth())
            .sum()
    }

    /// Snapshot of queued events, front first across partitions
    pub fn peek(&self, topic: Topic, limit: usize) -> Vec<Event> {
        let queue = self.topic_queue(topic);
        let state = queue.state.lock();
        state
            .partitions
            .iter()
            .flat_map(|partition| partition.iter().cloned())
            .take(limit)
            .collect()
    }

    pub fn set_priority_floor(&self, floor: PriorityFloor) {
        let changed = {
            let mut current = self.priority_floor.write();
            let changed = *current != floor;
            *current = floor;
            changed
        };
        if changed {
            info!(floor = %floor, "priority floor changed");
            self.signals
                .publish(PipelineSignal::LoadSheddingChanged { floor });
        }
    }

    pub fn priority_floor(&self) -> PriorityFloor {
        *self.priority_floor.read()
    }

    /// Apply a new dispatch concurrency level
    pub fn set_concurrency(&self, level: u32) {
        let level = level.max(1);
        let mut current = self.concurrency.lock();
        if level > *current {
            self.dispatch_permits
                .add_permits((level - *current) as usize);
        } else if level < *current {
            let surplus = *current - level;
            let permits = Arc::clone(&self.dispatch_permits);
            tokio::spawn(async move {
                if let Ok(acquired) = permits.acquire_many_owned(surplus).await {
                    acquired.forget();
                }
            });
        }
        *current = level;
        self.metrics.concurrency_level.set(level as i64);
    }

    pub fn concurrency(&self) -> u32 {
        *self.concurrency.lock()
    }

    pub fn set_max_batch_size(&self, size: usize) {
        self.max_batch_size.store(size.max(1), Ordering::Relaxed);
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.load(Ordering::Relaxed)
    }

    pub fn max_queue_size(&self) -> usize {
        self.config.max_queue_size
    }

    /// Whether an event is still tracked between enqueue and completion
    pub fn is_live(&self, event_id: &str) -> bool {
        self.live_events.contains_key(event_id)
    }

    pub fn live_event_count(&self) -> usize {
        self.live_events.len()
    }

    pub fn attempts_for(&self, event_id: &str) -> u32 {
        self.retry_ledger
            .get(event_id)
            .map(|entry| *entry.value())
            .unwrap_or(0)
    }

    pub fn pending_retry_timers(&self) -> usize {
        let mut timers = self.retry_timers.lock();
        timers.retain(|timer| !timer.is_finished());
        timers.len()
    }
}

/// Stable partition assignment by `(entityType, entityId)`
fn partition_of(event: &Event, partitions: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    event.entity_type.hash(&mut hasher);
    event.entity_id.hash(&mut hasher);
    (hasher.finish() as usize) % partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::recovery::RecoveryConfig;
    use trustscore_shared::{
        DeltaDirection, EntityType, EventData, EventKind, MetricDeltaData, SaleData, Source,
    };

    fn manager_with(config: QueueConfig) -> Arc<QueueManager> {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let signals = SignalBus::default();
        let recovery = Arc::new(RecoveryManager::new(
            RecoveryConfig::default(),
            signals.clone(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            DispatchConfig::default(),
            recovery.clone(),
            metrics.clone(),
        ));
        Arc::new(QueueManager::new(
            config,
            4,
            dispatcher,
            Arc::new(EventClassifier::new()),
            recovery,
            metrics,
            signals,
        ))
    }

    fn floor_change(entity_id: &str, pct: f64) -> Event {
        let mut event = Event::new(
            EventKind::MarketFloorPriceChange,
            EntityType::Nft,
            entity_id,
            Source::MarketCondition,
            EventData::MetricDelta(MetricDeltaData {
                metric: "floor_price".to_string(),
                previous: 10.0,
                current: 10.0 * (1.0 + pct / 100.0),
                delta: pct / 10.0,
                percentage_change: Some(pct),
                standard_deviations: None,
                magnitude: None,
                direction: DeltaDirection::of(pct),
                timeframe_ms: 50,
                provider: "test".to_string(),
            }),
        );
        event.priority = Some(6);
        event
    }

    fn sale(entity_id: &str, priority: u8) -> Event {
        let mut event = Event::new(
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
        );
        event.priority = Some(priority);
        event
    }

    #[tokio::test]
    async fn test_full_topic_rejects_without_mutation() {
        let manager = manager_with(QueueConfig {
            max_queue_size: 2,
            partition_count: 1,
            ..QueueConfig::default()
        });

        assert!(manager.enqueue(sale("a", 5), Topic::Blockchain).is_ok());
        assert!(manager.enqueue(sale("b", 5), Topic::Blockchain).is_ok());

        let err = manager.enqueue(sale("c", 5), Topic::Blockchain).unwrap_err();
        assert!(matches!(err, PipelineError::QueueFull { .. }));
        assert_eq!(manager.topic_stats(Topic::Blockchain).depth, 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_absorbed() {
        let manager = manager_with(QueueConfig {
            partition_count: 1,
            ..QueueConfig::default()
        });

        let event = sale("a", 5);
        let duplicate = event.clone();

        assert_eq!(
            manager.enqueue(event, Topic::Blockchain).unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            manager.enqueue(duplicate, Topic::Blockchain).unwrap(),
            EnqueueOutcome::Deduplicated
        );
        assert_eq!(manager.topic_stats(Topic::Blockchain).depth, 1);
    }

    #[tokio::test]
    async fn test_conflation_replaces_in_place() {
        let manager = manager_with(QueueConfig {
            partition_count: 1,
            ..QueueConfig::default()
        });

        manager
            .enqueue(floor_change("token-1", 10.0), Topic::MarketCondition)
            .unwrap();
        manager
            .enqueue(sale("token-2", 5), Topic::MarketCondition)
            .unwrap();
        let outcome = manager
            .enqueue(floor_change("token-1", 25.0), Topic::MarketCondition)
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Conflated);
        let queued = manager.peek(Topic::MarketCondition, 10);
        assert_eq!(queued.len(), 2);
        // replacement kept the original queue position
        assert_eq!(queued[0].kind, EventKind::MarketFloorPriceChange);
        assert_eq!(queued[0].percentage_change(), Some(25.0));
        assert_eq!(queued[1].kind, EventKind::NftSale);
    }

    #[tokio::test]
    async fn test_conflation_disabled_appends() {
        let manager = manager_with(QueueConfig {
            enable_conflation: false,
            partition_count: 1,
            ..QueueConfig::default()
        });

        manager
            .enqueue(floor_change("token-1", 10.0), Topic::MarketCondition)
            .unwrap();
        manager
            .enqueue(floor_change("token-1", 25.0), Topic::MarketCondition)
            .unwrap();
        assert_eq!(manager.topic_stats(Topic::MarketCondition).depth, 2);
    }

    #[tokio::test]
    async fn test_priority_floor_sheds_low_priority() {
        let manager = manager_with(QueueConfig {
            partition_count: 1,
            ..QueueConfig::default()
        });
        manager.set_priority_floor(PriorityFloor::Medium);

        let err = manager.enqueue(sale("a", 3), Topic::Blockchain).unwrap_err();
        assert!(matches!(err, PipelineError::LoadShed { .. }));

        assert!(manager.enqueue(sale("b", 4), Topic::Blockchain).is_ok());

        manager.set_priority_floor(PriorityFloor::Low);
        assert!(manager.enqueue(sale("c", 3), Topic::Blockchain).is_ok());
    }

    #[tokio::test]
    async fn test_batch_respects_dependency_order() {
        let manager = manager_with(QueueConfig {
            partition_count: 1,
            ..QueueConfig::default()
        });

        manager
            .enqueue(floor_change("token-1", 10.0), Topic::MarketCondition)
            .unwrap();
        manager
            .enqueue(sale("token-2", 5), Topic::MarketCondition)
            .unwrap();

        let queue = manager.topic_queue(Topic::MarketCondition);
        let batch = manager.take_batch(&queue, 0);
        assert_eq!(batch.len(), 2);
        // nft_sale has no dependencies; market_floor_price_change depends on it
        assert_eq!(batch[0].kind, EventKind::NftSale);
        assert_eq!(batch[1].kind, EventKind::MarketFloorPriceChange);
    }

    #[tokio::test]
    async fn test_drain_processes_enqueued_events() {
        let manager = manager_with(QueueConfig {
            partition_count: 2,
            ..QueueConfig::default()
        });
        Arc::clone(&manager).start();

        for i in 0..10 {
            manager
                .enqueue(sale(&format!("token-{i}"), 5), Topic::Blockchain)
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if manager.topic_stats(Topic::Blockchain).processed == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stats = manager.topic_stats(Topic::Blockchain);
        assert_eq!(stats.processed, 10);
        assert_eq!(stats.depth, 0);
        assert_eq!(manager.live_event_count(), 0);

        manager.stop().await;
        assert_eq!(manager.pending_retry_timers(), 0);
    }

    #[tokio::test]
    async fn test_same_entity_serializes_to_one_partition() {
        let manager = manager_with(QueueConfig {
            partition_count: 4,
            enable_conflation: false,
            enable_deduplication: false,
            ..QueueConfig::default()
        });

        for _ in 0..8 {
            manager
                .enqueue(sale("pinned-entity", 5), Topic::Blockchain)
                .unwrap();
        }

        let queue = manager.topic_queue(Topic::Blockchain);
        let state = queue.state.lock();
        let populated = state
            .partitions
            .iter()
            .filter(|partition| !partition.is_empty())
            .count();
        assert_eq!(populated, 1);
    }
}
