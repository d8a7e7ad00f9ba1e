//! # Capacity Manager
//!
//! Metric-driven management of the worker pool: auto-scaling rules over the
//! monitor's snapshots, load shedding through the queue manager's priority
//! floor, optimization strategies with cooldowns, and timestamped scheduled
//! capacity changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CapacityConfig, ScalingRuleConfig};
use crate::metrics::MetricsCollector;
use crate::monitor::PerformanceMonitor;
use crate::queue::QueueManager;
use crate::signals::{PipelineSignal, SignalBus};
use crate::types::{MetricsSnapshot, PriorityFloor};

/// Current worker-pool allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub processing_units: u32,
    pub memory_mb: u32,
    pub concurrency_level: u32,
}

/// Timestamped partial allocation override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledChange {
    pub id: Uuid,
    pub apply_at: DateTime<Utc>,
    pub processing_units: Option<u32>,
    pub memory_mb: Option<u32>,
    pub concurrency_level: Option<u32>,
    pub applied: bool,
}

struct RuleState {
    config: ScalingRuleConfig,
    last_fired: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptimizationKind {
    RaiseBatchSize,
    AdjustCacheTtl,
    RebalanceAllocation,
    SimplifyProcessing,
}

impl OptimizationKind {
    fn name(&self) -> &'static str {
        match self {
            OptimizationKind::RaiseBatchSize => "raise_batch_size",
            OptimizationKind::AdjustCacheTtl => "adjust_cache_ttl",
            OptimizationKind::RebalanceAllocation => "rebalance_allocation",
            OptimizationKind::SimplifyProcessing => "simplify_processing",
        }
    }
}

struct OptimizationState {
    kind: OptimizationKind,
    cooldown: Duration,
    last_applied: Option<Instant>,
}

/// Metric-driven capacity control
pub struct CapacityManager {
    config: CapacityConfig,
    allocation: RwLock<ResourceAllocation>,
    rules: Mutex<Vec<RuleState>>,
    scheduled: Mutex<Vec<ScheduledChange>>,
    optimizations: Mutex<Vec<OptimizationState>>,
    queue: Arc<QueueManager>,
    monitor: Arc<PerformanceMonitor>,
    signals: SignalBus,
    metrics: Arc<MetricsCollector>,
    shedding_active: AtomicBool,
    /// Degraded processing flag engaged under sustained low throughput
    simplified_mode: AtomicBool,
    /// Cache TTL knob exposed to handlers, adjusted under latency pressure
    cache_ttl_ms: AtomicU64,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CapacityManager {
    pub fn new(
        config: CapacityConfig,
        queue: Arc<QueueManager>,
        monitor: Arc<PerformanceMonitor>,
        signals: SignalBus,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let allocation = ResourceAllocation {
            processing_units: config.initial_allocation.processing_units.max(1),
            memory_mb: config.initial_allocation.memory_mb,
            concurrency_level: config.initial_allocation.concurrency_level.max(1),
        };
        metrics.processing_units.set(allocation.processing_units as i64);

        let rules = config
            .scaling_rules
            .iter()
            .cloned()
            .map(|rule| RuleState {
                config: rule,
                last_fired: None,
            })
            .collect();

        let optimizations = vec![
            OptimizationState {
                kind: OptimizationKind::RaiseBatchSize,
                cooldown: Duration::from_secs(60),
                last_applied: None,
            },
            OptimizationState {
                kind: OptimizationKind::AdjustCacheTtl,
                cooldown: Duration::from_secs(120),
                last_applied: None,
            },
            OptimizationState {
                kind: OptimizationKind::RebalanceAllocation,
                cooldown: Duration::from_secs(120),
                last_applied: None,
            },
            OptimizationState {
                kind: OptimizationKind::SimplifyProcessing,
                cooldown: Duration::from_secs(60),
                last_applied: None,
            },
        ];

        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            allocation: RwLock::new(allocation),
            rules: Mutex::new(rules),
            scheduled: Mutex::new(Vec::new()),
            optimizations: Mutex::new(optimizations),
            queue,
            monitor,
            signals,
            metrics,
            shedding_active: AtomicBool::new(false),
            simplified_mode: AtomicBool::new(false),
            cache_ttl_ms: AtomicU64::new(60_000),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Apply the initial allocation and spawn the control loops
    pub fn start(self: Arc<Self>) {
        let initial = *self.allocation.read();
        self.queue.set_concurrency(initial.concurrency_level);

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let manager = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            let mut shutdown = manager.shutdown.subscribe();
            let mut snapshots = manager.monitor.snapshot_receiver();
            loop {
                tokio::select! {
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        manager.on_snapshot(&snapshot);
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("capacity snapshot loop stopped");
        }));

        let manager = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            let mut shutdown = manager.shutdown.subscribe();
            let mut ticker = tokio::time::interval(Duration::from_millis(
                manager.config.check_interval_ms.max(100),
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.apply_due_scheduled_changes(),
                    _ = shutdown.recv() => break,
                }
            }
            debug!("capacity schedule loop stopped");
        }));

        info!(
            processing_units = initial.processing_units,
            concurrency = initial.concurrency_level,
            "capacity manager started"
        );
    }

    /// Stop the control loops
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// React to one metrics snapshot
    pub fn on_snapshot(&self, snapshot: &MetricsSnapshot) {
        self.apply_load_shedding(snapshot);
        self.apply_scaling_rules(snapshot);
        self.apply_optimizations(snapshot);
    }

    fn apply_load_shedding(&self, snapshot: &MetricsSnapshot) {
        let cpu = snapshot.get("cpu_utilization").unwrap_or(0.0);
        let memory = snapshot.get("memory_utilization").unwrap_or(0.0);
        let threshold = self.config.load_shedding_threshold;

        let overloaded = cpu > threshold || memory > threshold;
        let recovered = cpu < threshold && memory < threshold;

        if overloaded && !self.shedding_active.swap(true, Ordering::SeqCst) {
            warn!(cpu, memory, threshold, "resource pressure, shedding low-priority load");
            self.queue.set_priority_floor(PriorityFloor::Medium);
        } else if recovered && self.shedding_active.swap(false, Ordering::SeqCst) {
            info!(cpu, memory, "resource pressure cleared, accepting all priorities");
            self.queue.set_priority_floor(PriorityFloor::Low);
        }
    }

    /// At most one scaling rule fires per snapshot
    fn apply_scaling_rules(&self, snapshot: &MetricsSnapshot) {
        let fired: Option<(String, u32)> = {
            let mut rules = self.rules.lock();
            let mut fired = None;
            for rule in rules.iter_mut() {
                let in_cooldown = rule
                    .last_fired
                    .map(|at| at.elapsed() < Duration::from_millis(rule.config.cooldown_ms))
                    .unwrap_or(false);
                if in_cooldown {
                    continue;
                }

                let Some(value) = snapshot.get(&rule.config.metric) else {
                    continue;
                };

                let current = *self.allocation.read();
                let units = if value > rule.config.scale_up_threshold
                    && current.processing_units < rule.config.max_capacity
                {
                    Some(
                        (current.processing_units + rule.config.increment)
                            .min(rule.config.max_capacity),
                    )
                } else if value < rule.config.scale_down_threshold
                    && current.processing_units > rule.config.min_capacity
                {
                    Some(
                        current
                            .processing_units
                            .saturating_sub(rule.config.increment)
                            .max(rule.config.min_capacity),
                    )
                } else {
                    None
                };

                if let Some(units) = units {
                    rule.last_fired = Some(Instant::now());
                    fired = Some((rule.config.name.clone(), units));
                    break;
                }
            }
            fired
        };

        if let Some((rule_name, units)) = fired {
            self.rescale_to(units, &rule_name);
        }
    }

    /// Scale to a unit count, adjusting memory and concurrency proportionally
    fn rescale_to(&self, units: u32, rule: &str) {
        let (previous, updated) = {
            let mut allocation = self.allocation.write();
            let previous = *allocation;
            if previous.processing_units == units {
                return;
            }
            let ratio = units as f64 / previous.processing_units.max(1) as f64;
            allocation.processing_units = units;
            allocation.memory_mb = ((previous.memory_mb as f64 * ratio) as u32).max(256);
            allocation.concurrency_level =
                ((previous.concurrency_level as f64 * ratio).round() as u32).max(1);
            (previous, *allocation)
        };

        info!(
            rule,
            previous_units = previous.processing_units,
            new_units = updated.processing_units,
            concurrency = updated.concurrency_level,
            "capacity scaled"
        );
        self.metrics
            .processing_units
            .set(updated.processing_units as i64);
        self.queue.set_concurrency(updated.concurrency_level);
        self.signals.publish(PipelineSignal::CapacityScaled {
            rule: rule.to_string(),
            previous_units: previous.processing_units,
            new_units: updated.processing_units,
        });
    }

    fn apply_optimizations(&self, snapshot: &MetricsSnapshot) {
        let queue_depth = snapshot.get("queue_depth").unwrap_or(0.0);
        let latency = snapshot.get("end_to_end_latency").unwrap_or(0.0);
        let throughput = snapshot.get("queue_throughput").unwrap_or(0.0);
        let cpu = snapshot.get("cpu_utilization").unwrap_or(0.0);
        let memory = snapshot.get("memory_utilization").unwrap_or(0.0);

        let mut optimizations = self.optimizations.lock();
        for optimization in optimizations.iter_mut() {
            let ready = optimization
                .last_applied
                .map(|applied| applied.elapsed() >= optimization.cooldown)
                .unwrap_or(true);
            if !ready {
                continue;
            }

            let applied = match optimization.kind {
                OptimizationKind::RaiseBatchSize => {
                    if queue_depth > 5_000.0 {
                        let batch = self.queue.max_batch_size();
                        self.queue.set_max_batch_size((batch * 2).min(200));
                        true
                    } else {
                        false
                    }
                }
                OptimizationKind::AdjustCacheTtl => {
                    if latency > 2_000.0 {
                        let ttl = self.cache_ttl_ms.load(Ordering::Relaxed);
                        self.cache_ttl_ms
                            .store((ttl * 2).min(600_000), Ordering::Relaxed);
                        true
                    } else {
                        false
                    }
                }
                OptimizationKind::RebalanceAllocation => {
                    if cpu > 80.0 && memory < 50.0 {
                        let mut allocation = self.allocation.write();
                        allocation.concurrency_level = allocation.concurrency_level.max(1) + 1;
                        let concurrency = allocation.concurrency_level;
                        drop(allocation);
                        self.queue.set_concurrency(concurrency);
                        true
                    } else {
                        false
                    }
                }
                OptimizationKind::SimplifyProcessing => {
                    if throughput < 5.0 && queue_depth > 1_000.0 {
                        self.simplified_mode.store(true, Ordering::Relaxed);
                        true
                    } else if self.simplified_mode.load(Ordering::Relaxed)
                        && throughput > 20.0
                    {
                        self.simplified_mode.store(false, Ordering::Relaxed);
                        true
                    } else {
                        false
                    }
                }
            };

            if applied {
                debug!(strategy = optimization.kind.name(), "optimization applied");
                optimization.last_applied = Some(Instant::now());
            }
        }
    }

    /// Register a scheduled partial allocation override
    pub fn schedule_change(
        &self,
        apply_at: DateTime<Utc>,
        processing_units: Option<u32>,
        memory_mb: Option<u32>,
        concurrency_level: Option<u32>,
    ) -> Uuid {
        let change = ScheduledChange {
            id: Uuid::new_v4(),
            apply_at,
            processing_units,
            memory_mb,
            concurrency_level,
            applied: false,
        };
        let id = change.id;
        let mut scheduled = self.scheduled.lock();
        scheduled.push(change);
        scheduled.sort_by_key(|change| change.apply_at);
        id
    }

    /// Apply due scheduled changes in timestamp order
    pub fn apply_due_scheduled_changes(&self) {
        let now = Utc::now();
        let due: Vec<ScheduledChange> = {
            let mut scheduled = self.scheduled.lock();
            let due = scheduled
                .iter()
                .filter(|change| !change.applied && change.apply_at <= now)
                .cloned()
                .collect();
            for change in scheduled.iter_mut() {
                if !change.applied && change.apply_at <= now {
                    change.applied = true;
                }
            }
            due
        };

        for change in due {
            let updated = {
                let mut allocation = self.allocation.write();
                if let Some(units) = change.processing_units {
                    allocation.processing_units = units.max(1);
                }
                if let Some(memory) = change.memory_mb {
                    allocation.memory_mb = memory;
                }
                if let Some(concurrency) = change.concurrency_level {
                    allocation.concurrency_level = concurrency.max(1);
                }
                *allocation
            };

            info!(change_id = %change.id, units = updated.processing_units, "scheduled capacity change applied");
            self.metrics
                .processing_units
                .set(updated.processing_units as i64);
            self.queue.set_concurrency(updated.concurrency_level);
            self.reclamp_rules(updated.processing_units);
        }
    }

    /// Widen rule bounds so the current allocation stays reachable
    fn reclamp_rules(&self, units: u32) {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            rule.config.min_capacity = rule.config.min_capacity.min(units);
            rule.config.max_capacity = rule.config.max_capacity.max(units);
        }
    }

    /// Manually apply a full allocation
    pub fn scale_manual(&self, target: ResourceAllocation) -> ResourceAllocation {
        let updated = {
            let mut allocation = self.allocation.write();
            allocation.processing_units = target.processing_units.max(1);
            allocation.memory_mb = target.memory_mb;
            allocation.concurrency_level = target.concurrency_level.max(1);
            *allocation
        };
        self.metrics
            .processing_units
            .set(updated.processing_units as i64);
        self.queue.set_concurrency(updated.concurrency_level);
        self.reclamp_rules(updated.processing_units);
        updated
    }

    pub fn current_allocation(&self) -> ResourceAllocation {
        *self.allocation.read()
    }

    pub fn scheduled_changes(&self) -> Vec<ScheduledChange> {
        self.scheduled.lock().clone()
    }

    pub fn is_shedding(&self) -> bool {
        self.shedding_active.load(Ordering::SeqCst)
    }

    pub fn is_simplified(&self) -> bool {
        self.simplified_mode.load(Ordering::Relaxed)
    }

    pub fn cache_ttl_ms(&self) -> u64 {
        self.cache_ttl_ms.load(Ordering::Relaxed)
    }
}
