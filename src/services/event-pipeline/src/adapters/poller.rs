//! # Polling Adapter Machinery
//!
//! Shared engine for the social-media and market-condition pollers. On each
//! tick every enabled provider is asked for a snapshot of every monitored
//! entity; deltas against the previous snapshot are checked against per-metric
//! significance rules, and significant changes emit normalized events.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trustscore_shared::{
    DeltaDirection, EntityType, Event, EventData, EventKind, MetricDeltaData, Source,
};

use crate::adapters::{EventSink, HttpSnapshotProvider, Snapshot, SnapshotProvider, SourceAdapter};
use crate::config::PollerConfig;
use crate::error::{PipelineError, Result};
use crate::recovery::RecoveryManager;
use crate::signals::{PipelineSignal, SignalBus};
use crate::types::{ComponentHealth, HealthStatus};

/// How a metric delta qualifies as significant
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Significance {
    /// Relative change in percent of the previous value
    Percentage(f64),
    /// Absolute change
    Absolute(f64),
    /// Deviation from the rolling history in standard deviations
    StdDev(f64),
}

/// Binding from a snapshot metric to the event kind it emits
#[derive(Debug, Clone)]
pub struct MetricRule {
    pub metric: &'static str,
    pub kind: EventKind,
    pub significance: Significance,
}

struct SnapshotState {
    last: Snapshot,
    /// Rolling per-metric history for σ-based rules
    history: HashMap<String, VecDeque<f64>>,
}

struct ProviderState {
    retries: u32,
    backoff_until: Option<Instant>,
}

/// Generic snapshot poller parameterized by metric rules
#[derive(Clone)]
pub struct PollingAdapter {
    name: String,
    source: Source,
    config: Arc<PollerConfig>,
    rules: Arc<Vec<MetricRule>>,
    providers: Arc<RwLock<Vec<Arc<dyn SnapshotProvider>>>>,
    sink: Arc<dyn EventSink>,
    recovery: Arc<RecoveryManager>,
    signals: SignalBus,
    snapshots: Arc<DashMap<(String, EntityType, String), SnapshotState>>,
    provider_states: Arc<DashMap<String, ProviderState>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown: broadcast::Sender<()>,
}

impl PollingAdapter {
    pub fn new(
        name: impl Into<String>,
        source: Source,
        config: PollerConfig,
        rules: Vec<MetricRule>,
        sink: Arc<dyn EventSink>,
        recovery: Arc<RecoveryManager>,
        signals: SignalBus,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            name: name.into(),
            source,
            config: Arc::new(config),
            rules: Arc::new(rules),
            providers: Arc::new(RwLock::new(Vec::new())),
            sink,
            recovery,
            signals,
            snapshots: Arc::new(DashMap::new()),
            provider_states: Arc::new(DashMap::new()),
            worker: Arc::new(Mutex::new(None)),
            shutdown,
        }
    }

    /// Register a provider; configured HTTP providers and injected test
    /// providers go through the same path
    pub fn add_provider(&self, provider: Arc<dyn SnapshotProvider>) {
        self.providers.write().push(provider);
    }

    /// One full poll pass over every provider and monitored entity
    pub async fn poll_once(&self) {
        let providers: Vec<Arc<dyn SnapshotProvider>> = self.providers.read().clone();

        for provider in providers {
            if self.provider_backing_off(provider.name()) {
                continue;
            }

            for entity in &self.config.entities {
                let Ok(entity_type) = EntityType::from_str(&entity.entity_type) else {
                    warn!(
                        adapter = %self.name,
                        entity_type = %entity.entity_type,
                        "skipping entity with unknown type"
                    );
                    continue;
                };

                match provider.fetch(entity_type, &entity.entity_id).await {
                    Ok(snapshot) => {
                        self.clear_provider_backoff(provider.name());
                        self.compare_and_emit(
                            provider.name(),
                            entity_type,
                            &entity.entity_id,
                            snapshot,
                        )
                        .await;
                    }
                    Err(err) => {
                        self.handle_fetch_failure(provider.name(), err).await;
                        break;
                    }
                }
            }
        }
    }

    fn provider_backing_off(&self, provider: &str) -> bool {
        self.provider_states
            .get(provider)
            .and_then(|state| state.backoff_until)
            .map(|until| until > Instant::now())
            .unwrap_or(false)
    }

    fn clear_provider_backoff(&self, provider: &str) {
        if let Some(mut state) = self.provider_states.get_mut(provider) {
            state.retries = 0;
            state.backoff_until = None;
        }
    }

    async fn handle_fetch_failure(&self, provider: &str, err: PipelineError) {
        let retries = {
            let mut state = self
                .provider_states
                .entry(provider.to_string())
                .or_insert(ProviderState {
                    retries: 0,
                    backoff_until: None,
                });
            state.retries += 1;
            let capped = state.retries.min(self.config.max_retries).max(1);
            let delay = self.config.backoff_base_ms * 2u64.pow((capped - 1).min(16));
            state.backoff_until = Some(Instant::now() + Duration::from_millis(delay));
            state.retries
        };

        if retries <= self.config.max_retries {
            let delay_ms =
                self.config.backoff_base_ms * 2u64.pow(retries.saturating_sub(1).min(16));
            warn!(
                adapter = %self.name,
                provider,
                retries,
                error = %err,
                "snapshot fetch failed, backing off"
            );
            self.signals.publish(PipelineSignal::AdapterRetryScheduled {
                adapter: self.name.clone(),
                reference: provider.to_string(),
                attempts: retries,
                delay_ms,
            });
        } else {
            // persistent provider failures never enter the pipeline
            self.recovery
                .record(
                    &PipelineError::dependency(
                        format!("provider {provider} keeps failing: {err}"),
                        provider.to_string(),
                    ),
                    None,
                    None,
                )
                .await;
        }
    }

    async fn compare_and_emit(
        &self,
        provider: &str,
        entity_type: EntityType,
        entity_id: &str,
        snapshot: Snapshot,
    ) {
        let key = (provider.to_string(), entity_type, entity_id.to_string());

        let previous = self.snapshots.get(&key).map(|state| state.last.clone());

        if let Some(previous) = &previous {
            for rule in self.rules.iter() {
                let Some(current) = snapshot.metrics.get(rule.metric).copied() else {
                    continue;
                };
                let Some(prior) = previous.metrics.get(rule.metric).copied() else {
                    continue;
                };

                let delta = current - prior;
                let history_stats = self.history_stats(&key, rule.metric);
                let significant = match rule.significance {
                    Significance::Percentage(pct) => {
                        prior.abs() > f64::EPSILON && (delta / prior * 100.0).abs() >= pct
                    }
                    Significance::Absolute(abs) => delta.abs() >= abs,
                    Significance::StdDev(sigma) => history_stats
                        .map(|(mean, std_dev)| {
                            std_dev > 0.0 && (current - mean).abs() >= sigma * std_dev
                        })
                        .unwrap_or(false),
                };

                if !significant {
                    continue;
                }

                let percentage_change = if prior.abs() > f64::EPSILON {
                    Some(delta / prior * 100.0)
                } else {
                    None
                };
                let standard_deviations = history_stats.and_then(|(mean, std_dev)| {
                    (std_dev > 0.0).then(|| (current - mean).abs() / std_dev)
                });
                let timeframe_ms = (snapshot.taken_at - previous.taken_at).num_milliseconds();

                let event = Event::new(
                    rule.kind.clone(),
                    entity_type,
                    entity_id,
                    self.source,
                    EventData::MetricDelta(MetricDeltaData {
                        metric: rule.metric.to_string(),
                        previous: prior,
                        current,
                        delta,
                        percentage_change,
                        standard_deviations,
                        magnitude: Some(delta.abs()),
                        direction: DeltaDirection::of(delta),
                        timeframe_ms,
                        provider: provider.to_string(),
                    }),
                );

                debug!(
                    adapter = %self.name,
                    metric = rule.metric,
                    entity_id,
                    delta,
                    "significant change detected"
                );
                if let Err(err) = self.sink.submit(event).await {
                    warn!(adapter = %self.name, error = %err, "event submission failed");
                }
            }
        }

        // the new snapshot is stored whether or not anything was emitted
        let mut state = self.snapshots.entry(key).or_insert_with(|| SnapshotState {
            last: snapshot.clone(),
            history: HashMap::new(),
        });
        for (metric, value) in &snapshot.metrics {
            let series = state.history.entry(metric.clone()).or_default();
            series.push_back(*value);
            while series.len() > self.config.history_window.max(2) {
                series.pop_front();
            }
        }
        state.last = snapshot;
    }

    /// Mean and σ of the rolling history for one metric
    fn history_stats(
        &self,
        key: &(String, EntityType, String),
        metric: &str,
    ) -> Option<(f64, f64)> {
        let state = self.snapshots.get(key)?;
        let series = state.history.get(metric)?;
        if series.len() < 3 {
            return None;
        }
        let mean = series.iter().sum::<f64>() / series.len() as f64;
        let variance =
            series.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / series.len() as f64;
        Some((mean, variance.sqrt()))
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}

#[async_trait]
impl SourceAdapter for PollingAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Source {
        self.source
    }

    async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        // configured HTTP providers are materialized at startup
        {
            let mut providers = self.providers.write();
            for provider in &self.config.providers {
                if provider.enabled {
                    providers.push(Arc::new(HttpSnapshotProvider::new(
                        provider.name.clone(),
                        provider.endpoint.clone(),
                    )));
                }
            }
        }

        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval_ms = self.config.poll_interval_ms.max(100);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.poll_once().await,
                    _ = shutdown.recv() => break,
                }
            }
            debug!(adapter = %this.name, "poll loop stopped");
        });
        *worker = Some(handle);

        info!(adapter = %self.name, interval_ms, "polling adapter started");
        self.signals.publish(PipelineSignal::AdapterStarted {
            adapter: self.name.clone(),
        });
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        self.signals.publish(PipelineSignal::AdapterStopped {
            adapter: self.name.clone(),
        });
    }

    fn health(&self) -> ComponentHealth {
        let backing_off = self
            .provider_states
            .iter()
            .filter(|state| {
                state
                    .value()
                    .backoff_until
                    .map(|until| until > Instant::now())
                    .unwrap_or(false)
            })
            .count();
        let mut health = ComponentHealth::healthy(self.name.clone());
        if backing_off > 0 {
            health.status = HealthStatus::Degraded;
        }
        health
            .with_detail("providers", self.providers.read().len())
            .with_detail("providers_backing_off", backing_off)
            .with_detail("tracked_snapshots", self.snapshots.len())
    }
}
