//! # Source Adapters
//!
//! Adapters normalize source-specific payloads into the uniform event model
//! and feed them into the pipeline through the [`EventSink`] seam. Each
//! adapter is independently startable and reports its lifecycle over the
//! signal bus.

pub mod blockchain;
pub mod fraud;
pub mod market;
pub mod poller;
pub mod social;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use trustscore_shared::{EntityType, Event, Source};

use crate::error::{PipelineError, Result};
use crate::types::ComponentHealth;

pub use blockchain::{BlockchainAdapter, ChainEvent};
pub use fraud::{FraudWebhookAdapter, WebhookPayload};
pub use market::MarketConditionAdapter;
pub use poller::{MetricRule, PollingAdapter, Significance};
pub use social::SocialMediaAdapter;

/// Intake seam between adapters and the pipeline orchestrator
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: Event) -> Result<()>;
}

/// Contract shared by every source adapter
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn source(&self) -> Source;
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
    fn health(&self) -> ComponentHealth;
}

/// One polled observation of an entity: named numeric metrics
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub metrics: HashMap<String, f64>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(metrics: HashMap<String, f64>) -> Self {
        Self {
            metrics,
            taken_at: Utc::now(),
        }
    }
}

/// Upstream data source polled by the polling adapters
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, entity_type: EntityType, entity_id: &str) -> Result<Snapshot>;
}

/// HTTP provider fetching `GET {endpoint}/{entityType}/{entityId}` as a flat
/// JSON object of numeric metrics
pub struct HttpSnapshotProvider {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSnapshotProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, entity_type: EntityType, entity_id: &str) -> Result<Snapshot> {
        let url = format!("{}/{}/{}", self.endpoint, entity_type, entity_id);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(PipelineError::Connection {
                message: format!("provider {} returned {}", self.name, response.status()),
                endpoint: Some(url),
                retry_after_ms: None,
            });
        }

        let body: serde_json::Value = response.json().await?;
        let object = body.as_object().ok_or_else(|| {
            PipelineError::data(format!("provider {} returned a non-object body", self.name))
        })?;

        let metrics = object
            .iter()
            .filter_map(|(key, value)| value.as_f64().map(|number| (key.clone(), number)))
            .collect();
        Ok(Snapshot::new(metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_carries_timestamp() {
        let snapshot = Snapshot::new(HashMap::from([("floor_price".to_string(), 10.0)]));
        assert_eq!(snapshot.metrics["floor_price"], 10.0);
        assert!(snapshot.taken_at <= Utc::now());
    }
}
