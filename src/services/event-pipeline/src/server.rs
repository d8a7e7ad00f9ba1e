//! # Event Pipeline Service
//!
//! Service facade: assembles the pipeline and the source adapters, exposes
//! the HTTP surface (webhook ingestion, status, interventions, metrics) and
//! manages lifecycle for graceful startup and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::adapters::{
    BlockchainAdapter, ChainEvent, EventSink, FraudWebhookAdapter, MarketConditionAdapter,
    SocialMediaAdapter, SourceAdapter,
};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::handlers;
use crate::pipeline::EventPipeline;
use crate::types::{ComponentHealth, HealthStatus};

/// Capacity of the chain-event intake channel
const CHAIN_STREAM_BUFFER: usize = 1_024;

/// The assembled service: pipeline, adapters and HTTP surface
pub struct EventPipelineService {
    config: Arc<Config>,
    pipeline: Arc<EventPipeline>,
    fraud_adapter: FraudWebhookAdapter,
    social_adapter: SocialMediaAdapter,
    market_adapter: MarketConditionAdapter,
    blockchain_adapter: BlockchainAdapter,
    chain_tx: mpsc::Sender<ChainEvent>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl EventPipelineService {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        info!("initializing event pipeline service");
        config.validate()?;

        let pipeline = EventPipeline::new(&config)?;
        let sink: Arc<dyn EventSink> = pipeline.clone();
        let signals = pipeline.signals().clone();
        let recovery = pipeline.recovery().clone();

        let fraud_adapter = FraudWebhookAdapter::new(
            config.adapters.fraud_webhook.clone(),
            sink.clone(),
            recovery.clone(),
            signals.clone(),
        );
        let social_adapter = SocialMediaAdapter::new(
            config.adapters.social_media.clone(),
            sink.clone(),
            recovery.clone(),
            signals.clone(),
        );
        let market_adapter = MarketConditionAdapter::new(
            config.adapters.market_condition.clone(),
            sink.clone(),
            recovery,
            signals.clone(),
        );

        let (chain_tx, chain_rx) = mpsc::channel(CHAIN_STREAM_BUFFER);
        let blockchain_adapter = BlockchainAdapter::new(chain_rx, sink, signals);

        Ok(Arc::new(Self {
            config: Arc::new(config),
            pipeline,
            fraud_adapter,
            social_adapter,
            market_adapter,
            blockchain_adapter,
            chain_tx,
            server: Mutex::new(None),
        }))
    }

    /// Start the pipeline, every adapter and the HTTP server
    pub async fn start(self: Arc<Self>) -> Result<()> {
        Arc::clone(&self.pipeline).start();

        self.fraud_adapter.start().await?;
        self.social_adapter.start().await?;
        self.market_adapter.start().await?;
        self.blockchain_adapter.start().await?;

        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|err| {
                PipelineError::configuration(format!("invalid server address: {err}"))
            })?;

        let app = Arc::clone(&self).router();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|err| PipelineError::configuration(format!("bind {addr} failed: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| PipelineError::system(err.to_string()))?;

        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!(error = %err, "http server exited with error");
            }
        });
        *self.server.lock() = Some(handle);

        info!(%local_addr, "event pipeline service started");
        Ok(())
    }

    /// Stop adapters, the pipeline loops and the HTTP server
    pub async fn stop(&self) {
        self.fraud_adapter.stop().await;
        self.social_adapter.stop().await;
        self.market_adapter.stop().await;
        self.blockchain_adapter.stop().await;

        self.pipeline.stop().await;

        if let Some(server) = self.server.lock().take() {
            server.abort();
        }
        info!("event pipeline service stopped");
    }

    fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route("/metrics", get(handlers::metrics))
            .route("/api/v1/status", get(handlers::status))
            .route("/api/v1/interventions", post(handlers::intervention))
            .route("/api/v1/webhooks/fraud", post(handlers::fraud_webhook))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self)
    }

    /// Sender feeding the blockchain adapter's chain-event stream
    pub fn chain_sender(&self) -> mpsc::Sender<ChainEvent> {
        self.chain_tx.clone()
    }

    pub fn pipeline(&self) -> &Arc<EventPipeline> {
        &self.pipeline
    }

    pub fn fraud_adapter(&self) -> &FraudWebhookAdapter {
        &self.fraud_adapter
    }

    pub fn social_adapter(&self) -> &SocialMediaAdapter {
        &self.social_adapter
    }

    pub fn market_adapter(&self) -> &MarketConditionAdapter {
        &self.market_adapter
    }

    /// Health of the pipeline components and every adapter
    pub fn component_health(&self) -> Vec<ComponentHealth> {
        let mut components = self.pipeline.component_health();
        components.push(self.fraud_adapter.health());
        components.push(self.social_adapter.health());
        components.push(self.market_adapter.health());
        components.push(self.blockchain_adapter.health());
        components
    }

    /// Overall service health rollup
    pub fn overall_health(&self) -> HealthStatus {
        let components = self.component_health();
        if components
            .iter()
            .any(|component| component.status == HealthStatus::Unhealthy)
        {
            HealthStatus::Unhealthy
        } else if components
            .iter()
            .any(|component| component.status == HealthStatus::Degraded)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_service_creation() {
        let service = EventPipelineService::new(Config::default());
        assert!(service.is_ok());
    }

    #[tokio::test]
    async fn test_component_health_includes_adapters() {
        let service = EventPipelineService::new(Config::default()).unwrap();
        let components = service.component_health();
        let names: Vec<&str> = components
            .iter()
            .map(|component| component.component.as_str())
            .collect();

        assert!(names.contains(&"queue_manager"));
        assert!(names.contains(&"fraud_webhook"));
        assert!(names.contains(&"social_media"));
        assert!(names.contains(&"market_condition"));
        assert!(names.contains(&"blockchain"));
    }

    #[tokio::test]
    async fn test_overall_health_degrades_with_component() {
        let service = EventPipelineService::new(Config::default()).unwrap();
        // blockchain adapter not started yet reports unknown, not unhealthy
        assert_ne!(service.overall_health(), HealthStatus::Unhealthy);
    }
}
