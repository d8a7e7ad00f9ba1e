//! # Blockchain Adapter
//!
//! Consumes a stream of chain events and emits one normalized event per chain
//! event. Every on-chain occurrence is material, so there is no thresholding
//! here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trustscore_shared::{
    ContractUpdateData, CreatorActionData, EntityType, Event, EventData, EventKind, MintData,
    PriceUpdateData, SaleData, Source, TransferData,
};

use crate::adapters::{EventSink, SourceAdapter};
use crate::error::Result;
use crate::signals::{PipelineSignal, SignalBus};
use crate::types::{ComponentHealth, HealthStatus};

/// Raw chain occurrences delivered by the chain monitor
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    Transfer {
        token_id: String,
        from_address: String,
        to_address: String,
        tx_hash: String,
    },
    Sale {
        token_id: String,
        price: f64,
        currency: String,
        buyer: String,
        seller: String,
        marketplace: Option<String>,
        tx_hash: String,
    },
    Mint {
        token_id: String,
        creator: String,
        tx_hash: String,
    },
    ContractUpdated {
        contract_address: String,
        change: String,
        tx_hash: Option<String>,
    },
    CreatorAction {
        creator_id: String,
        action: String,
        details: serde_json::Value,
    },
    CollectionPriceUpdate {
        collection_id: String,
        floor_price: f64,
        previous_floor: Option<f64>,
    },
}

impl ChainEvent {
    fn normalize(self) -> Event {
        match self {
            ChainEvent::Transfer {
                token_id,
                from_address,
                to_address,
                tx_hash,
            } => Event::new(
                EventKind::NftTransfer,
                EntityType::Nft,
                token_id.clone(),
                Source::Blockchain,
                EventData::Transfer(TransferData {
                    token_id,
                    from_address,
                    to_address,
                    tx_hash,
                }),
            ),
            ChainEvent::Sale {
                token_id,
                price,
                currency,
                buyer,
                seller,
                marketplace,
                tx_hash,
            } => Event::new(
                EventKind::NftSale,
                EntityType::Nft,
                token_id.clone(),
                Source::Blockchain,
                EventData::Sale(SaleData {
                    token_id,
                    price,
                    currency,
                    buyer,
                    seller,
                    marketplace,
                    tx_hash: Some(tx_hash),
                }),
            ),
            ChainEvent::Mint {
                token_id,
                creator,
                tx_hash,
            } => Event::new(
                EventKind::NftMint,
                EntityType::Nft,
                token_id.clone(),
                Source::Blockchain,
                EventData::Mint(MintData {
                    token_id,
                    creator,
                    tx_hash,
                }),
            ),
            ChainEvent::ContractUpdated {
                contract_address,
                change,
                tx_hash,
            } => Event::new(
                EventKind::ContractUpdate,
                EntityType::Collection,
                contract_address.clone(),
                Source::Blockchain,
                EventData::ContractUpdate(ContractUpdateData {
                    contract_address,
                    change,
                    tx_hash,
                }),
            ),
            ChainEvent::CreatorAction {
                creator_id,
                action,
                details,
            } => Event::new(
                EventKind::CreatorActivity,
                EntityType::Creator,
                creator_id.clone(),
                Source::Blockchain,
                EventData::CreatorAction(CreatorActionData {
                    creator_id,
                    action,
                    details,
                }),
            ),
            ChainEvent::CollectionPriceUpdate {
                collection_id,
                floor_price,
                previous_floor,
            } => {
                let price_change = previous_floor
                    .filter(|previous| previous.abs() > f64::EPSILON)
                    .map(|previous| (floor_price - previous) / previous);
                Event::new(
                    EventKind::CollectionPriceUpdate,
                    EntityType::Collection,
                    collection_id.clone(),
                    Source::Blockchain,
                    EventData::PriceUpdate(PriceUpdateData {
                        collection_id,
                        floor_price,
                        previous_floor,
                        price_change,
                    }),
                )
            }
        }
    }
}

/// Stream-consuming adapter for the chain monitor
#[derive(Clone)]
pub struct BlockchainAdapter {
    sink: Arc<dyn EventSink>,
    signals: SignalBus,
    stream: Arc<Mutex<Option<mpsc::Receiver<ChainEvent>>>>,
    emitted: Arc<AtomicU64>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown: broadcast::Sender<()>,
}

impl BlockchainAdapter {
    pub fn new(
        stream: mpsc::Receiver<ChainEvent>,
        sink: Arc<dyn EventSink>,
        signals: SignalBus,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            sink,
            signals,
            stream: Arc::new(Mutex::new(Some(stream))),
            emitted: Arc::new(AtomicU64::new(0)),
            worker: Arc::new(Mutex::new(None)),
            shutdown,
        }
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SourceAdapter for BlockchainAdapter {
    fn name(&self) -> &str {
        "blockchain"
    }

    fn source(&self) -> Source {
        Source::Blockchain
    }

    async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let Some(mut stream) = self.stream.lock().take() else {
            return Ok(());
        };

        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    chain_event = stream.recv() => {
                        let Some(chain_event) = chain_event else {
                            debug!("chain event stream closed");
                            break;
                        };
                        let event = chain_event.normalize();
                        this.emitted.fetch_add(1, Ordering::Relaxed);
                        if let Err(err) = this.sink.submit(event).await {
                            warn!(error = %err, "chain event submission failed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("blockchain adapter loop stopped");
        });
        *worker = Some(handle);

        info!("blockchain adapter started");
        self.signals.publish(PipelineSignal::AdapterStarted {
            adapter: "blockchain".to_string(),
        });
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        self.signals.publish(PipelineSignal::AdapterStopped {
            adapter: "blockchain".to_string(),
        });
    }

    fn health(&self) -> ComponentHealth {
        let running = self.worker.lock().is_some();
        let mut health = ComponentHealth::healthy("blockchain");
        if !running {
            health.status = HealthStatus::Unknown;
        }
        health.with_detail("events_emitted", self.emitted.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::time::Duration;

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

    #[test]
    fn test_sale_normalization() {
        let event = ChainEvent::Sale {
            token_id: "token-1".to_string(),
            price: 3.2,
            currency: "ETH".to_string(),
            buyer: "0xb".to_string(),
            seller: "0xs".to_string(),
            marketplace: Some("opensea".to_string()),
            tx_hash: "0xabc".to_string(),
        }
        .normalize();

        assert_eq!(event.kind, EventKind::NftSale);
        assert_eq!(event.entity_type, EntityType::Nft);
        assert_eq!(event.entity_id, "token-1");
        assert_eq!(event.price(), Some(3.2));
    }

    #[test]
    fn test_price_update_derives_change() {
        let event = ChainEvent::CollectionPriceUpdate {
            collection_id: "col-1".to_string(),
            floor_price: 12.0,
            previous_floor: Some(10.0),
        }
        .normalize();

        assert_eq!(event.kind, EventKind::CollectionPriceUpdate);
        assert_eq!(event.entity_type, EntityType::Collection);
        let change = event.price_change().unwrap();
        assert!((change - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_every_chain_event_is_emitted() {
        let (chain_tx, chain_rx) = mpsc::channel(16);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let signals = SignalBus::default();

        let adapter = BlockchainAdapter::new(chain_rx, Arc::new(ChannelSink { tx: sink_tx }), signals);
        adapter.start().await.unwrap();

        for i in 0..5 {
            chain_tx
                .send(ChainEvent::Transfer {
                    token_id: format!("token-{i}"),
                    from_address: "0xa".to_string(),
                    to_address: "0xb".to_string(),
                    tx_hash: format!("0x{i}"),
                })
                .await
                .unwrap();
        }

        let mut received = 0;
        for _ in 0..5 {
            if tokio::time::timeout(Duration::from_secs(1), sink_rx.recv())
                .await
                .ok()
                .flatten()
                .is_some()
            {
                received += 1;
            }
        }
        assert_eq!(received, 5);
        assert_eq!(adapter.emitted_count(), 5);

        adapter.stop().await;
    }
}
