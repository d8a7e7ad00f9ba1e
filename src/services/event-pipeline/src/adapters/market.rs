//! # Market Condition Adapter
//!
//! Polls marketplace providers for floor price, volume, trend and portfolio
//! metrics. Volume uses a σ-based rule over the rolling history so anomalies
//! are judged against recent behavior rather than a fixed percentage.

use std::sync::Arc;

use async_trait::async_trait;
use trustscore_shared::{EventKind, Source};

use crate::adapters::poller::{MetricRule, PollingAdapter, Significance};
use crate::adapters::{EventSink, SnapshotProvider, SourceAdapter};
use crate::config::PollerConfig;
use crate::error::Result;
use crate::recovery::RecoveryManager;
use crate::signals::SignalBus;
use crate::types::ComponentHealth;

fn market_rules(config: &PollerConfig) -> Vec<MetricRule> {
    let thresholds = &config.thresholds;
    vec![
        MetricRule {
            metric: "floor_price",
            kind: EventKind::MarketFloorPriceChange,
            significance: Significance::Percentage(thresholds.floor_price_pct),
        },
        MetricRule {
            metric: "volume",
            kind: EventKind::MarketVolumeAnomaly,
            significance: Significance::StdDev(thresholds.volume_sigma),
        },
        MetricRule {
            metric: "trend",
            kind: EventKind::MarketTrendShift,
            significance: Significance::Percentage(thresholds.trend_pct),
        },
        MetricRule {
            metric: "similar_sale_price",
            kind: EventKind::MarketSimilarNftSale,
            significance: Significance::Absolute(0.01),
        },
        MetricRule {
            metric: "portfolio_value",
            kind: EventKind::MarketCreatorPortfolioChange,
            significance: Significance::Percentage(thresholds.portfolio_pct),
        },
    ]
}

/// Polling adapter over marketplace providers
#[derive(Clone)]
pub struct MarketConditionAdapter {
    inner: PollingAdapter,
}

impl MarketConditionAdapter {
    pub fn new(
        config: PollerConfig,
        sink: Arc<dyn EventSink>,
        recovery: Arc<RecoveryManager>,
        signals: SignalBus,
    ) -> Self {
        let rules = market_rules(&config);
        Self {
            inner: PollingAdapter::new(
                "market_condition",
                Source::MarketCondition,
                config,
                rules,
                sink,
                recovery,
                signals,
            ),
        }
    }

    pub fn add_provider(&self, provider: Arc<dyn SnapshotProvider>) {
        self.inner.add_provider(provider);
    }

    pub async fn poll_once(&self) {
        self.inner.poll_once().await;
    }
}

#[async_trait]
impl SourceAdapter for MarketConditionAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn source(&self) -> Source {
        Source::MarketCondition
    }

    async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }

    fn health(&self) -> ComponentHealth {
        self.inner.health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_rule_is_sigma_based() {
        let config = PollerConfig::default();
        let rules = market_rules(&config);

        let volume = rules.iter().find(|rule| rule.metric == "volume").unwrap();
        assert_eq!(volume.significance, Significance::StdDev(2.0));

        let floor = rules
            .iter()
            .find(|rule| rule.metric == "floor_price")
            .unwrap();
        assert_eq!(floor.significance, Significance::Percentage(10.0));
        assert_eq!(floor.kind, EventKind::MarketFloorPriceChange);
    }
}
