//! # Event Prioritizer
//!
//! Computes the 0–10 priority scalar for each event from the configured base
//! table, entity and source modifiers, and content-aware boosts. A priority
//! already assigned to an event is never recomputed.

use trustscore_shared::{Event, EventKind};

use crate::config::PrioritizerConfig;

/// Priority calculator driven by the configured tables
#[derive(Debug, Clone)]
pub struct EventPrioritizer {
    config: PrioritizerConfig,
}

impl EventPrioritizer {
    pub fn new(config: PrioritizerConfig) -> Self {
        Self { config }
    }

    /// Assign the event's priority in place and return it
    ///
    /// Events that already carry a priority keep it unchanged.
    pub fn prioritize(&self, event: &mut Event) -> u8 {
        if let Some(existing) = event.priority {
            return existing;
        }
        let priority = self.compute(event);
        event.priority = Some(priority);
        priority
    }

    /// Pure priority computation; clamped to [0, 10]
    pub fn compute(&self, event: &Event) -> u8 {
        let kind = event.kind.base();

        let base = self
            .config
            .base_priorities
            .get(&kind.to_string())
            .copied()
            .unwrap_or(self.config.default_base_priority) as i32;

        let entity_modifier = self
            .config
            .entity_type_modifiers
            .get(event.entity_type.as_str())
            .copied()
            .unwrap_or(0) as i32;

        let source_modifier = self
            .config
            .source_modifiers
            .get(event.source.as_str())
            .copied()
            .unwrap_or(0) as i32;

        let mut priority = base + entity_modifier + source_modifier;

        if self.config.enable_dynamic_priority {
            priority += self.content_boost(event, kind);
        }

        priority.clamp(0, 10) as u8
    }

    fn content_boost(&self, event: &Event, kind: &EventKind) -> i32 {
        match kind {
            EventKind::NftSale => {
                if event
                    .price()
                    .is_some_and(|price| price > self.config.significant_price_change_threshold)
                {
                    1
                } else {
                    0
                }
            }
            EventKind::MarketFloorPriceChange => {
                if event
                    .percentage_change()
                    .is_some_and(|pct| pct.abs() >= 20.0)
                {
                    1
                } else {
                    0
                }
            }
            EventKind::FraudWashTrading | EventKind::FraudImageAnalysis => {
                if event.fraud_confidence().is_some_and(|confidence| {
                    confidence >= self.config.significant_fraud_confidence_threshold
                }) {
                    2
                } else {
                    0
                }
            }
            EventKind::SocialSentimentShift => {
                if event.sentiment_shift().is_some_and(|shift| shift.abs() > 0.5) {
                    1
                } else {
                    0
                }
            }
            EventKind::MarketVolumeAnomaly => {
                if event.standard_deviations().is_some_and(|sigma| sigma > 3.0) {
                    1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustscore_shared::{
        DeltaDirection, EntityType, EventData, MetricDeltaData, SaleData, Source, WashTradingData,
    };

    fn prioritizer() -> EventPrioritizer {
        EventPrioritizer::new(PrioritizerConfig::default())
    }

    fn sale(price: f64) -> Event {
        Event::new(
            EventKind::NftSale,
            EntityType::Nft,
            "token-1",
            Source::Blockchain,
            EventData::Sale(SaleData {
                token_id: "token-1".to_string(),
                price,
                currency: "ETH".to_string(),
                buyer: "0xb".to_string(),
                seller: "0xs".to_string(),
                marketplace: None,
                tx_hash: None,
            }),
        )
    }

    fn floor_change(pct: f64) -> Event {
        Event::new(
            EventKind::MarketFloorPriceChange,
            EntityType::Collection,
            "col-1",
            Source::MarketCondition,
            EventData::MetricDelta(MetricDeltaData {
                metric: "floor_price".to_string(),
                previous: 10.0,
                current: 10.0 * (1.0 + pct / 100.0),
                delta: 10.0 * pct / 100.0,
                percentage_change: Some(pct),
                standard_deviations: None,
                magnitude: None,
                direction: DeltaDirection::of(pct),
                timeframe_ms: 60_000,
                provider: "test".to_string(),
            }),
        )
    }

    #[test]
    fn test_base_plus_modifiers() {
        // nft_sale base 8, nft modifier 0, blockchain modifier +1, no boost
        let mut event = sale(1.0);
        assert_eq!(prioritizer().prioritize(&mut event), 9);
    }

    #[test]
    fn test_high_price_boost_clamped() {
        // 8 + 0 + 1 + 1 = 10, clamp keeps it at 10
        let mut event = sale(25.0);
        assert_eq!(prioritizer().prioritize(&mut event), 10);
    }

    #[test]
    fn test_floor_change_boost() {
        // base 7, collection -1, marketCondition 0 → 6; +1 at ≥ 20 %
        let mut modest = floor_change(10.0);
        let mut sharp = floor_change(25.0);
        let prioritizer = prioritizer();
        assert_eq!(prioritizer.prioritize(&mut modest), 6);
        assert_eq!(prioritizer.prioritize(&mut sharp), 7);
    }

    #[test]
    fn test_fraud_confidence_boost() {
        let mut event = Event::new(
            EventKind::FraudWashTrading,
            EntityType::Nft,
            "token-9",
            Source::FraudDetection,
            EventData::WashTrading(WashTradingData {
                nft_id: "token-9".to_string(),
                confidence: Some(0.85),
                involved_addresses: Vec::new(),
                results: serde_json::json!({}),
            }),
        );
        // base 8 + 0 + 0 + 2 = 10
        assert_eq!(prioritizer().prioritize(&mut event), 10);
    }

    #[test]
    fn test_assigned_priority_is_fixed() {
        let mut event = sale(1.0);
        event.priority = Some(2);
        assert_eq!(prioritizer().prioritize(&mut event), 2);
        assert_eq!(event.priority, Some(2));
    }

    #[test]
    fn test_priority_is_idempotent() {
        let prioritizer = prioritizer();
        let mut first = floor_change(25.0);
        let mut second = first.clone();
        assert_eq!(
            prioritizer.prioritize(&mut first),
            prioritizer.prioritize(&mut second)
        );
    }

    #[test]
    fn test_priority_in_range_for_all_kinds() {
        let prioritizer = prioritizer();
        for kind in EventKind::CONCRETE {
            let mut event = Event::new(
                kind,
                EntityType::Market,
                "market-1",
                Source::SocialMedia,
                EventData::CreatorAction(trustscore_shared::CreatorActionData {
                    creator_id: "c".to_string(),
                    action: "probe".to_string(),
                    details: serde_json::json!({}),
                }),
            );
            let priority = prioritizer.prioritize(&mut event);
            assert!(priority <= 10);
        }
    }

    #[test]
    fn test_dynamic_priority_disabled() {
        let mut config = PrioritizerConfig::default();
        config.enable_dynamic_priority = false;
        let prioritizer = EventPrioritizer::new(config);

        let mut event = sale(25.0);
        // no +1 boost without dynamic priority
        assert_eq!(prioritizer.prioritize(&mut event), 9);
    }
}
