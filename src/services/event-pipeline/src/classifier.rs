//! # Event Classifier
//!
//! Maps each event kind onto its functional category, the entity types its
//! handlers may affect, a content-adjusted impact score, an urgency level and
//! the kinds whose prior processing it assumes. Classification is a pure
//! function of the event: the same event always classifies identically.

use trustscore_shared::{EntityType, Event, EventKind};

use crate::types::{EventCategory, Urgency};

/// Classification computed for one event
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: EventCategory,
    /// Entity types a handler for this kind may legitimately affect
    pub entity_associations: Vec<EntityType>,
    /// Impact score in [0, 1]
    pub impact: f64,
    pub urgency: Urgency,
    /// Kinds whose prior processing this event assumes
    pub dependencies: Vec<EventKind>,
}

/// Stateless classifier over the closed taxonomy
#[derive(Debug, Clone, Default)]
pub struct EventClassifier;

impl EventClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, event: &Event) -> Classification {
        let kind = event.kind.base();
        let impact = self.impact_score(event);

        Classification {
            category: category_of(kind),
            entity_associations: entity_associations(kind),
            impact,
            urgency: self.urgency(kind, impact),
            dependencies: dependencies_of(kind),
        }
    }

    /// Base impact adjusted by content signals, clamped to [0, 1]
    fn impact_score(&self, event: &Event) -> f64 {
        let mut impact = base_impact(event.kind.base());

        match event.entity_type {
            EntityType::Nft => impact += 0.1,
            EntityType::Collection => impact += 0.05,
            _ => {}
        }

        if let Some(change) = event.price_change() {
            if change.abs() > 0.2 {
                impact += 0.2;
            }
        }
        if let Some(confidence) = event.fraud_confidence() {
            if confidence > 0.7 {
                impact += 0.3;
            }
        }
        if let Some(shift) = event.sentiment_shift() {
            if shift.abs() > 0.5 {
                impact += 0.1;
            }
        }

        impact.clamp(0.0, 1.0)
    }

    /// High at impact ≥ 0.7, the kind's base urgency at ≥ 0.4, low below
    fn urgency(&self, kind: &EventKind, impact: f64) -> Urgency {
        if impact >= 0.7 {
            Urgency::High
        } else if impact >= 0.4 {
            base_urgency(kind)
        } else {
            Urgency::Low
        }
    }

    /// Position of a kind in the dependency order of a batch
    ///
    /// Kinds with no dependencies rank 0; a dependent kind ranks one past its
    /// deepest dependency. Drain batches are sorted by this rank so dependent
    /// events are handed to the dispatcher after their prerequisites.
    pub fn dependency_rank(&self, kind: &EventKind) -> usize {
        fn rank(kind: &EventKind, depth: usize) -> usize {
            if depth >= 4 {
                return depth;
            }
            dependencies_of(kind)
                .iter()
                .map(|dep| rank(dep, depth + 1))
                .max()
                .map(|deepest| deepest + 1)
                .unwrap_or(0)
        }
        rank(kind.base(), 0)
    }
}

fn category_of(kind: &EventKind) -> EventCategory {
    match kind {
        EventKind::NftTransfer => EventCategory::OwnershipChange,
        EventKind::NftSale => EventCategory::MarketActivity,
        EventKind::NftMint => EventCategory::CreationActivity,
        EventKind::ContractUpdate => EventCategory::MetadataChange,
        EventKind::CreatorActivity => EventCategory::CreatorActivity,
        EventKind::CollectionPriceUpdate => EventCategory::MarketActivity,
        EventKind::FraudImageAnalysis => EventCategory::RiskAssessment,
        EventKind::FraudSimilarityScore => EventCategory::RiskAssessment,
        EventKind::FraudWashTrading => EventCategory::MarketManipulation,
        EventKind::FraudMetadataValidation => EventCategory::MetadataChange,
        EventKind::SocialMentionFrequency => EventCategory::SocialActivity,
        EventKind::SocialSentimentShift => EventCategory::SocialActivity,
        EventKind::SocialFollowerChange => EventCategory::SocialActivity,
        EventKind::SocialCreatorAnnouncement => EventCategory::CreatorActivity,
        EventKind::SocialCommunityGrowth => EventCategory::SocialActivity,
        EventKind::MarketFloorPriceChange => EventCategory::MarketActivity,
        EventKind::MarketVolumeAnomaly => EventCategory::MarketManipulation,
        EventKind::MarketTrendShift => EventCategory::MarketActivity,
        EventKind::MarketSimilarNftSale => EventCategory::MarketActivity,
        EventKind::MarketCreatorPortfolioChange => EventCategory::CreatorActivity,
        EventKind::Notification(inner) => category_of(inner),
    }
}

fn entity_associations(kind: &EventKind) -> Vec<EntityType> {
    use EntityType::*;
    match kind {
        EventKind::NftTransfer => vec![Nft, Collection],
        EventKind::NftSale => vec![Nft, Collection, Market],
        EventKind::NftMint => vec![Nft, Collection, Creator],
        EventKind::ContractUpdate => vec![Collection],
        EventKind::CreatorActivity => vec![Creator, Collection],
        EventKind::CollectionPriceUpdate => vec![Collection, Market],
        EventKind::FraudImageAnalysis => vec![Nft],
        EventKind::FraudSimilarityScore => vec![Nft, Collection],
        EventKind::FraudWashTrading => vec![Nft, Collection, Market],
        EventKind::FraudMetadataValidation => vec![Nft],
        EventKind::SocialMentionFrequency => vec![Nft, Collection, Creator],
        EventKind::SocialSentimentShift => vec![Nft, Collection, Creator],
        EventKind::SocialFollowerChange => vec![Creator],
        EventKind::SocialCreatorAnnouncement => vec![Creator, Collection],
        EventKind::SocialCommunityGrowth => vec![Collection, Creator],
        EventKind::MarketFloorPriceChange => vec![Collection, Market],
        EventKind::MarketVolumeAnomaly => vec![Collection, Market],
        EventKind::MarketTrendShift => vec![Market],
        EventKind::MarketSimilarNftSale => vec![Nft, Market],
        EventKind::MarketCreatorPortfolioChange => vec![Creator, Market],
        EventKind::Notification(inner) => entity_associations(inner),
    }
}

fn base_impact(kind: &EventKind) -> f64 {
    match kind {
        EventKind::NftTransfer => 0.5,
        EventKind::NftSale => 0.8,
        EventKind::NftMint => 0.5,
        EventKind::ContractUpdate => 0.7,
        EventKind::CreatorActivity => 0.4,
        EventKind::CollectionPriceUpdate => 0.6,
        EventKind::FraudImageAnalysis => 0.7,
        EventKind::FraudSimilarityScore => 0.6,
        EventKind::FraudWashTrading => 0.9,
        EventKind::FraudMetadataValidation => 0.5,
        EventKind::SocialMentionFrequency => 0.3,
        EventKind::SocialSentimentShift => 0.4,
        EventKind::SocialFollowerChange => 0.2,
        EventKind::SocialCreatorAnnouncement => 0.4,
        EventKind::SocialCommunityGrowth => 0.2,
        EventKind::MarketFloorPriceChange => 0.7,
        EventKind::MarketVolumeAnomaly => 0.6,
        EventKind::MarketTrendShift => 0.5,
        EventKind::MarketSimilarNftSale => 0.4,
        EventKind::MarketCreatorPortfolioChange => 0.3,
        EventKind::Notification(inner) => base_impact(inner),
    }
}

fn base_urgency(kind: &EventKind) -> Urgency {
    match kind {
        EventKind::NftSale
        | EventKind::FraudWashTrading
        | EventKind::FraudImageAnalysis
        | EventKind::MarketFloorPriceChange => Urgency::High,
        EventKind::NftTransfer
        | EventKind::NftMint
        | EventKind::ContractUpdate
        | EventKind::CollectionPriceUpdate
        | EventKind::FraudSimilarityScore
        | EventKind::FraudMetadataValidation
        | EventKind::SocialSentimentShift
        | EventKind::MarketVolumeAnomaly
        | EventKind::MarketTrendShift => Urgency::Medium,
        EventKind::CreatorActivity
        | EventKind::SocialMentionFrequency
        | EventKind::SocialFollowerChange
        | EventKind::SocialCreatorAnnouncement
        | EventKind::SocialCommunityGrowth
        | EventKind::MarketSimilarNftSale
        | EventKind::MarketCreatorPortfolioChange => Urgency::Low,
        EventKind::Notification(inner) => base_urgency(inner),
    }
}

fn dependencies_of(kind: &EventKind) -> Vec<EventKind> {
    match kind {
        EventKind::CollectionPriceUpdate => vec![EventKind::NftSale],
        EventKind::MarketFloorPriceChange => vec![EventKind::NftSale],
        EventKind::MarketSimilarNftSale => vec![EventKind::NftSale],
        EventKind::MarketVolumeAnomaly => vec![EventKind::NftSale, EventKind::NftTransfer],
        EventKind::FraudWashTrading => vec![EventKind::NftTransfer],
        EventKind::Notification(inner) => dependencies_of(inner),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustscore_shared::{EventData, SaleData, Source, WashTradingData};

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

    fn wash_trading(confidence: f64) -> Event {
        Event::new(
            EventKind::FraudWashTrading,
            EntityType::Nft,
            "token-9",
            Source::FraudDetection,
            EventData::WashTrading(WashTradingData {
                nft_id: "token-9".to_string(),
                confidence: Some(confidence),
                involved_addresses: vec!["0xa".to_string(), "0xb".to_string()],
                results: serde_json::json!({}),
            }),
        )
    }

    #[test]
    fn test_category_table() {
        let classifier = EventClassifier::new();
        let classification = classifier.classify(&sale(1.0));
        assert_eq!(classification.category, EventCategory::MarketActivity);

        let classification = classifier.classify(&wash_trading(0.5));
        assert_eq!(classification.category, EventCategory::MarketManipulation);
    }

    #[test]
    fn test_impact_clamped_at_one() {
        let classifier = EventClassifier::new();
        // 0.9 base + 0.1 nft-level + 0.3 confidence boost would exceed 1.0
        let classification = classifier.classify(&wash_trading(0.95));
        assert_eq!(classification.impact, 1.0);
        assert_eq!(classification.urgency, Urgency::High);
    }

    #[test]
    fn test_entity_level_adjustment() {
        let classifier = EventClassifier::new();
        let nft_sale = classifier.classify(&sale(1.0));
        assert!((nft_sale.impact - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_low_impact_kinds_are_low_urgency() {
        let classifier = EventClassifier::new();
        let event = Event::new(
            EventKind::SocialFollowerChange,
            EntityType::Creator,
            "creator-1",
            Source::SocialMedia,
            EventData::MetricDelta(trustscore_shared::MetricDeltaData {
                metric: "followers".to_string(),
                previous: 100.0,
                current: 112.0,
                delta: 12.0,
                percentage_change: Some(12.0),
                standard_deviations: None,
                magnitude: None,
                direction: trustscore_shared::DeltaDirection::Up,
                timeframe_ms: 60_000,
                provider: "test".to_string(),
            }),
        );
        let classification = classifier.classify(&event);
        assert_eq!(classification.urgency, Urgency::Low);
        assert!(classification.impact < 0.4);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = EventClassifier::new();
        let event = sale(5.0);
        assert_eq!(classifier.classify(&event), classifier.classify(&event));
    }

    #[test]
    fn test_dependency_ranks() {
        let classifier = EventClassifier::new();
        assert_eq!(classifier.dependency_rank(&EventKind::NftSale), 0);
        assert_eq!(
            classifier.dependency_rank(&EventKind::MarketFloorPriceChange),
            1
        );
        assert_eq!(classifier.dependency_rank(&EventKind::FraudWashTrading), 1);
    }

    #[test]
    fn test_notification_inherits_base_classification() {
        let classifier = EventClassifier::new();
        let event = sale(1.0);
        let twin = event.to_notification(7);
        assert_eq!(
            classifier.classify(&twin).category,
            classifier.classify(&event).category
        );
    }
}
