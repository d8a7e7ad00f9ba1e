//! Event schema definitions for the TrustScore platform
//!
//! This module defines the uniform event record produced by every source
//! adapter, the closed event-kind taxonomy, and the typed per-kind payloads
//! carried through the pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Entity types that events can be associated with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Nft,
    Collection,
    Creator,
    Market,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Nft,
        EntityType::Collection,
        EntityType::Creator,
        EntityType::Market,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Nft => "nft",
            EntityType::Collection => "collection",
            EntityType::Creator => "creator",
            EntityType::Market => "market",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown entity type string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity type: {0}")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .find(|entity| entity.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownEntityType(s.to_string()))
    }
}

/// External systems that feed events into the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    Blockchain,
    FraudDetection,
    SocialMedia,
    MarketCondition,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Blockchain => "blockchain",
            Source::FraudDetection => "fraudDetection",
            Source::SocialMedia => "socialMedia",
            Source::MarketCondition => "marketCondition",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed event-kind taxonomy
///
/// The string form of each kind is part of the external contract; it is the
/// value carried on the wire and matched by handler registrations. Synthesized
/// notification events wrap the kind that triggered them and render as
/// `notification_<kind>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    // Blockchain
    NftTransfer,
    NftSale,
    NftMint,
    ContractUpdate,
    CreatorActivity,
    CollectionPriceUpdate,
    // Fraud detection
    FraudImageAnalysis,
    FraudSimilarityScore,
    FraudWashTrading,
    FraudMetadataValidation,
    // Social media
    SocialMentionFrequency,
    SocialSentimentShift,
    SocialFollowerChange,
    SocialCreatorAnnouncement,
    SocialCommunityGrowth,
    // Market condition
    MarketFloorPriceChange,
    MarketVolumeAnomaly,
    MarketTrendShift,
    MarketSimilarNftSale,
    MarketCreatorPortfolioChange,
    // Synthesized notification wrapping the triggering kind
    Notification(Box<EventKind>),
}

impl EventKind {
    /// Every concrete (non-notification) kind, in taxonomy order
    pub const CONCRETE: [EventKind; 20] = [
        EventKind::NftTransfer,
        EventKind::NftSale,
        EventKind::NftMint,
        EventKind::ContractUpdate,
        EventKind::CreatorActivity,
        EventKind::CollectionPriceUpdate,
        EventKind::FraudImageAnalysis,
        EventKind::FraudSimilarityScore,
        EventKind::FraudWashTrading,
        EventKind::FraudMetadataValidation,
        EventKind::SocialMentionFrequency,
        EventKind::SocialSentimentShift,
        EventKind::SocialFollowerChange,
        EventKind::SocialCreatorAnnouncement,
        EventKind::SocialCommunityGrowth,
        EventKind::MarketFloorPriceChange,
        EventKind::MarketVolumeAnomaly,
        EventKind::MarketTrendShift,
        EventKind::MarketSimilarNftSale,
        EventKind::MarketCreatorPortfolioChange,
    ];

    /// The underlying kind, unwrapping a notification wrapper
    pub fn base(&self) -> &EventKind {
        match self {
            EventKind::Notification(inner) => inner.base(),
            other => other,
        }
    }

    /// Whether this kind is a synthesized notification
    pub fn is_notification(&self) -> bool {
        matches!(self, EventKind::Notification(_))
    }

    /// Fraud-detection kinds receive a notification priority bonus
    pub fn is_fraud(&self) -> bool {
        matches!(
            self.base(),
            EventKind::FraudImageAnalysis
                | EventKind::FraudSimilarityScore
                | EventKind::FraudWashTrading
                | EventKind::FraudMetadataValidation
        )
    }

    /// Price-bearing kinds receive a smaller notification priority bonus
    pub fn is_price_related(&self) -> bool {
        matches!(
            self.base(),
            EventKind::NftSale
                | EventKind::CollectionPriceUpdate
                | EventKind::MarketFloorPriceChange
                | EventKind::MarketSimilarNftSale
        )
    }

    fn concrete_str(&self) -> &'static str {
        match self {
            EventKind::NftTransfer => "nft_transfer",
            EventKind::NftSale => "nft_sale",
            EventKind::NftMint => "nft_mint",
            EventKind::ContractUpdate => "contract_update",
            EventKind::CreatorActivity => "creator_activity",
            EventKind::CollectionPriceUpdate => "collection_price_update",
            EventKind::FraudImageAnalysis => "fraud_image_analysis",
            EventKind::FraudSimilarityScore => "fraud_similarity_score",
            EventKind::FraudWashTrading => "fraud_wash_trading",
            EventKind::FraudMetadataValidation => "fraud_metadata_validation",
            EventKind::SocialMentionFrequency => "social_mention_frequency",
            EventKind::SocialSentimentShift => "social_sentiment_shift",
            EventKind::SocialFollowerChange => "social_follower_change",
            EventKind::SocialCreatorAnnouncement => "social_creator_announcement",
            EventKind::SocialCommunityGrowth => "social_community_growth",
            EventKind::MarketFloorPriceChange => "market_floor_price_change",
            EventKind::MarketVolumeAnomaly => "market_volume_anomaly",
            EventKind::MarketTrendShift => "market_trend_shift",
            EventKind::MarketSimilarNftSale => "market_similar_nft_sale",
            EventKind::MarketCreatorPortfolioChange => "market_creator_portfolio_change",
            EventKind::Notification(_) => unreachable!("notification kinds render via Display"),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Notification(inner) => write!(f, "notification_{}", inner),
            other => f.write_str(other.concrete_str()),
        }
    }
}

/// Error returned when parsing an unknown event kind string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(inner) = s.strip_prefix("notification_") {
            return Ok(EventKind::Notification(Box::new(inner.parse()?)));
        }
        EventKind::CONCRETE
            .iter()
            .find(|kind| kind.concrete_str() == s)
            .cloned()
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Direction of a polled metric delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaDirection {
    Up,
    Down,
    Flat,
}

impl DeltaDirection {
    pub fn of(delta: f64) -> Self {
        if delta > 0.0 {
            DeltaDirection::Up
        } else if delta < 0.0 {
            DeltaDirection::Down
        } else {
            DeltaDirection::Flat
        }
    }
}

/// On-chain token transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferData {
    pub token_id: String,
    pub from_address: String,
    pub to_address: String,
    pub tx_hash: String,
}

/// On-chain sale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleData {
    pub token_id: String,
    /// Sale price in the chain's native currency
    pub price: f64,
    pub currency: String,
    pub buyer: String,
    pub seller: String,
    pub marketplace: Option<String>,
    pub tx_hash: Option<String>,
}

/// On-chain mint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintData {
    pub token_id: String,
    pub creator: String,
    pub tx_hash: String,
}

/// Contract-level change observed on chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractUpdateData {
    pub contract_address: String,
    pub change: String,
    pub tx_hash: Option<String>,
}

/// Creator action observed on chain or announced off chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatorActionData {
    pub creator_id: String,
    pub action: String,
    pub details: serde_json::Value,
}

/// Collection price movement reported by the chain monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdateData {
    pub collection_id: String,
    pub floor_price: f64,
    pub previous_floor: Option<f64>,
    /// Relative change as a fraction (0.2 = +20 %)
    pub price_change: Option<f64>,
}

/// Fraud-detection image analysis result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAnalysisData {
    pub nft_id: String,
    pub confidence: Option<f64>,
    pub flags: Vec<String>,
    pub results: serde_json::Value,
}

/// Fraud-detection similarity score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityData {
    pub nft_id: String,
    pub similarity_score: f64,
    pub similar_nfts: Vec<String>,
    pub threshold: Option<f64>,
}

/// Fraud-detection wash-trading verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WashTradingData {
    pub nft_id: String,
    pub confidence: Option<f64>,
    pub involved_addresses: Vec<String>,
    pub results: serde_json::Value,
}

/// Fraud-detection metadata validation outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataValidationData {
    pub nft_id: String,
    pub issues: Vec<String>,
    pub results: serde_json::Value,
}

/// Significant change detected by a polling adapter
///
/// Carries the previous and new values of the monitored metric along with the
/// delta that crossed the significance threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDeltaData {
    /// Monitored metric name (e.g. `floor_price`, `sentiment`, `followers`)
    pub metric: String,
    pub previous: f64,
    pub current: f64,
    pub delta: f64,
    /// Relative change in percent, when the metric has a meaningful baseline
    pub percentage_change: Option<f64>,
    /// Deviation from the rolling history in standard deviations
    pub standard_deviations: Option<f64>,
    /// Absolute shift magnitude for bounded metrics such as sentiment
    pub magnitude: Option<f64>,
    pub direction: DeltaDirection,
    /// Observation window covered by the delta, in milliseconds
    pub timeframe_ms: i64,
    pub provider: String,
}

/// Typed event payload, one variant per payload family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventData {
    Transfer(TransferData),
    Sale(SaleData),
    Mint(MintData),
    ContractUpdate(ContractUpdateData),
    CreatorAction(CreatorActionData),
    PriceUpdate(PriceUpdateData),
    FraudAnalysis(FraudAnalysisData),
    Similarity(SimilarityData),
    WashTrading(WashTradingData),
    MetadataValidation(MetadataValidationData),
    MetricDelta(MetricDeltaData),
}

/// Semantic identity used for queue conflation
pub type ConflationKey = (EntityType, String, EventKind);

/// The atomic unit of work flowing through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier; duplicates within a topic are dropped
    pub id: String,

    /// Event kind from the closed taxonomy
    pub kind: EventKind,

    /// Entity this event is routed against
    pub entity_type: EntityType,
    pub entity_id: String,

    /// Originating external system
    pub source: Source,

    /// Set by the adapter at normalization time
    pub timestamp: DateTime<Utc>,

    /// Set by the engine on intake; drives end-to-end latency measurement
    pub received_at: DateTime<Utc>,

    /// Assigned once by the prioritizer; fixed for the event's lifetime
    pub priority: Option<u8>,

    /// Typed per-kind payload
    pub data: EventData,
}

impl Event {
    pub fn new(
        kind: EventKind,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        source: Source,
        data: EventData,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            entity_type,
            entity_id: entity_id.into(),
            source,
            timestamp: now,
            received_at: now,
            priority: None,
            data,
        }
    }

    /// Semantic key for conflation: latest wins per `(entity, kind)`
    pub fn conflation_key(&self) -> ConflationKey {
        (self.entity_type, self.entity_id.clone(), self.kind.clone())
    }

    /// Assigned priority, or the neutral default when not yet prioritized
    pub fn priority_or_default(&self) -> u8 {
        self.priority.unwrap_or(5)
    }

    /// Synthesize the notification twin of this event
    ///
    /// The notification gets a fresh id, a `notification_<kind>` kind and the
    /// priority decided by the router; the payload is carried over verbatim.
    pub fn to_notification(&self, priority: u8) -> Event {
        Event {
            id: Uuid::new_v4().to_string(),
            kind: EventKind::Notification(Box::new(self.kind.clone())),
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            source: self.source,
            timestamp: self.timestamp,
            received_at: self.received_at,
            priority: Some(priority.min(10)),
            data: self.data.clone(),
        }
    }

    /// Sale price, when the payload carries one
    pub fn price(&self) -> Option<f64> {
        match &self.data {
            EventData::Sale(sale) => Some(sale.price),
            EventData::PriceUpdate(update) => Some(update.floor_price),
            _ => None,
        }
    }

    /// Relative price change as a fraction (0.2 = 20 %)
    pub fn price_change(&self) -> Option<f64> {
        match &self.data {
            EventData::PriceUpdate(update) => update.price_change,
            EventData::MetricDelta(delta) => delta.percentage_change.map(|pct| pct / 100.0),
            _ => None,
        }
    }

    /// Relative change in percent for polled metrics
    pub fn percentage_change(&self) -> Option<f64> {
        match &self.data {
            EventData::MetricDelta(delta) => delta.percentage_change,
            EventData::PriceUpdate(update) => update.price_change.map(|frac| frac * 100.0),
            _ => None,
        }
    }

    /// Detection confidence reported by fraud payloads
    pub fn fraud_confidence(&self) -> Option<f64> {
        match &self.data {
            EventData::FraudAnalysis(analysis) => analysis.confidence,
            EventData::WashTrading(wash) => wash.confidence,
            EventData::Similarity(similarity) => Some(similarity.similarity_score),
            _ => None,
        }
    }

    /// Shift magnitude for sentiment payloads
    pub fn sentiment_shift(&self) -> Option<f64> {
        if !matches!(self.kind.base(), EventKind::SocialSentimentShift) {
            return None;
        }
        match &self.data {
            EventData::MetricDelta(delta) => delta.magnitude.or(Some(delta.delta.abs())),
            _ => None,
        }
    }

    /// Deviation in σ for anomaly payloads
    pub fn standard_deviations(&self) -> Option<f64> {
        match &self.data {
            EventData::MetricDelta(delta) => delta.standard_deviations,
            _ => None,
        }
    }
}
