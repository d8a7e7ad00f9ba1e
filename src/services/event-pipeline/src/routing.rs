//! # Update Router
//!
//! Per-event routing decision: whether the event triggers an entity update,
//! whether it also triggers a notification, and at which priorities. Admission
//! is gated by per-entity cooldowns and a probabilistic draw against per-kind
//! thresholds; a deterministic token-bucket mode is selectable for
//! reproducible deployments.

use std::num::NonZeroU32;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use trustscore_shared::{EntityType, Event, EventKind};

use crate::config::{RouterConfig, RoutingMode};

/// Outcome of routing one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub should_update: bool,
    pub should_notify: bool,
    pub update_priority: u8,
    pub notification_priority: u8,
}

impl RouteDecision {
    fn suppressed() -> Self {
        Self {
            should_update: false,
            should_notify: false,
            update_priority: 0,
            notification_priority: 0,
        }
    }
}

enum Gate {
    Probabilistic(Mutex<StdRng>),
    TokenBucket {
        update: DefaultKeyedRateLimiter<(EntityType, EventKind)>,
        notify: DefaultKeyedRateLimiter<(EntityType, EventKind)>,
    },
}

/// Router over per-kind thresholds with per-entity cooldowns
pub struct UpdateRouter {
    config: RouterConfig,
    last_update: DashMap<(EntityType, String), DateTime<Utc>>,
    gate: Gate,
}

impl UpdateRouter {
    pub fn new(config: RouterConfig) -> Self {
        let gate = match config.mode {
            RoutingMode::Probabilistic => {
                let rng = match config.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                Gate::Probabilistic(Mutex::new(rng))
            }
            RoutingMode::TokenBucket => {
                let per_minute = config.token_bucket_per_minute.max(1);
                let notify_per_minute = ((per_minute as f64
                    * config.default_notification_threshold)
                    .ceil() as u32)
                    .max(1);
                Gate::TokenBucket {
                    update: RateLimiter::keyed(Quota::per_minute(
                        NonZeroU32::new(per_minute).expect("clamped above zero"),
                    )),
                    notify: RateLimiter::keyed(Quota::per_minute(
                        NonZeroU32::new(notify_per_minute).expect("clamped above zero"),
                    )),
                }
            }
        };

        Self {
            config,
            last_update: DashMap::new(),
            gate,
        }
    }

    /// Route one prioritized event
    pub fn route(&self, event: &Event) -> RouteDecision {
        let entity_key = (event.entity_type, event.entity_id.clone());

        if self.in_cooldown(&entity_key) {
            debug!(
                entity_type = %event.entity_type,
                entity_id = %event.entity_id,
                "routing suppressed by cooldown"
            );
            return RouteDecision::suppressed();
        }

        let kind_name = event.kind.base().to_string();
        let mut update_threshold = self
            .config
            .update_thresholds
            .get(&kind_name)
            .copied()
            .unwrap_or(self.config.default_update_threshold);
        let mut notification_threshold = self
            .config
            .notification_thresholds
            .get(&kind_name)
            .copied()
            .unwrap_or(self.config.default_notification_threshold);

        if self.config.enable_smart_routing {
            let (update_cut, notify_cut) = smart_reductions(event);
            // a reduction may not exceed the original threshold
            update_threshold = (update_threshold - update_cut.min(update_threshold)).max(0.0);
            notification_threshold =
                (notification_threshold - notify_cut.min(notification_threshold)).max(0.0);
        }

        let should_update = self.admit_update(event, update_threshold);
        // a notification is only ever considered for admitted updates
        let should_notify = should_update && self.admit_notification(event, notification_threshold);

        if !should_update {
            return RouteDecision::suppressed();
        }

        // cooldown clock advances only on admitted updates
        self.last_update.insert(entity_key, Utc::now());

        let update_priority = event.priority_or_default();
        let notification_priority = if should_notify {
            let bonus = if event.kind.is_fraud() {
                1.0
            } else if event.kind.is_price_related() {
                0.5
            } else {
                0.0
            };
            ((update_priority as f64 + bonus).round() as u8).min(10)
        } else {
            0
        };

        RouteDecision {
            should_update,
            should_notify,
            update_priority,
            notification_priority,
        }
    }

    /// Cooldown bookkeeping: entities with a recent admitted update are muted
    fn in_cooldown(&self, entity_key: &(EntityType, String)) -> bool {
        let Some(last) = self.last_update.get(entity_key) else {
            return false;
        };
        let cooldown_ms = self
            .config
            .cooldown_periods_ms
            .get(entity_key.0.as_str())
            .copied()
            .unwrap_or(60_000);
        Utc::now() - *last < Duration::milliseconds(cooldown_ms as i64)
    }

    fn admit_update(&self, event: &Event, threshold: f64) -> bool {
        match &self.gate {
            Gate::Probabilistic(rng) => rng.lock().gen::<f64>() < threshold,
            Gate::TokenBucket { update, .. } => {
                if threshold <= 0.0 {
                    return false;
                }
                update
                    .check_key(&(event.entity_type, event.kind.base().clone()))
                    .is_ok()
            }
        }
    }

    fn admit_notification(&self, event: &Event, threshold: f64) -> bool {
        match &self.gate {
            Gate::Probabilistic(rng) => rng.lock().gen::<f64>() < threshold,
            Gate::TokenBucket { notify, .. } => {
                if threshold <= 0.0 {
                    return false;
                }
                notify
                    .check_key(&(event.entity_type, event.kind.base().clone()))
                    .is_ok()
            }
        }
    }

    /// Number of entities currently tracked for cooldown purposes
    pub fn tracked_entities(&self) -> usize {
        self.last_update.len()
    }

    /// Forget cooldown state older than the longest configured cooldown
    pub fn evict_stale_cooldowns(&self) {
        let horizon = self
            .config
            .cooldown_periods_ms
            .values()
            .copied()
            .max()
            .unwrap_or(900_000);
        let cutoff = Utc::now() - Duration::milliseconds(horizon as i64);
        self.last_update.retain(|_, last| *last > cutoff);
    }
}

/// Additive threshold reductions for high-signal content
fn smart_reductions(event: &Event) -> (f64, f64) {
    match event.kind.base() {
        EventKind::NftSale => {
            if event.price().is_some_and(|price| price > 10.0) {
                (0.2, 0.3)
            } else {
                (0.0, 0.0)
            }
        }
        EventKind::FraudWashTrading => {
            if event.fraud_confidence().is_some_and(|c| c > 0.8) {
                (0.3, 0.4)
            } else {
                (0.0, 0.0)
            }
        }
        EventKind::FraudImageAnalysis => {
            if event.fraud_confidence().is_some_and(|c| c > 0.8) {
                (0.2, 0.3)
            } else {
                (0.0, 0.0)
            }
        }
        EventKind::MarketFloorPriceChange => {
            if event.percentage_change().is_some_and(|pct| pct.abs() >= 20.0) {
                (0.2, 0.3)
            } else {
                (0.0, 0.0)
            }
        }
        EventKind::MarketVolumeAnomaly => {
            if event.standard_deviations().is_some_and(|sigma| sigma > 3.0) {
                (0.2, 0.2)
            } else {
                (0.0, 0.0)
            }
        }
        EventKind::SocialSentimentShift => {
            if event.sentiment_shift().is_some_and(|shift| shift.abs() > 0.5) {
                (0.1, 0.2)
            } else {
                (0.0, 0.0)
            }
        }
        _ => (0.0, 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustscore_shared::{EventData, SaleData, Source};

    fn sale_for(entity_id: &str) -> Event {
        let mut event = Event::new(
            EventKind::NftSale,
            EntityType::Nft,
            entity_id,
            Source::Blockchain,
            EventData::Sale(SaleData {
                token_id: entity_id.to_string(),
                price: 1.0,
                currency: "ETH".to_string(),
                buyer: "0xb".to_string(),
                seller: "0xs".to_string(),
                marketplace: None,
                tx_hash: None,
            }),
        );
        event.priority = Some(8);
        event
    }

    fn always_admit_config() -> RouterConfig {
        let mut config = RouterConfig::default();
        for threshold in config.update_thresholds.values_mut() {
            *threshold = 1.0;
        }
        for threshold in config.notification_thresholds.values_mut() {
            *threshold = 1.0;
        }
        config.enable_smart_routing = false;
        config.seed = Some(7);
        config
    }

    #[test]
    fn test_cooldown_gates_second_update() {
        let router = UpdateRouter::new(always_admit_config());
        let event = sale_for("token-A");

        let first = router.route(&event);
        assert!(first.should_update);

        // still inside the 60 s nft cooldown
        let second = router.route(&event);
        assert!(!second.should_update);
        assert!(!second.should_notify);
    }

    #[test]
    fn test_cooldown_is_per_entity() {
        let router = UpdateRouter::new(always_admit_config());
        assert!(router.route(&sale_for("token-A")).should_update);
        assert!(router.route(&sale_for("token-B")).should_update);
        assert_eq!(router.tracked_entities(), 2);
    }

    #[test]
    fn test_cooldown_not_advanced_on_suppression() {
        let mut config = always_admit_config();
        for threshold in config.update_thresholds.values_mut() {
            *threshold = 0.0;
        }
        let router = UpdateRouter::new(config);

        let decision = router.route(&sale_for("token-A"));
        assert!(!decision.should_update);
        assert_eq!(router.tracked_entities(), 0);
    }

    #[test]
    fn test_notification_requires_update() {
        let mut config = always_admit_config();
        for threshold in config.update_thresholds.values_mut() {
            *threshold = 0.0;
        }
        let router = UpdateRouter::new(config);
        let decision = router.route(&sale_for("token-A"));
        assert!(!decision.should_notify);
    }

    #[test]
    fn test_notification_priority_bonus() {
        let router = UpdateRouter::new(always_admit_config());

        let decision = router.route(&sale_for("token-A"));
        assert!(decision.should_notify);
        // price-related bonus +0.5 rounds 8 → 9 (banker-free rounding of 8.5)
        assert_eq!(decision.update_priority, 8);
        assert!(decision.notification_priority >= decision.update_priority);
        assert!(decision.notification_priority <= 10);
    }

    #[test]
    fn test_seeded_router_is_reproducible() {
        let decisions: Vec<Vec<bool>> = (0..2)
            .map(|_| {
                let router = UpdateRouter::new(RouterConfig {
                    seed: Some(42),
                    enable_smart_routing: false,
                    ..RouterConfig::default()
                });
                (0..50)
                    .map(|i| router.route(&sale_for(&format!("token-{i}"))).should_update)
                    .collect()
            })
            .collect();
        assert_eq!(decisions[0], decisions[1]);
    }

    #[test]
    fn test_smart_reduction_capped_at_threshold() {
        let mut config = always_admit_config();
        config.enable_smart_routing = true;
        config
            .update_thresholds
            .insert("fraud_wash_trading".to_string(), 0.1);
        let router = UpdateRouter::new(config);

        let mut event = Event::new(
            EventKind::FraudWashTrading,
            EntityType::Nft,
            "token-F",
            Source::FraudDetection,
            EventData::WashTrading(trustscore_shared::WashTradingData {
                nft_id: "token-F".to_string(),
                confidence: Some(0.95),
                involved_addresses: Vec::new(),
                results: serde_json::json!({}),
            }),
        );
        event.priority = Some(8);

        // reduction (0.3) exceeds the 0.1 threshold; the adjusted threshold
        // floors at zero instead of going negative, so the event never updates
        let decision = router.route(&event);
        assert!(!decision.should_update);
    }

    #[test]
    fn test_token_bucket_mode_admits_then_throttles() {
        let mut config = always_admit_config();
        config.mode = RoutingMode::TokenBucket;
        config.token_bucket_per_minute = 1;
        // avoid the entity cooldown interfering with the bucket assertion
        config.cooldown_periods_ms.insert("nft".to_string(), 0);
        let router = UpdateRouter::new(config);

        let admitted: Vec<bool> = (0..3)
            .map(|_| router.route(&sale_for("token-A")).should_update)
            .collect();
        assert!(admitted[0]);
        assert!(!admitted[1]);
        assert!(!admitted[2]);
    }

    #[test]
    fn test_stale_cooldown_eviction() {
        let router = UpdateRouter::new(always_admit_config());
        assert!(router.route(&sale_for("token-A")).should_update);
        router.evict_stale_cooldowns();
        // the fresh entry survives eviction
        assert_eq!(router.tracked_entities(), 1);
    }
}
