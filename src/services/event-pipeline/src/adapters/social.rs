//! # Social Media Adapter
//!
//! Polls social providers for mention frequency, sentiment, follower and
//! community metrics per monitored entity and emits events when a change
//! crosses its significance threshold.

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

/// Snapshot metrics watched by the social poller
fn social_rules(config: &PollerConfig) -> Vec<MetricRule> {
    let thresholds = &config.thresholds;
    vec![
        MetricRule {
            metric: "mention_frequency",
            kind: EventKind::SocialMentionFrequency,
            significance: Significance::Percentage(thresholds.mention_frequency_pct),
        },
        MetricRule {
            metric: "sentiment",
            kind: EventKind::SocialSentimentShift,
            significance: Significance::Absolute(thresholds.sentiment_abs),
        },
        MetricRule {
            metric: "followers",
            kind: EventKind::SocialFollowerChange,
            significance: Significance::Percentage(thresholds.followers_pct),
        },
        MetricRule {
            metric: "community_size",
            kind: EventKind::SocialCommunityGrowth,
            significance: Significance::Percentage(thresholds.community_pct),
        },
        // any new announcement counts as material
        MetricRule {
            metric: "announcements",
            kind: EventKind::SocialCreatorAnnouncement,
            significance: Significance::Absolute(1.0),
        },
    ]
}

/// Polling adapter over social-media providers
#[derive(Clone)]
pub struct SocialMediaAdapter {
    inner: PollingAdapter,
}

impl SocialMediaAdapter {
    pub fn new(
        config: PollerConfig,
        sink: Arc<dyn EventSink>,
        recovery: Arc<RecoveryManager>,
        signals: SignalBus,
    ) -> Self {
        let rules = social_rules(&config);
        Self {
            inner: PollingAdapter::new(
                "social_media",
                Source::SocialMedia,
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
impl SourceAdapter for SocialMediaAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn source(&self) -> Source {
        Source::SocialMedia
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
