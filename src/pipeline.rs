//! Per-message relay pipeline.
//!
//! Stages run in order and the first failure ends processing with a
//! `DropReason`: Received -> Filtered -> LinkResolved -> QuotaChecked ->
//! Translating -> Shaped -> Dispatched. Every failure is resolved inside the
//! message's own task and never affects sibling messages.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::discord::{MemberIdentity, OutboundMessage, Platform};
use crate::error::{DropReason, PlatformError, TranslateError};
use crate::events::{ChannelDeleteEvent, Id, MessageEvent, PlatformEvent};
use crate::filter::{CooldownDedupeFilter, GatedText};
use crate::links::{LinkDirectory, LinkTarget};
use crate::metrics::{MetricsReport, RelayMetrics};
use crate::quota::{warning_text, QuotaGuard, QuotaService, DISABLED_NOTICE, EXHAUSTED_NOTICE};
use crate::shaper::{self, is_relayed};
use crate::translate::{GuardedTranslator, Translator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStage {
    Received,
    Filtered,
    LinkResolved,
    QuotaChecked,
    Translating,
    Shaped,
    Dispatched,
}

impl RelayStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStage::Received => "received",
            RelayStage::Filtered => "filtered",
            RelayStage::LinkResolved => "link_resolved",
            RelayStage::QuotaChecked => "quota_checked",
            RelayStage::Translating => "translating",
            RelayStage::Shaped => "shaped",
            RelayStage::Dispatched => "dispatched",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Relayed {
        target: Id,
        translated: bool,
        /// Attachment link messages delivered after the main message
        follow_ups: usize,
    },
    Dropped {
        stage: RelayStage,
        reason: DropReason,
    },
}

impl RelayOutcome {
    pub fn dropped(stage: RelayStage, reason: DropReason) -> Self {
        RelayOutcome::Dropped { stage, reason }
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            RelayOutcome::Dropped { reason, .. } => Some(*reason),
            RelayOutcome::Relayed { .. } => None,
        }
    }
}

/// Shared collaborators of the pipeline
pub struct RelayDeps {
    pub links: Arc<dyn LinkDirectory>,
    pub quota: Arc<dyn QuotaService>,
    pub platform: Arc<dyn Platform>,
    pub provider: Arc<dyn Translator>,
    pub metrics: Arc<RelayMetrics>,
}

pub struct RelayPipeline {
    links: Arc<dyn LinkDirectory>,
    quota: Arc<dyn QuotaService>,
    platform: Arc<dyn Platform>,
    translator: GuardedTranslator,
    filter: CooldownDedupeFilter,
    quota_guard: QuotaGuard,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<RelayMetrics>,
}

type StageResult<T> = Result<T, RelayOutcome>;

impl RelayPipeline {
    pub fn new(config: &Config, deps: RelayDeps) -> Self {
        let breaker = Arc::new(CircuitBreaker::from_config(config));
        let translator = GuardedTranslator::new(
            deps.provider,
            config,
            breaker.clone(),
            deps.metrics.clone(),
        );
        Self {
            links: deps.links,
            quota: deps.quota,
            platform: deps.platform,
            translator,
            filter: CooldownDedupeFilter::from_config(config),
            quota_guard: QuotaGuard::from_config(config),
            breaker,
            metrics: deps.metrics,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn links(&self) -> &Arc<dyn LinkDirectory> {
        &self.links
    }

    pub fn metrics_report(&self) -> MetricsReport {
        self.metrics.report(self.breaker.trips())
    }

    /// Route an inbound event. Message events are processed on their own task.
    pub async fn handle_event(self: &Arc<Self>, event: PlatformEvent) {
        match event {
            PlatformEvent::MessageCreate(msg) => {
                let pipeline = Arc::clone(self);
                tokio::spawn(async move {
                    pipeline.handle_message(msg).await;
                });
            }
            PlatformEvent::ChannelDelete(ev) => self.handle_channel_delete(ev).await,
        }
    }

    /// Forget every link touching a deleted channel
    pub async fn handle_channel_delete(&self, ev: ChannelDeleteEvent) {
        match self.links.unlink_channel(ev.guild_id, ev.channel_id).await {
            Ok(0) => debug!("Deleted channel {} had no links", ev.channel_id),
            Ok(removed) => info!(
                "Removed {} link rows for deleted channel {} in guild {}",
                removed, ev.channel_id, ev.guild_id
            ),
            Err(e) => error!("Failed to unlink deleted channel {}: {}", ev.channel_id, e),
        }
    }

    /// Sweep expired cooldown, dedupe and notice entries
    pub fn housekeeping(&self) {
        let now = Instant::now();
        self.filter.sweep(now);
        self.quota_guard.sweep(now);
        let (users, channels, recent) = self.filter.tracked();
        debug!(
            "Housekeeping: tracking {} users, {} channels, {} recent texts",
            users, channels, recent
        );
    }

    /// Process one message end to end
    pub async fn handle_message(&self, msg: MessageEvent) -> RelayOutcome {
        self.metrics.record_received();
        let outcome = match self.run(&msg).await {
            Ok(outcome) | Err(outcome) => outcome,
        };

        match &outcome {
            RelayOutcome::Relayed {
                target, translated, ..
            } => {
                self.metrics.record_relayed(*translated);
                info!(
                    "Relayed message {} from channel {} to {} (translated: {})",
                    msg.id, msg.channel_id, target, translated
                );
            }
            RelayOutcome::Dropped { stage, reason } => {
                self.metrics.record_drop(*reason);
                debug!(
                    "Dropped message {} in channel {} at {}: {}",
                    msg.id,
                    msg.channel_id,
                    stage.as_str(),
                    reason
                );
            }
        }
        outcome
    }

    async fn run(&self, msg: &MessageEvent) -> StageResult<RelayOutcome> {
        let guild = self.check_received(msg)?;

        self.filter
            .settle_proxy_race(self.platform.as_ref(), msg)
            .await
            .map_err(|r| RelayOutcome::dropped(RelayStage::Filtered, r))?;
        let gated = self
            .filter
            .admit(msg, Instant::now())
            .map_err(|r| RelayOutcome::dropped(RelayStage::Filtered, r))?;

        let link = self.resolve_link(guild, msg.channel_id).await?;

        self.check_quota(guild, msg.channel_id, &gated).await?;

        let text = self.translate(&gated, &link).await?;

        let shaped = shaper::shape(&text, &msg.attachments);

        let identity = self.resolve_identity(guild, msg).await;
        self.dispatch(link.target_channel, &identity, shaped, gated.should_translate)
            .await
    }

    fn check_received(&self, msg: &MessageEvent) -> StageResult<Id> {
        let dropped = |reason| Err(RelayOutcome::dropped(RelayStage::Received, reason));

        let Some(guild) = msg.guild_id else {
            return dropped(DropReason::NotInGuild);
        };
        if let Some(webhook) = msg.webhook_id {
            if self.platform.is_own_webhook(webhook) {
                return dropped(DropReason::AlreadyRelayed);
            }
        }
        if msg.author.bot && !msg.is_proxy_origin() {
            return dropped(DropReason::AutomatedAuthor);
        }
        if is_relayed(&msg.content) {
            return dropped(DropReason::AlreadyRelayed);
        }
        Ok(guild)
    }

    async fn resolve_link(&self, guild: Id, channel: Id) -> StageResult<LinkTarget> {
        let dropped = |reason| RelayOutcome::dropped(RelayStage::LinkResolved, reason);

        let link = match self.links.get_link(guild, channel).await {
            Ok(Some(link)) => link,
            Ok(None) => return Err(dropped(DropReason::LinkNotFound)),
            Err(e) => {
                error!("Link lookup failed for channel {}: {}", channel, e);
                return Err(dropped(DropReason::LinkNotFound));
            }
        };

        if link.target_channel == channel {
            warn!("Channel {} is linked to itself, ignoring", channel);
            return Err(dropped(DropReason::InvalidTarget));
        }
        Ok(link)
    }

    async fn send_notice(&self, channel: Id, text: &str) {
        if let Err(e) = self.platform.send_channel_message(channel, text).await {
            warn!("Failed to send notice in channel {}: {}", channel, e);
        }
    }

    async fn check_quota(&self, guild: Id, channel: Id, gated: &GatedText) -> StageResult<()> {
        let dropped = |reason| RelayOutcome::dropped(RelayStage::QuotaChecked, reason);

        if let Err(e) = self.quota.ensure_guild_row(guild).await {
            debug!("Could not ensure quota row for guild {}: {}", guild, e);
        }

        let snapshot = match self.quota.get_quota(guild).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Quota lookup failed for guild {}: {}", guild, e);
                return Err(dropped(DropReason::QuotaUnavailable));
            }
        };

        if !snapshot.translate_enabled {
            if self.quota_guard.disabled_notice_due(guild, Instant::now()) {
                self.send_notice(channel, DISABLED_NOTICE).await;
            }
            return Err(dropped(DropReason::TranslationDisabled));
        }

        if !gated.should_translate {
            return Ok(());
        }

        let amount = gated.text.chars().count() as u64;
        let consumed = match self.quota.consume_chars(guild, amount).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Quota consume failed for guild {}: {}", guild, e);
                return Err(dropped(DropReason::QuotaUnavailable));
            }
        };

        if !consumed.allowed {
            if self.quota_guard.exhausted_notice_due(guild, Instant::now()) {
                self.send_notice(channel, EXHAUSTED_NOTICE).await;
            }
            return Err(dropped(DropReason::QuotaExhausted));
        }
        self.metrics.record_translated_chars(amount);

        match self.quota.get_quota(guild).await {
            Ok(fresh) => {
                if self.quota_guard.observe_usage(guild, &fresh) {
                    let text = warning_text(&fresh, self.quota_guard.warn_ratio());
                    let platform = Arc::clone(&self.platform);
                    let metrics = Arc::clone(&self.metrics);
                    tokio::spawn(async move {
                        notify_quota_warning(platform.as_ref(), guild, &text, &metrics).await;
                    });
                }
            }
            Err(e) => warn!("Quota re-read failed for guild {}: {}", guild, e),
        }
        Ok(())
    }

    async fn translate(&self, gated: &GatedText, link: &LinkTarget) -> StageResult<String> {
        if !gated.should_translate {
            return Ok(gated.text.clone());
        }

        self.translator
            .translate(&gated.text, &link.source_lang, &link.target_lang)
            .await
            .map_err(|e| {
                let reason = match &e {
                    TranslateError::CircuitOpen => DropReason::CircuitOpen,
                    _ => {
                        warn!("Translation {} -> {} failed: {}", link.source_lang, link.target_lang, e);
                        DropReason::TranslationFailed
                    }
                };
                RelayOutcome::dropped(RelayStage::Translating, reason)
            })
    }

    /// Proxy posts keep the name and avatar they were posted with; ordinary
    /// authors are re-fetched to pick up their server nickname.
    async fn resolve_identity(&self, guild: Id, msg: &MessageEvent) -> MemberIdentity {
        let from_event = MemberIdentity {
            display_name: msg.author.display_name().to_string(),
            avatar_url: Some(msg.author.avatar_url()),
        };
        if msg.is_proxy_origin() {
            return from_event;
        }

        match self.platform.fetch_member(guild, msg.author.id).await {
            Ok(identity) => MemberIdentity {
                avatar_url: identity.avatar_url.or(from_event.avatar_url),
                display_name: identity.display_name,
            },
            Err(e) => {
                debug!("Member lookup for {} failed, using event author: {}", msg.author.id, e);
                from_event
            }
        }
    }

    async fn dispatch(
        &self,
        target: Id,
        identity: &MemberIdentity,
        shaped: shaper::ShapedMessage,
        translated: bool,
    ) -> StageResult<RelayOutcome> {
        let dropped = |reason| RelayOutcome::dropped(RelayStage::Dispatched, reason);

        let webhook = match self.platform.ensure_webhook(target).await {
            Ok(webhook) => webhook,
            Err(e) => {
                warn!("No webhook available in channel {}: {}", target, e);
                return Err(dropped(DropReason::IdentityUnavailable));
            }
        };

        let message = OutboundMessage::new(identity, shaped.content, shaped.embeds);
        let sent = self.platform.execute_webhook(&webhook, &message).await;
        let webhook = match sent {
            Ok(()) => webhook,
            Err(e) => {
                warn!("Webhook send to channel {} failed, retrying text-only: {}", target, e);
                // A deleted webhook never recovers; resolve a fresh one for the retry
                let webhook = match e {
                    PlatformError::NotFound => match self.platform.ensure_webhook(target).await {
                        Ok(fresh) => fresh,
                        Err(e) => {
                            warn!("Could not replace webhook in channel {}: {}", target, e);
                            return Err(dropped(DropReason::DispatchFailed));
                        }
                    },
                    _ => webhook,
                };
                if let Err(e) = self.platform.execute_webhook(&webhook, &message.text_only()).await {
                    warn!("Text-only webhook send to channel {} failed: {}", target, e);
                    return Err(dropped(DropReason::DispatchFailed));
                }
                webhook
            }
        };

        let mut follow_ups = 0;
        for links in shaped.follow_up {
            let extra = OutboundMessage::new(identity, links, Vec::new());
            match self.platform.execute_webhook(&webhook, &extra).await {
                Ok(()) => follow_ups += 1,
                Err(e) => warn!("Attachment follow-up to channel {} failed: {}", target, e),
            }
        }

        Ok(RelayOutcome::Relayed {
            target,
            translated,
            follow_ups,
        })
    }
}

/// DM the guild owner, falling back to the first human administrator
async fn notify_quota_warning(platform: &dyn Platform, guild: Id, text: &str, metrics: &RelayMetrics) {
    match platform.guild_owner(guild).await {
        Ok(owner) => match platform.send_direct_message(owner, text).await {
            Ok(()) => {
                metrics.record_quota_warning();
                info!("Sent quota warning to owner of guild {}", guild);
                return;
            }
            Err(e) => warn!("Could not DM owner of guild {}: {}", guild, e),
        },
        Err(e) => warn!("Could not resolve owner of guild {}: {}", guild, e),
    }

    match platform.first_human_admin(guild).await {
        Ok(Some(admin)) => match platform.send_direct_message(admin, text).await {
            Ok(()) => {
                metrics.record_quota_warning();
                info!("Sent quota warning to admin {} of guild {}", admin, guild);
            }
            Err(e) => warn!("Could not DM admin {} of guild {}: {}", admin, guild, e),
        },
        Ok(None) => info!("No owner or admin reachable for quota warning in guild {}", guild),
        Err(e) => warn!("Admin lookup failed for guild {}: {}", guild, e),
    }
}
