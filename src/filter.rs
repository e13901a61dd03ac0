//! Per-user and per-channel cooldowns, duplicate suppression, the length
//! gate and the proxy-race guard.
//!
//! Every check short-circuits: the first rejection wins and later checks do
//! not run (and do not record anything).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::Config;
use crate::discord::Platform;
use crate::error::{DropReason, PlatformError};
use crate::events::{contains_url, Id, MessageEvent};

/// Normalized text kept for duplicate comparison is capped to this many chars
const DEDUPE_TEXT_CHARS: usize = 140;

/// Entries younger than this are never swept
const MIN_SWEEP_AGE: Duration = Duration::from_secs(120);

/// Suffix appended to texts cut at `max_len`
const TRUNCATION_SUFFIX: &str = " (…)";

#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub user_cooldown: Duration,
    pub channel_cooldown: Duration,
    pub dedupe_window: Duration,
    /// Duplicate suppression is only active in event mode
    pub dedupe_enabled: bool,
    pub min_len: usize,
    pub max_len: usize,
    pub sweep_threshold: usize,
    pub proxy_settle_delay: Duration,
}

impl FilterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_cooldown: config.effective_user_cooldown(),
            channel_cooldown: config.effective_channel_cooldown(),
            dedupe_window: config.dedupe_window,
            dedupe_enabled: config.event_mode,
            min_len: config.min_msg_len,
            max_len: config.max_msg_len,
            sweep_threshold: config.cooldown_sweep_threshold,
            proxy_settle_delay: config.proxy_settle_delay,
        }
    }
}

/// Text that passed the length gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatedText {
    pub text: String,
    /// False for short texts relayed only because of attachments or links
    pub should_translate: bool,
}

#[derive(Debug, Clone)]
struct DedupeEntry {
    text: String,
    seen_at: Instant,
}

/// Whitespace collapsed, case preserved, capped at `DEDUPE_TEXT_CHARS`
fn normalize_for_dedupe(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(DEDUPE_TEXT_CHARS)
        .collect()
}

fn sweep_older_than<K>(map: &mut HashMap<K, Instant>, now: Instant, max_age: Duration)
where
    K: std::hash::Hash + Eq,
{
    map.retain(|_, seen| now.saturating_duration_since(*seen) < max_age);
}

pub struct CooldownDedupeFilter {
    settings: FilterSettings,
    users: Mutex<HashMap<Id, Instant>>,
    channels: Mutex<HashMap<Id, Instant>>,
    recent: Mutex<HashMap<(Id, Id), DedupeEntry>>,
}

impl CooldownDedupeFilter {
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            settings,
            users: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(FilterSettings::from_config(config))
    }

    pub fn settings(&self) -> &FilterSettings {
        &self.settings
    }

    fn sweep_age(window: Duration) -> Duration {
        (window * 2).max(MIN_SWEEP_AGE)
    }

    /// Wait briefly, then confirm an ordinary message was not replaced by a
    /// proxy re-post. Lookup errors other than not-found let the message through.
    pub async fn settle_proxy_race(
        &self,
        platform: &dyn Platform,
        msg: &MessageEvent,
    ) -> Result<(), DropReason> {
        if msg.is_proxy_origin() || msg.author.bot {
            return Ok(());
        }

        sleep(self.settings.proxy_settle_delay).await;
        match platform.message_exists(msg.channel_id, msg.id).await {
            Ok(true) => Ok(()),
            Ok(false) | Err(PlatformError::NotFound) => Err(DropReason::SupersededByProxy),
            Err(e) => {
                debug!("Proxy race check for message {} failed, continuing: {}", msg.id, e);
                Ok(())
            }
        }
    }

    fn check_cooldown(
        map: &Mutex<HashMap<Id, Instant>>,
        key: Id,
        window: Duration,
        sweep_threshold: usize,
        now: Instant,
    ) -> bool {
        let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = map.get(&key) {
            if now.saturating_duration_since(*last) < window {
                return false;
            }
        }
        map.insert(key, now);
        if map.len() > sweep_threshold {
            sweep_older_than(&mut map, now, Self::sweep_age(window));
        }
        true
    }

    /// Reject if the author posted less than the user cooldown ago; otherwise record now
    pub fn check_user_cooldown(&self, user: Id, now: Instant) -> Result<(), DropReason> {
        let ok = Self::check_cooldown(
            &self.users,
            user,
            self.settings.user_cooldown,
            self.settings.sweep_threshold,
            now,
        );
        if ok {
            Ok(())
        } else {
            Err(DropReason::UserCooldown)
        }
    }

    /// Reject if the channel relayed less than the channel cooldown ago; otherwise record now
    pub fn check_channel_cooldown(&self, channel: Id, now: Instant) -> Result<(), DropReason> {
        let ok = Self::check_cooldown(
            &self.channels,
            channel,
            self.settings.channel_cooldown,
            self.settings.sweep_threshold,
            now,
        );
        if ok {
            Ok(())
        } else {
            Err(DropReason::ChannelCooldown)
        }
    }

    /// Apply the length gate to trimmed message text
    pub fn gate_length(&self, content: &str, has_attachments: bool) -> Result<GatedText, DropReason> {
        let mut text = content.trim().to_string();
        let len = text.chars().count();

        if len < self.settings.min_len && !has_attachments && !contains_url(&text) {
            return Err(DropReason::TooShort);
        }

        if len > self.settings.max_len {
            text = text.chars().take(self.settings.max_len).collect();
            text.push_str(TRUNCATION_SUFFIX);
        }

        let should_translate = text.chars().count() >= self.settings.min_len;
        Ok(GatedText {
            text,
            should_translate,
        })
    }

    /// Suppress a repeat of the same (channel, author) text inside the dedupe window
    pub fn check_duplicate(
        &self,
        channel: Id,
        author: Id,
        text: &str,
        now: Instant,
    ) -> Result<(), DropReason> {
        if !self.settings.dedupe_enabled {
            return Ok(());
        }

        let normalized = normalize_for_dedupe(text);
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(prev) = recent.get(&(channel, author)) {
            if !normalized.is_empty()
                && prev.text == normalized
                && now.saturating_duration_since(prev.seen_at) < self.settings.dedupe_window
            {
                return Err(DropReason::Duplicate);
            }
        }

        recent.insert(
            (channel, author),
            DedupeEntry {
                text: normalized,
                seen_at: now,
            },
        );
        if recent.len() > self.settings.sweep_threshold {
            let max_age = Self::sweep_age(self.settings.dedupe_window);
            recent.retain(|_, entry| now.saturating_duration_since(entry.seen_at) < max_age);
        }
        Ok(())
    }

    /// Run the synchronous checks in order: user cooldown, channel cooldown,
    /// length gate, duplicate suppression.
    pub fn admit(&self, msg: &MessageEvent, now: Instant) -> Result<GatedText, DropReason> {
        self.check_user_cooldown(msg.author.id, now)?;
        self.check_channel_cooldown(msg.channel_id, now)?;
        let gated = self.gate_length(&msg.content, msg.has_attachments())?;
        self.check_duplicate(msg.channel_id, msg.author.id, &gated.text, now)?;
        Ok(gated)
    }

    /// Drop stale entries from every map regardless of size
    pub fn sweep(&self, now: Instant) {
        {
            let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            sweep_older_than(&mut users, now, Self::sweep_age(self.settings.user_cooldown));
        }
        {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            sweep_older_than(&mut channels, now, Self::sweep_age(self.settings.channel_cooldown));
        }
        let max_age = Self::sweep_age(self.settings.dedupe_window);
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| now.saturating_duration_since(entry.seen_at) < max_age);
    }

    /// Number of tracked (users, channels, dedupe entries)
    pub fn tracked(&self) -> (usize, usize, usize) {
        (
            self.users.lock().unwrap_or_else(|e| e.into_inner()).len(),
            self.channels.lock().unwrap_or_else(|e| e.into_inner()).len(),
            self.recent.lock().unwrap_or_else(|e| e.into_inner()).len(),
        )
    }
}
