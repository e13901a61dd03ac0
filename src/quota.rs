//! Per-guild character quota: the remote quota store client and the local
//! warning/notice bookkeeping.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::Config;
use crate::error::QuotaError;
use crate::events::Id;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub const DISABLED_NOTICE: &str =
    "🚫 Translation is **not enabled** for this server. Contact the bot's owner or manager.";

pub const EXHAUSTED_NOTICE: &str =
    "⚠️ This server's translation quota is used up for now. An admin can raise the limit or wait for the monthly reset.";

/// Quota numbers for one guild
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QuotaSnapshot {
    #[serde(default)]
    pub translate_enabled: bool,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub char_limit: u64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub used_chars: u64,
}

fn null_as_zero<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or(0))
}

/// Result of an atomic consume call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    #[serde(default)]
    pub remaining: i64,
}

pub trait QuotaService: Send + Sync {
    /// Create the guild's quota row if missing (store defaults apply)
    fn ensure_guild_row(&self, guild: Id) -> BoxFuture<'_, Result<(), QuotaError>>;

    fn get_quota(&self, guild: Id) -> BoxFuture<'_, Result<QuotaSnapshot, QuotaError>>;

    /// Atomically check and debit `amount` characters
    fn consume_chars(&self, guild: Id, amount: u64) -> BoxFuture<'_, Result<ConsumeOutcome, QuotaError>>;
}

/// PostgREST-style quota store client
pub struct HttpQuotaService {
    http: reqwest::Client,
    base_url: String,
    key: String,
}

/// RPC responses arrive as a row list; accept a bare object too
fn first_row<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, QuotaError> {
    let row = match value {
        serde_json::Value::Array(rows) => rows
            .into_iter()
            .next()
            .ok_or_else(|| QuotaError::Malformed("empty row list".to_string()))?,
        other => other,
    };
    serde_json::from_value(row).map_err(|e| QuotaError::Malformed(e.to_string()))
}

impl HttpQuotaService {
    pub fn new(base_url: &str, key: &str) -> Result<Self, QuotaError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, QuotaError> {
        Self::new(&config.quota_service_url, &config.quota_service_key)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, QuotaError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QuotaError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn rpc<T: DeserializeOwned>(&self, name: &str, payload: serde_json::Value) -> Result<T, QuotaError> {
        let response = self
            .send(self.post(&format!("/rest/v1/rpc/{}", name)).json(&payload))
            .await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| QuotaError::Malformed(e.to_string()))?;
        first_row(value)
    }

    async fn upsert_guild(&self, guild: Id) -> Result<(), QuotaError> {
        let request = self
            .post("/rest/v1/guild_quotas?on_conflict=guild_id")
            .header("Prefer", "resolution=merge-duplicates")
            .json(&serde_json::json!({ "guild_id": guild }));
        self.send(request).await?;
        Ok(())
    }
}

impl QuotaService for HttpQuotaService {
    fn ensure_guild_row(&self, guild: Id) -> BoxFuture<'_, Result<(), QuotaError>> {
        Box::pin(self.upsert_guild(guild))
    }

    fn get_quota(&self, guild: Id) -> BoxFuture<'_, Result<QuotaSnapshot, QuotaError>> {
        Box::pin(self.rpc("get_guild_quota", serde_json::json!({ "p_guild_id": guild })))
    }

    fn consume_chars(&self, guild: Id, amount: u64) -> BoxFuture<'_, Result<ConsumeOutcome, QuotaError>> {
        Box::pin(self.rpc(
            "consume_guild_chars",
            serde_json::json!({ "p_guild_id": guild, "p_amount": amount }),
        ))
    }
}

/// 1234567 -> "1,234,567"
fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Text of the high-usage warning sent to the guild owner or an admin
pub fn warning_text(snapshot: &QuotaSnapshot, warn_ratio: f64) -> String {
    format!(
        "⚠️ This server has used {} of {} translation characters ({:.0}% of the monthly quota). Consider raising the limit or waiting for the reset.",
        group_thousands(snapshot.used_chars),
        group_thousands(snapshot.char_limit),
        warn_ratio * 100.0
    )
}

/// Local quota bookkeeping: which guilds were warned, and when notices were last sent.
pub struct QuotaGuard {
    warn_ratio: f64,
    low_watermark: f64,
    notice_interval: Duration,
    warned: Mutex<HashSet<Id>>,
    disabled_notices: Mutex<HashMap<Id, Instant>>,
    exhausted_notices: Mutex<HashMap<Id, Instant>>,
}

impl QuotaGuard {
    pub fn new(warn_ratio: f64, low_watermark: f64, notice_interval: Duration) -> Self {
        Self {
            warn_ratio,
            low_watermark,
            notice_interval,
            warned: Mutex::new(HashSet::new()),
            disabled_notices: Mutex::new(HashMap::new()),
            exhausted_notices: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.quota_warn_ratio,
            config.quota_low_watermark,
            config.notice_interval,
        )
    }

    pub fn warn_ratio(&self) -> f64 {
        self.warn_ratio
    }

    /// Record fresh usage numbers. Returns true exactly once per crossing of
    /// the warning ratio; the flag clears when usage falls under the low watermark.
    pub fn observe_usage(&self, guild: Id, snapshot: &QuotaSnapshot) -> bool {
        if snapshot.char_limit == 0 {
            return false;
        }
        let limit = snapshot.char_limit as f64;
        let used = snapshot.used_chars as f64;
        let mut warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());

        if used < self.low_watermark * limit {
            if warned.remove(&guild) {
                debug!("Quota usage for guild {} reset, warning re-armed", guild);
            }
            return false;
        }

        used >= self.warn_ratio * limit && warned.insert(guild)
    }

    fn notice_due(map: &Mutex<HashMap<Id, Instant>>, guild: Id, interval: Duration, now: Instant) -> bool {
        let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(&guild) {
            Some(last) if now.saturating_duration_since(*last) < interval => false,
            _ => {
                map.insert(guild, now);
                true
            }
        }
    }

    /// True if a "translation disabled" notice may be sent now (and records it)
    pub fn disabled_notice_due(&self, guild: Id, now: Instant) -> bool {
        Self::notice_due(&self.disabled_notices, guild, self.notice_interval, now)
    }

    /// True if a "quota exhausted" notice may be sent now (and records it)
    pub fn exhausted_notice_due(&self, guild: Id, now: Instant) -> bool {
        Self::notice_due(&self.exhausted_notices, guild, self.notice_interval, now)
    }

    /// Forget notice timestamps older than the notice interval
    pub fn sweep(&self, now: Instant) {
        for map in [&self.disabled_notices, &self.exhausted_notices] {
            map.lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|_, last| now.saturating_duration_since(*last) < self.notice_interval);
        }
    }
}
