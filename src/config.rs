use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;

/// Immutable process configuration, built once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_bot_token: String,
    pub discord_api_url: String,
    pub relay_webhook_secret: String,
    pub admin_api_key: Option<String>,

    // Link directory (exactly one of these)
    pub database_url: Option<String>,
    pub links_file: Option<String>,

    // Quota service
    pub quota_service_url: String,
    pub quota_service_key: String,

    // Translation provider
    pub translate_api_url: String,
    pub provider_rate_cap: f64,
    pub provider_burst: f64,
    pub translate_timeout: Duration,
    pub pre_call_jitter_ms: u64,
    pub concurrency: usize,

    // Retry / backoff
    pub retry_attempts: u32,
    pub retry_base: Duration,
    pub retry_factor: f64,
    pub retry_max_delay: Duration,
    pub retry_jitter_ms: u64,

    // Circuit breaker
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,

    // Cooldowns, dedupe and length gate
    pub event_mode: bool,
    pub user_cooldown: Duration,
    pub channel_cooldown: Duration,
    pub event_user_cooldown: Duration,
    pub event_channel_cooldown: Duration,
    pub dedupe_window: Duration,
    pub min_msg_len: usize,
    pub max_msg_len: usize,
    pub proxy_settle_delay: Duration,
    pub cooldown_sweep_threshold: usize,

    // Quota thresholds and notices
    pub quota_warn_ratio: f64,
    pub quota_low_watermark: f64,
    pub notice_interval: Duration,

    // Server
    pub port: u16,
    pub housekeeping_cron: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_bot_token: String::new(),
            discord_api_url: "https://discord.com/api/v10".to_string(),
            relay_webhook_secret: String::new(),
            admin_api_key: None,
            database_url: None,
            links_file: None,
            quota_service_url: String::new(),
            quota_service_key: String::new(),
            translate_api_url: "https://translate.googleapis.com/translate_a/single".to_string(),
            provider_rate_cap: 12.0,
            provider_burst: 24.0,
            translate_timeout: Duration::from_secs(8),
            pre_call_jitter_ms: 150,
            concurrency: 6,
            retry_attempts: 3,
            retry_base: Duration::from_millis(300),
            retry_factor: 2.0,
            retry_max_delay: Duration::from_secs(2),
            retry_jitter_ms: 150,
            breaker_threshold: 6,
            breaker_cooldown: Duration::from_secs(30),
            event_mode: false,
            user_cooldown: Duration::from_secs(2),
            channel_cooldown: Duration::from_millis(150),
            event_user_cooldown: Duration::from_millis(1500),
            event_channel_cooldown: Duration::from_secs(2),
            dedupe_window: Duration::from_secs(3),
            min_msg_len: 4,
            max_msg_len: 2000,
            proxy_settle_delay: Duration::from_millis(700),
            cooldown_sweep_threshold: 10_000,
            quota_warn_ratio: 0.9,
            quota_low_watermark: 0.1,
            notice_interval: Duration::from_secs(60),
            port: 8080,
            housekeeping_cron: "0 */5 * * * *".to_string(),
        }
    }
}

/// Parse an optional env var, falling back to `default` when unset or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read a duration expressed in (fractional) seconds. Negative, non-finite
/// or out-of-range values fall back to `default`.
fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let d = Config::default();

        let config = Self {
            // Discord
            discord_bot_token: std::env::var("DISCORD_BOT_TOKEN")
                .context("DISCORD_BOT_TOKEN not set")?,
            discord_api_url: std::env::var("DISCORD_API_URL").unwrap_or(d.discord_api_url),
            relay_webhook_secret: std::env::var("RELAY_WEBHOOK_SECRET")
                .context("RELAY_WEBHOOK_SECRET not set")?,
            admin_api_key: env_opt("ADMIN_API_KEY"),

            // Link directory
            database_url: env_opt("DATABASE_URL"),
            links_file: env_opt("LINKS_FILE"),

            // Quota service
            quota_service_url: std::env::var("QUOTA_SERVICE_URL")
                .context("QUOTA_SERVICE_URL not set")?,
            quota_service_key: std::env::var("QUOTA_SERVICE_KEY")
                .context("QUOTA_SERVICE_KEY not set")?,

            // Translation provider
            translate_api_url: std::env::var("TRANSLATE_API_URL").unwrap_or(d.translate_api_url),
            provider_rate_cap: env_or("EV_PROVIDER_RATE_CAP", d.provider_rate_cap),
            provider_burst: env_or("EV_PROVIDER_BURST", d.provider_burst),
            translate_timeout: env_secs("EV_TRANSLATE_TIMEOUT", d.translate_timeout),
            pre_call_jitter_ms: env_or("EV_JITTER_MS", d.pre_call_jitter_ms),
            concurrency: env_or("CONCURRENCY", d.concurrency),

            // Retry / backoff
            retry_attempts: env_or("EV_RETRY_ATTEMPTS", d.retry_attempts),
            retry_base: env_secs("EV_RETRY_BASE", d.retry_base),
            retry_factor: env_or("EV_RETRY_FACTOR", d.retry_factor),
            retry_max_delay: env_secs("EV_RETRY_MAX", d.retry_max_delay),
            retry_jitter_ms: env_or("EV_RETRY_JITTER_MS", d.retry_jitter_ms),

            // Circuit breaker
            breaker_threshold: env_or("EV_CB_THRESHOLD", d.breaker_threshold),
            breaker_cooldown: env_secs("EV_CB_COOLDOWN", d.breaker_cooldown),

            // Cooldowns, dedupe and length gate
            event_mode: std::env::var("EV_MODE_EVENT")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(d.event_mode),
            user_cooldown: env_secs("USER_COOLDOWN", d.user_cooldown),
            channel_cooldown: env_secs("CHANNEL_COOLDOWN", d.channel_cooldown),
            event_user_cooldown: env_secs("EV_USER_COOLDOWN_SEC", d.event_user_cooldown),
            event_channel_cooldown: env_secs("EV_CHANNEL_COOLDOWN_SEC", d.event_channel_cooldown),
            dedupe_window: env_secs("EV_DEDUPE_WINDOW_SEC", d.dedupe_window),
            min_msg_len: env_or("MIN_MSG_LEN", d.min_msg_len),
            max_msg_len: env_or("MAX_MSG_LEN", d.max_msg_len),
            proxy_settle_delay: env_millis("PROXY_SETTLE_MS", d.proxy_settle_delay),
            cooldown_sweep_threshold: env_or(
                "COOLDOWN_SWEEP_THRESHOLD",
                d.cooldown_sweep_threshold,
            ),

            // Quota thresholds and notices
            quota_warn_ratio: env_or("QUOTA_WARN_RATIO", d.quota_warn_ratio),
            quota_low_watermark: env_or("QUOTA_LOW_WATERMARK", d.quota_low_watermark),
            notice_interval: env_secs("NOTICE_INTERVAL_SEC", d.notice_interval),

            // Server
            port: env_or("PORT", d.port),
            housekeeping_cron: std::env::var("HOUSEKEEPING_CRON").unwrap_or(d.housekeeping_cron),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_none() && self.links_file.is_none() {
            bail!("Either DATABASE_URL or LINKS_FILE must be set");
        }
        if self.database_url.is_some() && self.links_file.is_some() {
            bail!("DATABASE_URL and LINKS_FILE are mutually exclusive");
        }
        if self.provider_rate_cap <= 0.0 || !self.provider_rate_cap.is_finite() {
            bail!("EV_PROVIDER_RATE_CAP must be positive, got {}", self.provider_rate_cap);
        }
        if self.provider_burst < 1.0 || !self.provider_burst.is_finite() {
            bail!("EV_PROVIDER_BURST must be at least 1, got {}", self.provider_burst);
        }
        if self.retry_attempts == 0 {
            bail!("EV_RETRY_ATTEMPTS must be >= 1");
        }
        if self.retry_factor < 1.0 {
            bail!("EV_RETRY_FACTOR must be >= 1.0, got {}", self.retry_factor);
        }
        if self.breaker_threshold == 0 {
            bail!("EV_CB_THRESHOLD must be >= 1");
        }
        if self.concurrency == 0 {
            bail!("CONCURRENCY must be >= 1");
        }
        if self.min_msg_len > self.max_msg_len {
            bail!(
                "MIN_MSG_LEN ({}) must not exceed MAX_MSG_LEN ({})",
                self.min_msg_len,
                self.max_msg_len
            );
        }
        if !(0.0..=1.0).contains(&self.quota_warn_ratio)
            || !(0.0..=1.0).contains(&self.quota_low_watermark)
        {
            bail!("QUOTA_WARN_RATIO and QUOTA_LOW_WATERMARK must be within 0..=1");
        }
        if self.quota_low_watermark >= self.quota_warn_ratio {
            bail!("QUOTA_LOW_WATERMARK must be below QUOTA_WARN_RATIO");
        }
        Ok(())
    }

    /// User cooldown window, honouring event mode
    pub fn effective_user_cooldown(&self) -> Duration {
        if self.event_mode {
            self.event_user_cooldown
        } else {
            self.user_cooldown
        }
    }

    /// Channel cooldown window, honouring event mode
    pub fn effective_channel_cooldown(&self) -> Duration {
        if self.event_mode {
            self.event_channel_cooldown
        } else {
            self.channel_cooldown
        }
    }
}
