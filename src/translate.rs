//! Translation provider client and the guarded call path around it.
//!
//! `GuardedTranslator` composes the circuit breaker, pre-call jitter, the
//! process-wide rate governor, a concurrency cap and retry with backoff.
//! The breaker is consulted once per message; the governor and the
//! concurrency cap apply to every attempt.

use futures::future::BoxFuture;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::{ProviderError, TranslateError};
use crate::metrics::RelayMetrics;
use crate::rate_limit::RateGovernor;
use crate::retry::{with_retry_if, RetryConfig};

/// A single call to a translation provider. No retries, no rate limiting.
pub trait Translator: Send + Sync {
    fn translate<'a>(
        &'a self,
        text: &'a str,
        source_lang: &'a str,
        target_lang: &'a str,
    ) -> BoxFuture<'a, Result<String, ProviderError>>;
}

/// Client for the public web translation endpoint (`translate_a/single`)
pub struct GoogleWebTranslator {
    http: reqwest::Client,
    api_url: String,
}

impl GoogleWebTranslator {
    pub fn new(api_url: &str) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent("Mozilla/5.0")
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        Self::new(&config.translate_api_url)
    }

    async fn request(&self, text: &str, source_lang: &str, target_lang: &str) -> Result<String, ProviderError> {
        let response = self
            .http
            .get(&self.api_url)
            .query(&[
                ("client", "gtx"),
                ("sl", source_lang),
                ("tl", target_lang),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        parse_segments(&body)
    }
}

impl Translator for GoogleWebTranslator {
    fn translate<'a>(
        &'a self,
        text: &'a str,
        source_lang: &'a str,
        target_lang: &'a str,
    ) -> BoxFuture<'a, Result<String, ProviderError>> {
        Box::pin(self.request(text, source_lang, target_lang))
    }
}

/// Join the translated segments of a `[[["seg", "orig", ...], ...], ...]` response
fn parse_segments(body: &serde_json::Value) -> Result<String, ProviderError> {
    let segments = body
        .get(0)
        .and_then(|s| s.as_array())
        .ok_or_else(|| ProviderError::Malformed("missing segment list".to_string()))?;

    Ok(segments
        .iter()
        .filter_map(|segment| segment.get(0).and_then(|s| s.as_str()))
        .collect())
}

/// Provider access with breaker, rate governor, concurrency cap and retries
pub struct GuardedTranslator {
    provider: Arc<dyn Translator>,
    governor: Arc<RateGovernor>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    call_timeout: Duration,
    pre_call_jitter_ms: u64,
    permits: Semaphore,
    metrics: Arc<RelayMetrics>,
}

impl GuardedTranslator {
    pub fn new(
        provider: Arc<dyn Translator>,
        config: &Config,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            provider,
            governor: Arc::new(RateGovernor::from_config(config)),
            breaker,
            retry: RetryConfig::from_config(config),
            call_timeout: config.translate_timeout,
            pre_call_jitter_ms: config.pre_call_jitter_ms,
            permits: Semaphore::new(config.concurrency.max(1)),
            metrics,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// One provider call under the governor and the concurrency cap
    async fn attempt(&self, text: &str, source_lang: &str, target_lang: &str) -> Result<String, ProviderError> {
        self.governor.acquire().await;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Transport("translation permits closed".to_string()))?;

        self.metrics.record_provider_call();
        let outcome = match timeout(
            self.call_timeout,
            self.provider.translate(text, source_lang, target_lang),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };

        match &outcome {
            Ok(_) => self.breaker.on_success(),
            Err(e) => {
                self.metrics.record_provider_failure();
                if e.is_transient() {
                    self.breaker.on_failure();
                }
            }
        }
        outcome
    }

    /// Translate `text`, failing fast while the breaker is open
    pub async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslateError> {
        if self.breaker.is_open() {
            debug!("Circuit open, skipping translation {} -> {}", source_lang, target_lang);
            return Err(TranslateError::CircuitOpen);
        }

        if self.pre_call_jitter_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0..=self.pre_call_jitter_ms);
            sleep(Duration::from_millis(jitter)).await;
        }

        let mut attempts = 0u32;
        let result = with_retry_if(
            &self.retry,
            "Translation",
            || {
                attempts += 1;
                self.attempt(text, source_lang, target_lang)
            },
            // Stop retrying once the breaker opens, whoever tripped it
            |e: &ProviderError| e.is_transient() && !self.breaker.is_open(),
        )
        .await;

        result.map_err(|last| {
            if last.is_transient() {
                warn!("Translation {} -> {} gave up after {} attempts", source_lang, target_lang, attempts);
                TranslateError::Exhausted { attempts, last }
            } else {
                TranslateError::NonRetryable(last)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Provider replaying scripted results, then succeeding
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<String, ProviderError>>>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(Vec::new())
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Translator for ScriptedProvider {
        fn translate<'a>(&'a self, text: &'a str, _: &'a str, target: &'a str) -> BoxFuture<'a, Result<String, ProviderError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    sleep(self.delay).await;
                }
                let next = self.script.lock().unwrap().pop_front();
                next.unwrap_or_else(|| Ok(format!("[{}] {}", target, text)))
            })
        }
    }

    fn test_config() -> Config {
        Config {
            pre_call_jitter_ms: 0,
            retry_jitter_ms: 0,
            retry_attempts: 3,
            retry_base: Duration::from_millis(300),
            retry_factor: 2.0,
            retry_max_delay: Duration::from_secs(2),
            breaker_threshold: 6,
            breaker_cooldown: Duration::from_secs(30),
            translate_timeout: Duration::from_secs(8),
            ..Config::default()
        }
    }

    fn guarded(provider: Arc<ScriptedProvider>, config: &Config) -> GuardedTranslator {
        GuardedTranslator::new(
            provider,
            config,
            Arc::new(CircuitBreaker::from_config(config)),
            Arc::new(RelayMetrics::new()),
        )
    }

    fn server_error() -> Result<String, ProviderError> {
        Err(ProviderError::Server {
            status: 503,
            body: String::new(),
        })
    }

    // ==================== Response Parsing ====================

    #[test]
    fn test_parse_segments_joins_all_parts() {
        let body = serde_json::json!([
            [["Hola ", "Hello ", null], ["mundo", "world", null]],
            null,
            "en"
        ]);
        assert_eq!(parse_segments(&body).unwrap(), "Hola mundo");
    }

    #[test]
    fn test_parse_segments_rejects_unexpected_shape() {
        assert!(matches!(
            parse_segments(&serde_json::json!({"error": "nope"})),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_google_web_translator_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("client", "gtx"))
            .and(query_param("sl", "en"))
            .and(query_param("tl", "pt"))
            .and(query_param("dt", "t"))
            .and(query_param("q", "good morning"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([[["bom dia", "good morning"]]])),
            )
            .mount(&server)
            .await;

        let translator = GoogleWebTranslator::new(&server.uri()).unwrap();
        let out = translator.translate("good morning", "en", "pt").await.unwrap();
        assert_eq!(out, "bom dia");
    }

    #[tokio::test]
    async fn test_google_web_translator_classifies_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let translator = GoogleWebTranslator::new(&server.uri()).unwrap();
        let err = translator.translate("hi", "en", "es").await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited));
    }

    // ==================== Guarded Path ====================

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let config = test_config();
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let translator = guarded(provider.clone(), &config);

        let out = translator.translate("hello", "en", "es").await.unwrap();
        assert_eq!(out, "[es] hello");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_transient_failures_then_success() {
        let config = test_config();
        let provider = Arc::new(ScriptedProvider::new(vec![server_error(), Err(ProviderError::Timeout)]));
        let translator = guarded(provider.clone(), &config);
        let start = Instant::now();

        let out = translator.translate("hello", "en", "es").await.unwrap();
        assert_eq!(out, "[es] hello");
        assert_eq!(provider.calls(), 3);

        // Backoff 300ms then 600ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900) && elapsed < Duration::from_millis(1_000));
        assert_eq!(translator.breaker().snapshot().fail_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_attempts_exhausted() {
        let config = test_config();
        let provider = Arc::new(ScriptedProvider::new(vec![
            server_error(),
            server_error(),
            server_error(),
        ]));
        let translator = guarded(provider.clone(), &config);

        match translator.translate("hello", "en", "es").await {
            Err(TranslateError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(translator.breaker().snapshot().fail_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let config = test_config();
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Client {
            status: 400,
            body: "bad language".to_string(),
        })]));
        let translator = guarded(provider.clone(), &config);

        let err = translator.translate("hello", "en", "xx").await.unwrap_err();
        assert!(matches!(err, TranslateError::NonRetryable(ProviderError::Client { .. })));
        assert_eq!(provider.calls(), 1);
        assert_eq!(translator.breaker().snapshot().fail_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let config = Config {
            retry_attempts: 1,
            translate_timeout: Duration::from_secs(1),
            ..test_config()
        };
        let provider = Arc::new(ScriptedProvider::slow(Duration::from_secs(5)));
        let translator = guarded(provider, &config);

        match translator.translate("hello", "en", "es").await {
            Err(TranslateError::Exhausted { last, .. }) => {
                assert!(matches!(last, ProviderError::Timeout))
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_fails_fast() {
        let config = Config {
            breaker_threshold: 6,
            ..test_config()
        };
        let provider = Arc::new(ScriptedProvider::new((0..6).map(|_| server_error()).collect()));
        let translator = guarded(provider.clone(), &config);

        // Two messages, three failing attempts each
        assert!(translator.translate("one", "en", "es").await.is_err());
        assert!(translator.translate("two", "en", "es").await.is_err());
        assert!(translator.breaker().is_open());

        let err = translator.translate("three", "en", "es").await.unwrap_err();
        assert!(matches!(err, TranslateError::CircuitOpen));
        assert_eq!(provider.calls(), 6, "no provider call while open");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(translator.translate("four", "en", "es").await.unwrap(), "[es] four");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_when_breaker_opens() {
        let config = Config {
            breaker_threshold: 6,
            ..test_config()
        };
        let provider = Arc::new(ScriptedProvider::new((0..3).map(|_| server_error()).collect()));
        let translator = guarded(provider.clone(), &config);

        // Another message's failures bring the breaker one short of tripping
        for _ in 0..5 {
            translator.breaker().on_failure();
        }

        match translator.translate("hello", "en", "es").await {
            Err(TranslateError::Exhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected early stop, got {:?}", other),
        }
        assert_eq!(provider.calls(), 1);
        assert!(translator.breaker().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_count_every_attempt() {
        let config = test_config();
        let metrics = Arc::new(RelayMetrics::new());
        let provider = Arc::new(ScriptedProvider::new(vec![server_error()]));
        let translator = GuardedTranslator::new(
            provider,
            &config,
            Arc::new(CircuitBreaker::from_config(&config)),
            metrics.clone(),
        );

        translator.translate("hello", "en", "es").await.unwrap();
        assert_eq!(metrics.provider_calls(), 2);
        assert_eq!(metrics.provider_failures(), 1);
    }
}
