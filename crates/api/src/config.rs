//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use billing::{CheckoutSettings, CircuitBreakerConfig, RetryPolicy, WebhookSettings};
use domain::{Currency, Money};
use patient_records::NotificationSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`, `LOG_FORMAT`: tracing filter and `text`/`json` output
/// - `DATABASE_URL`: PostgreSQL for attempts and the bus; in-memory when unset
/// - `WEBHOOK_SECRET`: gateway callback signing secret
/// - `GATEWAY_API_KEY`, `GATEWAY_BASE_URL`: gateway credentials and API root
/// - `FRONTEND_BASE_URL`: root of checkout redirect URLs
/// - `DEFAULT_CURRENCY`, `DEFAULT_VISIT_FEE`: pricing fallbacks
/// - `BREAKER_*`, `RETRY_*`: gateway call protection
/// - `BUS_PARTITIONS`, `CONSUMER_POLL_MS`: event bus
/// - `NOTIFICATION_TTL_SECS`, `NOTIFICATION_CAPACITY`: notification cache
///
/// Unparseable values fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub gateway_api_key: Option<String>,
    pub gateway_base_url: String,
    pub gateway_timeout: Duration,
    pub frontend_base_url: String,
    pub default_currency: Currency,
    pub default_visit_fee: Money,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub bus_partitions: u32,
    pub consumer_poll: Duration,
    pub notifications: NotificationSettings,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let vars = Vars(lookup);

        let breaker = CircuitBreakerConfig {
            failure_rate_threshold: vars.parsed("BREAKER_FAILURE_RATE")
                .unwrap_or(defaults.breaker.failure_rate_threshold),
            window_size: vars.parsed("BREAKER_WINDOW").unwrap_or(defaults.breaker.window_size),
            minimum_calls: vars.parsed("BREAKER_MIN_CALLS").unwrap_or(defaults.breaker.minimum_calls),
            open_duration: vars.parsed("BREAKER_OPEN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.breaker.open_duration),
            half_open_calls: vars.parsed("BREAKER_HALF_OPEN_CALLS")
                .unwrap_or(defaults.breaker.half_open_calls),
        };

        let retry = RetryPolicy {
            max_attempts: vars.parsed("RETRY_MAX_ATTEMPTS").unwrap_or(defaults.retry.max_attempts),
            initial_backoff: vars.parsed("RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_backoff),
            ..defaults.retry
        };

        let notifications = NotificationSettings {
            ttl: vars.parsed("NOTIFICATION_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.notifications.ttl),
            capacity: vars.parsed("NOTIFICATION_CAPACITY").unwrap_or(defaults.notifications.capacity),
        };

        Self {
            host: vars.text("HOST").unwrap_or(defaults.host),
            port: vars.parsed("PORT").unwrap_or(defaults.port),
            log_level: vars.text("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match vars.text("LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: vars.text("DATABASE_URL"),
            webhook_secret: vars.text("WEBHOOK_SECRET"),
            gateway_api_key: vars.text("GATEWAY_API_KEY"),
            gateway_base_url: vars.text("GATEWAY_BASE_URL").unwrap_or(defaults.gateway_base_url),
            gateway_timeout: defaults.gateway_timeout,
            frontend_base_url: vars.text("FRONTEND_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.frontend_base_url),
            default_currency: vars.text("DEFAULT_CURRENCY")
                .and_then(|c| Currency::from_str(&c).ok())
                .unwrap_or(defaults.default_currency),
            default_visit_fee: vars.text("DEFAULT_VISIT_FEE")
                .and_then(|f| Money::from_str(&f).ok())
                .filter(Money::is_positive)
                .unwrap_or(defaults.default_visit_fee),
            breaker,
            retry,
            bus_partitions: vars.parsed("BUS_PARTITIONS")
                .filter(|p: &u32| *p > 0)
                .unwrap_or(defaults.bus_partitions),
            consumer_poll: vars.parsed("CONSUMER_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.consumer_poll),
            notifications,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True if a secret API key is present.
    pub fn gateway_configured(&self) -> bool {
        self.gateway_api_key
            .as_deref()
            .is_some_and(|key| key.starts_with("sk_"))
    }

    pub fn checkout_settings(&self) -> CheckoutSettings {
        CheckoutSettings {
            frontend_base_url: self.frontend_base_url.clone(),
            default_currency: self.default_currency.clone(),
            default_visit_fee: self.default_visit_fee,
            gateway_configured: self.gateway_configured(),
            ..CheckoutSettings::default()
        }
    }

    pub fn webhook_settings(&self) -> WebhookSettings {
        WebhookSettings::new(self.webhook_secret.clone())
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// Trimmed value, `None` when unset or blank.
    fn text(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.text(key)?.parse().ok()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            webhook_secret: None,
            gateway_api_key: None,
            gateway_base_url: "https://api.stripe.com".to_string(),
            gateway_timeout: Duration::from_secs(10),
            frontend_base_url: "http://localhost:5173".to_string(),
            default_currency: Currency::usd(),
            default_visit_fee: Money::from_cents(5000),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            bus_partitions: 8,
            consumer_poll: Duration::from_millis(250),
            notifications: NotificationSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = from_pairs(&[]);
        assert_eq!(config.addr(), "0.0.0.0:3000");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert_eq!(config.gateway_base_url, "https://api.stripe.com");
        assert_eq!(config.default_visit_fee, Money::from_cents(5000));
        assert_eq!(config.breaker.minimum_calls, 3);
        assert_eq!(config.breaker.open_duration, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(200));
        assert_eq!(config.bus_partitions, 8);
        assert_eq!(config.notifications.ttl, Duration::from_secs(30));
        assert_eq!(config.notifications.capacity, 10_000);
        assert!(!config.gateway_configured());
        assert!(!config.webhook_settings().is_configured());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("LOG_FORMAT", "JSON"),
            ("GATEWAY_API_KEY", "sk_test_abc"),
            ("WEBHOOK_SECRET", "whsec_123"),
            ("FRONTEND_BASE_URL", "https://app.example/"),
            ("DEFAULT_CURRENCY", "EUR"),
            ("DEFAULT_VISIT_FEE", "75.50"),
            ("BREAKER_MIN_CALLS", "5"),
            ("RETRY_BACKOFF_MS", "50"),
            ("BUS_PARTITIONS", "16"),
        ]);

        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.gateway_configured());
        assert!(config.webhook_settings().is_configured());
        assert_eq!(config.default_currency.as_str(), "eur");
        assert_eq!(config.bus_partitions, 16);

        let checkout = config.checkout_settings();
        assert_eq!(checkout.frontend_base_url, "https://app.example");
        assert_eq!(checkout.default_visit_fee, Money::from_cents(7550));
        assert!(checkout.gateway_configured);
        assert_eq!(config.breaker.minimum_calls, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(50));
    }

    #[test]
    fn test_publishable_key_is_not_a_secret_key() {
        let config = from_pairs(&[("GATEWAY_API_KEY", "pk_test_abc")]);
        assert!(!config.gateway_configured());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("PORT", "not-a-port"),
            ("DEFAULT_CURRENCY", "dollars"),
            ("DEFAULT_VISIT_FEE", "-3"),
            ("BUS_PARTITIONS", "0"),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.default_currency, Currency::usd());
        assert_eq!(config.default_visit_fee, Money::from_cents(5000));
        assert_eq!(config.bus_partitions, 8);
    }

    #[test]
    fn test_placeholder_secret_disables_webhooks() {
        let config = from_pairs(&[("WEBHOOK_SECRET", "your-webhook-secret-here")]);
        assert!(!config.webhook_settings().is_configured());
    }
}
