//! Process configuration from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use provisioner_crypto::EncryptionService;

use crate::checkout::Price;
use crate::external::{RailwayConfig, RazorpayConfig};
use crate::jobs::{JobQueueConfig, RetryPolicy};
use crate::provisioning::ProvisionerConfig;
use crate::rate_limit::{ClientKeySource, RateLimitConfig};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub razorpay: RazorpayConfig,
    pub price: Price,
    pub railway: RailwayConfig,
    /// 64 hex characters; validated on load.
    pub master_encryption_key: String,
    pub jobs: JobQueueConfig,
    pub worker_concurrency: usize,
    pub worker_poll_interval: Duration,
    pub reaper_interval: Duration,
    pub provisioner: ProvisionerConfig,
    pub http_connect_timeout: Duration,
    pub http_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    /// Operator endpoints are disabled when unset.
    pub admin_api_token: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("razorpay", &self.razorpay)
            .field("price", &self.price)
            .field("railway", &self.railway)
            .field("jobs", &self.jobs)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("provisioner", &self.provisioner)
            .field("rate_limit", &self.rate_limit)
            .field("admin_enabled", &self.admin_api_token.is_some())
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let master_encryption_key = env.required("MASTER_ENCRYPTION_KEY")?;
        EncryptionService::from_hex(&master_encryption_key).map_err(|e| ConfigError::Invalid {
            key: "MASTER_ENCRYPTION_KEY",
            reason: e.to_string(),
        })?;

        let base_url = env.required("BASE_URL")?.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "BASE_URL",
                reason: "must start with http:// or https://".into(),
            });
        }

        let max_attempts: u32 = env.parsed("JOB_MAX_RETRIES", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "JOB_MAX_RETRIES",
                reason: "must be at least 1".into(),
            });
        }
        let worker_concurrency: usize = env.parsed("WORKER_CONCURRENCY", 1)?;
        if worker_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                reason: "must be at least 1".into(),
            });
        }

        let defaults = ProvisionerConfig::default();
        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            bind_addr: env.parsed("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            razorpay: RazorpayConfig {
                key_id: env.required("RAZORPAY_KEY_ID")?,
                key_secret: env.required("RAZORPAY_KEY_SECRET")?,
                webhook_secret: env.required("RAZORPAY_WEBHOOK_SECRET")?,
                api_base: env.or("RAZORPAY_API_BASE", "https://api.razorpay.com"),
            },
            price: Price {
                amount: env.parsed("PRICE_AMOUNT", 499_900)?,
                currency: env.or("PRICE_CURRENCY", "INR"),
            },
            railway: RailwayConfig {
                api_url: env.or("RAILWAY_API_URL", "https://backboard.railway.app/graphql/v2"),
                api_token: env.required("RAILWAY_API_TOKEN")?,
                template_id: env.required("RAILWAY_TEMPLATE_ID")?,
                team_id: env.optional("RAILWAY_TEAM_ID"),
            },
            master_encryption_key,
            jobs: JobQueueConfig {
                retry: RetryPolicy::new(
                    max_attempts,
                    Duration::from_millis(env.parsed("JOB_RETRY_DELAY_MS", 30_000)?),
                ),
                lock_duration: Duration::from_secs(env.parsed("JOB_LOCK_SECS", 300)?),
            },
            worker_concurrency,
            worker_poll_interval: Duration::from_millis(env.parsed("WORKER_POLL_MS", 2_000)?),
            reaper_interval: Duration::from_secs(env.parsed("REAPER_INTERVAL_SECS", 60)?),
            provisioner: ProvisionerConfig {
                base_url,
                setup_link_expiry: Duration::from_secs(
                    env.parsed::<u64>("SETUP_LINK_EXPIRY_HOURS", 72)?.saturating_mul(60 * 60),
                ),
                ready_timeout: Duration::from_secs(env.parsed("PROVISION_READY_TIMEOUT_SECS", 600)?),
                app_env: env.or("APP_ENV", &defaults.app_env),
                ..defaults
            },
            http_connect_timeout: Duration::from_secs(env.parsed("HTTP_CONNECT_TIMEOUT_SECS", 5)?),
            http_timeout: Duration::from_secs(env.parsed("HTTP_TIMEOUT_SECS", 30)?),
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(env.parsed("RATE_LIMIT_WINDOW_SECS", 900)?),
                max: env.parsed("RATE_LIMIT_MAX", 20)?,
                key_source: if env.parsed("RATE_LIMIT_TRUST_PROXY", false)? {
                    ClientKeySource::ForwardedFor
                } else {
                    ClientKeySource::PeerAddress
                },
                ..RateLimitConfig::default()
            },
            admin_api_token: env.optional("ADMIN_API_TOKEN"),
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> HashMap<&'static str, String> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/provisioner".to_string()),
            ("BASE_URL", "https://orders.example.com/".to_string()),
            ("RAZORPAY_KEY_ID", "rzp_test".to_string()),
            ("RAZORPAY_KEY_SECRET", "secret".to_string()),
            ("RAZORPAY_WEBHOOK_SECRET", "whsec".to_string()),
            ("RAILWAY_API_TOKEN", "token".to_string()),
            ("RAILWAY_TEMPLATE_ID", "tmpl".to_string()),
            ("MASTER_ENCRYPTION_KEY", "ab".repeat(32)),
        ])
    }

    fn load(vars: &HashMap<&'static str, String>) -> Result<Config, ConfigError> {
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_optional_values_are_unset() {
        let cfg = load(&base()).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.provisioner.base_url, "https://orders.example.com");
        assert_eq!(cfg.jobs.retry.max_attempts, 3);
        assert_eq!(cfg.jobs.retry.base_delay, Duration::from_secs(30));
        assert_eq!(cfg.jobs.lock_duration, Duration::from_secs(300));
        assert_eq!(cfg.provisioner.setup_link_expiry, Duration::from_secs(72 * 3600));
        assert_eq!(cfg.price.amount, 499_900);
        assert_eq!(cfg.rate_limit.max, 20);
        assert_eq!(cfg.rate_limit.key_source, ClientKeySource::PeerAddress);
        assert!(cfg.admin_api_token.is_none());
        assert!(cfg.railway.team_id.is_none());
    }

    #[test]
    fn forwarded_for_is_used_only_when_the_proxy_is_trusted() {
        let mut vars = base();
        vars.insert("RATE_LIMIT_TRUST_PROXY", "true".into());
        assert_eq!(load(&vars).unwrap().rate_limit.key_source, ClientKeySource::ForwardedFor);

        vars.insert("RATE_LIMIT_TRUST_PROXY", "yes".into());
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "RATE_LIMIT_TRUST_PROXY", .. }
        ));
    }

    #[test]
    fn missing_required_value_is_named() {
        let mut vars = base();
        vars.remove("RAILWAY_TEMPLATE_ID");
        assert_eq!(load(&vars).unwrap_err(), ConfigError::Missing("RAILWAY_TEMPLATE_ID"));

        vars = base();
        vars.insert("DATABASE_URL", "   ".into());
        assert_eq!(load(&vars).unwrap_err(), ConfigError::Missing("DATABASE_URL"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut vars = base();
        vars.insert("JOB_MAX_RETRIES", "many".into());
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "JOB_MAX_RETRIES", .. }
        ));

        let mut vars = base();
        vars.insert("MASTER_ENCRYPTION_KEY", "abcd".into());
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "MASTER_ENCRYPTION_KEY", .. }
        ));

        let mut vars = base();
        vars.insert("WORKER_CONCURRENCY", "0".into());
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "WORKER_CONCURRENCY", .. }
        ));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let mut vars = base();
        vars.insert("ADMIN_API_TOKEN", "op-token".into());
        let rendered = format!("{:?}", load(&vars).unwrap());
        assert!(!rendered.contains("op-token"));
        assert!(!rendered.contains(&"ab".repeat(32)));
        assert!(!rendered.contains("whsec"));
    }
}
