use std::time::Duration;

use serde::Deserialize;

const PLACEHOLDER_SECRET: &str = "CHANGE_ME_JWT_SECRET";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// HS256 secret used to verify admin bearer tokens.
    pub jwt_secret: String,
    /// Backoff applied when a create call does not specify one.
    pub default_backoff_secs: u64,
    /// Upper bound accepted for a request's backoff interval.
    pub max_backoff_secs: u64,
    /// Bound on every store operation. Elapsed -> transient failure.
    pub store_timeout_ms: u64,
    /// Attempts at the destructive action per call before reporting fatal.
    pub erase_attempts: u32,
    /// Bound on a single attempt at the destructive action.
    pub erase_timeout_ms: u64,
    /// How long a caller running the destructive action keeps exclusive
    /// rights to it before another caller may take over.
    pub execution_lease_secs: u64,
    /// Bound on delivering one approver's code.
    pub notify_timeout_ms: u64,
    /// Period of the expiry / completion / purge sweep.
    pub sweep_interval_secs: u64,
    /// Terminal requests older than this are purged.
    pub retention_days: u32,
    /// Comma-separated list of webhook URLs that receive confirmation codes.
    pub webhook_urls: Vec<String>,
    pub webhook_secret: Option<String>,
}

impl Config {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn erase_timeout(&self) -> Duration {
        Duration::from_millis(self.erase_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Settings suitable for in-process tests: short timeouts, no webhooks.
    pub fn default_for_test() -> Self {
        Self {
            port: 0,
            database_url: "postgres://localhost/deletion_gate_test".into(),
            jwt_secret: "test-secret".into(),
            default_backoff_secs: 24 * 3600,
            max_backoff_secs: 30 * 24 * 3600,
            store_timeout_ms: 2_000,
            erase_attempts: 2,
            erase_timeout_ms: 10_000,
            execution_lease_secs: 300,
            notify_timeout_ms: 1_000,
            sweep_interval_secs: 60,
            retention_days: 90,
            webhook_urls: Vec::new(),
            webhook_secret: None,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let jwt_secret =
        std::env::var("DELGATE_JWT_SECRET").unwrap_or_else(|_| PLACEHOLDER_SECRET.into());

    if jwt_secret == PLACEHOLDER_SECRET {
        let env_mode = std::env::var("DELGATE_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "DELGATE_JWT_SECRET is still the insecure placeholder. \
                 Set a real secret before running in production."
            );
        }
        tracing::warn!("DELGATE_JWT_SECRET is not set, using insecure placeholder");
    }

    let webhook_urls: Vec<String> = std::env::var("DELGATE_WEBHOOK_URLS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    for raw in &webhook_urls {
        let parsed = url::Url::parse(raw)
            .map_err(|e| anyhow::anyhow!("invalid webhook URL '{}': {}", raw, e))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("webhook URL '{}' must be http or https", raw);
        }
    }

    let cfg = Config {
        port: env_or("DELGATE_PORT", 8480),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/deletion_gate".into()),
        jwt_secret,
        default_backoff_secs: env_or("DELGATE_DEFAULT_BACKOFF_SECS", 24 * 3600),
        max_backoff_secs: env_or("DELGATE_MAX_BACKOFF_SECS", 30 * 24 * 3600),
        store_timeout_ms: env_or("DELGATE_STORE_TIMEOUT_MS", 5_000),
        erase_attempts: env_or("DELGATE_ERASE_ATTEMPTS", 3),
        erase_timeout_ms: env_or("DELGATE_ERASE_TIMEOUT_MS", 60_000),
        execution_lease_secs: env_or("DELGATE_EXECUTION_LEASE_SECS", 900),
        notify_timeout_ms: env_or("DELGATE_NOTIFY_TIMEOUT_MS", 15_000),
        sweep_interval_secs: env_or("DELGATE_SWEEP_INTERVAL_SECS", 300),
        retention_days: env_or("DELGATE_RETENTION_DAYS", 90),
        webhook_urls,
        webhook_secret: std::env::var("DELGATE_WEBHOOK_SECRET").ok(),
    };

    if cfg.default_backoff_secs == 0 || cfg.default_backoff_secs > cfg.max_backoff_secs {
        anyhow::bail!(
            "DELGATE_DEFAULT_BACKOFF_SECS must be between 1 and DELGATE_MAX_BACKOFF_SECS ({})",
            cfg.max_backoff_secs
        );
    }
    if cfg.erase_attempts == 0 {
        anyhow::bail!("DELGATE_ERASE_ATTEMPTS must be at least 1");
    }
    // The lease must outlive a full round of erase attempts.
    let round_ms = cfg.erase_timeout_ms.saturating_mul(u64::from(cfg.erase_attempts));
    if cfg.execution_lease_secs.saturating_mul(1_000) <= round_ms {
        anyhow::bail!(
            "DELGATE_EXECUTION_LEASE_SECS must exceed DELGATE_ERASE_TIMEOUT_MS x DELGATE_ERASE_ATTEMPTS ({}ms)",
            round_ms
        );
    }

    Ok(cfg)
}
