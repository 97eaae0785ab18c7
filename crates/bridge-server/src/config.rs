//! Startup configuration, loaded once from the environment.
//!
//! Missing confidential values abort startup rather than failing lazily on
//! first use, mirroring the fail-fast validation the companion server applies
//! to its own settings (`validate_port` and friends) before accepting them.

use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    /// OAuth client id registered with upstream for this bridge.
    pub upstream_client_id: String,
    /// OAuth client secret registered with upstream for this bridge.
    pub upstream_client_secret: String,
    /// Base URL of the upstream API (e.g. `https://www.onlinescoutmanager.co.uk`).
    pub upstream_base_url: String,
    /// Secret used to sign/seed session and state tokens.
    pub session_secret: String,
    /// Public domain this service is reachable at, used to build absolute
    /// verification/callback URLs.
    pub external_domain: String,
    /// SQLite database path (file or `:memory:`).
    pub database_url: String,
    /// Device code lifetime.
    pub device_code_ttl: Duration,
    /// Minimum interval between `/device/token` polls for the same device_code.
    pub device_poll_interval: Duration,
    /// Per-IP limit on `/device/authorize` (requests per minute).
    pub device_authorize_limit_per_min: u32,
    /// Per-IP limit on verification-page code submissions (requests per 10s).
    pub code_entry_limit_per_10s: u32,
    /// Per-request handler deadline.
    pub request_deadline: Duration,
    /// `RUST_LOG`-style filter directive.
    pub log_level: String,
    /// Emit JSON logs instead of the pretty human format.
    pub log_json: bool,
    /// Port to bind the HTTP listener on.
    pub port: u16,
}

impl Config {
    /// Load configuration from the environment, optionally seeded from a
    /// local `.env` file. Fails fast on any missing confidential value.
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let upstream_client_id = required_env("UPSTREAM_CLIENT_ID")?;
        let upstream_client_secret = required_env("UPSTREAM_CLIENT_SECRET")?;
        let session_secret = required_env("SESSION_SECRET")?;
        if session_secret.len() < 32 {
            return Err(AppError::invalid_input_field(
                "SESSION_SECRET must be at least 32 characters",
                "SESSION_SECRET",
            ));
        }

        let upstream_base_url = env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| "https://www.onlinescoutmanager.co.uk".to_string());
        let external_domain = required_env("EXTERNAL_DOMAIN")?;
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "bridge.sqlite".to_string());

        let device_code_ttl = Duration::from_secs(env_u64("DEVICE_CODE_TTL_SECS", 600)?);
        let device_poll_interval = Duration::from_secs(env_u64("DEVICE_POLL_INTERVAL_SECS", 5)?);
        let device_authorize_limit_per_min = env_u32("DEVICE_AUTHORIZE_LIMIT_PER_MIN", 6)?;
        let code_entry_limit_per_10s = env_u32("CODE_ENTRY_LIMIT_PER_10S", 1)?;
        let request_deadline = Duration::from_secs(env_u64("REQUEST_DEADLINE_SECS", 10)?);
        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let port = env_u32("PORT", 8080)? as u16;

        Ok(Self {
            upstream_client_id,
            upstream_client_secret,
            upstream_base_url,
            session_secret,
            external_domain,
            database_url,
            device_code_ttl,
            device_poll_interval,
            device_authorize_limit_per_min,
            code_entry_limit_per_10s,
            request_deadline,
            log_level,
            log_json,
            port,
        })
    }
}

fn required_env(key: &str) -> Result<String, AppError> {
    env::var(key).map_err(|_| {
        AppError::invalid_input_field(format!("missing required environment variable {key}"), key)
    })
}

fn env_u64(key: &str, default: u64) -> Result<u64, AppError> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| AppError::invalid_input_field(format!("{key} must be an integer"), key)),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32, AppError> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| AppError::invalid_input_field(format!("{key} must be an integer"), key)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "UPSTREAM_CLIENT_ID",
            "UPSTREAM_CLIENT_SECRET",
            "SESSION_SECRET",
            "EXTERNAL_DOMAIN",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_missing_required_fails() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let result = Config::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_short_session_secret_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("UPSTREAM_CLIENT_ID", "client");
        env::set_var("UPSTREAM_CLIENT_SECRET", "secret");
        env::set_var("SESSION_SECRET", "short");
        env::set_var("EXTERNAL_DOMAIN", "example.com");
        let result = Config::from_env();
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    fn test_defaults_applied() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("UPSTREAM_CLIENT_ID", "client");
        env::set_var("UPSTREAM_CLIENT_SECRET", "secret");
        env::set_var("SESSION_SECRET", "a-secret-that-is-at-least-32-chars-long");
        env::set_var("EXTERNAL_DOMAIN", "example.com");
        let config = Config::from_env().unwrap();
        assert_eq!(config.device_code_ttl, Duration::from_secs(600));
        assert_eq!(config.device_poll_interval, Duration::from_secs(5));
        clear_env();
    }
}
