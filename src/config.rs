//! Configuration loading from environment variables.
//!
//! Values are validated early so startup fails fast with actionable errors.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

pub const DEFAULT_API_BASE: &str = "https://api.replicate.com/v1";
/// GFPGAN face restoration model version.
pub const DEFAULT_MODEL_VERSION: &str =
    "0fbacf7afc6c144e5be9767cff80f25aff23e52b0708f17e20f9879b2f21516c";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
pub const DEFAULT_CORS_ORIGINS: &str = "http://127.0.0.1:5173";

/// Runtime configuration for the HTTP server and the upstream client.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host interface to bind, for example `127.0.0.1`.
    pub host: String,
    /// TCP port to bind.
    pub port: u16,
    /// Optional bearer token required by all endpoints.
    pub api_key: Option<String>,
    /// Token authorizing calls to the prediction API.
    pub upstream_token: String,
    /// Base URL of the prediction API, without trailing slash.
    pub upstream_base: String,
    /// Model version submitted with every prediction.
    pub model_version: String,
    /// Root directory holding `uploads/` and `restored/`.
    pub data_dir: PathBuf,
    /// Delay between prediction status polls.
    pub poll_interval: Duration,
    /// Timeout applied to each upstream HTTP request.
    pub upstream_timeout: Duration,
    /// Largest accepted request body.
    pub max_upload_bytes: usize,
    /// Browser origins allowed by CORS.
    pub cors_origins: Vec<String>,
}

impl AppConfig {
    /// Builds configuration from environment variables.
    ///
    /// Variables:
    /// - `HOST` (default `127.0.0.1`)
    /// - `PORT` (default `8000`)
    /// - `API_KEY` (optional)
    /// - `REPLICATE_API_TOKEN` (required)
    /// - `REPLICATE_API_BASE` (default `https://api.replicate.com/v1`)
    /// - `RESTORE_MODEL_VERSION` (default GFPGAN)
    /// - `DATA_DIR` (default `.`)
    /// - `POLL_INTERVAL_MS` (default `1000`, min `100`, max `10000`)
    /// - `UPSTREAM_TIMEOUT_SECS` (default `30`, min `1`, max `300`)
    /// - `MAX_UPLOAD_BYTES` (default 20 MiB, min 1 KiB, max 200 MiB)
    /// - `CORS_ALLOWED_ORIGINS` (comma separated, default `http://127.0.0.1:5173`)
    pub fn from_env() -> Result<Self, AppError> {
        let host = env_str("HOST", "127.0.0.1");
        let port = env_u16("PORT", 8000)?;
        let upstream_token = env_opt("REPLICATE_API_TOKEN").ok_or_else(|| {
            AppError::internal("REPLICATE_API_TOKEN is not set; the prediction API requires a token")
        })?;
        let upstream_base = env_str("REPLICATE_API_BASE", DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let poll_interval_ms =
            env_u64_bounded("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS, 100, 10_000)?;
        let upstream_timeout_secs =
            env_u64_bounded("UPSTREAM_TIMEOUT_SECS", DEFAULT_UPSTREAM_TIMEOUT_SECS, 1, 300)?;
        let max_upload_bytes = env_u64_bounded(
            "MAX_UPLOAD_BYTES",
            DEFAULT_MAX_UPLOAD_BYTES as u64,
            1024,
            200 * 1024 * 1024,
        )? as usize;

        Ok(Self {
            host,
            port,
            api_key: env_opt("API_KEY"),
            upstream_token,
            upstream_base,
            model_version: env_str("RESTORE_MODEL_VERSION", DEFAULT_MODEL_VERSION),
            data_dir: PathBuf::from(env_str("DATA_DIR", ".")),
            poll_interval: Duration::from_millis(poll_interval_ms),
            upstream_timeout: Duration::from_secs(upstream_timeout_secs),
            max_upload_bytes,
            cors_origins: parse_origins(&env_str("CORS_ALLOWED_ORIGINS", DEFAULT_CORS_ORIGINS)),
        })
    }

    /// Applies command-line overrides on top of the environment.
    pub fn apply_overrides(
        &mut self,
        host: Option<String>,
        port: Option<u16>,
        data_dir: Option<PathBuf>,
    ) {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(data_dir) = data_dir {
            self.data_dir = data_dir;
        }
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn env_str(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

fn env_u16(name: &str, default: u16) -> Result<u16, AppError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.trim().parse::<u16>().map_err(|_| {
        AppError::internal(format!("invalid {name}={raw:?}; expected integer 1-65535"))
    })?;
    if parsed == 0 {
        return Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected > 0"
        )));
    }
    Ok(parsed)
}

fn env_u64_bounded(name: &str, default: u64, min: u64, max: u64) -> Result<u64, AppError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    parse_u64_bounded(name, &raw, min, max)
}

fn parse_u64_bounded(name: &str, raw: &str, min: u64, max: u64) -> Result<u64, AppError> {
    let trimmed = raw.trim();
    let parsed = trimmed.parse::<u64>().map_err(|_| {
        AppError::internal(format!(
            "invalid {name}={raw:?}; expected integer in range [{min}, {max}]"
        ))
    })?;
    if parsed < min || parsed > max {
        return Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected integer in range [{min}, {max}]"
        )));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::{parse_origins, parse_u64_bounded};

    #[test]
    fn parse_u64_bounded_accepts_in_range_values() {
        assert_eq!(
            parse_u64_bounded("POLL_INTERVAL_MS", "100", 100, 10_000).unwrap(),
            100
        );
        assert_eq!(
            parse_u64_bounded("POLL_INTERVAL_MS", " 10000 ", 100, 10_000).unwrap(),
            10_000
        );
    }

    #[test]
    fn parse_u64_bounded_rejects_non_numeric_value() {
        assert!(parse_u64_bounded("POLL_INTERVAL_MS", "soon", 100, 10_000).is_err());
    }

    #[test]
    fn parse_u64_bounded_rejects_out_of_range_values() {
        assert!(parse_u64_bounded("UPSTREAM_TIMEOUT_SECS", "0", 1, 300).is_err());
        assert!(parse_u64_bounded("UPSTREAM_TIMEOUT_SECS", "301", 1, 300).is_err());
    }

    #[test]
    fn parse_origins_skips_blank_entries() {
        assert_eq!(
            parse_origins("http://a.test, ,http://b.test,"),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }
}
