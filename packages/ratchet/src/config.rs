use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Engine behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Convert panics inside phases into `system/internal_error`.
    pub capture_panics: bool,
    /// Reject subcommand calls into undeclared domains.
    pub enforce_domain_boundaries: bool,
    /// Memoize resolved callback chains.
    pub cache_callback_chains: bool,
    /// Used by `Engine::run_with_default_timeout`.
    pub default_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_panics: true,
            enforce_domain_boundaries: true,
            cache_callback_chains: true,
            default_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads a `.env` file if one exists. Unset variables keep their default.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let default_timeout = match env::var("RATCHET_DEFAULT_TIMEOUT_MS") {
            Ok(ms) => Some(Duration::from_millis(
                ms.parse()
                    .context("RATCHET_DEFAULT_TIMEOUT_MS must be a number of milliseconds")?,
            )),
            Err(_) => defaults.default_timeout,
        };

        Ok(Self {
            capture_panics: flag("RATCHET_CAPTURE_PANICS", defaults.capture_panics)?,
            enforce_domain_boundaries: flag(
                "RATCHET_ENFORCE_DOMAIN_BOUNDARIES",
                defaults.enforce_domain_boundaries,
            )?,
            cache_callback_chains: flag(
                "RATCHET_CACHE_CALLBACK_CHAINS",
                defaults.cache_callback_chains,
            )?,
            default_timeout,
        })
    }
}

fn flag(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(value) => parse_flag(&value).with_context(|| format!("{name} must be a boolean")),
        Err(_) => Ok(default),
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("unrecognised boolean {other:?}"),
    }
}
