use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 60 * 60;
const MAX_TOKEN_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// One source of client settings; unset fields defer to the next layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SettingsLayer {
    pub api_base_url: Option<String>,
    pub database_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub token_ttl_secs: Option<u64>,
}

impl SettingsLayer {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads `WORKFLOW_HUB_*` variables through `lookup`. Blank or unparsable
    /// values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |key: &str| text(key).and_then(|v| v.parse::<u64>().ok());
        Self {
            api_base_url: text("WORKFLOW_HUB_API_URL"),
            database_url: text("WORKFLOW_HUB_DATABASE_URL"),
            request_timeout_secs: secs("WORKFLOW_HUB_TIMEOUT_SECS"),
            token_ttl_secs: secs("WORKFLOW_HUB_TOKEN_TTL_SECS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub api_base_url: String,
    /// `None` selects the per-user default database.
    pub database_url: Option<String>,
    pub request_timeout: Duration,
    pub token_ttl: chrono::Duration,
}

pub fn resolve_effective_settings(env: &SettingsLayer, cli: &SettingsLayer) -> EffectiveSettings {
    let api_base_url = cli
        .api_base_url
        .clone()
        .or_else(|| env.api_base_url.clone())
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.into());

    let database_url = cli.database_url.clone().or_else(|| env.database_url.clone());

    let timeout_secs = cli
        .request_timeout_secs
        .or(env.request_timeout_secs)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

    let ttl_secs = cli
        .token_ttl_secs
        .or(env.token_ttl_secs)
        .unwrap_or(DEFAULT_TOKEN_TTL_SECS)
        .min(MAX_TOKEN_TTL_SECS);

    EffectiveSettings {
        api_base_url,
        database_url,
        request_timeout: Duration::from_secs(timeout_secs),
        token_ttl: chrono::Duration::seconds(ttl_secs as i64),
    }
}
