use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

use crate::session::Session;

/// Configuration file read from the working directory, if present.
pub const CONFIG_FILE: &str = "knowledge-vaults.toml";

/// Environment prefix; nested keys use `__`, e.g. `KV_STORE__BACKEND=rest`.
pub const ENV_PREFIX: &str = "KV_";

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| {
    Config::load().expect("FATAL: failed to load knowledge-vaults configuration")
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub basic: BasicConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Defaults, then `knowledge-vaults.toml`, then `KV_*` environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicConfig {
    pub loglevel: String,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            loglevel: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Rest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// SQLite database for the embedded backend.
    pub database_url: String,
    /// Base of the REST collections, e.g. `https://db.example.com/rest/v1`.
    pub rest_url: Option<String>,
    /// Server-Sent Events change feed.
    pub realtime_url: Option<String>,
    pub api_key: String,
    /// Bearer token of the signed-in user; falls back to `api_key`.
    pub access_token: Option<String>,
    pub proxy: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            database_url: "sqlite:knowledge-vaults.db".to_string(),
            rest_url: None,
            realtime_url: None,
            api_key: String::new(),
            access_token: None,
            proxy: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 15,
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Trailing-edge window for coalescing change notifications. Zero refetches immediately.
    pub refetch_debounce_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            refetch_debounce_ms: 150,
        }
    }
}

impl SyncConfig {
    pub fn refetch_debounce(&self) -> Duration {
        Duration::from_millis(self.refetch_debounce_ms)
    }
}

/// Identity the CLI acts as. Sign-in happens elsewhere; this only names the profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub profile_id: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

impl SessionConfig {
    pub fn session(&self) -> Option<Session> {
        self.session_for(self.profile_id.as_deref()?)
    }

    /// Session for `profile_id`. The configured name and email only apply
    /// when it is the configured profile.
    pub fn session_for(&self, profile_id: &str) -> Option<Session> {
        let profile_id = profile_id.trim();
        if profile_id.is_empty() {
            return None;
        }
        let configured = self.profile_id.as_deref().map(str::trim) == Some(profile_id);
        if !configured {
            return Some(Session::new(profile_id));
        }
        Some(Session {
            profile_id: profile_id.to_string(),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
        })
    }
}
