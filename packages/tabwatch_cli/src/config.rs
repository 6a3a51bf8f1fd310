use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tabwatch::lease::AcquireTiming;
use tabwatch::{BackoffPolicy, CoordinatorSettings};

// =============================================================================
// Tunables (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [lease]
//                    ttl_ms = 8000
//
//   env var:         TABWATCH_LEASE__TTL_MS=8000   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub lease: LeaseFileConfig,
    #[serde(default)]
    pub pending: PendingFileConfig,
    #[serde(default)]
    pub inbox: InboxFileConfig,
    #[serde(default)]
    pub credentials: CredentialsFileConfig,
}

/// Where the job and inbox endpoints live (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_progress_endpoint")]
    pub progress_endpoint: String,
    #[serde(default = "default_inbox_endpoint")]
    pub inbox_endpoint: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            progress_endpoint: default_progress_endpoint(),
            inbox_endpoint: default_inbox_endpoint(),
        }
    }
}

/// Lease timing (`[lease]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseFileConfig {
    /// Must exceed the server's long-poll hold time.
    #[serde(default = "default_lease_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_acquire_jitter_ms")]
    pub acquire_jitter_ms: u64,
    #[serde(default = "default_stabilize_ms")]
    pub stabilize_ms: u64,
    #[serde(default = "default_promotion_interval_ms")]
    pub promotion_interval_ms: u64,
}

impl Default for LeaseFileConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lease_ttl_ms(),
            acquire_jitter_ms: default_acquire_jitter_ms(),
            stabilize_ms: default_stabilize_ms(),
            promotion_interval_ms: default_promotion_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingFileConfig {
    #[serde(default = "default_pending_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for PendingFileConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_pending_ttl_secs(),
        }
    }
}

/// Inbox sync interval (`[inbox]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboxFileConfig {
    #[serde(default = "default_inbox_base_ms")]
    pub base_interval_ms: u64,
    #[serde(default = "default_inbox_max_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_inbox_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for InboxFileConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_inbox_base_ms(),
            max_interval_ms: default_inbox_max_ms(),
            jitter_ms: default_inbox_jitter_ms(),
        }
    }
}

/// Bearer token lookup (`[credentials]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialsFileConfig {
    /// Environment variable holding the token. Unset means anonymous requests.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_token_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_credential_attempts")]
    pub attempts: u32,
    #[serde(default = "default_credential_backoff_ms")]
    pub backoff_base_ms: u64,
}

impl Default for CredentialsFileConfig {
    fn default() -> Self {
        Self {
            token_env: None,
            cache_ttl_secs: default_token_cache_ttl_secs(),
            attempts: default_credential_attempts(),
            backoff_base_ms: default_credential_backoff_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_progress_endpoint() -> String {
    "api/tasks".to_string()
}
fn default_inbox_endpoint() -> String {
    "api/notifications".to_string()
}
fn default_lease_ttl_ms() -> u64 {
    45_000
}
fn default_acquire_jitter_ms() -> u64 {
    60
}
fn default_stabilize_ms() -> u64 {
    50
}
fn default_promotion_interval_ms() -> u64 {
    5_000
}
fn default_pending_ttl_secs() -> u64 {
    600
}
fn default_inbox_base_ms() -> u64 {
    15_000
}
fn default_inbox_max_ms() -> u64 {
    300_000
}
fn default_inbox_jitter_ms() -> u64 {
    3_000
}
fn default_token_cache_ttl_secs() -> u64 {
    300
}
fn default_credential_attempts() -> u32 {
    5
}
fn default_credential_backoff_ms() -> u64 {
    1_000
}

impl FileConfig {
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            lease_ttl: Duration::from_millis(self.lease.ttl_ms),
            acquire: AcquireTiming {
                jitter: Duration::from_millis(self.lease.acquire_jitter_ms),
                stabilize: Duration::from_millis(self.lease.stabilize_ms),
            },
            promotion_interval: Duration::from_millis(self.lease.promotion_interval_ms),
            pending_ttl: Duration::from_secs(self.pending.ttl_secs),
            credential_attempts: self.credentials.attempts,
            credential_backoff: Duration::from_millis(self.credentials.backoff_base_ms),
            ..Default::default()
        }
    }

    pub fn inbox_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.inbox.base_interval_ms),
            max: Duration::from_millis(self.inbox.max_interval_ms),
            jitter: Duration::from_millis(self.inbox.jitter_ms),
        }
    }
}

/// Layers: defaults → `<data_dir>/config.toml` → `TABWATCH_*` env vars.
///
///   `TABWATCH_SERVER__BASE_URL=https://dash.example`  →  `server.base_url`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("TABWATCH_").split("__"))
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct TabwatchConfig {
    pub data_dir: PathBuf,
    /// Backing directory of the shared store, one file per key.
    pub store_dir: PathBuf,
}

impl TabwatchConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::data_local_dir()
                .context("Could not determine a local data directory")?
                .join("tabwatch"),
        };

        let store_dir = data_dir.join("store");
        std::fs::create_dir_all(&store_dir)
            .with_context(|| format!("Failed to create store directory: {:?}", store_dir))?;

        Ok(Self {
            data_dir,
            store_dir,
        })
    }
}
