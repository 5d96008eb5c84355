use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// HMAC-SHA256 secret guarding the webhook endpoint. Unset disables
    /// signature validation (local/dev deployments).
    #[serde(default, rename = "webhookSecret")]
    pub webhook_secret: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8088
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "courier.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Phone normalization policy. The country code default is a deployment
/// convention, never hard-coded at call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_country_code", rename = "defaultCountryCode")]
    pub default_country_code: Option<String>,
    #[serde(default = "default_min_phone_digits", rename = "minPhoneDigits")]
    pub min_phone_digits: usize,
    #[serde(default = "default_max_phone_digits", rename = "maxPhoneDigits")]
    pub max_phone_digits: usize,
}

fn default_country_code() -> Option<String> {
    Some("55".to_string())
}

fn default_min_phone_digits() -> usize {
    8
}

fn default_max_phone_digits() -> usize {
    15
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            default_country_code: default_country_code(),
            min_phone_digits: default_min_phone_digits(),
            max_phone_digits: default_max_phone_digits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestConfig {
    /// Accept group/channel/broadcast senders as first-class contacts.
    /// Disabled by default: such events are rejected with
    /// `UnsupportedSenderKind`.
    #[serde(default, rename = "allowGroupSenders")]
    pub allow_group_senders: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_sweep_interval", rename = "sweepIntervalSecs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_send_buffer", rename = "sendBuffer")]
    pub send_buffer: usize,
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_send_buffer() -> usize {
    64
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            send_buffer: default_send_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_merge_attempts", rename = "mergeMaxAttempts")]
    pub merge_max_attempts: u32,
    /// Periodic batch sweep interval. Zero disables the background sweep
    /// (the `sweep` subcommand still runs one on demand).
    #[serde(default = "default_dedup_sweep_interval", rename = "sweepIntervalSecs")]
    pub sweep_interval_secs: u64,
}

fn default_merge_attempts() -> u32 {
    3
}

fn default_dedup_sweep_interval() -> u64 {
    0
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            merge_max_attempts: default_merge_attempts(),
            sweep_interval_secs: default_dedup_sweep_interval(),
        }
    }
}
