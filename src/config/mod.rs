use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::ds3::{BulkConfig, ChunkOrdering, Credentials, Ds3Client, HttpTransport};

/// DS3 profile: endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// DS3 endpoint URL
    pub endpoint: String,

    /// DS3 access id
    pub access_key: String,

    /// DS3 secret key
    pub secret_key: String,

    /// Optional http proxy URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// 307 responses tolerated per request (default: 5)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure_tls: bool,
}

fn default_max_redirects() -> u32 {
    crate::ds3::DEFAULT_MAX_REDIRECTS
}

fn default_request_timeout() -> u64 {
    300
}

impl Profile {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            proxy: None,
            max_redirects: default_max_redirects(),
            request_timeout: default_request_timeout(),
            insecure_tls: false,
        }
    }

    pub fn credentials(&self) -> Result<Credentials> {
        Credentials::new(self.access_key.as_str(), self.secret_key.as_str())
            .context("Profile credentials are incomplete")
    }

    /// Build a client over the hyper transport for this profile
    pub fn client(&self) -> Result<Ds3Client<HttpTransport>> {
        let transport = HttpTransport::new(&self.credentials()?, self.insecure_tls)
            .context("Failed to create HTTP transport")?
            .with_timeout(Duration::from_secs(self.request_timeout));

        let mut client = Ds3Client::new(&self.endpoint, transport)
            .context(format!("Invalid endpoint: {:?}", self.endpoint))?
            .with_max_redirects(self.max_redirects);
        if let Some(proxy) = &self.proxy {
            client = client.with_proxy(proxy.as_str());
        }
        Ok(client)
    }
}

/// Bulk job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSettings {
    /// Concurrent object transfers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Chunk polls before a job times out
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Delay between empty polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Ask the service to hand out GET chunks in order
    #[serde(default)]
    pub process_chunks_in_order: bool,
}

fn default_workers() -> usize {
    4
}

fn default_max_poll_attempts() -> u32 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_poll_attempts: default_max_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            process_chunks_in_order: false,
        }
    }
}

impl BulkSettings {
    pub fn to_bulk_config(&self) -> BulkConfig {
        BulkConfig {
            workers: self.workers.max(1),
            max_poll_attempts: self.max_poll_attempts,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            chunk_ordering: if self.process_chunks_in_order {
                ChunkOrdering::InOrder
            } else {
                ChunkOrdering::None
            },
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Named DS3 profiles
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,

    /// Profile used when none is named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,

    /// Bulk job settings
    #[serde(default)]
    pub bulk: BulkSettings,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a profile by name, or the default profile if not specified
    pub fn get_profile(&self, name: Option<&str>) -> Option<&Profile> {
        if let Some(name) = name {
            self.profiles.get(name)
        } else if let Some(default) = &self.default_profile {
            self.profiles.get(default)
        } else {
            self.profiles.values().next()
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(variable = name, value = %value, "Ignoring non-numeric environment value");
            None
        }
    }
}

/// Load configuration from environment variables
///
/// - DS3_ENDPOINT, DS3_ACCESS_KEY, DS3_SECRET_KEY (required)
/// - http_proxy / HTTP_PROXY (optional)
/// - DS3_MAX_REDIRECTS, DS3_REQUEST_TIMEOUT, DS3_INSECURE_TLS (optional)
/// - DS3_BULK_WORKERS, DS3_MAX_POLL_ATTEMPTS, DS3_POLL_INTERVAL_MS (optional)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let endpoint = std::env::var("DS3_ENDPOINT")
        .context("DS3_ENDPOINT environment variable not set")?;
    if endpoint.trim().is_empty() {
        anyhow::bail!("DS3_ENDPOINT is empty");
    }

    let access_key = std::env::var("DS3_ACCESS_KEY")
        .context("DS3_ACCESS_KEY environment variable not set")?;
    let secret_key = std::env::var("DS3_SECRET_KEY")
        .context("DS3_SECRET_KEY environment variable not set")?;

    let mut profile = Profile::new(endpoint.trim(), &access_key, &secret_key);
    profile.proxy = std::env::var("http_proxy")
        .or_else(|_| std::env::var("HTTP_PROXY"))
        .ok()
        .filter(|p| !p.trim().is_empty());
    if let Some(max_redirects) = env_number("DS3_MAX_REDIRECTS") {
        profile.max_redirects = max_redirects;
    }
    if let Some(timeout) = env_number("DS3_REQUEST_TIMEOUT") {
        profile.request_timeout = timeout;
    }
    if let Ok(insecure) = std::env::var("DS3_INSECURE_TLS") {
        profile.insecure_tls = insecure == "true" || insecure == "1";
    }

    let mut config = Config::new();
    config.profiles.insert("default".to_string(), profile);
    config.default_profile = Some("default".to_string());

    if let Some(workers) = env_number("DS3_BULK_WORKERS") {
        config.bulk.workers = workers;
    }
    if let Some(attempts) = env_number("DS3_MAX_POLL_ATTEMPTS") {
        config.bulk.max_poll_attempts = attempts;
    }
    if let Some(interval) = env_number("DS3_POLL_INTERVAL_MS") {
        config.bulk.poll_interval_ms = interval;
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// # Arguments
/// * `config_path` - Optional path to YAML config file
/// * `profile_name` - Optional profile name to use (only relevant for YAML configs)
pub fn load_config(config_path: Option<&str>, profile_name: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        let mut config = load_from_yaml(path)?;

        // If a specific profile is requested, make it the default
        if let Some(name) = profile_name {
            if !config.profiles.contains_key(name) {
                anyhow::bail!("Profile '{}' not found in config file", name);
            }
            config.default_profile = Some(name.to_string());
        }

        Ok(config)
    } else {
        load_from_env()
    }
}
