use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::reseed::{ReseedConfig, SamplingPolicy};

/// Lower bound on the rebuild interval; anything shorter turns the scheduler
/// into a tight loop.
pub const MIN_REBUILD_INTERVAL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub signer: SignerConfig,
    pub netdb: NetDbConfig,
    #[serde(default)]
    pub bundles: BundleConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    /// su3 signer id, usually an email-like address (e.g. `you@mail.i2p`).
    pub id: String,
    /// Path to the private signing key.  Defaults to the signer id with `@`
    /// replaced by `_at_` and a `.pem` suffix.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl SignerConfig {
    pub fn resolved_key_path(&self) -> PathBuf {
        self.key_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(signer_key_file(&self.id)))
    }
}

/// Default key filename for a signer id: `you@mail.i2p` -> `you_at_mail.i2p.pem`.
pub fn signer_key_file(signer_id: &str) -> String {
    format!("{}.pem", signer_id.replacen('@', "_at_", 1))
}

// ---------------------------------------------------------------------------
// NetDb
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NetDbConfig {
    /// Directory holding `routerInfo-*.dat` files (searched recursively).
    pub path: PathBuf,
    /// Ignore router infos whose mtime is older than this many seconds.
    /// `0` disables the filter.
    #[serde(default)]
    pub max_age_secs: u64,
}

// ---------------------------------------------------------------------------
// Bundle generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BundleConfig {
    /// Router infos packed into each su3 file.
    #[serde(default = "default_records_per_bundle")]
    pub records_per_bundle: usize,
    /// Number of su3 files per generation; `0` sizes it from the netDb.
    #[serde(default)]
    pub bundle_count: usize,
    /// Redundancy factor applied to `ceil(records / records_per_bundle)` when
    /// `bundle_count` is automatic.
    #[serde(default = "default_auto_multiplier")]
    pub auto_multiplier: usize,
    /// Hard ceiling on bundles per generation.
    #[serde(default = "default_max_bundles")]
    pub max_bundles: usize,
    /// Seconds between cache rebuilds.
    #[serde(default = "default_rebuild_interval")]
    pub rebuild_interval_secs: u64,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            records_per_bundle: default_records_per_bundle(),
            bundle_count: 0,
            auto_multiplier: default_auto_multiplier(),
            max_bundles: default_max_bundles(),
            rebuild_interval_secs: default_rebuild_interval(),
        }
    }
}

fn default_records_per_bundle() -> usize {
    75
}

fn default_auto_multiplier() -> usize {
    4
}

fn default_max_bundles() -> usize {
    1000
}

fn default_rebuild_interval() -> u64 {
    12 * 60 * 60
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Path prefix for the reseed endpoint (e.g. `/netdb`).  Empty for none.
    #[serde(default)]
    pub prefix: String,
    /// Take the client address from `X-Forwarded-For` (behind a TLS proxy).
    #[serde(default)]
    pub trust_proxy: bool,
    /// User agents allowed to download bundles.  Empty allows everyone.
    #[serde(default = "default_allowed_user_agents")]
    pub allowed_user_agents: Vec<String>,
    /// PEM certificate chain.  With `tls_key`, the listener speaks HTTPS.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    /// PEM private key matching `tls_cert`.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

impl ServerConfig {
    /// Certificate and key paths when in-process TLS is configured.
    pub fn tls(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            prefix: String::new(),
            trust_proxy: false,
            allowed_user_agents: default_allowed_user_agents(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_allowed_user_agents() -> Vec<String> {
    vec!["Wget/1.11.4".to_string()]
}

// ---------------------------------------------------------------------------
// Conversion into the core config
// ---------------------------------------------------------------------------

impl Config {
    /// Immutable settings handed to the reseeder.
    pub fn reseed_config(&self) -> ReseedConfig {
        ReseedConfig {
            records_per_bundle: self.bundles.records_per_bundle,
            bundle_count: self.bundles.bundle_count,
            policy: SamplingPolicy {
                auto_multiplier: self.bundles.auto_multiplier,
                max_bundles: self.bundles.max_bundles,
            },
            rebuild_interval: Duration::from_secs(self.bundles.rebuild_interval_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.signer.id.is_empty(), "signer.id is required");
    anyhow::ensure!(
        config.signer.id.len() <= 255,
        "signer.id must be at most 255 bytes"
    );
    anyhow::ensure!(
        config.bundles.records_per_bundle >= 1,
        "bundles.records_per_bundle must be at least 1"
    );
    anyhow::ensure!(
        config.bundles.auto_multiplier >= 1,
        "bundles.auto_multiplier must be at least 1"
    );
    anyhow::ensure!(
        config.bundles.max_bundles >= 1,
        "bundles.max_bundles must be at least 1"
    );
    anyhow::ensure!(
        config.bundles.rebuild_interval_secs >= MIN_REBUILD_INTERVAL_SECS,
        "bundles.rebuild_interval_secs must be at least {MIN_REBUILD_INTERVAL_SECS}"
    );
    let prefix = &config.server.prefix;
    anyhow::ensure!(
        prefix.is_empty() || (prefix.starts_with('/') && !prefix.ends_with('/')),
        "server.prefix must be empty or start with '/' and not end with '/'"
    );
    anyhow::ensure!(
        config.server.tls_cert.is_some() == config.server.tls_key.is_some(),
        "server.tls_cert and server.tls_key must be set together"
    );
    Ok(())
}
