//! Share keeper configuration.
//!
//! The keeper's name is not configured: it is the SHA-256 digest of its
//! public key, which is how data collectors authorize it.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};

use privcount_core::crypto;
use privcount_core::node::valid_sigma_decrease_tolerance;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct TallyServerInfo {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    key: Option<PathBuf>,
    state: PathBuf,
    secret_handshake: Option<PathBuf>,
    tally_server_info: TallyServerInfo,
    delay_period: Option<f64>,
    always_delay: Option<bool>,
    sigma_decrease_tolerance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigDocument {
    share_keeper: RawConfig,
}

/// The validated share keeper configuration.
#[derive(Debug, Clone)]
pub struct ShareKeeperConfig {
    pub key: PathBuf,
    /// SHA-256 hex digest of the public key.
    pub name: String,
    pub state: PathBuf,
    pub secret_handshake: PathBuf,
    pub tally_server_address: String,
    pub delay_period: Option<f64>,
    pub always_delay: bool,
    pub sigma_decrease_tolerance: f64,
}

impl ShareKeeperConfig {
    /// Load and validate the config, generating the keypair on first start
    /// if the key file does not exist.
    pub fn load(config_path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(config_path)?;
        let document: ConfigDocument = serde_yaml::from_str(&text)?;
        let raw = document.share_keeper;
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));

        let key = resolve_path(
            base,
            &raw.key.unwrap_or_else(|| PathBuf::from("privcount.rsa_key.pem")),
        );
        if !key.exists() {
            tracing::info!("generating share keeper keypair at {}", key.display());
            crypto::generate_keypair(&key).map_err(|e| Error::Config(e.to_string()))?;
        }
        let name =
            crypto::private_key_file_digest(&key).map_err(|e| Error::Config(e.to_string()))?;

        let secret_handshake = resolve_path(
            base,
            &raw.secret_handshake
                .unwrap_or_else(|| PathBuf::from("privcount.secret_handshake.yaml")),
        );
        crypto::load_or_create_secret(&secret_handshake)
            .map_err(|e| Error::Config(format!("secret handshake: {e}")))?;

        let sigma_decrease_tolerance =
            valid_sigma_decrease_tolerance(raw.sigma_decrease_tolerance)
                .map_err(|e| Error::Config(e.to_string()))?;

        Ok(ShareKeeperConfig {
            key,
            name,
            state: resolve_path(base, &raw.state),
            secret_handshake,
            tally_server_address: format!(
                "{}:{}",
                raw.tally_server_info.ip, raw.tally_server_info.port
            ),
            delay_period: raw.delay_period,
            always_delay: raw.always_delay.unwrap_or(false),
            sigma_decrease_tolerance,
        })
    }

    /// A config echo safe to send to the tally server.
    pub fn sanitized(&self) -> Value {
        json!({
            "key": "(key path)",
            "name": self.name,
            "state": "(state path)",
            "secret_handshake": "(secret_handshake path)",
            "delay_period": self.delay_period,
            "always_delay": self.always_delay,
            "sigma_decrease_tolerance": self.sigma_decrease_tolerance,
        })
    }
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}
