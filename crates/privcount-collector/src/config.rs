//! Data collector configuration.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};

use privcount_core::crypto;
use privcount_core::node::valid_sigma_decrease_tolerance;

use crate::error::{Error, Result};

/// Address of the tally server.
#[derive(Debug, Clone, Deserialize)]
pub struct TallyServerInfo {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    name: String,
    /// Local port of the relay event source.
    event_source: u16,
    /// Authorized share keeper key digests; shares are only ever encrypted
    /// to keys whose digest is in this set.
    share_keepers: BTreeSet<String>,
    tally_server_info: TallyServerInfo,
    state: PathBuf,
    secret_handshake: Option<PathBuf>,
    /// This relay's fingerprint, used to look up its noise weight.
    fingerprint: Option<String>,
    delay_period: Option<f64>,
    always_delay: Option<bool>,
    sigma_decrease_tolerance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigDocument {
    data_collector: RawConfig,
}

/// The validated data collector configuration.
#[derive(Debug, Clone)]
pub struct DataCollectorConfig {
    pub name: String,
    pub event_source: u16,
    pub share_keepers: BTreeSet<String>,
    pub tally_server_address: String,
    pub state: PathBuf,
    pub secret_handshake: PathBuf,
    pub fingerprint: Option<String>,
    pub delay_period: Option<f64>,
    pub always_delay: bool,
    pub sigma_decrease_tolerance: f64,
}

impl DataCollectorConfig {
    /// Load and validate the config from a YAML file.
    pub fn load(config_path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(config_path)?;
        let document: ConfigDocument = serde_yaml::from_str(&text)?;
        let raw = document.data_collector;
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));

        if raw.name.is_empty() {
            return Err(Error::Config("data collector needs a name".into()));
        }
        if raw.event_source == 0 {
            return Err(Error::Config("event_source port must be positive".into()));
        }
        if raw.share_keepers.is_empty() {
            return Err(Error::Config(
                "data collector needs at least one authorized share keeper".into(),
            ));
        }

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

        Ok(DataCollectorConfig {
            name: raw.name,
            event_source: raw.event_source,
            share_keepers: raw.share_keepers,
            tally_server_address: format!(
                "{}:{}",
                raw.tally_server_info.ip, raw.tally_server_info.port
            ),
            state: resolve_path(base, &raw.state),
            secret_handshake,
            fingerprint: raw.fingerprint,
            delay_period: raw.delay_period,
            always_delay: raw.always_delay.unwrap_or(false),
            sigma_decrease_tolerance,
        })
    }

    /// A config echo safe to send to the tally server.
    pub fn sanitized(&self) -> Value {
        json!({
            "name": self.name,
            "event_source": self.event_source,
            "share_keepers": self.share_keepers,
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASE_CONFIG: &str = r#"
data_collector:
  name: dc-test
  event_source: 20003
  share_keepers:
    - 1111111111111111111111111111111111111111111111111111111111111111
  tally_server_info:
    ip: 127.0.0.1
    port: 20001
  state: dc.state
  fingerprint: FINGERPRINT1
"#;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("dc.yaml");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(body.as_bytes()).expect("write");
        path
    }

    #[test]
    fn loads_and_sanitizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(dir.path(), BASE_CONFIG);
        let config = DataCollectorConfig::load(&path).expect("loads");
        assert_eq!(config.name, "dc-test");
        assert_eq!(config.tally_server_address, "127.0.0.1:20001");
        assert_eq!(config.share_keepers.len(), 1);
        let sanitized = config.sanitized();
        assert_eq!(sanitized["state"], "(state path)");
        assert_eq!(sanitized["secret_handshake"], "(secret_handshake path)");
    }

    #[test]
    fn rejects_empty_share_keepers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = BASE_CONFIG.replace(
            "  share_keepers:\n    - 1111111111111111111111111111111111111111111111111111111111111111\n",
            "  share_keepers: []\n",
        );
        let path = write_config(dir.path(), &body);
        assert!(DataCollectorConfig::load(&path).is_err());
    }
}
