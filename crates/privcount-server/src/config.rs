//! Tally server configuration: one YAML document, re-read every event
//! period so operators can adjust counters and thresholds between rounds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use privcount_core::counter::{
    check_counters_config, check_noise_weight_config, NoiseWeightConfig,
};
use privcount_core::crypto;
use privcount_core::node::{valid_delay_period, valid_sigma_decrease_tolerance, ContinuePolicy};
use privcount_core::noise::{get_noise_allocation, NoiseSpec, DEFAULT_SIGMA_TOLERANCE};
use privcount_core::traffic::{TrafficModel, TrafficModelConfig};
use privcount_core::CountersConfig;

use crate::error::{Error, Result};

/// An inline structure or a path to a YAML file holding one.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum InlineOrPath<T> {
    Path(PathBuf),
    Inline(T),
}

impl<T: serde::de::DeserializeOwned> InlineOrPath<T> {
    fn resolve(self, base: &Path) -> Result<T> {
        match self {
            InlineOrPath::Inline(value) => Ok(value),
            InlineOrPath::Path(path) => {
                let path = if path.is_relative() {
                    base.join(path)
                } else {
                    path
                };
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Ok(serde_yaml::from_str(&text)?)
            }
        }
    }
}

/// The `counters` file shape: `counters:` mapping names to bins.
#[derive(Debug, Clone, Deserialize)]
struct CountersDocument {
    counters: CountersConfig,
}

/// The `tally_server` section as written in YAML.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    listen_port: u16,
    secret_handshake: Option<PathBuf>,
    key: Option<PathBuf>,
    cert: Option<PathBuf>,
    state: PathBuf,
    results: Option<PathBuf>,
    collect_period: f64,
    event_period: Option<f64>,
    checkin_period: Option<f64>,
    delay_period: Option<f64>,
    always_delay: Option<bool>,
    sigma_decrease_tolerance: Option<f64>,
    dc_threshold: usize,
    sk_threshold: usize,
    noise_weight: NoiseWeightConfig,
    #[serde(rename = "continue")]
    continue_policy: Option<ContinuePolicy>,
    counters: Option<InlineOrPath<CountersDocument>>,
    noise: Option<InlineOrPath<NoiseSpec>>,
    sigmas: Option<InlineOrPath<NoiseSpec>>,
    allocation: Option<PathBuf>,
    traffic_model: Option<InlineOrPath<TrafficModelConfig>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigDocument {
    tally_server: RawConfig,
}

/// The validated tally server configuration.
#[derive(Debug, Clone)]
pub struct TallyServerConfig {
    pub listen_port: u16,
    pub secret_handshake: PathBuf,
    pub key: PathBuf,
    pub cert: PathBuf,
    pub state: PathBuf,
    pub results: PathBuf,
    pub collect_period: f64,
    pub event_period: f64,
    pub checkin_period: f64,
    pub delay_period: f64,
    pub always_delay: bool,
    pub sigma_decrease_tolerance: f64,
    pub dc_threshold: usize,
    pub sk_threshold: usize,
    pub noise_weight: NoiseWeightConfig,
    pub continue_policy: ContinuePolicy,
    /// Counter bins, including expanded traffic-model counters.
    pub counters: CountersConfig,
    /// Noise config with sigmas resolved (allocated from a privacy budget
    /// when one was configured).
    pub noise: NoiseSpec,
    pub traffic_model: Option<TrafficModelConfig>,
}

impl TallyServerConfig {
    /// Load and validate the config from a YAML file.
    ///
    /// Fatal at process start; on refresh the caller logs the error and
    /// keeps the previous config.
    pub fn load(config_path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(config_path)?;
        let document: ConfigDocument = serde_yaml::from_str(&text)?;
        let raw = document.tally_server;
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));

        if raw.dc_threshold == 0 || raw.sk_threshold == 0 {
            return Err(Error::Config("dc_threshold and sk_threshold must be positive".into()));
        }
        if raw.collect_period <= 0.0 {
            return Err(Error::Config("collect_period must be positive".into()));
        }

        // event and checkin periods above half the collect period delay
        // results or never finish; clamp with a warning
        let period_max = raw.collect_period / 2.0;
        let mut event_period = raw.event_period.unwrap_or(60.0);
        if event_period > period_max {
            tracing::warn!(
                "event_period {:.0} too large for collect_period {:.0}, reducing to {:.0}",
                event_period,
                raw.collect_period,
                period_max
            );
            event_period = period_max;
        }
        let mut checkin_period = raw.checkin_period.unwrap_or(60.0);
        if checkin_period > period_max {
            tracing::warn!(
                "checkin_period {:.0} too large for collect_period {:.0}, reducing to {:.0}",
                checkin_period,
                raw.collect_period,
                period_max
            );
            checkin_period = period_max;
        }
        if checkin_period > event_period {
            tracing::info!(
                "checkin_period {:.0} greater than event_period {:.0}, client statuses might be delayed",
                checkin_period,
                event_period
            );
        }

        let delay_period = valid_delay_period(raw.delay_period, raw.collect_period);

        let mut counters = raw
            .counters
            .ok_or_else(|| Error::Config("tally server has no counters".into()))?
            .resolve(base)?
            .counters;

        // noise takes precedence over sigmas when both are configured
        let noise_input = match (raw.noise, raw.sigmas) {
            (Some(noise), _) => noise.resolve(base)?,
            (None, Some(sigmas)) => sigmas.resolve(base)?,
            (None, None) => {
                return Err(Error::Config(
                    "tally server needs either a noise or a sigmas config".into(),
                ));
            }
        };

        let mut noise = if noise_input.privacy.is_some() {
            let allocated = get_noise_allocation(&noise_input)?;
            if let Some(allocation_path) = &raw.allocation {
                let allocation_path = if allocation_path.is_relative() {
                    base.join(allocation_path)
                } else {
                    allocation_path.clone()
                };
                std::fs::write(&allocation_path, serde_yaml::to_string(&allocated)?)?;
                tracing::info!(
                    "computed noise allocation written to {}",
                    allocation_path.display()
                );
            }
            allocated
        } else {
            noise_input
        };

        // expand the traffic model into concrete counters and noise entries
        let traffic_model = match raw.traffic_model {
            Some(model) => {
                let model_config = model.resolve(base)?;
                let model = TrafficModel::new(model_config.clone())?;
                model.register_counters();
                let expanded_noise = model.expand_noise_config(&noise)?;
                // template entries are placeholders, not counters
                noise
                    .counters
                    .retain(|name, _| !name.contains('<'));
                noise.counters.extend(expanded_noise);
                counters.extend(model.bins_init_config());
                Some(model_config)
            }
            None => None,
        };

        if !check_counters_config(&counters, &noise.sigmas_config(), false) {
            return Err(Error::Config(
                "counters and sigmas failed validation".into(),
            ));
        }
        tracing::info!(
            "configured {} counters with {} bins",
            counters.len(),
            privcount_core::counter::count_bins(&counters)
        );
        if !check_noise_weight_config(&raw.noise_weight, raw.dc_threshold) {
            return Err(Error::Config("noise weight config failed validation".into()));
        }

        let sigma_decrease_tolerance =
            valid_sigma_decrease_tolerance(raw.sigma_decrease_tolerance)
                .map_err(|e| Error::Config(e.to_string()))?;
        // a decrease tolerance below the allocation's own search tolerance
        // makes no sense
        if let Some(privacy) = &noise.privacy {
            let allocation_tolerance =
                privacy.sigma_tolerance.unwrap_or(DEFAULT_SIGMA_TOLERANCE);
            if sigma_decrease_tolerance < allocation_tolerance {
                return Err(Error::Config(format!(
                    "sigma_decrease_tolerance {sigma_decrease_tolerance} is below the \
                     allocation sigma tolerance {allocation_tolerance}"
                )));
            }
        }

        let secret_handshake = raw
            .secret_handshake
            .unwrap_or_else(|| PathBuf::from("privcount.secret_handshake.yaml"));
        crypto::load_or_create_secret(&resolve_path(base, &secret_handshake))
            .map_err(|e| Error::Config(format!("secret handshake: {e}")))?;

        // generate the keypair when either file is missing; the cert here is
        // the public key material handed to the channel-security layer
        let key = resolve_path(
            base,
            &raw.key.unwrap_or_else(|| PathBuf::from("privcount.rsa_key.pem")),
        );
        let cert = resolve_path(
            base,
            &raw.cert.unwrap_or_else(|| PathBuf::from("privcount.rsa_key.cert")),
        );
        if !key.exists() || !cert.exists() {
            tracing::info!("generating tally server keypair at {}", key.display());
            crypto::generate_keypair(&key).map_err(|e| Error::Config(e.to_string()))?;
            let loaded = crypto::load_private_key_file(&key)
                .map_err(|e| Error::Config(e.to_string()))?;
            let public_pem = crypto::public_key_pem(&loaded.to_public_key())
                .map_err(|e| Error::Config(e.to_string()))?;
            std::fs::write(&cert, public_pem)?;
        }

        let results = resolve_path(base, &raw.results.unwrap_or_else(|| PathBuf::from(".")));
        if !results.exists() {
            return Err(Error::Config(format!(
                "results directory {} does not exist",
                results.display()
            )));
        }

        Ok(TallyServerConfig {
            listen_port: raw.listen_port,
            secret_handshake: resolve_path(base, &secret_handshake),
            key,
            cert,
            state: resolve_path(base, &raw.state),
            results,
            collect_period: raw.collect_period,
            event_period,
            checkin_period,
            delay_period,
            always_delay: raw.always_delay.unwrap_or(false),
            sigma_decrease_tolerance,
            dc_threshold: raw.dc_threshold,
            sk_threshold: raw.sk_threshold,
            noise_weight: raw.noise_weight,
            continue_policy: raw.continue_policy.unwrap_or_default(),
            counters,
            noise,
            traffic_model,
        })
    }

    /// A config echo safe to publish in outcome files: paths are replaced by
    /// literal markers and counter structures by placeholders.
    pub fn sanitized(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("listen_port".into(), self.listen_port.into());
        map.insert("secret_handshake".into(), "(secret_handshake path)".into());
        map.insert("key".into(), "(key path)".into());
        map.insert("cert".into(), "(cert path)".into());
        map.insert("state".into(), "(state path)".into());
        map.insert("results".into(), "(results path)".into());
        map.insert("allocation".into(), "(allocation path)".into());
        map.insert("collect_period".into(), self.collect_period.into());
        map.insert("event_period".into(), self.event_period.into());
        map.insert("checkin_period".into(), self.checkin_period.into());
        map.insert("delay_period".into(), self.delay_period.into());
        map.insert("always_delay".into(), self.always_delay.into());
        map.insert(
            "sigma_decrease_tolerance".into(),
            self.sigma_decrease_tolerance.into(),
        );
        map.insert("dc_threshold".into(), (self.dc_threshold as u64).into());
        map.insert("sk_threshold".into(), (self.sk_threshold as u64).into());
        map.insert(
            "noise_weight".into(),
            serde_json::to_value(&self.noise_weight).unwrap_or(Value::Null),
        );
        map.insert(
            "continue".into(),
            serde_json::to_value(self.continue_policy).unwrap_or(Value::Null),
        );
        map.insert("counters".into(), "(counter bins, no counts)".into());
        // keep the noise parameters, but not the per-counter structures
        let mut noise = serde_json::Map::new();
        if let Some(privacy) = &self.noise.privacy {
            noise.insert(
                "privacy".into(),
                serde_json::to_value(privacy).unwrap_or(Value::Null),
            );
        }
        noise.insert("counters".into(), "(counter sigmas, no counts)".into());
        map.insert("noise".into(), Value::Object(noise));
        map.insert(
            "counter_limits".into(),
            privcount_core::counter::counter_limits(),
        );
        Value::Object(map)
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

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        // pre-create key material so the loader does not spend the test run
        // generating a production-size RSA key
        std::fs::write(dir.join("ts.key"), "placeholder").expect("write key");
        std::fs::write(dir.join("ts.cert"), "placeholder").expect("write cert");
        let path = dir.join("ts.yaml");
        let mut file = std::fs::File::create(&path).expect("create config");
        file.write_all(body.as_bytes()).expect("write config");
        path
    }

    const BASE_CONFIG: &str = r#"
tally_server:
  listen_port: 20001
  state: ts.state
  key: ts.key
  cert: ts.cert
  collect_period: 3600
  event_period: 60
  checkin_period: 60
  dc_threshold: 1
  sk_threshold: 1
  noise_weight:
    "*": 1.0
  counters:
    counters:
      ExitStreamByteCount:
        bins:
          - [0, 512]
          - [512, 1024]
          - [1024, .inf]
      ZeroCount:
        bins:
          - [0, .inf]
  sigmas:
    counters:
      ExitStreamByteCount:
        sigma: 10.0
      ZeroCount:
        sigma: 0.0
"#;

    #[test]
    fn loads_a_minimal_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(dir.path(), BASE_CONFIG);
        let config = TallyServerConfig::load(&path).expect("loads");
        assert_eq!(config.listen_port, 20001);
        assert_eq!(config.counters.len(), 2);
        assert_eq!(config.noise.counters["ExitStreamByteCount"].sigma, Some(10.0));
        // delay period defaults to the collect period
        assert_eq!(config.delay_period, 3600.0);
        assert!(config.key.exists());
        assert!(config.cert.exists());
    }

    #[test]
    fn clamps_oversized_periods() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = BASE_CONFIG
            .replace("event_period: 60", "event_period: 4000")
            .replace("checkin_period: 60", "checkin_period: 4000");
        let path = write_config(dir.path(), &body);
        let config = TallyServerConfig::load(&path).expect("loads");
        assert_eq!(config.event_period, 1800.0);
        assert_eq!(config.checkin_period, 1800.0);
    }

    #[test]
    fn rejects_missing_noise_weight_coverage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = BASE_CONFIG.replace("    \"*\": 1.0", "    somefingerprint: 1.0");
        let path = write_config(dir.path(), &body);
        // one explicit weight covers dc_threshold 1, so this still loads
        assert!(TallyServerConfig::load(&path).is_ok());

        let body = body.replace("dc_threshold: 1", "dc_threshold: 2");
        let path = write_config(dir.path(), &body);
        assert!(TallyServerConfig::load(&path).is_err());
    }

    #[test]
    fn rejects_mismatched_counters_and_sigmas() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = BASE_CONFIG.replace(
            "      ZeroCount:\n        sigma: 0.0",
            "      ZeroCount:\n        sigma: 0.0\n      EntryConnectionCount:\n        sigma: 1.0",
        );
        let path = write_config(dir.path(), &body);
        assert!(TallyServerConfig::load(&path).is_err());
    }

    #[test]
    fn sanitized_config_hides_paths_and_structures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(dir.path(), BASE_CONFIG);
        let config = TallyServerConfig::load(&path).expect("loads");
        let sanitized = config.sanitized();
        assert_eq!(sanitized["key"], "(key path)");
        assert_eq!(sanitized["state"], "(state path)");
        assert_eq!(sanitized["counters"], "(counter bins, no counts)");
        assert_eq!(sanitized["noise"]["counters"], "(counter sigmas, no counts)");
    }
}
