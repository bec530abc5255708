//! The share keeper role: import every data collector's blinding share at
//! round start, hold the aggregated counters, emit them at round end.

use serde_json::{json, Value};

use privcount_core::client::ProtocolClient;
use privcount_core::counter::BlindingShare;
use privcount_core::crypto;
use privcount_core::node::{RoundClient, StartConfig, StopConfig};
use privcount_core::sampling::counter_modulus;
use privcount_core::{Counts, SecureCounters};

use crate::config::ShareKeeperConfig;

/// The share keeper client, driven by the shared protocol session.
pub struct ShareKeeper {
    config: ShareKeeperConfig,
    round: RoundClient,
    keystore: Option<SecureCounters>,
    /// Serialized public key PEM, reported in every status so the tally
    /// server can hand it to the data collectors.
    public_key_pem: String,
}

impl ShareKeeper {
    pub fn new(config: ShareKeeperConfig) -> crate::Result<Self> {
        let private_key = crypto::load_private_key_file(&config.key)?;
        let public_key_pem = crypto::public_key_pem(&private_key.to_public_key())?;
        let round = RoundClient::new(
            config.delay_period,
            config.always_delay,
            config.sigma_decrease_tolerance,
        );
        Ok(ShareKeeper {
            config,
            round,
            keystore: None,
            public_key_pem,
        })
    }

    /// Decrypt and import every share. Any decryption failure or shape
    /// mismatch aborts the round: a partial import can never cancel out.
    fn import_shares(&mut self, config: &StartConfig, counters_config: &privcount_core::CountersConfig) -> Option<usize> {
        let shares = config.shares.as_ref()?;
        let private_key = match crypto::load_private_key_file(&self.config.key) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("cannot load private key: {}", e);
                return None;
            }
        };
        let mut keystore =
            match SecureCounters::new(counters_config, counter_modulus(), false) {
                Ok(keystore) => keystore,
                Err(e) => {
                    tracing::warn!("cannot build counters: {}", e);
                    return None;
                }
            };
        for share in shares {
            let secret: Counts = match crypto::decrypt(&private_key, &share.secret) {
                Ok(secret) => secret,
                Err(e) => {
                    tracing::warn!("failed to decrypt blinding share: {}", e);
                    return None;
                }
            };
            let share = BlindingShare {
                sk_uid: share.sk_uid.clone(),
                dc_name: share.dc_name.clone(),
                secret,
            };
            if !keystore.import_blinding_share(&share) {
                // the imported share does not match the configured counters:
                // a configuration mismatch or a tampering tally server
                tracing::warn!(
                    "failed to import blinding share from {:?}",
                    share.dc_name
                );
                return None;
            }
        }
        let imported = shares.len();
        self.keystore = Some(keystore);
        Some(imported)
    }
}

impl ProtocolClient for ShareKeeper {
    fn status(&mut self) -> Value {
        json!({
            "type": "ShareKeeper",
            "name": self.config.name,
            "state": if self.keystore.is_some() { "active" } else { "idle" },
            "public_key": self.public_key_pem,
        })
    }

    fn handle_server_status(&mut self, status: &Value) {
        tracing::info!(
            "tally server is {} with {}/{} DCs and {}/{} SKs",
            status["state"].as_str().unwrap_or("unknown"),
            status["dcs_total"],
            status["dcs_required"],
            status["sks_total"],
            status["sks_required"],
        );
    }

    fn do_start(&mut self, raw_config: Value) -> Option<Value> {
        tracing::info!("got command to start new collection round");
        let config: StartConfig = match serde_json::from_value(raw_config.clone()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("start command could not be parsed: {}", e);
                return None;
            }
        };
        if config.shares.is_none() {
            tracing::warn!("start command is missing shares");
            return None;
        }
        if self.keystore.is_some() {
            tracing::warn!("still holding a previous round's shares, refusing to start");
            return None;
        }
        // register traffic-model counters so their names validate
        if let Some(model_config) = &config.traffic_model {
            match privcount_core::traffic::TrafficModel::new(model_config.clone()) {
                Ok(model) => model.register_counters(),
                Err(e) => {
                    tracing::warn!("start command traffic model is invalid: {}", e);
                    return None;
                }
            }
        }

        let counters_config = self.round.check_start_config(&config, raw_config)?;
        let imported = self.import_shares(&config, &counters_config)?;
        tracing::info!(
            "successfully started and imported {} blinding shares for {} counters",
            imported,
            counters_config.len()
        );
        Some(json!({}))
    }

    fn do_stop(&mut self, raw_config: Value) -> Option<Value> {
        tracing::info!("got command to stop collection round");
        let stop_config: StopConfig = match serde_json::from_value(raw_config) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("stop command could not be parsed: {}", e);
                return None;
            }
        };
        let counts = self
            .keystore
            .take()
            .and_then(|mut keystore| keystore.detach_counts().ok());
        let response =
            self.round
                .check_stop_config(&stop_config, counts, self.config.sanitized());
        serde_json::to_value(response).ok()
    }
}

/// Run the share keeper until the process is stopped.
pub async fn run(config_path: std::path::PathBuf) -> anyhow::Result<()> {
    let config = ShareKeeperConfig::load(&config_path)?;
    tracing::info!(
        "running share keeper using RSA public key id '{}'",
        config.name
    );
    let address = config.tally_server_address.clone();
    let keeper = ShareKeeper::new(config)?;
    privcount_core::client::run_client_loop(address, keeper, || async {}).await?;
    Ok(())
}
