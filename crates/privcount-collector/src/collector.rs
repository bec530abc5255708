//! The data collector role: round lifecycle against the tally server, the
//! event source reader, and the rotation timer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use privcount_core::client::ProtocolClient;
use privcount_core::crypto;
use privcount_core::event::parse_tagged_event_line;
use privcount_core::node::{EncryptedShare, RoundClient, StartConfig, StopConfig};
use privcount_core::traffic::TrafficModel;

use crate::aggregator::{Aggregator, ROTATION_PERIOD};
use crate::config::DataCollectorConfig;

fn lock(aggregator: &Arc<Mutex<Aggregator>>) -> MutexGuard<'_, Aggregator> {
    aggregator
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The data collector client, driven by the shared protocol session.
pub struct DataCollector {
    config: DataCollectorConfig,
    round: RoundClient,
    aggregator: Option<Arc<Mutex<Aggregator>>>,
    /// Gates the event source and rotation tasks of the current round.
    collecting: Arc<AtomicBool>,
    /// The deferred collection start, cancelled when a stop arrives first.
    defer_handle: Option<tokio::task::JoinHandle<()>>,
    /// Last known aggregator context, kept for status reports after the
    /// aggregator is gone.
    context: Value,
}

impl DataCollector {
    pub fn new(config: DataCollectorConfig) -> Self {
        let round = RoundClient::new(
            config.delay_period,
            config.always_delay,
            config.sigma_decrease_tolerance,
        );
        DataCollector {
            config,
            round,
            aggregator: None,
            collecting: Arc::new(AtomicBool::new(false)),
            defer_handle: None,
            context: json!({}),
        }
    }

    /// Verify that every share keeper key supplied by the tally server
    /// matches our authorized digest set, in both directions: an unknown key
    /// or a missing authorized keeper refuses the round.
    fn verify_sharekeepers(
        &self,
        sharekeepers: &BTreeMap<String, String>,
    ) -> Option<BTreeMap<String, rsa::RsaPublicKey>> {
        let mut expected = self.config.share_keepers.clone();
        let mut keys = BTreeMap::new();
        for (sk_uid, pem_b64) in sharekeepers {
            let pem_bytes = match BASE64.decode(pem_b64) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("share keeper {} key is not base64: {}", sk_uid, e);
                    return None;
                }
            };
            let pem = match std::str::from_utf8(&pem_bytes) {
                Ok(pem) => pem,
                Err(_) => {
                    tracing::warn!("share keeper {} key is not UTF-8 PEM", sk_uid);
                    return None;
                }
            };
            let key = match crypto::load_public_key_pem(pem) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!("share keeper {} key failed to parse: {}", sk_uid, e);
                    return None;
                }
            };
            let digest = match crypto::public_key_digest(&key) {
                Ok(digest) => digest,
                Err(e) => {
                    tracing::warn!("share keeper {} key failed to digest: {}", sk_uid, e);
                    return None;
                }
            };
            if !expected.remove(&digest) {
                tracing::warn!("we received an unexpected key for share keeper {}", sk_uid);
                return None;
            }
            keys.insert(sk_uid.clone(), key);
        }
        if !expected.is_empty() {
            tracing::warn!(
                "refusing to start collecting without {} required share keepers",
                expected.len()
            );
            return None;
        }
        Some(keys)
    }

    /// Launch the deferred collection start: noise first, then the event
    /// source reader and the rotation timer.
    fn start_collection_deferred(&mut self, defer_time: f64) {
        let aggregator = self
            .aggregator
            .clone()
            .unwrap_or_else(|| unreachable!("started with an aggregator"));
        self.collecting.store(true, Ordering::SeqCst);
        let collecting = self.collecting.clone();
        let event_source = self.config.event_source;
        let handle = tokio::spawn(async move {
            // sync the time that all DCs start listening for events
            tokio::time::sleep(Duration::from_secs_f64(defer_time.max(0.0))).await;
            if !collecting.load(Ordering::SeqCst) {
                return;
            }
            if !lock(&aggregator).generate_noise() {
                // fail-closed: no weight for our fingerprint
                collecting.store(false, Ordering::SeqCst);
                return;
            }
            let rotation_aggregator = aggregator.clone();
            let rotation_collecting = collecting.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs_f64(ROTATION_PERIOD));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if !rotation_collecting.load(Ordering::SeqCst) {
                        break;
                    }
                    let mut aggregator = lock(&rotation_aggregator);
                    aggregator.rotate();
                    aggregator.evict_stale_streams();
                }
            });
            run_event_source(event_source, aggregator, collecting).await;
        });
        self.defer_handle = Some(handle);
    }

    fn teardown_collection(&mut self) {
        self.collecting.store(false, Ordering::SeqCst);
        if let Some(handle) = self.defer_handle.take() {
            handle.abort();
        }
    }
}

impl ProtocolClient for DataCollector {
    fn status(&mut self) -> Value {
        if let Some(aggregator) = &self.aggregator {
            self.context = lock(aggregator).context();
        }
        let mut status = json!({
            "type": "DataCollector",
            "name": self.config.name,
            "state": if self.aggregator.is_some() { "active" } else { "idle" },
        });
        if let Some(fingerprint) = &self.config.fingerprint {
            status["fingerprint"] = json!(fingerprint);
        }
        if let (Some(status), Some(context)) =
            (status.as_object_mut(), self.context.as_object())
        {
            for (key, value) in context {
                status.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        status
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
        let Some(sharekeepers) = &config.sharekeepers else {
            tracing::warn!("start command is missing sharekeepers");
            return None;
        };
        if self.aggregator.is_some() {
            tracing::warn!("still running a previous round, refusing to start");
            return None;
        }

        // the traffic model's dynamic counters must be registered before the
        // start config's counter names can validate
        if let Some(model_config) = &config.traffic_model {
            match TrafficModel::new(model_config.clone()) {
                Ok(model) => model.register_counters(),
                Err(e) => {
                    tracing::warn!("start command traffic model is invalid: {}", e);
                    return None;
                }
            }
        }

        let combined = self.round.check_start_config(&config, raw_config)?;
        let sk_keys = self.verify_sharekeepers(sharekeepers)?;

        let sk_uids: Vec<String> = sk_keys.keys().cloned().collect();
        let aggregator = match Aggregator::new(
            &combined,
            &sk_uids,
            config.noise_weight.clone(),
            self.config.fingerprint.clone(),
            config.traffic_model.clone(),
        ) {
            Ok(aggregator) => Arc::new(Mutex::new(aggregator)),
            Err(e) => {
                tracing::warn!("could not build counters: {}", e);
                return None;
            }
        };

        // encrypt one share to each share keeper; the tally server relays
        // them but can never open them
        let shares = lock(&aggregator).detach_shares()?;
        let mut encrypted = BTreeMap::new();
        for (sk_uid, share) in shares {
            let key = sk_keys.get(&sk_uid)?;
            let payload = match crypto::encrypt(key, &share.secret) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("could not encrypt share for {}: {}", sk_uid, e);
                    return None;
                }
            };
            encrypted.insert(
                sk_uid.clone(),
                EncryptedShare {
                    sk_uid,
                    dc_name: Some(self.config.name.clone()),
                    secret: payload,
                },
            );
        }

        self.aggregator = Some(aggregator);
        self.start_collection_deferred(config.defer_time.unwrap_or(0.0));

        tracing::info!(
            "successfully started and generated {} blinding shares for {} counters",
            encrypted.len(),
            combined.len()
        );
        serde_json::to_value(encrypted).ok()
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

        self.teardown_collection();
        let counts = match self.aggregator.take() {
            Some(aggregator) => {
                self.context = lock(&aggregator).context();
                lock(&aggregator).stop(true)
            }
            None => {
                tracing::info!("no aggregator, counts never started");
                None
            }
        };

        let response =
            self.round
                .check_stop_config(&stop_config, counts, self.config.sanitized());
        serde_json::to_value(response).ok()
    }
}

/// Read the event feed, one tagged event per line, until collection stops.
/// Connection failures retry while the round is live.
async fn run_event_source(
    port: u16,
    aggregator: Arc<Mutex<Aggregator>>,
    collecting: Arc<AtomicBool>,
) {
    while collecting.load(Ordering::SeqCst) {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => {
                tracing::info!("connected to event source on port {}", port);
                let mut lines = BufReader::new(stream).lines();
                loop {
                    if !collecting.load(Ordering::SeqCst) {
                        return;
                    }
                    match lines.next_line().await {
                        Ok(Some(line)) => match parse_tagged_event_line(&line) {
                            Ok(event) => lock(&aggregator).handle_event(&event),
                            Err(e) => tracing::warn!("dropping event line: {}", e),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("event source read failed: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("cannot connect to event source on port {}: {}", port, e);
            }
        }
        if collecting.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }
}

/// Run the data collector until the process is stopped.
pub async fn run(config_path: std::path::PathBuf) -> anyhow::Result<()> {
    let config = DataCollectorConfig::load(&config_path)?;
    tracing::info!("running data collector '{}'", config.name);
    let address = config.tally_server_address.clone();
    let collector = DataCollector::new(config);
    privcount_core::client::run_client_loop(address, collector, || async {}).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use privcount_core::counter::{Bin, CounterSpec, NoiseWeightConfig};
    use privcount_core::noise::{NoiseCounter, NoiseSpec};
    use privcount_core::CountersConfig;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;
    use std::collections::BTreeSet;

    fn test_config(share_keepers: BTreeSet<String>) -> DataCollectorConfig {
        DataCollectorConfig {
            name: "dc-test".into(),
            event_source: 1,
            share_keepers,
            tally_server_address: "127.0.0.1:1".into(),
            state: "/tmp/dc.state".into(),
            secret_handshake: "/tmp/dc.secret".into(),
            fingerprint: Some("FP1".into()),
            delay_period: None,
            always_delay: false,
            sigma_decrease_tolerance: 1e-6,
        }
    }

    fn start_config_with_key(key: &RsaPrivateKey) -> Value {
        let pem = crypto::public_key_pem(&key.to_public_key()).expect("pem");
        let mut counters = CountersConfig::new();
        counters.insert(
            "ZeroCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                sigma: None,
            },
        );
        let mut noise_counters = std::collections::BTreeMap::new();
        noise_counters.insert(
            "ZeroCount".to_string(),
            NoiseCounter {
                sigma: Some(0.0),
                ..Default::default()
            },
        );
        let mut weights = NoiseWeightConfig::new();
        weights.insert("*".into(), 1.0);
        serde_json::to_value(StartConfig {
            sharekeepers: Some(
                [("sk1".to_string(), BASE64.encode(pem.as_bytes()))]
                    .into_iter()
                    .collect(),
            ),
            shares: None,
            counters,
            noise: NoiseSpec {
                privacy: None,
                counters: noise_counters,
            },
            noise_weight: weights,
            dc_threshold: 1,
            collect_period: 60.0,
            defer_time: Some(0.0),
            traffic_model: None,
        })
        .expect("serializes")
    }

    #[tokio::test]
    async fn start_produces_decryptable_shares() {
        let sk_key = RsaPrivateKey::new(&mut OsRng, 1024).expect("keygen");
        let digest = crypto::public_key_digest(&sk_key.to_public_key()).expect("digest");
        let mut collector = DataCollector::new(test_config([digest].into_iter().collect()));

        let result = collector
            .do_start(start_config_with_key(&sk_key))
            .expect("start succeeds");
        let shares: BTreeMap<String, EncryptedShare> =
            serde_json::from_value(result).expect("share map");
        assert_eq!(shares.len(), 1);
        let share = &shares["sk1"];
        assert_eq!(share.dc_name.as_deref(), Some("dc-test"));

        // the share keeper can decrypt the secret
        let secret: privcount_core::Counts =
            crypto::decrypt(&sk_key, &share.secret).expect("decrypts");
        assert!(secret.contains_key("ZeroCount"));

        collector.teardown_collection();
    }

    #[tokio::test]
    async fn unknown_sharekeeper_key_is_refused() {
        let sk_key = RsaPrivateKey::new(&mut OsRng, 1024).expect("keygen");
        // authorized set contains a different digest
        let mut collector =
            DataCollector::new(test_config(["0".repeat(64)].into_iter().collect()));
        assert!(collector.do_start(start_config_with_key(&sk_key)).is_none());
    }

    #[tokio::test]
    async fn stop_without_start_reports_cleanly() {
        let mut collector = DataCollector::new(test_config(["0".repeat(64)].into_iter().collect()));
        let response = collector
            .do_stop(json!({"send_counters": false}))
            .expect("responds");
        assert!(response.get("Config").is_some());
    }
}
