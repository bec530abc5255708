//! The per-round state machine.
//!
//! A round moves through six states:
//!
//! ```text
//! new -> starting_dcs -> starting_sks -> started -> stopping -> stopped
//! ```
//!
//! The DCs must hand over their encrypted shares before the SKs start, a
//! wall-clock timer (or any failure) moves a started round to stopping, and
//! the round stops once every participant has answered the STOP command.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use privcount_core::counter::NoiseWeightConfig;
use privcount_core::node::{now_epoch, EncryptedShare, StartConfig, StopConfig, StopResponse};
use privcount_core::noise::NoiseSpec;
use privcount_core::traffic::TrafficModelConfig;
use privcount_core::{CountersConfig, Counts};

/// The round states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    New,
    StartingDcs,
    StartingSks,
    Started,
    Stopping,
    Stopped,
}

impl RoundState {
    fn label(self) -> &'static str {
        match self {
            RoundState::New => "new",
            RoundState::StartingDcs => "starting_dcs",
            RoundState::StartingSks => "starting_sks",
            RoundState::Started => "started",
            RoundState::Stopping => "stopping",
            RoundState::Stopped => "stopped",
        }
    }
}

/// One collection round owned by the tally server.
pub struct CollectionRound {
    state: RoundState,
    /// Configured collection length, seconds.
    period: f64,
    counters_config: CountersConfig,
    noise_config: NoiseSpec,
    noise_weight_config: NoiseWeightConfig,
    dc_threshold: usize,
    traffic_model: Option<TrafficModelConfig>,
    sk_uids: Vec<String>,
    /// SK uid to base64 public-key PEM, collected from SK status reports.
    sk_public_keys: BTreeMap<String, String>,
    dc_uids: Vec<String>,
    clock_padding: f64,
    starting_ts: Option<f64>,
    stopping_ts: Option<f64>,
    /// Shares awaiting forwarding, grouped by destination SK.
    encrypted_shares: BTreeMap<String, Vec<EncryptedShare>>,
    /// UIDs we still need shares (or share acknowledgements) from.
    need_shares: BTreeSet<String>,
    /// UIDs we still need final counts from.
    need_counts: BTreeSet<String>,
    final_counts: BTreeMap<String, Counts>,
    /// Sanitized per-client config echoes from STOP responses.
    client_configs: BTreeMap<String, Value>,
    error_flag: bool,
}

impl CollectionRound {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        period: f64,
        counters_config: CountersConfig,
        noise_config: NoiseSpec,
        noise_weight_config: NoiseWeightConfig,
        dc_threshold: usize,
        traffic_model: Option<TrafficModelConfig>,
        sk_uids: Vec<String>,
        sk_public_keys: BTreeMap<String, String>,
        dc_uids: Vec<String>,
        clock_padding: f64,
    ) -> Self {
        CollectionRound {
            state: RoundState::New,
            period,
            counters_config,
            noise_config,
            noise_weight_config,
            dc_threshold,
            traffic_model,
            sk_uids,
            sk_public_keys,
            dc_uids,
            clock_padding,
            starting_ts: None,
            stopping_ts: None,
            encrypted_shares: BTreeMap::new(),
            need_shares: BTreeSet::new(),
            need_counts: BTreeSet::new(),
            final_counts: BTreeMap::new(),
            client_configs: BTreeMap::new(),
            error_flag: false,
        }
    }

    fn change_state(&mut self, new_state: RoundState) {
        if self.state != new_state {
            tracing::info!(
                "collection round state changed from '{}' to '{}'",
                self.state.label(),
                new_state.label()
            );
            self.state = new_state;
        }
    }

    /// Begin the round: all DCs owe us their encrypted shares.
    pub fn start(&mut self) {
        if self.state != RoundState::New {
            return;
        }
        self.starting_ts = Some(now_epoch());
        self.need_shares = self.dc_uids.iter().cloned().collect();
        self.change_state(RoundState::StartingDcs);
    }

    /// Drive the round toward stopped. Called on expiry, on error, and
    /// repeatedly while stopping until every participant has answered.
    pub fn stop(&mut self) {
        if self.stopping_ts.is_none() {
            self.stopping_ts = Some(now_epoch());
        }
        match self.state {
            RoundState::New => self.change_state(RoundState::Stopped),
            RoundState::StartingDcs | RoundState::StartingSks => {
                self.need_shares.clear();
                self.encrypted_shares.clear();
                // tell everyone to stop and reset; an interrupted start can
                // never produce a valid tally
                self.error_flag = true;
                self.need_counts = self
                    .dc_uids
                    .iter()
                    .chain(self.sk_uids.iter())
                    .cloned()
                    .collect();
                self.change_state(RoundState::Stopping);
            }
            RoundState::Started => {
                let starting_ts = self.starting_ts.unwrap_or(0.0);
                let stopping_ts = self.stopping_ts.unwrap_or(0.0);
                if stopping_ts - starting_ts >= self.period {
                    tracing::info!("graceful end to collection round");
                } else {
                    tracing::info!(
                        "premature end to collection round, results may be less accurate than \
                         expected due to the noise that was added"
                    );
                }
                self.need_counts = self
                    .dc_uids
                    .iter()
                    .chain(self.sk_uids.iter())
                    .cloned()
                    .collect();
                self.change_state(RoundState::Stopping);
            }
            RoundState::Stopping => {
                if self.need_counts.is_empty() {
                    self.change_state(RoundState::Stopped);
                }
            }
            RoundState::Stopped => {}
        }
    }

    /// A participating client stopped responding: the round cannot recover.
    pub fn lost_client(&mut self, client_uid: &str) {
        if !self.is_participating(client_uid) {
            return;
        }
        tracing::warn!(
            "lost client {} while round is {}, flagging round as failed",
            client_uid,
            self.state.label()
        );
        self.error_flag = true;
    }

    /// Store a client's START SUCCESS payload.
    ///
    /// During `starting_dcs` this is the DC's encrypted share map (one share
    /// per SK); a duplicate or unexpected sender is rejected. During
    /// `starting_sks` it is the SK's import acknowledgement.
    pub fn store_start_result(&mut self, client_uid: &str, data: &Value) -> bool {
        match self.state {
            RoundState::StartingDcs => {
                if !self.dc_uids.contains(&client_uid.to_string()) {
                    tracing::warn!("unexpected start result from non-DC {}", client_uid);
                    return false;
                }
                if !self.need_shares.contains(client_uid) {
                    tracing::warn!("rejecting duplicate shares from {}", client_uid);
                    return false;
                }
                let shares: BTreeMap<String, EncryptedShare> =
                    match serde_json::from_value(data.clone()) {
                        Ok(shares) => shares,
                        Err(e) => {
                            tracing::warn!("malformed share map from {}: {}", client_uid, e);
                            self.error_flag = true;
                            return false;
                        }
                    };
                // every SK must get exactly one share from every DC
                let expected: BTreeSet<&String> = self.sk_uids.iter().collect();
                let got: BTreeSet<&String> = shares.keys().collect();
                if expected != got {
                    tracing::warn!(
                        "share map from {} does not cover the round's share keepers",
                        client_uid
                    );
                    self.error_flag = true;
                    return false;
                }
                for (sk_uid, share) in shares {
                    self.encrypted_shares.entry(sk_uid).or_default().push(share);
                }
                self.need_shares.remove(client_uid);
                tracing::info!(
                    "received shares from data collector {}, need {} more",
                    client_uid,
                    self.need_shares.len()
                );
                if self.need_shares.is_empty() {
                    self.need_shares = self.sk_uids.iter().cloned().collect();
                    self.change_state(RoundState::StartingSks);
                }
                true
            }
            RoundState::StartingSks => {
                if !self.need_shares.remove(client_uid) {
                    tracing::warn!("unexpected share ack from {}", client_uid);
                    return false;
                }
                tracing::info!("share keeper {} started and received its shares", client_uid);
                if self.need_shares.is_empty() {
                    self.change_state(RoundState::Started);
                }
                true
            }
            _ => {
                tracing::warn!(
                    "ignoring start result from {} in state {}",
                    client_uid,
                    self.state.label()
                );
                false
            }
        }
    }

    /// Store a client's STOP SUCCESS payload (counts plus config echo).
    pub fn store_stop_result(&mut self, client_uid: &str, data: &Value) {
        if self.state != RoundState::Stopping {
            tracing::warn!(
                "ignoring stop result from {} in state {}",
                client_uid,
                self.state.label()
            );
            return;
        }
        let response: StopResponse = match serde_json::from_value(data.clone()) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("malformed stop response from {}: {}", client_uid, e);
                self.error_flag = true;
                self.need_counts.remove(client_uid);
                return;
            }
        };
        self.client_configs
            .insert(client_uid.to_string(), response.config);

        if !self.need_counts.remove(client_uid) {
            return;
        }
        match response.counts {
            None => {
                tracing::warn!(
                    "received no counts from {}, final results will not be available",
                    client_uid
                );
                self.error_flag = true;
            }
            Some(counts) if counts.is_empty() && !self.error_flag => {
                tracing::warn!(
                    "received empty counts from {}, final results will not be available",
                    client_uid
                );
                self.error_flag = true;
            }
            Some(counts) => {
                if self.error_flag {
                    tracing::warn!("discarding counts from {}: round already failed", client_uid);
                } else {
                    tracing::info!(
                        "received {} counters from stopped client {}",
                        counts.len(),
                        client_uid
                    );
                    self.final_counts.insert(client_uid.to_string(), counts);
                }
            }
        }
    }

    /// An error response (`START FAIL` / `STOP FAIL`) from a client. Clients
    /// legitimately refuse a START when they are still enforcing a
    /// collection delay.
    pub fn store_failure(&mut self, client_uid: &str) {
        tracing::warn!(
            "received error response from {} while in state {}",
            client_uid,
            self.state.label()
        );
        match self.state {
            RoundState::StartingDcs | RoundState::StartingSks | RoundState::Started => {
                self.error_flag = true;
            }
            RoundState::Stopping => {
                self.error_flag = true;
                self.need_counts.remove(client_uid);
            }
            _ => {}
        }
    }

    /// The START payload for a client, or `None` if it is not this client's
    /// turn to start.
    pub fn start_config(&self, client_uid: &str) -> Option<StartConfig> {
        if !self.is_participating(client_uid) || !self.need_shares.contains(client_uid) {
            return None;
        }
        match self.state {
            RoundState::StartingDcs if self.dc_uids.contains(&client_uid.to_string()) => {
                tracing::info!(
                    "sending start command with {} counters, requesting {} shares, to data collector {}",
                    self.counters_config.len(),
                    self.sk_public_keys.len(),
                    client_uid
                );
                Some(StartConfig {
                    sharekeepers: Some(self.sk_public_keys.clone()),
                    shares: None,
                    counters: self.counters_config.clone(),
                    noise: self.noise_config.clone(),
                    noise_weight: self.noise_weight_config.clone(),
                    dc_threshold: self.dc_threshold,
                    collect_period: self.period,
                    defer_time: Some(self.clock_padding),
                    traffic_model: self.traffic_model.clone(),
                })
            }
            RoundState::StartingSks if self.sk_uids.contains(&client_uid.to_string()) => {
                let shares = self.encrypted_shares.get(client_uid).cloned()?;
                tracing::info!(
                    "sending start command with {} counters and {} shares to share keeper {}",
                    self.counters_config.len(),
                    shares.len(),
                    client_uid
                );
                Some(StartConfig {
                    sharekeepers: None,
                    shares: Some(shares),
                    counters: self.counters_config.clone(),
                    noise: self.noise_config.clone(),
                    noise_weight: self.noise_weight_config.clone(),
                    dc_threshold: self.dc_threshold,
                    collect_period: self.period,
                    defer_time: None,
                    traffic_model: self.traffic_model.clone(),
                })
            }
            _ => None,
        }
    }

    /// The STOP payload for a client, or `None` if nothing is owed.
    pub fn stop_config(&self, client_uid: &str) -> Option<StopConfig> {
        if !self.is_participating(client_uid) || !self.need_counts.contains(client_uid) {
            return None;
        }
        debug_assert_eq!(self.state, RoundState::Stopping);
        tracing::info!(
            "sending stop command to {} {} request for counters",
            client_uid,
            if self.error_flag { "without" } else { "with" }
        );
        Some(StopConfig {
            send_counters: !self.error_flag,
        })
    }

    pub fn is_participating(&self, client_uid: &str) -> bool {
        self.dc_uids.contains(&client_uid.to_string())
            || self.sk_uids.contains(&client_uid.to_string())
    }

    /// Has the collection period elapsed?
    pub fn is_expired(&self) -> bool {
        match self.starting_ts {
            Some(ts) => now_epoch() - ts >= self.period,
            None => false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_flag
    }

    pub fn is_stopped(&self) -> bool {
        self.state == RoundState::Stopped
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn noise_config(&self) -> &NoiseSpec {
        &self.noise_config
    }

    pub fn counters_config(&self) -> &CountersConfig {
        &self.counters_config
    }

    pub fn starting_ts(&self) -> Option<f64> {
        self.starting_ts
    }

    pub fn stopping_ts(&self) -> Option<f64> {
        self.stopping_ts
    }

    pub fn clock_padding(&self) -> f64 {
        self.clock_padding
    }

    pub fn final_counts(&self) -> &BTreeMap<String, Counts> {
        &self.final_counts
    }

    pub fn client_configs(&self) -> &BTreeMap<String, Value> {
        &self.client_configs
    }

    /// One status line for the periodic log.
    pub fn log_status(&self) {
        let mut message = format!("collection round is in '{}' state", self.state.label());
        match self.state {
            RoundState::StartingDcs => {
                message += &format!(
                    ", waiting to receive shares from {} DCs: {}",
                    self.need_shares.len(),
                    self.need_shares.iter().cloned().collect::<Vec<_>>().join(",")
                );
            }
            RoundState::StartingSks => {
                message += &format!(
                    ", waiting to send shares to {} SKs: {}",
                    self.need_shares.len(),
                    self.need_shares.iter().cloned().collect::<Vec<_>>().join(",")
                );
            }
            RoundState::Started => {
                if let Some(ts) = self.starting_ts {
                    message += &format!(", running for {:.0} seconds", now_epoch() - ts);
                }
            }
            RoundState::Stopping => {
                message += &format!(
                    ", waiting to receive counts from {} DCs/SKs: {}",
                    self.need_counts.len(),
                    self.need_counts.iter().cloned().collect::<Vec<_>>().join(",")
                );
            }
            _ => {}
        }
        tracing::info!("{}", message);
    }
}
