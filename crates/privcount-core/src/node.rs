//! Round logic shared by the data collector and share keeper clients, plus
//! the typed START/STOP payloads and the continue policy.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::counter::{
    check_counters_config, check_noise_weight_config, combine_counters, counter_limits,
    float_accuracy, CountersConfig, Counts, NoiseWeightConfig,
};
use crate::crypto::EncryptedPayload;
use crate::delay::CollectionDelay;
use crate::error::{Error, Result};
use crate::noise::{NoiseSpec, DEFAULT_SIGMA_TOLERANCE};
use crate::traffic::TrafficModelConfig;

/// Current wall-clock time as epoch seconds.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// How many more rounds the tally server wants to run.
///
/// `true` continues forever (`None`), `false` stops after the first round,
/// a number runs that many rounds in total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContinuePolicy {
    Flag(bool),
    Rounds(u64),
}

impl Default for ContinuePolicy {
    fn default() -> Self {
        ContinuePolicy::Flag(false)
    }
}

/// Whether another round should be collected.
pub fn continue_collecting(num_phases: u64, policy: ContinuePolicy) -> bool {
    if num_phases == 0 {
        return true;
    }
    match policy {
        ContinuePolicy::Flag(flag) => flag,
        ContinuePolicy::Rounds(rounds) => rounds > num_phases,
    }
}

/// Remaining round count, or `None` for "forever".
pub fn get_remaining_rounds(num_phases: u64, policy: ContinuePolicy) -> Option<u64> {
    if num_phases == 0 {
        return Some(1);
    }
    match policy {
        ContinuePolicy::Flag(true) => None,
        ContinuePolicy::Flag(false) => Some(0),
        ContinuePolicy::Rounds(rounds) => Some(rounds.saturating_sub(num_phases)),
    }
}

/// Validate a delay period against the collect period; the delay must be at
/// least as long as the collection it gates.
pub fn valid_delay_period(delay_period: Option<f64>, collect_period: f64) -> f64 {
    debug_assert!(collect_period > 0.0);
    let Some(delay_period) = delay_period else {
        tracing::warn!(
            "delay_period not specified, using collect_period {:.0}",
            collect_period
        );
        return collect_period;
    };
    if delay_period < 0.0 {
        tracing::warn!(
            "delay_period invalid, using collect_period {:.0}",
            collect_period
        );
        return collect_period;
    }
    if delay_period < collect_period {
        tracing::warn!(
            "delay_period {:.1} too small for collect_period {:.1}, increasing to {:.1}",
            delay_period,
            collect_period,
            collect_period
        );
        return collect_period;
    }
    delay_period
}

/// Validate the sigma decrease tolerance: floats can not be transmitted
/// with more accuracy than the float-to-string round trip preserves, so the
/// tolerance must not be below that accuracy.
pub fn valid_sigma_decrease_tolerance(tolerance: Option<f64>) -> Result<f64> {
    let tolerance = tolerance.unwrap_or(DEFAULT_SIGMA_TOLERANCE);
    if tolerance < float_accuracy() {
        return Err(Error::Config(format!(
            "sigma_decrease_tolerance {tolerance} is below float accuracy {}",
            float_accuracy()
        )));
    }
    Ok(tolerance)
}

/// One encrypted blinding share in transit: DC to TS to SK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedShare {
    pub sk_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc_name: Option<String>,
    pub secret: EncryptedPayload,
}

/// The START payload sent by the tally server. DCs receive the share keeper
/// keys; SKs receive the encrypted shares collected from the DCs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartConfig {
    /// SK uid to base64 public-key PEM (DC start only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharekeepers: Option<BTreeMap<String, String>>,
    /// Encrypted shares to import (SK start only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<Vec<EncryptedShare>>,
    pub counters: CountersConfig,
    pub noise: NoiseSpec,
    pub noise_weight: NoiseWeightConfig,
    pub dc_threshold: usize,
    pub collect_period: f64,
    /// Clock padding: DCs defer event collection by this many seconds so
    /// all DCs start counting together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_model: Option<TrafficModelConfig>,
}

/// The STOP payload sent by the tally server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopConfig {
    pub send_counters: bool,
}

/// A client's STOP response: its counts (when requested and available) plus
/// a config echo for the outcome context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResponse {
    #[serde(rename = "Counts", default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<Counts>,
    #[serde(rename = "Config")]
    pub config: Value,
}

/// Client-side state for one collection round, shared by DCs and SKs.
///
/// Owns the client's [`CollectionDelay`]: the server performs the same
/// checks, but clients enforce them independently for defence in depth.
pub struct RoundClient {
    pub delay: CollectionDelay,
    configured_delay_period: Option<f64>,
    always_delay: bool,
    sigma_decrease_tolerance: f64,
    /// Raw start config, echoed back in the STOP response context.
    start_config_echo: Option<Value>,
    collect_period: Option<f64>,
    delay_period: Option<f64>,
    last_noise_config: Option<NoiseSpec>,
    collection_start_time: Option<f64>,
}

impl RoundClient {
    pub fn new(
        configured_delay_period: Option<f64>,
        always_delay: bool,
        sigma_decrease_tolerance: f64,
    ) -> Self {
        RoundClient {
            delay: CollectionDelay::new(),
            configured_delay_period,
            always_delay,
            sigma_decrease_tolerance,
            start_config_echo: None,
            collect_period: None,
            delay_period: None,
            last_noise_config: None,
            collection_start_time: None,
        }
    }

    /// Perform the common client checks on a START config. On success,
    /// records the round start and returns the combined counters (bins and
    /// sigmas merged); on failure returns `None` and the caller must answer
    /// `START FAIL`.
    pub fn check_start_config(
        &mut self,
        config: &StartConfig,
        raw_config: Value,
    ) -> Option<CountersConfig> {
        let sigmas = config.noise.sigmas_config();
        if !check_counters_config(&config.counters, &sigmas, false) {
            tracing::warn!("start command failed: invalid counters or sigmas");
            return None;
        }
        if !check_noise_weight_config(&config.noise_weight, config.dc_threshold) {
            tracing::warn!("start command failed: invalid noise weight config");
            return None;
        }
        if config.collect_period <= 0.0 {
            tracing::warn!("start command failed: invalid collect period");
            return None;
        }

        // first round: no delay to enforce yet
        let delay = self.delay_period.unwrap_or(0.0);
        if !self.delay.round_start_permitted(
            &config.noise,
            now_epoch(),
            delay,
            self.always_delay,
            self.sigma_decrease_tolerance,
        ) {
            return None;
        }

        self.start_config_echo = Some(raw_config);
        self.collect_period = Some(config.collect_period);
        self.delay_period = Some(valid_delay_period(
            self.configured_delay_period,
            config.collect_period,
        ));
        self.last_noise_config = Some(config.noise.clone());
        self.collection_start_time = Some(now_epoch());

        Some(combine_counters(&config.counters, &sigmas))
    }

    /// Perform the common client actions when a round stops: build the STOP
    /// response with the config echo and register the result with the
    /// collection delay.
    pub fn check_stop_config(
        &mut self,
        stop_config: &StopConfig,
        counts: Option<Counts>,
        local_config_echo: Value,
    ) -> StopResponse {
        let end_time = now_epoch();
        let wants_counters = stop_config.send_counters;
        tracing::info!(
            "tally server {} final counts",
            if wants_counters { "wants" } else { "does not want" }
        );

        let mut round_successful = false;
        let response_counts = if wants_counters {
            match counts {
                Some(counts) => {
                    tracing::info!("sending counts from {} counters", counts.len());
                    round_successful = true;
                    Some(counts)
                }
                None => {
                    tracing::info!("no counts available");
                    None
                }
            }
        } else {
            // never an error: the server wants a cleanup, not data
            Some(Counts::new())
        };

        let mut config_echo = local_config_echo;
        if let Value::Object(map) = &mut config_echo {
            map.insert("counter_limits".into(), counter_limits());
            if let Some(start) = &self.start_config_echo {
                map.insert("Start".into(), start.clone());
            }
            if let Ok(stop) = serde_json::to_value(stop_config) {
                map.insert("Stop".into(), stop);
            }
        }

        let (Some(collect_period), Some(delay_period), Some(noise), Some(start_time)) = (
            self.collect_period,
            self.delay_period,
            self.last_noise_config.clone(),
            self.collection_start_time,
        ) else {
            tracing::warn!("tally server sent stop command before start command");
            return StopResponse {
                counts: response_counts,
                config: config_echo,
            };
        };
        tracing::debug!(
            "round ran {:.0}s of a configured {:.0}s collect period",
            end_time - start_time,
            collect_period
        );

        // Using the collect period from the tally server alone would be
        // insecure: nothing forces the actual collection to match it. Use
        // the longest of the delay fixed at start time and the delay implied
        // by the observed round length under the current config.
        let actual_collect = (end_time - start_time).max(f64::MIN_POSITIVE);
        let actual_delay = valid_delay_period(self.configured_delay_period, actual_collect);
        let delay = delay_period.max(actual_delay);

        if let Value::Object(map) = &mut config_echo {
            let time = serde_json::json!({
                "Start": start_time,
                "Stop": end_time,
                "Delay": actual_delay,
            });
            map.insert("Time".into(), time);
        }

        self.delay.set_stop_result(
            round_successful,
            &noise,
            start_time,
            end_time,
            delay,
            self.always_delay,
            self.sigma_decrease_tolerance,
        );

        self.start_config_echo = None;
        self.collect_period = None;
        self.collection_start_time = None;
        tracing::info!("collection phase was stopped");

        StopResponse {
            counts: response_counts,
            config: config_echo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{Bin, CounterSpec};
    use crate::noise::NoiseCounter;
    use serde_json::json;

    fn start_config() -> StartConfig {
        let mut counters = CountersConfig::new();
        counters.insert(
            "ZeroCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                sigma: None,
            },
        );
        let mut noise_counters = BTreeMap::new();
        noise_counters.insert(
            "ZeroCount".to_string(),
            NoiseCounter {
                sigma: Some(0.0),
                ..Default::default()
            },
        );
        let mut noise_weight = NoiseWeightConfig::new();
        noise_weight.insert("*".into(), 1.0);
        StartConfig {
            sharekeepers: None,
            shares: None,
            counters,
            noise: NoiseSpec {
                privacy: None,
                counters: noise_counters,
            },
            noise_weight,
            dc_threshold: 1,
            collect_period: 60.0,
            defer_time: None,
            traffic_model: None,
        }
    }

    #[test]
    fn continue_policy() {
        assert!(continue_collecting(0, ContinuePolicy::Flag(false)));
        assert!(!continue_collecting(1, ContinuePolicy::Flag(false)));
        assert!(continue_collecting(5, ContinuePolicy::Flag(true)));
        assert!(continue_collecting(1, ContinuePolicy::Rounds(3)));
        assert!(!continue_collecting(3, ContinuePolicy::Rounds(3)));
        assert_eq!(get_remaining_rounds(0, ContinuePolicy::Flag(false)), Some(1));
        assert_eq!(get_remaining_rounds(2, ContinuePolicy::Flag(true)), None);
        assert_eq!(get_remaining_rounds(2, ContinuePolicy::Rounds(5)), Some(3));
    }

    #[test]
    fn continue_policy_deserializes_both_forms() {
        let flag: ContinuePolicy = serde_json::from_str("true").expect("bool form");
        assert_eq!(flag, ContinuePolicy::Flag(true));
        let rounds: ContinuePolicy = serde_json::from_str("4").expect("count form");
        assert_eq!(rounds, ContinuePolicy::Rounds(4));
    }

    #[test]
    fn delay_period_is_clamped_to_collect_period() {
        assert_eq!(valid_delay_period(None, 100.0), 100.0);
        assert_eq!(valid_delay_period(Some(-5.0), 100.0), 100.0);
        assert_eq!(valid_delay_period(Some(50.0), 100.0), 100.0);
        assert_eq!(valid_delay_period(Some(500.0), 100.0), 500.0);
    }

    #[test]
    fn sigma_tolerance_floor() {
        assert!(valid_sigma_decrease_tolerance(None).is_ok());
        assert!(valid_sigma_decrease_tolerance(Some(1e-20)).is_err());
        assert!(valid_sigma_decrease_tolerance(Some(1e-6)).is_ok());
    }

    #[test]
    fn start_config_checks_pass_and_combine() {
        let mut client = RoundClient::new(Some(120.0), false, 1e-6);
        let config = start_config();
        let combined = client
            .check_start_config(&config, json!({}))
            .expect("valid start");
        assert_eq!(combined.len(), 1);
        assert_eq!(combined["ZeroCount"].sigma, Some(0.0));
        assert!(combined["ZeroCount"].bins.is_some());
    }

    #[test]
    fn start_config_rejects_missing_weights() {
        let mut client = RoundClient::new(None, false, 1e-6);
        let mut config = start_config();
        config.noise_weight.clear();
        assert!(client.check_start_config(&config, json!({})).is_none());
    }

    #[test]
    fn start_config_rejects_unknown_counters() {
        let mut client = RoundClient::new(None, false, 1e-6);
        let mut config = start_config();
        config.counters.insert(
            "NotARealCounterName".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                sigma: None,
            },
        );
        config.noise.counters.insert(
            "NotARealCounterName".into(),
            NoiseCounter {
                sigma: Some(0.0),
                ..Default::default()
            },
        );
        assert!(client.check_start_config(&config, json!({})).is_none());
    }

    #[test]
    fn stop_response_carries_echo_and_counts() {
        let mut client = RoundClient::new(None, false, 1e-6);
        let config = start_config();
        client
            .check_start_config(&config, json!({"name": "dc1"}))
            .expect("valid start");

        let counts = Counts::new();
        let response = client.check_stop_config(
            &StopConfig {
                send_counters: true,
            },
            Some(counts),
            json!({"state": "(state path)"}),
        );
        assert!(response.counts.is_some());
        let config_echo = response.config.as_object().expect("object");
        assert!(config_echo.contains_key("Start"));
        assert!(config_echo.contains_key("Stop"));
        assert!(config_echo.contains_key("Time"));
        assert!(config_echo.contains_key("counter_limits"));
    }

    #[test]
    fn stop_without_start_still_responds() {
        let mut client = RoundClient::new(None, false, 1e-6);
        let response = client.check_stop_config(
            &StopConfig {
                send_counters: false,
            },
            None,
            json!({}),
        );
        // cleanup-only stop: an empty counts map, not an error
        assert_eq!(response.counts, Some(Counts::new()));
    }
}
