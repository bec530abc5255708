//! Hidden-Markov traffic model: dynamic counter registration and
//! Viterbi-based emission assignment.
//!
//! The hidden states loosely represent whether an endpoint is transmitting
//! or pausing; the observed events are outbound/inbound packets with the
//! delay since the previous packet. Per-state counts are tallied under the
//! same secret-sharing scheme as every other counter, so the model can later
//! be re-estimated from aggregate noisy tallies alone.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::counter::{Bin, CounterSpec, CountersConfig, SecureCounters, SINGLE_BIN};
use crate::error::{Error, Result};
use crate::noise::{NoiseCounter, NoiseSpec};
use crate::registry::{self, EVENT_STREAM_BYTES, EVENT_STREAM_ENDED};

/// Approximate payload bytes per packet, used to split byte transfers into
/// packet observations.
pub const PACKET_BYTE_COUNT: u64 = 1434;
/// Packets arriving within this many microseconds are treated as one bundle.
pub const PACKET_ARRIVAL_TIME_TOLERANCE: u64 = 100;
/// Packets processed per stream before the stream is truncated with a
/// warning. Keeps a single stream from starving the event loop.
pub const MAX_STREAM_PACKET_COUNT: usize = 10_000;
/// Wall-clock seconds of Viterbi processing per stream before truncation.
pub const MAX_STREAM_PROCESSING_TIME: f64 = 10.0;
/// Seconds a stream may sit idle before its stored packets are evicted.
pub const STREAM_EVICT_TIME: f64 = 3600.0;

/// Emission parameters for one (state, direction): the direction
/// probability, and the mean and deviation of the log-delay distribution.
/// Serialized as the three-element array `[p, mu, sigma]`.
pub type Emission = (f64, f64, f64);

/// A compact HMM description, as carried in the tally server config and in
/// START payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficModelConfig {
    pub states: Vec<String>,
    pub start_probability: BTreeMap<String, f64>,
    pub transition_probability: BTreeMap<String, BTreeMap<String, f64>>,
    pub emission_probability: BTreeMap<String, BTreeMap<String, Emission>>,
}

/// Check the cross-references inside a model config: every probability key
/// must name a declared state.
pub fn check_traffic_model_config(config: &TrafficModelConfig) -> bool {
    if config.states.is_empty() {
        tracing::warn!("traffic model has no states");
        return false;
    }
    let states: BTreeSet<&String> = config.states.iter().collect();
    for state in config.start_probability.keys() {
        if !states.contains(state) {
            tracing::warn!("start probability names unknown state {}", state);
            return false;
        }
    }
    for (src, dsts) in &config.transition_probability {
        if !states.contains(src) {
            tracing::warn!("transition probability names unknown state {}", src);
            return false;
        }
        for dst in dsts.keys() {
            if !states.contains(dst) {
                tracing::warn!("transition probability names unknown state {}", dst);
                return false;
            }
        }
    }
    for state in config.emission_probability.keys() {
        if !states.contains(state) {
            tracing::warn!("emission probability names unknown state {}", state);
            return false;
        }
    }
    true
}

/// Many packets that arrived at (almost) the same time, in one direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketBundle {
    /// Direction flag; `None` marks a flush observation.
    pub sent: Option<bool>,
    /// Microseconds since the previous packet.
    pub delay_micros: u64,
    /// Bundle timestamp, epoch seconds.
    pub timestamp: f64,
    /// Number of packets sharing this direction and delay.
    pub packet_count: u32,
    /// Payload bytes of the last packet in the bundle.
    pub payload_bytes: u32,
}

impl PacketBundle {
    /// The emission direction key for this bundle.
    pub fn direction(&self) -> &'static str {
        match self.sent {
            None => "F",
            Some(true) => "-",
            Some(false) => "+",
        }
    }
}

/// Discretize a delay to the nearest power of e (truncated), matching the
/// emission distribution's log-delay domain.
fn discretize_delay(delay_micros: u64) -> f64 {
    if delay_micros <= 2 {
        1.0
    } else {
        (delay_micros as f64).ln().floor().exp().floor()
    }
}

/// Truncated log of a delay: 0 for sub-microsecond delays (log(0) is
/// undefined and negative logs must not enter the counters).
fn log_delay(delay_micros: u64) -> i64 {
    if delay_micros < 1 {
        0
    } else {
        (delay_micros as f64).ln() as i64
    }
}

const SQRT_2_PI: f64 = 2.506_628_274_631_000_5;

/// A validated hidden Markov model.
pub struct TrafficModel {
    config: TrafficModelConfig,
    /// For each state, the states with a positive-probability transition
    /// into it. Only these need to be considered during Viterbi.
    incoming: BTreeMap<String, BTreeSet<String>>,
}

impl TrafficModel {
    pub fn new(config: TrafficModelConfig) -> Result<Self> {
        if !check_traffic_model_config(&config) {
            return Err(Error::TrafficModel(
                "traffic model config failed validation".into(),
            ));
        }
        let mut incoming: BTreeMap<String, BTreeSet<String>> = config
            .states
            .iter()
            .map(|s| (s.clone(), BTreeSet::new()))
            .collect();
        for (src, dsts) in &config.transition_probability {
            for (dst, p) in dsts {
                if *p > 0.0 {
                    if let Some(set) = incoming.get_mut(dst) {
                        set.insert(src.clone());
                    }
                }
            }
        }
        Ok(TrafficModel { config, incoming })
    }

    pub fn config(&self) -> &TrafficModelConfig {
        &self.config
    }

    // -- counter template expansion --------------------------------------

    /// Dynamic counter label to noise-template label. Dynamic labels depend
    /// on the model's states:
    /// one emission / log-delay / squared-log-delay counter per
    /// (state, direction), one transition counter per positive
    /// (src, dst) pair, and one START transition counter per starting state.
    pub fn dynamic_counter_template_label_mapping(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        for (state, directions) in &self.config.emission_probability {
            for direction in directions.keys() {
                labels.insert(
                    format!("ExitStreamTrafficModelEmissionCount_{state}_{direction}"),
                    "ExitStreamTrafficModelEmissionCount_<STATE>_<DIRECTION>".to_string(),
                );
                labels.insert(
                    format!("ExitStreamTrafficModelLogDelayTime_{state}_{direction}"),
                    "ExitStreamTrafficModelLogDelayTime_<STATE>_<DIRECTION>".to_string(),
                );
                labels.insert(
                    format!("ExitStreamTrafficModelSquaredLogDelayTime_{state}_{direction}"),
                    "ExitStreamTrafficModelSquaredLogDelayTime_<STATE>_<DIRECTION>".to_string(),
                );
            }
        }
        for (src, dsts) in &self.config.transition_probability {
            for (dst, p) in dsts {
                if *p > 0.0 {
                    labels.insert(
                        format!("ExitStreamTrafficModelTransitionCount_{src}_{dst}"),
                        "ExitStreamTrafficModelTransitionCount_<SRCSTATE>_<DSTSTATE>".to_string(),
                    );
                }
            }
        }
        for (state, p) in &self.config.start_probability {
            if *p > 0.0 {
                labels.insert(
                    format!("ExitStreamTrafficModelTransitionCount_START_{state}"),
                    "ExitStreamTrafficModelTransitionCount_START_<STATE>".to_string(),
                );
            }
        }
        labels
    }

    /// Static counter labels (independent of the model input), each its own
    /// template.
    pub fn static_counter_template_label_mapping() -> BTreeMap<String, String> {
        [
            "ExitStreamTrafficModelEmissionCount",
            "ExitStreamTrafficModelTransitionCount",
            "ExitStreamTrafficModelLogDelayTime",
            "ExitStreamTrafficModelSquaredLogDelayTime",
        ]
        .iter()
        .map(|label| ((*label).to_string(), (*label).to_string()))
        .collect()
    }

    /// All counter labels (static and dynamic) to template labels.
    pub fn all_counter_template_label_mapping(&self) -> BTreeMap<String, String> {
        let mut all = self.dynamic_counter_template_label_mapping();
        all.extend(Self::static_counter_template_label_mapping());
        all
    }

    /// The template labels noise must be specified for.
    pub fn all_template_labels(&self) -> BTreeSet<String> {
        self.all_counter_template_label_mapping()
            .into_values()
            .collect()
    }

    /// The dynamically named counters counted for this model.
    pub fn dynamic_counter_labels(&self) -> BTreeSet<String> {
        self.dynamic_counter_template_label_mapping()
            .into_keys()
            .collect()
    }

    /// Every counter counted for this model.
    pub fn all_counter_labels(&self) -> BTreeSet<String> {
        self.all_counter_template_label_mapping()
            .into_keys()
            .collect()
    }

    /// Register the dynamic counters with the known-counter set so START
    /// payloads naming them validate.
    pub fn register_counters(&self) {
        for label in self.dynamic_counter_labels() {
            registry::register_dynamic_counter(
                &label,
                [
                    EVENT_STREAM_BYTES.to_string(),
                    EVENT_STREAM_ENDED.to_string(),
                ],
            );
        }
    }

    /// Does the templated noise config cover every template label?
    pub fn check_noise_config(&self, templated_noise_config: &NoiseSpec) -> bool {
        self.all_template_labels()
            .iter()
            .all(|label| templated_noise_config.counters.contains_key(label))
    }

    /// Expand a templated noise config into per-counter noise entries for
    /// every counter counted by this model.
    pub fn expand_noise_config(
        &self,
        templated_noise_config: &NoiseSpec,
    ) -> Result<BTreeMap<String, NoiseCounter>> {
        if !self.check_noise_config(templated_noise_config) {
            return Err(Error::TrafficModel(
                "templated noise config is missing traffic model labels".into(),
            ));
        }
        let mut noise = BTreeMap::new();
        for (counter_label, template_label) in self.all_counter_template_label_mapping() {
            noise.insert(
                counter_label,
                templated_noise_config.counters[&template_label].clone(),
            );
        }
        Ok(noise)
    }

    /// Initial bins for every model counter: all are single-value counts,
    /// so each gets the single `[0, inf)` bin.
    pub fn bins_init_config(&self) -> CountersConfig {
        self.all_counter_labels()
            .into_iter()
            .map(|label| {
                (
                    label,
                    CounterSpec {
                        bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                        sigma: None,
                    },
                )
            })
            .collect()
    }

    // -- Viterbi ----------------------------------------------------------

    /// Flatten bundles into per-packet observations `(direction, delay)`,
    /// enforcing the per-stream packet cap.
    fn observations(bundles: &[PacketBundle]) -> Vec<(&'static str, u64)> {
        let mut observations = Vec::new();
        for bundle in bundles {
            for _ in 0..bundle.packet_count {
                if observations.len() >= MAX_STREAM_PACKET_COUNT {
                    tracing::warn!(
                        "stream exceeded {} packets, truncating traffic model observations",
                        MAX_STREAM_PACKET_COUNT
                    );
                    return observations;
                }
                observations.push((bundle.direction(), bundle.delay_micros));
            }
        }
        observations
    }

    fn emission_log_prob(&self, state: &str, direction: &str, dx: f64) -> Option<f64> {
        let (dp, mu, sigma) = *self.config.emission_probability.get(state)?.get(direction)?;
        let delay_logp =
            -(dx * sigma * SQRT_2_PI).ln() - 0.5 * ((dx.ln() - mu) / sigma).powi(2);
        Some(dp.ln() + delay_logp)
    }

    /// Find the most likely hidden state sequence for a stream's packet
    /// bundles, in log space.
    ///
    /// Bounded by [`MAX_STREAM_PACKET_COUNT`] and
    /// [`MAX_STREAM_PROCESSING_TIME`]: an oversized stream is truncated with
    /// a warning, never allowed to stall the event loop. The result is
    /// deterministic for a fixed model and observation sequence.
    pub fn run_viterbi(&self, bundles: &[PacketBundle]) -> Vec<String> {
        let observations = Self::observations(bundles);
        if observations.is_empty() {
            return Vec::new();
        }
        let started = Instant::now();

        // one column per observation; cell: (log prob, predecessor state)
        let mut table: Vec<BTreeMap<&str, (f64, Option<&str>)>> = Vec::new();

        let (direction, delay) = observations[0];
        let dx = discretize_delay(delay);
        let mut first = BTreeMap::new();
        for state in &self.config.states {
            let start_p = self.config.start_probability.get(state).copied().unwrap_or(0.0);
            let cell = if start_p > 0.0 {
                match self.emission_log_prob(state, direction, dx) {
                    Some(fit) => (start_p.ln() + fit, None),
                    None => (f64::NEG_INFINITY, None),
                }
            } else {
                (f64::NEG_INFINITY, None)
            };
            first.insert(state.as_str(), cell);
        }
        table.push(first);

        let mut truncated_at = None;
        for (t, (direction, delay)) in observations.iter().copied().enumerate().skip(1) {
            if started.elapsed().as_secs_f64() > MAX_STREAM_PROCESSING_TIME {
                tracing::warn!(
                    "viterbi processing exceeded {}s after {} observations, truncating stream",
                    MAX_STREAM_PROCESSING_TIME,
                    t
                );
                truncated_at = Some(t);
                break;
            }
            let dx = discretize_delay(delay);
            let prev_col = &table[t - 1];
            let mut column = BTreeMap::new();
            for state in &self.config.states {
                let mut best: (f64, Option<&str>) = (f64::NEG_INFINITY, None);
                if let Some(incoming) = self.incoming.get(state) {
                    for prev_state in incoming {
                        let trans_p = self.config.transition_probability[prev_state.as_str()]
                            [state.as_str()];
                        let score = prev_col[prev_state.as_str()].0 + trans_p.ln();
                        if score > best.0 {
                            best = (score, Some(prev_state.as_str()));
                        }
                    }
                }
                let cell = match self.emission_log_prob(state, direction, dx) {
                    Some(fit) if best.1.is_some() => (best.0 + fit, best.1),
                    _ => (f64::NEG_INFINITY, best.1),
                };
                column.insert(state.as_str(), cell);
            }
            table.push(column);
        }

        // backtrack from the most probable final state
        let last = table
            .last()
            .unwrap_or_else(|| unreachable!("observations is non-empty"));
        let (mut previous, _) = last
            .iter()
            .max_by(|a, b| {
                a.1 .0
                    .partial_cmp(&b.1 .0)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(state, cell)| (*state, cell.0))
            .unwrap_or_else(|| unreachable!("model has at least one state"));
        let mut path = vec![previous.to_string()];
        for t in (1..table.len()).rev() {
            match table[t][previous].1 {
                Some(prev) => {
                    path.push(prev.to_string());
                    previous = prev;
                }
                None => break,
            }
        }
        path.reverse();

        let expected = truncated_at.unwrap_or(observations.len());
        if path.len() != expected {
            tracing::warn!(
                "saw stream with {} observations but computed {} states",
                expected,
                path.len()
            );
        }
        path
    }

    // -- counter increments -----------------------------------------------

    /// Increment the model's counters for one completed stream.
    ///
    /// Per observation: one emission count for (state, direction), the
    /// log-delay and squared-log-delay scalar additions (for later
    /// estimation of mu and sigma from aggregated tallies), one transition
    /// count per consecutive state pair, and one START transition for the
    /// first packet.
    pub fn increment_stream_counters(
        &self,
        bundles: &[PacketBundle],
        likeliest_states: &[String],
        secure_counters: &mut SecureCounters,
    ) {
        let observations = Self::observations(bundles);
        let num_states = likeliest_states.len();
        for (i, (direction, delay)) in observations.iter().copied().enumerate() {
            let Some(state) = likeliest_states.get(i) else {
                break;
            };
            let ldelay = log_delay(delay);

            secure_counters.increment("ExitStreamTrafficModelEmissionCount", SINGLE_BIN, 1);
            secure_counters.increment(
                &format!("ExitStreamTrafficModelEmissionCount_{state}_{direction}"),
                SINGLE_BIN,
                1,
            );

            secure_counters.increment("ExitStreamTrafficModelLogDelayTime", SINGLE_BIN, ldelay);
            secure_counters.increment(
                &format!("ExitStreamTrafficModelLogDelayTime_{state}_{direction}"),
                SINGLE_BIN,
                ldelay,
            );

            secure_counters.increment(
                "ExitStreamTrafficModelSquaredLogDelayTime",
                SINGLE_BIN,
                ldelay * ldelay,
            );
            secure_counters.increment(
                &format!("ExitStreamTrafficModelSquaredLogDelayTime_{state}_{direction}"),
                SINGLE_BIN,
                ldelay * ldelay,
            );

            if i == 0 {
                secure_counters.increment(
                    &format!("ExitStreamTrafficModelTransitionCount_START_{state}"),
                    SINGLE_BIN,
                    1,
                );
            }
            if i + 1 < num_states {
                let next_state = &likeliest_states[i + 1];
                secure_counters.increment(
                    "ExitStreamTrafficModelTransitionCount",
                    SINGLE_BIN,
                    1,
                );
                secure_counters.increment(
                    &format!("ExitStreamTrafficModelTransitionCount_{state}_{next_state}"),
                    SINGLE_BIN,
                    1,
                );
            }
        }
    }

    // -- re-estimation ----------------------------------------------------

    /// Re-estimate the model from aggregated (noisy) tallies, blending the
    /// observed statistics into the existing parameters with the given
    /// inertia factors. Returns the updated config.
    pub fn update_from_tallies(
        &mut self,
        tallies: &BTreeMap<String, i64>,
        trans_inertia: f64,
        emit_inertia: f64,
    ) -> TrafficModelConfig {
        let tally = |label: &str| tallies.get(label).copied().unwrap_or(0);

        // transition counts per source state
        let mut state_count: BTreeMap<String, i64> = BTreeMap::new();
        let mut obs_trans_p: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (src, dsts) in &self.config.transition_probability {
            let mut total = 0i64;
            let mut counts = BTreeMap::new();
            for dst in dsts.keys() {
                let count = tally(&format!(
                    "ExitStreamTrafficModelTransitionCount_{src}_{dst}"
                ))
                .max(0);
                counts.insert(dst.clone(), count);
                total += count;
            }
            state_count.insert(src.clone(), total);
            let mut probs = BTreeMap::new();
            for (dst, count) in counts {
                let p = if total > 0 {
                    count as f64 / total as f64
                } else {
                    0.0
                };
                probs.insert(dst, p);
            }
            obs_trans_p.insert(src.clone(), probs);
        }

        // observed emission statistics per (state, direction)
        let mut new_emit = self.config.emission_probability.clone();
        for (state, directions) in &mut new_emit {
            let total = state_count.get(state).copied().unwrap_or(0);
            for (direction, (dp, mu, sigma)) in directions.iter_mut() {
                let emit_count =
                    tally(&format!("ExitStreamTrafficModelEmissionCount_{state}_{direction}"))
                        .max(0);
                let obs_mu = if emit_count > 0 {
                    tally(&format!("ExitStreamTrafficModelLogDelayTime_{state}_{direction}"))
                        as f64
                        / emit_count as f64
                } else {
                    0.0
                };
                let obs_var = if emit_count > 0 {
                    let sq = tally(&format!(
                        "ExitStreamTrafficModelSquaredLogDelayTime_{state}_{direction}"
                    )) as f64
                        / emit_count as f64;
                    sq - obs_mu * obs_mu
                } else {
                    0.0
                };
                // noise can make a small positive variance look negative
                let obs_sigma = if obs_var < 0.01f64.sqrt() {
                    0.01
                } else {
                    obs_var.sqrt()
                };
                let obs_dp = if total > 0 {
                    emit_count as f64 / total as f64
                } else {
                    0.0
                };
                *dp = emit_inertia * *dp + (1.0 - emit_inertia) * obs_dp;
                *mu = emit_inertia * *mu + (1.0 - emit_inertia) * obs_mu;
                *sigma = emit_inertia * *sigma + (1.0 - emit_inertia) * obs_sigma;
            }
        }
        self.config.emission_probability = new_emit;

        for (src, dsts) in &mut self.config.transition_probability {
            for (dst, p) in dsts.iter_mut() {
                *p = trans_inertia * *p + (1.0 - trans_inertia) * obs_trans_p[src][dst];
            }
        }

        // starting transitions
        let mut start_counts: BTreeMap<String, i64> = BTreeMap::new();
        let mut start_total = 0i64;
        for (state, p) in &self.config.start_probability {
            if *p > 0.0 {
                let count =
                    tally(&format!("ExitStreamTrafficModelTransitionCount_START_{state}")).max(0);
                start_counts.insert(state.clone(), count);
                start_total += count;
            }
        }
        for (state, p) in &mut self.config.start_probability {
            let observed = if start_total > 0 {
                start_counts.get(state).copied().unwrap_or(0) as f64 / start_total as f64
            } else {
                0.0
            };
            *p = trans_inertia * *p + (1.0 - trans_inertia) * observed;
        }

        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::counter_modulus;
    use num_bigint::BigInt;

    fn two_state_model() -> TrafficModel {
        let config = TrafficModelConfig {
            states: vec!["Blabbing".into(), "Thinking".into()],
            start_probability: [("Blabbing".to_string(), 0.6), ("Thinking".to_string(), 0.4)]
                .into_iter()
                .collect(),
            transition_probability: [
                (
                    "Blabbing".to_string(),
                    [("Blabbing".to_string(), 0.8), ("Thinking".to_string(), 0.2)]
                        .into_iter()
                        .collect(),
                ),
                (
                    "Thinking".to_string(),
                    [("Blabbing".to_string(), 0.5), ("Thinking".to_string(), 0.5)]
                        .into_iter()
                        .collect(),
                ),
            ]
            .into_iter()
            .collect(),
            emission_probability: [
                (
                    "Blabbing".to_string(),
                    [("+".to_string(), (0.8, 3.0, 1.0)), ("-".to_string(), (0.2, 3.0, 1.0))]
                        .into_iter()
                        .collect(),
                ),
                (
                    "Thinking".to_string(),
                    [("+".to_string(), (0.5, 6.5, 1.0)), ("-".to_string(), (0.5, 6.5, 1.0))]
                        .into_iter()
                        .collect(),
                ),
            ]
            .into_iter()
            .collect(),
        };
        TrafficModel::new(config).expect("valid model")
    }

    fn bundle(delay_micros: u64) -> PacketBundle {
        PacketBundle {
            sent: Some(false),
            delay_micros,
            timestamp: 0.0,
            packet_count: 1,
            payload_bytes: 600,
        }
    }

    #[test]
    fn config_validation_rejects_unknown_states() {
        let mut config = two_state_model().config().clone();
        config
            .start_probability
            .insert("Mystery".into(), 0.1);
        assert!(!check_traffic_model_config(&config));
    }

    #[test]
    fn delay_discretization_truncates_to_powers_of_e() {
        assert_eq!(discretize_delay(0), 1.0);
        assert_eq!(discretize_delay(2), 1.0);
        assert_eq!(discretize_delay(20), 7.0);
        assert_eq!(discretize_delay(1000), 403.0);
    }

    #[test]
    fn viterbi_assigns_one_state_per_observation() {
        let model = two_state_model();
        let bundles = vec![bundle(20), bundle(10), bundle(50), bundle(1000)];
        let states = model.run_viterbi(&bundles);
        assert_eq!(states.len(), 4);
        for state in &states {
            assert!(model.config().states.contains(state));
        }
    }

    #[test]
    fn viterbi_is_deterministic() {
        let model = two_state_model();
        let bundles = vec![bundle(20), bundle(10), bundle(50), bundle(1000)];
        let first = model.run_viterbi(&bundles);
        for _ in 0..5 {
            assert_eq!(model.run_viterbi(&bundles), first);
        }
    }

    #[test]
    fn viterbi_prefers_matching_delays() {
        let model = two_state_model();
        // short delays fit Blabbing (mu = 3), the long delay fits
        // Thinking (mu = 6.5, about exp(6.5) = 665 micros)
        let states = model.run_viterbi(&[bundle(20), bundle(20), bundle(20), bundle(100_000)]);
        assert_eq!(states[0], "Blabbing");
        assert_eq!(states[3], "Thinking");
    }

    #[test]
    fn bundles_expand_to_packet_observations() {
        let model = two_state_model();
        let mut multi = bundle(20);
        multi.packet_count = 3;
        let states = model.run_viterbi(&[multi, bundle(1000)]);
        assert_eq!(states.len(), 4);
    }

    #[test]
    fn template_expansion_covers_all_shapes() {
        let model = two_state_model();
        let dynamic = model.dynamic_counter_template_label_mapping();
        // 2 states x 2 directions x 3 emission statistics
        // + 4 positive transitions + 2 start transitions
        assert_eq!(dynamic.len(), 12 + 4 + 2);
        assert!(dynamic.contains_key("ExitStreamTrafficModelEmissionCount_Blabbing_+"));
        assert!(dynamic.contains_key("ExitStreamTrafficModelTransitionCount_Blabbing_Thinking"));
        assert!(dynamic.contains_key("ExitStreamTrafficModelTransitionCount_START_Thinking"));
        assert_eq!(model.all_template_labels().len(), 5 + 4);
    }

    #[test]
    fn registered_counters_validate() {
        let model = two_state_model();
        model.register_counters();
        assert!(crate::registry::is_known_counter(
            "ExitStreamTrafficModelEmissionCount_Blabbing_+"
        ));
    }

    #[test]
    fn stream_counters_accumulate() {
        let model = two_state_model();
        model.register_counters();
        let mut config = model.bins_init_config();
        for spec in config.values_mut() {
            spec.sigma = Some(0.0);
        }
        let mut counters =
            SecureCounters::new(&config, counter_modulus(), false).expect("valid config");

        let bundles = vec![bundle(20), bundle(10), bundle(50), bundle(1000)];
        let states = model.run_viterbi(&bundles);
        model.increment_stream_counters(&bundles, &states, &mut counters);

        let counts = counters.detach_counts().expect("counts");
        assert_eq!(
            counts["ExitStreamTrafficModelEmissionCount"].bins[0].count,
            BigInt::from(4)
        );
        assert_eq!(
            counts["ExitStreamTrafficModelTransitionCount"].bins[0].count,
            BigInt::from(3)
        );
        // ldelay sums: ln(20)=2, ln(10)=2, ln(50)=3, ln(1000)=6
        assert_eq!(
            counts["ExitStreamTrafficModelLogDelayTime"].bins[0].count,
            BigInt::from(2 + 2 + 3 + 6)
        );
        assert_eq!(
            counts["ExitStreamTrafficModelSquaredLogDelayTime"].bins[0].count,
            BigInt::from(4 + 4 + 9 + 36)
        );
        // exactly one START transition
        let start_total: BigInt = counts
            .iter()
            .filter(|(name, _)| name.starts_with("ExitStreamTrafficModelTransitionCount_START_"))
            .map(|(_, counter)| counter.bins[0].count.clone())
            .sum();
        assert_eq!(start_total, BigInt::from(1));
    }

    #[test]
    fn update_from_tallies_blends_observations() {
        let mut model = two_state_model();
        let mut tallies = BTreeMap::new();
        tallies.insert(
            "ExitStreamTrafficModelTransitionCount_Blabbing_Blabbing".to_string(),
            90i64,
        );
        tallies.insert(
            "ExitStreamTrafficModelTransitionCount_Blabbing_Thinking".to_string(),
            10i64,
        );
        tallies.insert(
            "ExitStreamTrafficModelEmissionCount_Blabbing_+".to_string(),
            80i64,
        );
        tallies.insert(
            "ExitStreamTrafficModelLogDelayTime_Blabbing_+".to_string(),
            240i64,
        );
        tallies.insert(
            "ExitStreamTrafficModelSquaredLogDelayTime_Blabbing_+".to_string(),
            800i64,
        );
        tallies.insert(
            "ExitStreamTrafficModelTransitionCount_START_Blabbing".to_string(),
            100i64,
        );
        let updated = model.update_from_tallies(&tallies, 0.1, 0.1);
        let trans = &updated.transition_probability["Blabbing"];
        // 0.1 * 0.8 + 0.9 * 0.9
        assert!((trans["Blabbing"] - 0.89).abs() < 1e-9);
        // observed mu = 240 / 80 = 3.0
        let (_, mu, _) = updated.emission_probability["Blabbing"]["+"];
        assert!((mu - 3.0).abs() < 1e-9);
        // start probability pulled toward 1.0 for Blabbing
        assert!(updated.start_probability["Blabbing"] > 0.9);
    }
}
