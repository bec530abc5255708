//! Counter configuration, validation, and the secure counter engine.
//!
//! A counter is a histogram: an ordered list of half-open bins `[lo, hi)`
//! (`hi = +inf` also includes +inf) plus a Gaussian sigma used at the data
//! collectors. [`SecureCounters`] holds one mod-Q cell per bin and supports
//! the full blind / noise / increment / tally lifecycle:
//!
//! ```text
//! data collector: new, generate_blinding_shares, detach_blinding_shares,
//!                 generate_noise, increment (repeated), detach_counts
//! share keeper:   new, import_blinding_share (repeated), detach_counts
//! tally server:   new, tally_counters, detach_counts
//! ```
//!
//! Summing every participant's detached counts mod Q cancels the blinding
//! and yields the true totals plus noise.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use num_bigint::{BigInt, BigUint};
use num_traits::Zero;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::registry;
use crate::sampling::{
    adjust_count_signed, derive_blinding_factor, max_tally_counter_value, noise, reduce_mod,
    round_noise,
};

/// Placeholder bin key for a counter with a single bin.
///
/// NaN is outside the range of every possible counter value, so it can never
/// collide with a real bin key.
pub const SINGLE_BIN: f64 = f64::NAN;

// ---------------------------------------------------------------------------
// Bin bounds: f64 with ±inf, serialized as "inf"/"-inf" strings in JSON
// ---------------------------------------------------------------------------

fn serialize_bound<S: Serializer>(v: f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    if v == f64::INFINITY {
        serializer.serialize_str("inf")
    } else if v == f64::NEG_INFINITY {
        serializer.serialize_str("-inf")
    } else {
        serializer.serialize_f64(v)
    }
}

struct BoundVisitor;

impl Visitor<'_> for BoundVisitor {
    type Value = f64;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a number, \"inf\", or \"-inf\"")
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<f64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<f64, E> {
        Ok(v as f64)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<f64, E> {
        Ok(v as f64)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<f64, E> {
        match v {
            "inf" | "+inf" | ".inf" => Ok(f64::INFINITY),
            "-inf" | "-.inf" => Ok(f64::NEG_INFINITY),
            other => f64::from_str(other)
                .map_err(|_| de::Error::custom(format!("invalid bin bound '{other}'"))),
        }
    }
}

fn deserialize_bound<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<f64, D::Error> {
    deserializer.deserialize_any(BoundVisitor)
}

// ---------------------------------------------------------------------------
// Configuration records
// ---------------------------------------------------------------------------

/// A half-open histogram interval `[lo, hi)`.
///
/// `hi = +inf` is inclusive of +inf; `lo = -inf` admits every finite value
/// below `hi`. Serialized as the two-element array `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bin {
    pub lo: f64,
    pub hi: f64,
}

impl Bin {
    pub fn new(lo: f64, hi: f64) -> Self {
        Bin { lo, hi }
    }
}

impl Serialize for Bin {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        struct Bound(f64);
        impl Serialize for Bound {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serialize_bound(self.0, serializer)
            }
        }
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&Bound(self.lo))?;
        seq.serialize_element(&Bound(self.hi))?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Bin {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct BinVisitor;
        impl<'de> Visitor<'de> for BinVisitor {
            type Value = Bin;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [lo, hi] bin")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Bin, A::Error> {
                struct Bound(f64);
                impl<'de> Deserialize<'de> for Bound {
                    fn deserialize<D: Deserializer<'de>>(
                        deserializer: D,
                    ) -> std::result::Result<Self, D::Error> {
                        deserialize_bound(deserializer).map(Bound)
                    }
                }
                let lo: Bound = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let hi: Bound = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                // tolerate and discard a trailing count element
                let _: Option<serde::de::IgnoredAny> = seq.next_element()?;
                Ok(Bin::new(lo.0, hi.0))
            }
        }
        deserializer.deserialize_seq(BinVisitor)
    }
}

/// One counter's configuration: its bins and/or its sigma.
///
/// The tally server configures bins and sigmas through separate documents;
/// either side may be absent here, and [`combine_counters`] merges them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CounterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bins: Option<Vec<Bin>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigma: Option<f64>,
}

/// Counter name (titlecase) to configuration, ordered for deterministic
/// logs and output files.
pub type CountersConfig = BTreeMap<String, CounterSpec>;

// ---------------------------------------------------------------------------
// Tally cells
// ---------------------------------------------------------------------------

/// A per-bin tally cell `(lo, hi, count)`.
///
/// The count is an unbounded integer: in `[0, Q)` while blinded, and in
/// `[-Q/2, Q/2)` after signed recovery. Serialized as `[lo, hi, count]` with
/// the count as an arbitrary-precision JSON number.
#[derive(Debug, Clone, PartialEq)]
pub struct TallyBin {
    pub lo: f64,
    pub hi: f64,
    pub count: BigInt,
}

impl TallyBin {
    pub fn zeroed(bin: &Bin) -> Self {
        TallyBin {
            lo: bin.lo,
            hi: bin.hi,
            count: BigInt::zero(),
        }
    }
}

impl Serialize for TallyBin {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        struct Bound(f64);
        impl Serialize for Bound {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serialize_bound(self.0, serializer)
            }
        }
        let count: serde_json::Number = serde_json::from_str(&self.count.to_string())
            .map_err(serde::ser::Error::custom)?;
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&Bound(self.lo))?;
        seq.serialize_element(&Bound(self.hi))?;
        seq.serialize_element(&count)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for TallyBin {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct TallyBinVisitor;
        impl<'de> Visitor<'de> for TallyBinVisitor {
            type Value = TallyBin;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [lo, hi, count] tally bin")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<TallyBin, A::Error> {
                struct Bound(f64);
                impl<'de> Deserialize<'de> for Bound {
                    fn deserialize<D: Deserializer<'de>>(
                        deserializer: D,
                    ) -> std::result::Result<Self, D::Error> {
                        deserialize_bound(deserializer).map(Bound)
                    }
                }
                let lo: Bound = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let hi: Bound = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let count: serde_json::Number = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let count = BigInt::parse_bytes(count.to_string().as_bytes(), 10)
                    .ok_or_else(|| de::Error::custom("count is not an integer"))?;
                Ok(TallyBin {
                    lo: lo.0,
                    hi: hi.0,
                    count,
                })
            }
        }
        deserializer.deserialize_seq(TallyBinVisitor)
    }
}

/// One counter's tally cells plus its sigma.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyCounter {
    pub bins: Vec<TallyBin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigma: Option<f64>,
}

/// A full counter snapshot: name to tally cells. This is what travels inside
/// blinding shares, STOP responses, and the tallies output file.
pub type Counts = BTreeMap<String, TallyCounter>;

/// The blinding-share structure a data collector generates for one share
/// keeper: an additive secret-share of the zero vector over mod-Q counter
/// space, in its negative (unblinding) form only after import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlindingShare {
    pub sk_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc_name: Option<String>,
    pub secret: Counts,
}

// ---------------------------------------------------------------------------
// Configuration validation
// ---------------------------------------------------------------------------

/// Check that each counter name is known to this PrivCount version.
pub fn check_counter_names<'a>(names: impl Iterator<Item = &'a String>) -> bool {
    let mut ok = true;
    for name in names {
        if !registry::is_known_counter(name) {
            tracing::warn!("counter name {} is unknown", name);
            ok = false;
        }
    }
    ok
}

/// Total number of bins across all counters.
pub fn count_bins(config: &CountersConfig) -> usize {
    config
        .values()
        .map(|spec| spec.bins.as_ref().map_or(0, Vec::len))
        .sum()
}

/// Check that every counter's bins are well-formed: `lo < hi`, sorted by
/// lower bound, non-overlapping. If `allow_unknown_counters` is false, also
/// require every name to be known.
pub fn check_bins_config(bins: &CountersConfig, allow_unknown_counters: bool) -> bool {
    if !allow_unknown_counters && !check_counter_names(bins.keys()) {
        return false;
    }
    for (name, spec) in bins {
        let Some(counter_bins) = &spec.bins else {
            tracing::warn!("counter {} is configured without bins", name);
            return false;
        };
        let mut sorted: Vec<Bin> = counter_bins.clone();
        if sorted.iter().any(|b| b.lo.is_nan() || b.hi.is_nan()) {
            tracing::warn!("counter {} has a NaN bin bound", name);
            return false;
        }
        sorted.sort_by(|a, b| {
            a.lo.partial_cmp(&b.lo)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.hi.partial_cmp(&b.hi).unwrap_or(std::cmp::Ordering::Equal))
        });
        let mut prev: Option<Bin> = None;
        for bin in sorted {
            if bin.lo >= bin.hi {
                tracing::warn!(
                    "bin [{}, {}) in counter {} will never count any values: its lower bound is not below its upper bound",
                    bin.lo, bin.hi, name
                );
                return false;
            }
            if let Some(p) = prev {
                if p.lo == bin.lo {
                    tracing::warn!(
                        "bin [{}, {}) in counter {} overlaps [{}, {}): equal lower bounds",
                        p.lo, p.hi, name, bin.lo, bin.hi
                    );
                    return false;
                }
                if p.hi > bin.lo {
                    tracing::warn!(
                        "bin [{}, {}) in counter {} overlaps [{}, {})",
                        p.lo, p.hi, name, bin.lo, bin.hi
                    );
                    return false;
                }
            }
            prev = Some(bin);
        }
    }
    true
}

/// Check that every sigma is present and non-negative. If
/// `allow_unknown_counters` is false, also require every name to be known.
pub fn check_sigmas_config(sigmas: &CountersConfig, allow_unknown_counters: bool) -> bool {
    if !allow_unknown_counters && !check_counter_names(sigmas.keys()) {
        return false;
    }
    for (name, spec) in sigmas {
        match spec.sigma {
            Some(sigma) if sigma >= 0.0 => {}
            Some(_) => {
                tracing::warn!("invalid sigma for counter {}: less than zero", name);
                return false;
            }
            None => {
                tracing::warn!("counter {} is configured without a sigma", name);
                return false;
            }
        }
    }
    true
}

/// Return a copy of `config` with counters lacking bins skipped (warned).
pub fn skip_missing_bins(config: &CountersConfig) -> CountersConfig {
    config
        .iter()
        .filter(|(name, spec)| {
            if spec.bins.is_none() {
                tracing::warn!(
                    "skipping counter '{}': configured as a bins counter, but it has no bins",
                    name
                );
            }
            spec.bins.is_some()
        })
        .map(|(name, spec)| (name.clone(), spec.clone()))
        .collect()
}

/// Return a copy of `config` with counters lacking a sigma skipped (warned).
pub fn skip_missing_sigmas(config: &CountersConfig) -> CountersConfig {
    config
        .iter()
        .filter(|(name, spec)| {
            if spec.sigma.is_none() {
                tracing::warn!(
                    "skipping counter '{}': configured as a sigma counter, but it has no sigma",
                    name
                );
            }
            spec.sigma.is_some()
        })
        .map(|(name, spec)| (name.clone(), spec.clone()))
        .collect()
}

/// Counter keys in `first` that are missing from `second`, with warnings.
pub fn extra_counters(
    first: &CountersConfig,
    second: &CountersConfig,
    first_name: &str,
    second_name: &str,
) -> Vec<String> {
    let mut extra: Vec<String> = first
        .keys()
        .filter(|k| !second.contains_key(*k))
        .cloned()
        .collect();
    extra.sort();
    for key in &extra {
        tracing::warn!(
            "skipping counter '{}' because it has a {}, but no {}",
            key,
            first_name,
            second_name
        );
    }
    extra
}

/// Counter keys shared by `first` and `second`, warning about one-sided keys.
pub fn common_counters(
    first: &CountersConfig,
    second: &CountersConfig,
    first_name: &str,
    second_name: &str,
) -> Vec<String> {
    extra_counters(first, second, first_name, second_name);
    extra_counters(second, first, second_name, first_name);
    first
        .keys()
        .filter(|k| second.contains_key(*k))
        .cloned()
        .collect()
}

/// Merge a bins config and a sigmas config, dropping counters missing from
/// either side. Bin widths come from `bins`, everything else from `sigmas`:
/// the tally server is permitted to update both between rounds.
pub fn combine_counters(bins: &CountersConfig, sigmas: &CountersConfig) -> CountersConfig {
    let bins = skip_missing_bins(bins);
    let sigmas = skip_missing_sigmas(sigmas);
    let common = common_counters(&bins, &sigmas, "bins", "sigmas");

    let mut combined = CountersConfig::new();
    for key in common {
        let mut spec = sigmas[&key].clone();
        spec.bins.clone_from(&bins[&key].bins);
        combined.insert(key, spec);
    }
    combined
}

/// Check that bins and sigmas cover exactly the same counters, with no
/// counter missing bins or sigma.
pub fn check_combined_counters(bins: &CountersConfig, sigmas: &CountersConfig) -> bool {
    let combined = combine_counters(bins, sigmas);
    combined.len() == bins.len() && combined.len() == sigmas.len()
}

/// Sanity check bins and sigmas individually and as a pair.
pub fn check_counters_config(
    bins: &CountersConfig,
    sigmas: &CountersConfig,
    allow_unknown_counters: bool,
) -> bool {
    check_bins_config(bins, allow_unknown_counters)
        && check_sigmas_config(sigmas, allow_unknown_counters)
        && check_combined_counters(bins, sigmas)
}

// ---------------------------------------------------------------------------
// Float accuracy
// ---------------------------------------------------------------------------

/// Maximum proportional change when converting an exact value to an f64:
/// half the distance to the adjacent float.
pub fn float_representation_accuracy() -> f64 {
    f64::EPSILON / 2.0
}

/// Maximum proportional change when converting an f64 to a string and back.
///
/// Sigmas travel between the TS and the SKs/DCs as JSON decimal strings;
/// the guaranteed-preserved digit count bounds the round-trip error.
pub fn float_string_accuracy() -> f64 {
    10.0f64.powi(-(f64::DIGITS as i32) + 1)
}

/// Maximum proportional change over exact value -> float -> string -> float.
pub fn float_accuracy() -> f64 {
    float_representation_accuracy() + float_string_accuracy()
}

// ---------------------------------------------------------------------------
// Noise weights
// ---------------------------------------------------------------------------

/// Map from DC fingerprint to noise weight; the `"*"` key supplies a default
/// for fingerprints not listed explicitly.
pub type NoiseWeightConfig = BTreeMap<String, f64>;

/// The wildcard key in a noise weight config.
pub const NOISE_WEIGHT_DEFAULT_KEY: &str = "*";

/// A noise weight must keep the scaled noise within the tally range.
pub fn check_noise_weight_value(weight: f64) -> bool {
    use num_traits::FromPrimitive;
    if !weight.is_finite() || weight < 0.0 {
        return false;
    }
    match BigInt::from_f64(weight.ceil()) {
        Some(v) => v <= max_tally_counter_value(),
        None => false,
    }
}

/// The sum of all weights must also stay in range.
pub fn check_noise_weight_sum(sum: f64) -> bool {
    check_noise_weight_value(sum)
}

/// Whether the config carries a `"*"` default weight.
pub fn has_noise_weight_default(config: &NoiseWeightConfig) -> bool {
    config.contains_key(NOISE_WEIGHT_DEFAULT_KEY)
}

/// Look up the weight for `fingerprint`, falling back to the default.
pub fn get_noise_weight(config: &NoiseWeightConfig, fingerprint: Option<&str>) -> Option<f64> {
    fingerprint
        .and_then(|fp| config.get(fp))
        .or_else(|| config.get(NOISE_WEIGHT_DEFAULT_KEY))
        .copied()
}

/// Whether `fingerprint` has any applicable weight.
pub fn has_noise_weight(config: &NoiseWeightConfig, fingerprint: Option<&str>) -> bool {
    get_noise_weight(config, fingerprint).is_some()
}

/// Validate a noise weight config against the DC threshold: every weight in
/// range; enough explicit weights (or a default) to cover a full threshold;
/// the worst-case sum in range.
pub fn check_noise_weight_config(config: &NoiseWeightConfig, dc_threshold: usize) -> bool {
    for (fingerprint, weight) in config {
        if !check_noise_weight_value(*weight) {
            tracing::warn!(
                "invalid noise weight {} for fingerprint {}",
                weight,
                fingerprint
            );
            return false;
        }
    }
    let explicit_count = config
        .keys()
        .filter(|k| k.as_str() != NOISE_WEIGHT_DEFAULT_KEY)
        .count();
    if !has_noise_weight_default(config) && explicit_count < dc_threshold {
        tracing::warn!(
            "noise weight config has {} explicit weights, fewer than the DC threshold {} and no default",
            explicit_count,
            dc_threshold
        );
        return false;
    }
    let explicit_sum: f64 = config
        .iter()
        .filter(|(k, _)| k.as_str() != NOISE_WEIGHT_DEFAULT_KEY)
        .map(|(_, w)| *w)
        .sum();
    let default_weight = config.get(NOISE_WEIGHT_DEFAULT_KEY).copied().unwrap_or(0.0);
    let default_instances = dc_threshold.saturating_sub(explicit_count) as f64;
    let sum = explicit_sum + default_weight * default_instances;
    if !check_noise_weight_sum(sum) {
        tracing::warn!("noise weight sum {} is out of range", sum);
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// SecureCounters
// ---------------------------------------------------------------------------

/// Securely count any number of labelled histograms over mod-Q cells.
///
/// Created from a combined counters config (bins and sigmas). Increment
/// order does not matter: mod-Q sums commute, so the final tally is
/// independent of event interleaving across collectors.
pub struct SecureCounters {
    counters: Option<Counts>,
    zero_counters: Counts,
    modulus: BigUint,
    shares: Option<BTreeMap<String, BlindingShare>>,
    noise_pending: bool,
    noise_generated: bool,
}

impl SecureCounters {
    /// Deep-copy the config and initialise every bin cell to zero.
    ///
    /// If `require_noise` is true, [`Self::detach_counts`] refuses to run
    /// until [`Self::generate_noise`] has been called: data collectors must
    /// never publish un-noised counts.
    pub fn new(config: &CountersConfig, modulus: &BigUint, require_noise: bool) -> Result<Self> {
        let mut counters = Counts::new();
        for (name, spec) in config {
            let bins = spec
                .bins
                .as_ref()
                .ok_or_else(|| Error::Counter(format!("counter {name} has no bins")))?;
            if bins.is_empty() {
                return Err(Error::Counter(format!("counter {name} has zero bins")));
            }
            counters.insert(
                name.clone(),
                TallyCounter {
                    bins: bins.iter().map(TallyBin::zeroed).collect(),
                    sigma: spec.sigma,
                },
            );
        }
        Ok(SecureCounters {
            zero_counters: counters.clone(),
            counters: Some(counters),
            modulus: modulus.clone(),
            shares: None,
            noise_pending: require_noise,
            noise_generated: false,
        })
    }

    /// Whether a bin key is the single-bin placeholder.
    pub fn is_single_bin_value(value: f64) -> bool {
        if SINGLE_BIN.is_nan() {
            value.is_nan()
        } else {
            value == SINGLE_BIN
        }
    }

    /// Is `value` inside `[lo, hi)`? `hi = +inf` also admits +inf.
    pub fn is_in_bin(lo: f64, hi: f64, value: f64) -> bool {
        value >= lo && (value < hi || hi == f64::INFINITY)
    }

    /// Check that `other` has every counter of ours with the same bin count.
    /// Sigma is disregarded: it is only meaningful at the data collectors.
    fn check_counter(&self, other: &Counts) -> bool {
        let Some(counters) = &self.counters else {
            return false;
        };
        for (name, counter) in counters {
            let Some(other_counter) = other.get(name) else {
                return false;
            };
            if counter.bins.is_empty() || counter.bins.len() != other_counter.bins.len() {
                return false;
            }
        }
        true
    }

    /// Add `counter` into our cells, bin by bin, mod Q.
    fn tally_counter(&mut self, counter: &Counts) -> bool {
        if !self.check_counter(counter) {
            return false;
        }
        let modulus = self.modulus.clone();
        let Some(counters) = &mut self.counters else {
            return false;
        };
        for (name, own) in counters.iter_mut() {
            let other = &counter[name];
            for (own_bin, other_bin) in own.bins.iter_mut().zip(&other.bins) {
                let sum = &own_bin.count + &other_bin.count;
                own_bin.count = BigInt::from(reduce_mod(&sum, &modulus));
            }
        }
        true
    }

    /// Generate (or re-derive) a full blinding-factor structure and apply it.
    ///
    /// With `factors = None`, samples fresh uniform factors; otherwise
    /// re-derives from the given factors. `positive` selects blinding vs
    /// unblinding. Returns the applied structure, or `None` on mismatch.
    fn derive_all_counters(&mut self, factors: Option<&Counts>, positive: bool) -> Option<Counts> {
        let generate = factors.is_none();
        let mut blinding = match factors {
            Some(f) => f.clone(),
            None => self.zero_counters.clone(),
        };
        if !self.check_counter(&blinding) {
            return None;
        }
        for counter in blinding.values_mut() {
            for bin in &mut counter.bins {
                let factor = if generate {
                    derive_blinding_factor(None, &self.modulus, positive)
                } else {
                    // counts arriving over the network must already be
                    // canonical ring elements
                    let value = bin.count.to_biguint()?;
                    if value >= self.modulus {
                        return None;
                    }
                    derive_blinding_factor(Some(&value), &self.modulus, positive)
                };
                bin.count = BigInt::from(factor);
            }
        }
        if !self.tally_counter(&blinding) {
            return None;
        }
        Some(blinding)
    }

    /// Generate and apply one fresh blinding structure per share keeper uid,
    /// keeping each in the outgoing share table.
    pub fn generate_blinding_shares(&mut self, sk_uids: &[String]) {
        let mut shares = BTreeMap::new();
        for uid in sk_uids {
            let factors = self
                .derive_all_counters(None, true)
                .unwrap_or_else(|| unreachable!("self-generated factors always match"));
            shares.insert(
                uid.clone(),
                BlindingShare {
                    sk_uid: uid.clone(),
                    dc_name: None,
                    secret: factors,
                },
            );
        }
        self.shares = Some(shares);
    }

    /// Sample one rounded Gaussian per bin and add it mod Q.
    ///
    /// Must be called exactly once per round, after share generation and
    /// before any event increments; a second call is rejected.
    pub fn generate_noise(&mut self, noise_weight: f64) -> Result<()> {
        if self.noise_generated {
            return Err(Error::Counter(
                "noise has already been generated for this round".into(),
            ));
        }
        let mut noise_values = self.zero_counters.clone();
        for counter in noise_values.values_mut() {
            let sigma = counter.sigma.unwrap_or(0.0);
            for bin in &mut counter.bins {
                let sampled = noise(sigma, 1.0, noise_weight);
                // exact halfway values round towards even integers
                bin.count = round_noise(sampled);
            }
        }
        self.tally_counter(&noise_values);
        self.noise_generated = true;
        self.noise_pending = false;
        Ok(())
    }

    /// Return the per-SK share table and sever our reference to it.
    ///
    /// The caller asymmetric-encrypts each entry to its share keeper.
    pub fn detach_blinding_shares(&mut self) -> Option<BTreeMap<String, BlindingShare>> {
        self.shares.take()
    }

    /// Apply the additive inverse of a decrypted blinding share.
    ///
    /// Share keepers only. Returns false if the share's counter set or
    /// shapes do not match; the caller must abort the round.
    pub fn import_blinding_share(&mut self, share: &BlindingShare) -> bool {
        self.derive_all_counters(Some(&share.secret), false).is_some()
    }

    /// Increment the bin of `counter_name` containing `bin_key` by `inc`.
    ///
    /// Single-bin counters require the [`SINGLE_BIN`] sentinel key;
    /// multi-bin counters require a real key. Unknown counter names are
    /// silently ignored, so a rolling counter-set upgrade cannot crash a
    /// long-lived collector. After `detach_counts` this is a no-op.
    pub fn increment(&mut self, counter_name: &str, bin_key: f64, inc: i64) {
        let modulus = self.modulus.clone();
        let Some(counters) = &mut self.counters else {
            return;
        };
        let Some(counter) = counters.get_mut(counter_name) else {
            return;
        };
        let key = if counter.bins.len() == 1 {
            if !Self::is_single_bin_value(bin_key) {
                return;
            }
            counter.bins[0].lo
        } else {
            if Self::is_single_bin_value(bin_key) {
                return;
            }
            bin_key
        };
        for bin in &mut counter.bins {
            if Self::is_in_bin(bin.lo, bin.hi, key) {
                let sum = &bin.count + BigInt::from(inc);
                bin.count = BigInt::from(reduce_mod(&sum, &modulus));
            }
        }
    }

    /// Sum every snapshot into our cells mod Q, then map each cell from
    /// unsigned `[0, Q)` to signed `[-Q/2, Q/2)`.
    ///
    /// Tally server only. Returns false on any shape mismatch.
    pub fn tally_counters(&mut self, counters: &[Counts]) -> bool {
        for counter in counters {
            if !self.tally_counter(counter) {
                return false;
            }
        }
        let modulus = self.modulus.clone();
        if let Some(own) = &mut self.counters {
            for counter in own.values_mut() {
                for bin in &mut counter.bins {
                    let unsigned = bin
                        .count
                        .to_biguint()
                        .unwrap_or_else(|| unreachable!("blinded cells are in [0, Q)"));
                    bin.count = adjust_count_signed(&unsigned, &modulus);
                }
            }
        }
        true
    }

    /// Return the counters and clear them; later increments are no-ops.
    ///
    /// Fails if noise was required but never generated.
    pub fn detach_counts(&mut self) -> Result<Counts> {
        if self.noise_pending {
            return Err(Error::Counter(
                "refusing to detach counts before noise was generated".into(),
            ));
        }
        self.counters
            .take()
            .ok_or_else(|| Error::Counter("counts were already detached".into()))
    }
}

/// The hard-coded counter limits, echoed into configuration contexts so
/// outcome files record the ring every party used.
pub fn counter_limits() -> serde_json::Value {
    use crate::sampling::{
        counter_modulus, max_blinded_counter_value, min_blinded_counter_value,
        min_tally_counter_value,
    };
    let mut map = serde_json::Map::new();
    let big = |v: String| {
        serde_json::from_str::<serde_json::Number>(&v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    };
    map.insert("counter_modulus".into(), big(counter_modulus().to_string()));
    map.insert(
        "min_blinded_counter_value".into(),
        big(min_blinded_counter_value().to_string()),
    );
    map.insert(
        "max_blinded_counter_value".into(),
        big(max_blinded_counter_value().to_string()),
    );
    map.insert(
        "min_tally_counter_value".into(),
        big(min_tally_counter_value().to_string()),
    );
    map.insert(
        "max_tally_counter_value".into(),
        big(max_tally_counter_value().to_string()),
    );
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::counter_modulus;
    use num_traits::One;

    fn test_config() -> CountersConfig {
        let mut config = CountersConfig::new();
        config.insert(
            "ExitStreamByteCount".into(),
            CounterSpec {
                bins: Some(vec![
                    Bin::new(0.0, 512.0),
                    Bin::new(512.0, 1024.0),
                    Bin::new(1024.0, f64::INFINITY),
                ]),
                sigma: Some(0.0),
            },
        );
        config.insert(
            "ZeroCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                sigma: Some(0.0),
            },
        );
        config
    }

    fn counts_of(sc: &mut SecureCounters) -> Counts {
        sc.detach_counts().expect("counts available")
    }

    #[test]
    fn increment_lands_in_the_right_bins() {
        let mut sc = SecureCounters::new(&test_config(), counter_modulus(), false)
            .expect("valid config");
        for _ in 0..500 {
            sc.increment("ExitStreamByteCount", 0.0, 1);
        }
        for _ in 0..250 {
            sc.increment("ExitStreamByteCount", 600.0, 1);
        }
        for _ in 0..250 {
            sc.increment("ExitStreamByteCount", 2047.0, 1);
        }
        let counts = counts_of(&mut sc);
        let bins = &counts["ExitStreamByteCount"].bins;
        assert_eq!(bins[0].count, BigInt::from(500));
        assert_eq!(bins[1].count, BigInt::from(250));
        assert_eq!(bins[2].count, BigInt::from(250));
        assert_eq!(counts["ZeroCount"].bins[0].count, BigInt::zero());
    }

    #[test]
    fn negative_increment_cancels() {
        let mut sc = SecureCounters::new(&test_config(), counter_modulus(), false)
            .expect("valid config");
        sc.increment("ExitStreamByteCount", 0.0, 1);
        sc.increment("ExitStreamByteCount", 0.0, -1);
        sc.increment("ZeroCount", SINGLE_BIN, 3);
        let counts = counts_of(&mut sc);
        assert_eq!(counts["ExitStreamByteCount"].bins[0].count, BigInt::zero());
        assert_eq!(counts["ZeroCount"].bins[0].count, BigInt::from(3));
    }

    #[test]
    fn single_bin_requires_sentinel() {
        let mut sc = SecureCounters::new(&test_config(), counter_modulus(), false)
            .expect("valid config");
        // non-sentinel key on a single-bin counter is ignored
        sc.increment("ZeroCount", 5.0, 1);
        // sentinel key on a multi-bin counter is ignored
        sc.increment("ExitStreamByteCount", SINGLE_BIN, 1);
        let counts = counts_of(&mut sc);
        assert_eq!(counts["ZeroCount"].bins[0].count, BigInt::zero());
        assert!(counts["ExitStreamByteCount"]
            .bins
            .iter()
            .all(|b| b.count.is_zero()));
    }

    #[test]
    fn unknown_counter_is_ignored() {
        let mut sc = SecureCounters::new(&test_config(), counter_modulus(), false)
            .expect("valid config");
        sc.increment("NoSuchCounter", 1.0, 1);
        let counts = counts_of(&mut sc);
        assert!(counts["ZeroCount"].bins[0].count.is_zero());
    }

    #[test]
    fn increment_after_detach_is_noop() {
        let mut sc = SecureCounters::new(&test_config(), counter_modulus(), false)
            .expect("valid config");
        let _ = counts_of(&mut sc);
        sc.increment("ZeroCount", SINGLE_BIN, 1);
        assert!(sc.detach_counts().is_err());
    }

    #[test]
    fn noise_twice_is_rejected() {
        let mut sc =
            SecureCounters::new(&test_config(), counter_modulus(), true).expect("valid config");
        sc.generate_noise(1.0).expect("first noise");
        assert!(sc.generate_noise(1.0).is_err());
    }

    #[test]
    fn detach_before_noise_is_rejected() {
        let mut sc =
            SecureCounters::new(&test_config(), counter_modulus(), true).expect("valid config");
        assert!(sc.detach_counts().is_err());
        sc.generate_noise(1.0).expect("noise");
        assert!(sc.detach_counts().is_ok());
    }

    #[test]
    fn near_modulus_total_does_not_overflow() {
        // 2^69 - 1 increments into one bin, applied as one big increment
        // batch plus a remainder: the tally must neither wrap nor go signed.
        let modulus = counter_modulus();
        let mut config = CountersConfig::new();
        config.insert(
            "ZeroCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                sigma: Some(0.0),
            },
        );
        let mut dc = SecureCounters::new(&config, modulus, false).expect("valid config");
        let mut sk1 = SecureCounters::new(&config, modulus, false).expect("valid config");
        let mut sk2 = SecureCounters::new(&config, modulus, false).expect("valid config");

        dc.generate_blinding_shares(&["sk1".into(), "sk2".into()]);
        let shares = dc.detach_blinding_shares().expect("shares present");
        assert!(sk1.import_blinding_share(&shares["sk1"]));
        assert!(sk2.import_blinding_share(&shares["sk2"]));

        let target: BigUint = (BigUint::one() << 69) - BigUint::one();
        let step = i64::MAX;
        let mut remaining = target.clone();
        let step_big = BigUint::from(step as u64);
        while remaining >= step_big {
            dc.increment("ZeroCount", SINGLE_BIN, step);
            remaining -= &step_big;
        }
        let rest = i64::try_from(remaining).expect("remainder fits i64");
        dc.increment("ZeroCount", SINGLE_BIN, rest);

        let mut tally = SecureCounters::new(&config, modulus, false).expect("valid config");
        let all = vec![
            counts_of(&mut dc),
            counts_of(&mut sk1),
            counts_of(&mut sk2),
        ];
        assert!(tally.tally_counters(&all));
        let result = counts_of(&mut tally);
        assert_eq!(result["ZeroCount"].bins[0].count, BigInt::from(target));
    }

    #[test]
    fn import_rejects_mismatched_shapes() {
        let modulus = counter_modulus();
        let mut dc =
            SecureCounters::new(&test_config(), modulus, false).expect("valid config");
        dc.generate_blinding_shares(&["sk1".into()]);
        let shares = dc.detach_blinding_shares().expect("shares present");

        let mut other_config = CountersConfig::new();
        other_config.insert(
            "ZeroCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, 10.0), Bin::new(10.0, f64::INFINITY)]),
                sigma: Some(0.0),
            },
        );
        let mut sk = SecureCounters::new(&other_config, modulus, false).expect("valid config");
        assert!(!sk.import_blinding_share(&shares["sk1"]));
    }

    #[test]
    fn bins_config_rejects_overlap_and_inversion() {
        let mut bad = CountersConfig::new();
        bad.insert(
            "ZeroCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, 10.0), Bin::new(5.0, 20.0)]),
                sigma: None,
            },
        );
        assert!(!check_bins_config(&bad, true));

        let mut inverted = CountersConfig::new();
        inverted.insert(
            "ZeroCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(10.0, 0.0)]),
                sigma: None,
            },
        );
        assert!(!check_bins_config(&inverted, true));

        let mut ok = CountersConfig::new();
        ok.insert(
            "ZeroCount".into(),
            CounterSpec {
                bins: Some(vec![
                    Bin::new(f64::NEG_INFINITY, -10.0),
                    Bin::new(0.0, 512.0),
                    Bin::new(512.0, f64::INFINITY),
                ]),
                sigma: None,
            },
        );
        assert!(check_bins_config(&ok, true));
    }

    #[test]
    fn infinite_bins_include_their_bound() {
        assert!(SecureCounters::is_in_bin(0.0, f64::INFINITY, f64::INFINITY));
        assert!(SecureCounters::is_in_bin(
            f64::NEG_INFINITY,
            0.0,
            -1.0e308
        ));
        assert!(!SecureCounters::is_in_bin(f64::NEG_INFINITY, 0.0, 0.0));
    }

    #[test]
    fn modulus_one_has_single_value() {
        let one = BigUint::one();
        let mut config = CountersConfig::new();
        config.insert(
            "ZeroCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                sigma: Some(0.0),
            },
        );
        let mut sc = SecureCounters::new(&config, &one, false).expect("valid config");
        sc.increment("ZeroCount", SINGLE_BIN, 12345);
        let counts = counts_of(&mut sc);
        assert!(counts["ZeroCount"].bins[0].count.is_zero());
    }

    #[test]
    fn combine_counters_drops_one_sided_entries() {
        let mut bins = CountersConfig::new();
        bins.insert(
            "ExitStreamCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                sigma: None,
            },
        );
        bins.insert(
            "EntryConnectionCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                sigma: None,
            },
        );
        let mut sigmas = CountersConfig::new();
        sigmas.insert(
            "ExitStreamCount".into(),
            CounterSpec {
                bins: None,
                sigma: Some(1.5),
            },
        );
        let combined = combine_counters(&bins, &sigmas);
        assert_eq!(combined.len(), 1);
        assert_eq!(combined["ExitStreamCount"].sigma, Some(1.5));
        assert!(combined["ExitStreamCount"].bins.is_some());
        assert!(!check_combined_counters(&bins, &sigmas));
    }

    #[test]
    fn tally_bin_json_round_trip() {
        let bin = TallyBin {
            lo: 0.0,
            hi: f64::INFINITY,
            count: BigInt::from(counter_modulus() / 2u32),
        };
        let json = serde_json::to_string(&bin).expect("serialize");
        assert!(json.contains("590295810358705651712"));
        let back: TallyBin = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, bin);
    }

    #[test]
    fn noise_weight_config_checks() {
        let mut config = NoiseWeightConfig::new();
        config.insert("A".repeat(40), 1.0);
        assert!(!check_noise_weight_config(&config, 2));
        config.insert(NOISE_WEIGHT_DEFAULT_KEY.into(), 2.0);
        assert!(check_noise_weight_config(&config, 2));
        assert_eq!(get_noise_weight(&config, Some(&"A".repeat(40))), Some(1.0));
        assert_eq!(get_noise_weight(&config, Some("unknown")), Some(2.0));
        config.insert("B".repeat(40), -1.0);
        assert!(!check_noise_weight_config(&config, 2));
    }
}
