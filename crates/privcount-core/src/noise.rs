//! Differentially private noise allocation.
//!
//! Converts a global privacy budget (ε, δ) plus per-counter
//! (sensitivity, expected value) pairs into per-counter Gaussian sigmas such
//! that the composed release satisfies (ε, δ)-DP and the relative noise
//! ratio `sigma / expected_value` is equal across counters, minimizing the
//! worst-case relative error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::counter::float_accuracy;
use crate::error::{Error, Result};

/// Default absolute tolerance for the sigma binary search.
pub const DEFAULT_SIGMA_TOLERANCE: f64 = 1e-6;
/// Default absolute tolerance for the epsilon binary search.
pub const DEFAULT_EPSILON_TOLERANCE: f64 = 1e-15;
/// Default absolute tolerance for the sigma-ratio binary search.
pub const DEFAULT_SIGMA_RATIO_TOLERANCE: f64 = 1e-6;

/// The standard sanity-check counter: a single `[-inf, inf]` bin with zero
/// noise. It only ever accumulates blinding values, so it must tally to zero.
pub const DUMMY_COUNTER_NAME: &str = "ZeroCount";

/// Return true if `(epsilon, delta)`-differential privacy is satisfied by a
/// zero-mean Gaussian with standard deviation `std` for a counter with the
/// given sensitivity.
pub fn satisfies_dp(sensitivity: f64, epsilon: f64, delta: f64, std: f64) -> bool {
    // lowest value at which epsilon differential-privacy is satisfied
    let lower_x = -(epsilon * std * std / sensitivity) + sensitivity / 2.0;
    let Ok(normal) = Normal::new(0.0, std) else {
        return false;
    };
    normal.cdf(lower_x) <= delta
}

/// Search `(lower_bound, upper_bound)` for the boundary of a monotone
/// predicate: if `x < y` and `fn(x)`, then `fn(y)`.
///
/// With `return_true`, returns the smallest satisfying value within `tol`;
/// otherwise the largest unsatisfying value. The tolerance is absolute and
/// has no default: use the one belonging to the variable being searched.
pub fn interval_boolean_binary_search(
    f: impl Fn(f64) -> bool,
    mut lower_bound: f64,
    mut upper_bound: f64,
    tol: f64,
    return_true: bool,
) -> Result<f64> {
    if upper_bound < lower_bound {
        return Err(Error::Noise(format!(
            "invalid binary-search interval: [{lower_bound}, {upper_bound}]"
        )));
    }
    if f(lower_bound) {
        if return_true {
            return Ok(lower_bound);
        }
        return Err(Error::Noise(
            "cannot return x false: fn(lower_bound) is true".into(),
        ));
    }
    if !f(upper_bound) {
        if return_true {
            return Err(Error::Noise(
                "cannot return x true: fn(upper_bound) is false".into(),
            ));
        }
        return Ok(upper_bound);
    }
    loop {
        if upper_bound - lower_bound < tol {
            return Ok(if return_true { upper_bound } else { lower_bound });
        }
        let midpoint = (upper_bound + lower_bound) / 2.0;
        if f(midpoint) {
            upper_bound = midpoint;
        } else {
            lower_bound = midpoint;
        }
    }
}

/// Smallest standard deviation such that the probability of violating
/// epsilon-differential privacy is at most delta.
pub fn get_differentially_private_std(
    sensitivity: f64,
    epsilon: f64,
    delta: f64,
    tol: f64,
) -> Result<f64> {
    // Upper bound from an improved version of Hardt and Roth, "Beating
    // Randomized Response on Incoherent Matrices", Thm 2.6 / App. A.
    let std_upper_bound =
        (sensitivity / epsilon) * (4.0 / 3.0) * (2.0 * (1.0 / delta).ln()).sqrt();
    let std_lower_bound = tol;
    if satisfies_dp(sensitivity, epsilon, delta, std_lower_bound) {
        return Err(Error::Noise(
            "could not find lower bound for std interval".into(),
        ));
    }
    interval_boolean_binary_search(
        |x| satisfies_dp(sensitivity, epsilon, delta, x),
        std_lower_bound,
        std_upper_bound,
        tol,
        true,
    )
}

/// Per-counter privacy parameters: sensitivity and expected value.
pub type StatsParameters = BTreeMap<String, (f64, f64)>;

/// Allocate epsilon to equalize noise ratios (delta shared equally), then
/// find the optimal sigma for each counter's allocation.
pub fn get_approximate_privacy_allocation(
    epsilon: f64,
    delta: f64,
    stats_parameters: &StatsParameters,
    sigma_tol: f64,
) -> Result<(BTreeMap<String, f64>, BTreeMap<String, f64>)> {
    if stats_parameters.is_empty() {
        return Err(Error::Noise("no counters to allocate noise for".into()));
    }
    let mut epsilons = BTreeMap::new();
    let (init_param, (init_s, init_v)) = stats_parameters
        .iter()
        .next()
        .unwrap_or_else(|| unreachable!("checked non-empty"));
    let init_constant = init_s / init_v;
    let mut coefficient_sum = 1.0;
    for (param, (s, v)) in stats_parameters {
        if param != init_param {
            coefficient_sum += s / v / init_constant;
        }
    }
    let init_epsilon = epsilon / coefficient_sum;
    epsilons.insert(init_param.clone(), init_epsilon);
    for (param, (s, v)) in stats_parameters {
        if param != init_param {
            epsilons.insert(param.clone(), init_epsilon * s / v / init_constant);
        }
    }
    let mut sigmas = BTreeMap::new();
    let stat_delta = delta / stats_parameters.len() as f64;
    for (param, (s, _)) in stats_parameters {
        let sigma = get_differentially_private_std(*s, epsilons[param], stat_delta, sigma_tol)?;
        sigmas.insert(param.clone(), sigma);
    }
    Ok((epsilons, sigmas))
}

/// Find the epsilon consumed by a fixed sigma at a fixed delta.
pub fn get_differentially_private_epsilon(
    sensitivity: f64,
    sigma: f64,
    delta: f64,
    tol: f64,
) -> Result<f64> {
    let epsilon_upper_bound = (sensitivity / sigma) * (2.0 * (2.0 / delta).ln()).sqrt();
    interval_boolean_binary_search(
        |x| satisfies_dp(sensitivity, x, delta, sigma),
        0.0,
        epsilon_upper_bound,
        tol,
        true,
    )
}

/// The sigma implied by a sigma ratio and a counter's expected value.
///
/// Inverse of [`get_expected_noise_ratio`].
pub fn get_sigma(excess_noise_ratio: f64, sigma_ratio: f64, estimated_value: f64) -> f64 {
    if excess_noise_ratio == 0.0 {
        0.0
    } else {
        sigma_ratio * estimated_value / excess_noise_ratio.sqrt()
    }
}

/// The noise ratio implied by a sigma and a counter's expected value.
///
/// Inverse of [`get_sigma`].
pub fn get_expected_noise_ratio(excess_noise_ratio: f64, sigma: f64, estimated_value: f64) -> f64 {
    if estimated_value == 0.0 {
        0.0
    } else {
        excess_noise_ratio.sqrt() * sigma / estimated_value
    }
}

/// Given a sigma ratio, determine the per-counter epsilons consumed.
pub fn get_epsilon_consumed(
    stats_parameters: &StatsParameters,
    excess_noise_ratio: f64,
    sigma_ratio: f64,
    delta: f64,
    tol: f64,
) -> Result<BTreeMap<String, f64>> {
    let stat_delta = delta / stats_parameters.len() as f64;
    let mut epsilons = BTreeMap::new();
    for (param, (sensitivity, value)) in stats_parameters {
        let sigma = get_sigma(excess_noise_ratio, sigma_ratio, *value);
        let epsilon = get_differentially_private_epsilon(*sensitivity, sigma, stat_delta, tol)?;
        epsilons.insert(param.clone(), epsilon);
    }
    Ok(epsilons)
}

/// Search for the sigma ratio (and resulting epsilon allocation) that just
/// consumes the epsilon budget.
///
/// The excess noise ratio (typically the number of collecting machines)
/// expands the noise so the release stays private even when that many DCs
/// collude and subtract their own noise.
pub fn get_opt_privacy_allocation(
    epsilon: f64,
    delta: f64,
    stats_parameters: &StatsParameters,
    excess_noise_ratio: f64,
    sigma_tol: f64,
    epsilon_tol: f64,
    sigma_ratio_tol: f64,
) -> Result<(BTreeMap<String, f64>, BTreeMap<String, f64>, f64)> {
    // approximate allocation bounds the sigma-ratio search interval
    let (_, approx_sigmas) =
        get_approximate_privacy_allocation(epsilon, delta, stats_parameters, sigma_tol)?;
    let mut min_sigma_ratio = f64::INFINITY;
    let mut max_sigma_ratio = f64::NEG_INFINITY;
    for (param, (_, value)) in stats_parameters {
        let ratio = get_expected_noise_ratio(excess_noise_ratio, approx_sigmas[param], *value);
        min_sigma_ratio = min_sigma_ratio.min(ratio);
        max_sigma_ratio = max_sigma_ratio.max(ratio);
    }
    let opt_sigma_ratio = interval_boolean_binary_search(
        |x| {
            get_epsilon_consumed(stats_parameters, excess_noise_ratio, x, delta, epsilon_tol)
                .map(|eps| eps.values().sum::<f64>() <= epsilon)
                .unwrap_or(false)
        },
        min_sigma_ratio,
        max_sigma_ratio,
        sigma_ratio_tol,
        true,
    )?;
    let opt_epsilons = get_epsilon_consumed(
        stats_parameters,
        excess_noise_ratio,
        opt_sigma_ratio,
        delta,
        epsilon_tol,
    )?;
    let mut opt_sigmas = BTreeMap::new();
    for (param, (_, value)) in stats_parameters {
        opt_sigmas.insert(
            param.clone(),
            get_sigma(excess_noise_ratio, opt_sigma_ratio, *value),
        );
    }
    Ok((opt_epsilons, opt_sigmas, opt_sigma_ratio))
}

// ---------------------------------------------------------------------------
// Configuration-level noise records
// ---------------------------------------------------------------------------

/// The privacy budget section of a noise config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    pub epsilon: f64,
    pub delta: f64,
    /// Typically the number of DC machines: the factor by which noise is
    /// expanded to cover that many colluding collectors.
    pub excess_noise_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigma_tolerance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon_tolerance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigma_ratio_tolerance: Option<f64>,
    /// Filled in by the allocator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigma_ratio: Option<f64>,
}

/// One counter's noise parameters: the privacy inputs and/or the allocated
/// sigma.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NoiseCounter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigma: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
}

/// A noise configuration: an optional privacy budget plus per-counter noise
/// parameters. With a budget, sigmas are computed; without one, the sigmas
/// must be supplied directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy: Option<PrivacyBudget>,
    pub counters: BTreeMap<String, NoiseCounter>,
}

impl NoiseSpec {
    /// The per-counter sigmas, skipping (and warning about) counters that
    /// do not have one.
    pub fn sigmas(&self) -> BTreeMap<String, f64> {
        let mut sigmas = BTreeMap::new();
        for (name, counter) in &self.counters {
            match counter.sigma {
                Some(sigma) => {
                    sigmas.insert(name.clone(), sigma);
                }
                None => {
                    tracing::warn!("skipping counter '{}': it has no sigma value", name);
                }
            }
        }
        sigmas
    }

    /// Convert into a counters config carrying only sigmas, for
    /// [`crate::counter::combine_counters`].
    pub fn sigmas_config(&self) -> crate::counter::CountersConfig {
        self.sigmas()
            .into_iter()
            .map(|(name, sigma)| {
                (
                    name,
                    crate::counter::CounterSpec {
                        bins: None,
                        sigma: Some(sigma),
                    },
                )
            })
            .collect()
    }
}

/// Run the optimal allocation over a noise spec with a privacy budget,
/// filling in each counter's sigma and epsilon and the overall sigma ratio.
///
/// Fails for pathological inputs (zero sensitivity or expected value, an
/// impossible budget): the tally server must refuse to start a round.
pub fn get_noise_allocation(spec: &NoiseSpec) -> Result<NoiseSpec> {
    let privacy = spec
        .privacy
        .as_ref()
        .ok_or_else(|| Error::Noise("noise spec has no privacy budget".into()))?;
    let sigma_tol = privacy.sigma_tolerance.unwrap_or(DEFAULT_SIGMA_TOLERANCE);
    let epsilon_tol = privacy
        .epsilon_tolerance
        .unwrap_or(DEFAULT_EPSILON_TOLERANCE);
    let sigma_ratio_tol = privacy
        .sigma_ratio_tolerance
        .unwrap_or(DEFAULT_SIGMA_RATIO_TOLERANCE);
    if sigma_tol < float_accuracy() {
        return Err(Error::Noise(format!(
            "sigma tolerance {sigma_tol} is below float conversion accuracy {}",
            float_accuracy()
        )));
    }

    let mut stats_parameters = StatsParameters::new();
    let mut zero_sigma_counters = Vec::new();
    for (name, counter) in &spec.counters {
        match (counter.sensitivity, counter.estimated_value) {
            // the sanity-check counter carries zeros and gets zero noise
            (Some(s), Some(v)) if s == 0.0 && v == 0.0 => zero_sigma_counters.push(name.clone()),
            (Some(s), Some(v)) if s > 0.0 && v > 0.0 => {
                stats_parameters.insert(name.clone(), (s, v));
            }
            _ => {
                return Err(Error::Noise(format!(
                    "counter {name} needs positive sensitivity and estimated_value \
                     (or zero for both) to allocate noise"
                )));
            }
        }
    }

    let (epsilons, sigmas, sigma_ratio) = get_opt_privacy_allocation(
        privacy.epsilon,
        privacy.delta,
        &stats_parameters,
        privacy.excess_noise_ratio,
        sigma_tol,
        epsilon_tol,
        sigma_ratio_tol,
    )?;

    let mut allocated = spec.clone();
    if let Some(p) = &mut allocated.privacy {
        p.sigma_ratio = Some(sigma_ratio);
    }
    for (name, counter) in &mut allocated.counters {
        if zero_sigma_counters.contains(name) {
            counter.sigma = Some(0.0);
            counter.epsilon = Some(0.0);
        } else {
            counter.sigma = sigmas.get(name).copied();
            counter.epsilon = epsilons.get(name).copied();
        }
    }
    Ok(allocated)
}
