//! Inter-round delay enforcement tied to noise-allocation changes.
//!
//! Two consecutive rounds may start without delay iff their noise
//! allocations are equivalent: identical counter sets and no sigma decreased
//! by more than the configured tolerance. Otherwise at least `delay_period`
//! must elapse between the previous round's stop and the next round's start.
//!
//! The share keepers must enforce these checks for the protocol to be
//! secure; the tally server does them for convenience and the data
//! collectors for defence in depth.

use std::collections::BTreeMap;

use crate::noise::NoiseSpec;

/// Default tolerance for acceptable sigma decreases between rounds.
pub const DEFAULT_SIGMA_DECREASE_TOLERANCE: f64 = crate::noise::DEFAULT_SIGMA_TOLERANCE;

/// Tracks the noise allocation and end time of recent successful rounds.
///
/// Only successful rounds update the state: a failed round neither advances
/// the clock nor re-anchors the allocation.
#[derive(Debug, Default, Clone)]
pub struct CollectionDelay {
    /// The earliest noise allocation in a series of equivalent allocations.
    starting_noise_allocation: Option<NoiseSpec>,
    /// The end time of the last successful round, epoch seconds.
    last_round_end_time: Option<f64>,
}

impl CollectionDelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Would moving from `previous_sigma` to `proposed_sigma` on the same
    /// counter need a delay? Equal (within tolerance) or increased sigmas do
    /// not; a decrease beyond tolerance does.
    pub fn sigma_change_needs_delay(
        previous_sigma: f64,
        proposed_sigma: f64,
        tolerance: f64,
        logging_label: Option<&str>,
    ) -> bool {
        if proposed_sigma >= previous_sigma {
            return false;
        }
        if previous_sigma - proposed_sigma <= tolerance {
            return false;
        }
        if let Some(label) = logging_label {
            tracing::warn!(
                "delaying round: proposed sigma {:.2e} is less than previous sigma {:.2e}, and not within tolerance {:.2e}, in counter {}",
                proposed_sigma,
                previous_sigma,
                tolerance,
                label
            );
        }
        true
    }

    /// Would moving between two allocations need a delay? Allocations are
    /// equivalent when they cover the same counters and no sigma needs a
    /// delay. The first round never needs one.
    pub fn noise_change_needs_delay(
        previous_allocation: Option<&NoiseSpec>,
        proposed_allocation: &NoiseSpec,
        tolerance: f64,
    ) -> bool {
        let Some(previous) = previous_allocation else {
            return false;
        };
        let previous_sigmas: BTreeMap<String, f64> = previous.sigmas();
        let proposed_sigmas: BTreeMap<String, f64> = proposed_allocation.sigmas();

        let common: Vec<&String> = previous_sigmas
            .keys()
            .filter(|k| proposed_sigmas.contains_key(*k))
            .collect();
        if common.len() != previous_sigmas.len() || common.len() != proposed_sigmas.len() {
            for key in previous_sigmas.keys() {
                if !proposed_sigmas.contains_key(key) {
                    tracing::warn!("counter '{}' has a previous sigma but no proposed sigma", key);
                }
            }
            for key in proposed_sigmas.keys() {
                if !previous_sigmas.contains_key(key) {
                    tracing::warn!("counter '{}' has a proposed sigma but no previous sigma", key);
                }
            }
            return true;
        }

        for key in common {
            if Self::sigma_change_needs_delay(
                previous_sigmas[key],
                proposed_sigmas[key],
                tolerance,
                Some(key),
            ) {
                return true;
            }
        }
        false
    }

    /// The earliest time a round with `noise_allocation` could start, given
    /// the configured `delay_period` (seconds). With `always_delay`, the
    /// delay applies unconditionally (intended for testing).
    pub fn get_next_round_start_time(
        &self,
        noise_allocation: &NoiseSpec,
        delay_period: f64,
        always_delay: bool,
        tolerance: f64,
    ) -> f64 {
        debug_assert!(delay_period >= 0.0);
        let noise_change_delay = Self::noise_change_needs_delay(
            self.starting_noise_allocation.as_ref(),
            noise_allocation,
            tolerance,
        );
        let needs_delay = always_delay || noise_change_delay;

        match self.last_round_end_time {
            // no previous successful round: any time is fine
            None => 0.0,
            Some(end) if needs_delay => end + delay_period,
            Some(end) => end,
        }
    }

    /// Check whether a round with `noise_allocation` may start at
    /// `start_time`. Logs the wait when it may not.
    pub fn round_start_permitted(
        &self,
        noise_allocation: &NoiseSpec,
        start_time: f64,
        delay_period: f64,
        always_delay: bool,
        tolerance: f64,
    ) -> bool {
        let next_start_time = self.get_next_round_start_time(
            noise_allocation,
            delay_period,
            always_delay,
            tolerance,
        );
        if start_time >= next_start_time {
            return true;
        }
        let reason = if always_delay {
            "we are configured to always delay"
        } else {
            "noise allocation changed"
        };
        tracing::info!(
            "delaying round for {:.0} more seconds because {}",
            next_start_time - start_time,
            reason
        );
        false
    }

    /// Record the end of a round.
    ///
    /// Successful rounds update the last end time and, when the allocation
    /// is no longer equivalent to the anchored one, re-anchor it. Keeping
    /// the *starting* allocation of an equivalence chain stops a tally
    /// server from ratcheting the noise down a tolerance at a time.
    pub fn set_stop_result(
        &mut self,
        round_successful: bool,
        noise_allocation: &NoiseSpec,
        start_time: f64,
        end_time: f64,
        delay_period: f64,
        always_delay: bool,
        tolerance: f64,
    ) {
        debug_assert!(start_time < end_time);
        // a round that started before its enforced delay elapsed indicates a
        // reconfigured delay, a node with a faster clock, or a repeated stop
        if !self.round_start_permitted(
            noise_allocation,
            start_time,
            delay_period,
            always_delay,
            tolerance,
        ) {
            let expected_start = self.get_next_round_start_time(
                noise_allocation,
                delay_period,
                always_delay,
                tolerance,
            );
            let status = if round_successful {
                "successfully"
            } else {
                "failed and"
            };
            tracing::warn!(
                "round that just {} stopped was started {:.0}s before enforced delay elapsed (started {:.0}, expected start {:.0})",
                status,
                expected_start - start_time,
                start_time,
                expected_start
            );
        }
        if !round_successful {
            return;
        }
        self.last_round_end_time = Some(end_time);
        if self.starting_noise_allocation.is_none() || always_delay {
            // first allocation this run, or one we explicitly delayed for
            self.starting_noise_allocation = Some(noise_allocation.clone());
        } else if !Self::noise_change_needs_delay(
            self.starting_noise_allocation.as_ref(),
            noise_allocation,
            tolerance,
        ) {
            // still equivalent to the anchor: keep the anchor
        } else {
            // different enough that the enforced delay must have elapsed
            self.starting_noise_allocation = Some(noise_allocation.clone());
        }
    }
}
