//! Modular sampling and signed recovery for the secure counter ring.
//!
//! All counter arithmetic happens mod Q with Q = 2^70, so counts never fit a
//! machine integer and every value here is a [`BigUint`] / [`BigInt`].
//! Blinding factors and noise must come from the platform CSPRNG: an
//! adversary who can predict the RNG state can strip both the blinding and
//! the noise.

use num_bigint::{BigInt, BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{FromPrimitive, One, Zero};
use rand::rngs::OsRng;
use rand_distr::{Distribution, Normal};
use std::sync::OnceLock;

/// Number of bits in the counter modulus: Q = 2^70.
///
/// Q must exceed the sum of every possible tally plus noise plus per-DC
/// blinding magnitude, and must be large enough that collisions between
/// uniformly random blinding factors across a round are astronomically
/// unlikely.
pub const COUNTER_MODULUS_BITS: u64 = 70;

/// The fixed process-wide counter modulus, Q = 2^70.
pub fn counter_modulus() -> &'static BigUint {
    static MODULUS: OnceLock<BigUint> = OnceLock::new();
    MODULUS.get_or_init(|| BigUint::one() << COUNTER_MODULUS_BITS)
}

/// The smallest blinded counter value: 0.
pub fn min_blinded_counter_value() -> BigUint {
    BigUint::zero()
}

/// The largest blinded counter value: Q - 1.
pub fn max_blinded_counter_value() -> BigUint {
    counter_modulus() - BigUint::one()
}

/// The smallest tally counter value after signed recovery: -(Q/2).
pub fn min_tally_counter_value() -> BigInt {
    adjust_count_signed(&(counter_modulus() / 2u32), counter_modulus())
}

/// The largest tally counter value after signed recovery.
pub fn max_tally_counter_value() -> BigInt {
    BigInt::from((counter_modulus() + BigUint::one()) / 2u32) - BigInt::one()
}

/// Sample a uniformly distributed value in `[0, modulus)` from the OS CSPRNG.
///
/// Uses rejection sampling over the minimal power-of-two bit length to avoid
/// modulo bias. The worst-case rejection rate is 1 in 2, when the modulus is
/// `2^n + 1`.
///
/// # Panics
///
/// Panics if `modulus` is zero.
pub fn sample(modulus: &BigUint) -> BigUint {
    assert!(!modulus.is_zero(), "cannot sample modulo zero");
    // to get values up to modulus-1, we need this many bits
    let mut bit_count = (modulus - BigUint::one()).bits();
    // the modulus-is-1 case still samples one bit
    if bit_count == 0 {
        bit_count = 1;
    }
    debug_assert!(modulus <= &(BigUint::one() << bit_count));
    debug_assert!(modulus >= &(BigUint::one() << (bit_count - 1)));
    let mut rng = OsRng;
    loop {
        let v = rng.gen_biguint(bit_count);
        if &v < modulus {
            return v;
        }
    }
}

/// Like `sample`, but returns a value in the inclusive range `[a, b]`.
pub fn sample_randint(a: &BigUint, b: &BigUint) -> BigUint {
    debug_assert!(a <= b);
    a + sample(&(b - a + BigUint::one()))
}

/// Derive a blinding factor less than `modulus`.
///
/// If `secret` is `None`, sample a fresh uniform factor. When `positive` is
/// true, returns the blinding factor; when false, returns the unblinding
/// factor (the additive inverse mod `modulus`). Typically called as:
///
/// ```text
/// blinding   = derive_blinding_factor(None,            Q, true)
/// unblinding = derive_blinding_factor(Some(&blinding), Q, false)
/// ```
pub fn derive_blinding_factor(
    secret: Option<&BigUint>,
    modulus: &BigUint,
    positive: bool,
) -> BigUint {
    let v = match secret {
        Some(s) => s.clone(),
        None => sample(modulus),
    };
    debug_assert!(&v < modulus);
    if positive || v.is_zero() {
        v
    } else {
        modulus - v
    }
}

/// Map an unsigned count in `[0, modulus)` to a signed count.
///
/// For odd moduli the result is in `{ -modulus/2, ..., 0, ..., modulus/2 }`;
/// for even moduli it is in `{ -modulus/2, ..., 0, ..., modulus/2 - 1 }`,
/// matching two's complement when the modulus is a power of two. This is the
/// inverse of reduction mod `modulus` whenever the original value was within
/// that range, and is required at tally time because noise may be negative.
pub fn adjust_count_signed(count: &BigUint, modulus: &BigUint) -> BigInt {
    debug_assert!(count < modulus);
    let threshold = (modulus + BigUint::one()) / 2u32;
    if count >= &threshold {
        BigInt::from(count.clone()) - BigInt::from(modulus.clone())
    } else {
        BigInt::from(count.clone())
    }
}

/// Reduce a signed value into `[0, modulus)`.
///
/// Used when applying (possibly negative) increments and noise to blinded
/// cells; `mod_floor` keeps the representative non-negative.
pub fn reduce_mod(value: &BigInt, modulus: &BigUint) -> BigUint {
    let m = BigInt::from(modulus.clone());
    let reduced = value.mod_floor(&m);
    reduced
        .to_biguint()
        .unwrap_or_else(|| unreachable!("mod_floor of a positive modulus is non-negative"))
}

/// Sample Gaussian noise for one counter bin.
///
/// The distribution is `N(0, sigma_i)` with
/// `sigma_i = p_exit * sigma / sqrt(sum_of_sq)`: the configured sigma scaled
/// by this relay's noise weight (its exit probability over the summed squared
/// weights of the collecting relays). Returns a floating point sample;
/// callers round it to an integer before it enters the counter space.
pub fn noise(sigma: f64, sum_of_sq: f64, p_exit: f64) -> f64 {
    let sigma_i = p_exit * sigma / sum_of_sq.sqrt();
    if sigma_i <= 0.0 {
        return 0.0;
    }
    // OsRng, never a seedable PRNG: knowing the RNG state would let an
    // adversary subtract the noise from the published tally.
    match Normal::new(0.0, sigma_i) {
        Ok(dist) => dist.sample(&mut OsRng),
        Err(_) => 0.0,
    }
}

/// Round a noise sample to the nearest integer, ties to even, as a `BigInt`.
///
/// Values over 2^53 are not integer-accurate, but that inaccuracy only
/// perturbs the noise, never the counts.
pub fn round_noise(sample: f64) -> BigInt {
    BigInt::from_f64(sample.round_ties_even()).unwrap_or_else(BigInt::zero)
}
