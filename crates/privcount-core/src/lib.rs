//! # PrivCount Core
//!
//! The cryptographic and coordination core of PrivCount: a distributed
//! measurement system in which mutually distrusting Data Collectors (DCs)
//! aggregate event counts without any single party learning an individual
//! contributor's raw values.
//!
//! Counters are histograms over mod-Q cells (Q = 2^70). Each DC seeds its
//! counters with the sum of fresh random blinding shares, one per Share
//! Keeper (SK); each SK imports the additive inverse of its share. Summing
//! every party's detached counters mod Q cancels the blinding and recovers
//! the true totals plus differentially private Gaussian noise.
//!
//! ## Crate layout
//!
//! - [`sampling`] - CSPRNG sampling mod Q, blinding factors, signed recovery
//! - [`counter`] - counter configuration, validation, and [`counter::SecureCounters`]
//! - [`noise`] - (ε, δ)-differential-privacy noise allocation
//! - [`delay`] - inter-round delay enforcement tied to noise changes
//! - [`traffic`] - hidden-Markov traffic model and Viterbi assignment
//! - [`crypto`] - RSA-OAEP + Fernet hybrid encryption for blinding shares
//! - [`event`] - tagged event feed parsing
//! - [`protocol`] - line-framed wire messages between the roles
//! - [`client`] - the client-side session and reconnect driver
//! - [`node`] - round logic shared by the DC and SK clients

pub mod client;
pub mod counter;
pub mod crypto;
pub mod delay;
pub mod error;
pub mod event;
pub mod node;
pub mod noise;
pub mod protocol;
pub mod registry;
pub mod sampling;
pub mod traffic;

pub use counter::{Bin, CounterSpec, CountersConfig, Counts, SecureCounters, SINGLE_BIN};
pub use error::{Error, Result};
pub use sampling::{adjust_count_signed, counter_modulus, derive_blinding_factor, sample};
