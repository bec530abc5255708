//! PrivCount Share Keeper.
//!
//! Holds a long-term RSA keypair; during a round, receives one encrypted
//! blinding-share structure from every data collector, imports them, and at
//! round end emits its aggregated share. Stateless across rounds except for
//! the keypair.

pub mod config;
pub mod error;
pub mod keeper;

pub use config::ShareKeeperConfig;
pub use error::{Error, Result};
pub use keeper::ShareKeeper;
