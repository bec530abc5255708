//! PrivCount Tally Server.
//!
//! The singleton coordinator: knows the authorized client identities and the
//! counter/noise configuration, drives each collection round through its
//! state machine, and writes the outcome files at round end.

pub mod clients;
pub mod config;
pub mod error;
pub mod outcome;
pub mod round;
pub mod server;

pub use config::TallyServerConfig;
pub use error::{Error, Result};
pub use round::{CollectionRound, RoundState};
pub use server::TallyServer;
