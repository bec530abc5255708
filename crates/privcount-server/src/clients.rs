//! Client tracking: status merges, liveness, and role queries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use privcount_core::node::now_epoch;

/// The two client roles that check in with the tally server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    DataCollector,
    ShareKeeper,
}

/// One client's last reported status, merged with what the server measures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatus {
    #[serde(rename = "type")]
    pub client_type: ClientType,
    pub name: String,
    /// `idle` or `active`, as reported by the client.
    pub state: String,
    /// Server-side: when the client was last heard from, epoch seconds.
    #[serde(default)]
    pub alive: f64,
    /// Server-side: the peer address of the client's connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Server-side: measured round-trip time, seconds.
    #[serde(default)]
    pub rtt: f64,
    /// Server-side: measured absolute clock skew, seconds.
    #[serde(default)]
    pub clock_skew: f64,
    /// Server-side: when the client last changed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Data collectors only: the relay fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Share keepers only: the serialized public key (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Data collectors only: when the last feed event arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<f64>,
    /// Anything else the client reported, echoed into the outcome context.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// All clients the tally server has heard from recently, by UID
/// (`host~name`).
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<String, ClientStatus>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the UID for a status report from a connection.
    pub fn uid_for(host: &str, name: &str) -> String {
        format!("{host}~{name}")
    }

    /// Merge a status report into the registry.
    ///
    /// A changed fingerprint is ignored with a warning and the old one kept:
    /// a relay's identity must stay pinned for the round's noise weights to
    /// mean anything.
    pub fn set_client_status(&mut self, uid: &str, mut status: ClientStatus) {
        let old = self.clients.get(uid);
        let old_fingerprint = old.and_then(|c| c.fingerprint.clone());
        let old_state = old.map(|c| c.state.clone());
        let old_time = old.and_then(|c| c.time);

        if let (Some(old_fp), Some(new_fp)) = (&old_fingerprint, &status.fingerprint) {
            if old_fp != new_fp {
                tracing::warn!(
                    "ignoring fingerprint update from {} {}: kept {} ignored {}",
                    uid,
                    status.state,
                    old_fp,
                    new_fp
                );
            }
        }

        if old.is_none() {
            tracing::info!(
                "new {:?} {} joined and is {}",
                status.client_type,
                uid,
                status.state
            );
        }

        // `time` tracks the last state change, seeded from first contact
        status.time = match (&old_state, old_time) {
            (Some(previous_state), Some(time)) if *previous_state == status.state => Some(time),
            _ => Some(status.alive),
        };
        if old_fingerprint.is_some() {
            status.fingerprint = old_fingerprint;
        }
        tracing::info!(
            "client status: {:?} {} is alive and {}",
            status.client_type,
            uid,
            status.state
        );
        self.clients.insert(uid.to_string(), status);
    }

    /// Drop clients not heard from in 6 checkin periods (warn at 2),
    /// returning the dropped UIDs so an active round can be aborted.
    pub fn clear_dead_clients(&mut self, checkin_period: f64) -> Vec<String> {
        let now = now_epoch();
        let mut dead = Vec::new();
        for (uid, status) in &self.clients {
            let since_checkin = now - status.alive;
            if since_checkin > 2.0 * checkin_period {
                tracing::warn!(
                    "last checkin from {} was {:.0} seconds ago",
                    uid,
                    since_checkin
                );
            }
            if since_checkin > 6.0 * checkin_period {
                tracing::warn!("marking dead client {}", uid);
                dead.push(uid.clone());
            }
        }
        for uid in &dead {
            self.clients.remove(uid);
        }
        dead
    }

    pub fn get(&self, uid: &str) -> Option<&ClientStatus> {
        self.clients.get(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.clients.contains_key(uid)
    }

    fn matching(&self, client_type: ClientType, state: &str) -> Vec<String> {
        self.clients
            .iter()
            .filter(|(_, c)| c.client_type == client_type && c.state == state)
            .map(|(uid, _)| uid.clone())
            .collect()
    }

    pub fn idle_dcs(&self) -> Vec<String> {
        self.matching(ClientType::DataCollector, "idle")
    }

    pub fn active_dcs(&self) -> Vec<String> {
        self.matching(ClientType::DataCollector, "active")
    }

    pub fn idle_sks(&self) -> Vec<String> {
        self.matching(ClientType::ShareKeeper, "idle")
    }

    pub fn active_sks(&self) -> Vec<String> {
        self.matching(ClientType::ShareKeeper, "active")
    }

    /// Slack to add to round start deferral: the worst client RTT plus skew,
    /// plus one checkin period.
    pub fn clock_padding(&self, uids: &[String], checkin_period: f64) -> f64 {
        let max_delay = uids
            .iter()
            .filter_map(|uid| self.clients.get(uid))
            .map(|c| c.rtt + c.clock_skew)
            .fold(0.0, f64::max);
        max_delay + checkin_period
    }

    /// A JSON snapshot of every client's status, for the outcome context.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(&self.clients).unwrap_or(Value::Null)
    }
}
