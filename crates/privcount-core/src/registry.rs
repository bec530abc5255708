//! The authoritative set of counter names and the events that feed them.
//!
//! Counter sets arriving in configuration or START payloads must validate
//! against this registry. Traffic-model counters are registered dynamically
//! at config load, because their names depend on the model's states.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, OnceLock};

/// Event kinds emitted by the event source, by tagged-event name.
pub const EVENT_STREAM_ENDED: &str = "PRIVCOUNT_STREAM_ENDED";
pub const EVENT_CIRCUIT_ENDED: &str = "PRIVCOUNT_CIRCUIT_ENDED";
pub const EVENT_CONNECTION_ENDED: &str = "PRIVCOUNT_CONNECTION_ENDED";
pub const EVENT_HSDIR_STORE: &str = "PRIVCOUNT_HSDIR_CACHE_STORE";
pub const EVENT_STREAM_BYTES: &str = "PRIVCOUNT_STREAM_BYTES_TRANSFERRED";
/// Pseudo-event for counters that are incremented by the collector itself
/// (rotation timers, sanity checks), not by a feed event.
pub const EVENT_INTERNAL: &str = "PRIVCOUNT_INTERNAL";

/// The static counter table: name to the events it needs.
///
/// Kept sorted by name. The per-class stream/circuit variants share their
/// base counter's events.
static KNOWN_COUNTERS: &[(&str, &[&str])] = &[
    ("EntryCircuitCount", &[EVENT_CIRCUIT_ENDED]),
    ("EntryCircuitActiveCount", &[EVENT_CIRCUIT_ENDED]),
    ("EntryCircuitInactiveCount", &[EVENT_CIRCUIT_ENDED]),
    ("EntryCircuitCellsIn", &[EVENT_CIRCUIT_ENDED]),
    ("EntryCircuitCellsOut", &[EVENT_CIRCUIT_ENDED]),
    ("EntryCircuitCellsRatio", &[EVENT_CIRCUIT_ENDED]),
    ("EntryClientIPCount", &[EVENT_CIRCUIT_ENDED, EVENT_INTERNAL]),
    ("EntryClientIPActiveCount", &[EVENT_CIRCUIT_ENDED, EVENT_INTERNAL]),
    ("EntryClientIPInactiveCount", &[EVENT_CIRCUIT_ENDED, EVENT_INTERNAL]),
    ("EntryClientIPActiveCircuitCount", &[EVENT_CIRCUIT_ENDED, EVENT_INTERNAL]),
    ("EntryClientIPInactiveCircuitCount", &[EVENT_CIRCUIT_ENDED, EVENT_INTERNAL]),
    ("EntryConnectionCount", &[EVENT_CONNECTION_ENDED]),
    ("EntryConnectionLifeTime", &[EVENT_CONNECTION_ENDED]),
    ("ExitCircuitCount", &[EVENT_CIRCUIT_ENDED]),
    ("ExitCircuitActiveCount", &[EVENT_CIRCUIT_ENDED]),
    ("ExitCircuitInactiveCount", &[EVENT_CIRCUIT_ENDED]),
    ("ExitCircuitLifeTime", &[EVENT_CIRCUIT_ENDED]),
    ("ExitCircuitActiveLifeTime", &[EVENT_CIRCUIT_ENDED]),
    ("ExitCircuitInactiveLifeTime", &[EVENT_CIRCUIT_ENDED]),
    ("ExitCircuitStreamCount", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitInterStreamCreationTime", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitWebCount", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitWebStreamCount", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitWebInterStreamCreationTime", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitInteractiveCount", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitInteractiveStreamCount", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitInteractiveInterStreamCreationTime", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitP2PCount", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitP2PStreamCount", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitP2PInterStreamCreationTime", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitOtherCount", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitOtherStreamCount", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitCircuitOtherInterStreamCreationTime", &[EVENT_CIRCUIT_ENDED, EVENT_STREAM_ENDED]),
    ("ExitStreamCount", &[EVENT_STREAM_ENDED]),
    ("ExitStreamByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitStreamOutboundByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitStreamInboundByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitStreamByteRatio", &[EVENT_STREAM_ENDED]),
    ("ExitStreamLifeTime", &[EVENT_STREAM_ENDED]),
    ("ExitWebStreamCount", &[EVENT_STREAM_ENDED]),
    ("ExitWebStreamByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitWebStreamOutboundByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitWebStreamInboundByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitWebStreamByteRatio", &[EVENT_STREAM_ENDED]),
    ("ExitWebStreamLifeTime", &[EVENT_STREAM_ENDED]),
    ("ExitInteractiveStreamCount", &[EVENT_STREAM_ENDED]),
    ("ExitInteractiveStreamByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitInteractiveStreamOutboundByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitInteractiveStreamInboundByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitInteractiveStreamByteRatio", &[EVENT_STREAM_ENDED]),
    ("ExitInteractiveStreamLifeTime", &[EVENT_STREAM_ENDED]),
    ("ExitP2PStreamCount", &[EVENT_STREAM_ENDED]),
    ("ExitP2PStreamByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitP2PStreamOutboundByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitP2PStreamInboundByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitP2PStreamByteRatio", &[EVENT_STREAM_ENDED]),
    ("ExitP2PStreamLifeTime", &[EVENT_STREAM_ENDED]),
    ("ExitOtherStreamCount", &[EVENT_STREAM_ENDED]),
    ("ExitOtherStreamByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitOtherStreamOutboundByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitOtherStreamInboundByteCount", &[EVENT_STREAM_ENDED]),
    ("ExitOtherStreamByteRatio", &[EVENT_STREAM_ENDED]),
    ("ExitOtherStreamLifeTime", &[EVENT_STREAM_ENDED]),
    ("ExitStreamTrafficModelEmissionCount", &[EVENT_STREAM_BYTES, EVENT_STREAM_ENDED]),
    ("ExitStreamTrafficModelTransitionCount", &[EVENT_STREAM_BYTES, EVENT_STREAM_ENDED]),
    ("ExitStreamTrafficModelLogDelayTime", &[EVENT_STREAM_BYTES, EVENT_STREAM_ENDED]),
    ("ExitStreamTrafficModelSquaredLogDelayTime", &[EVENT_STREAM_BYTES, EVENT_STREAM_ENDED]),
    ("HSDirStoreCount", &[EVENT_HSDIR_STORE]),
    ("HSDirStoreByteCount", &[EVENT_HSDIR_STORE]),
    ("ZeroCount", &[EVENT_INTERNAL]),
];

fn dynamic_counters() -> &'static Mutex<BTreeMap<String, BTreeSet<String>>> {
    static DYNAMIC: OnceLock<Mutex<BTreeMap<String, BTreeSet<String>>>> = OnceLock::new();
    DYNAMIC.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Register a counter whose name is derived at config time (traffic model
/// expansion). Idempotent.
pub fn register_dynamic_counter(name: &str, events: impl IntoIterator<Item = String>) {
    let mut dynamic = dynamic_counters()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    dynamic
        .entry(name.to_string())
        .or_default()
        .extend(events);
}

/// Whether a counter name is in the authoritative set (static or dynamic).
pub fn is_known_counter(name: &str) -> bool {
    if KNOWN_COUNTERS.iter().any(|(known, _)| *known == name) {
        return true;
    }
    dynamic_counters()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .contains_key(name)
}

/// All statically known counter names.
pub fn static_counter_names() -> Vec<&'static str> {
    KNOWN_COUNTERS.iter().map(|(name, _)| *name).collect()
}

/// The events a counter needs, or empty if the counter is unknown.
pub fn events_for_counter(name: &str) -> BTreeSet<String> {
    if let Some((_, events)) = KNOWN_COUNTERS.iter().find(|(known, _)| *known == name) {
        return events.iter().map(|e| (*e).to_string()).collect();
    }
    dynamic_counters()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(name)
        .cloned()
        .unwrap_or_default()
}

/// The union of events needed by a list of counters. A collector subscribes
/// to exactly this set for a round.
pub fn events_for_counters<'a>(names: impl Iterator<Item = &'a String>) -> BTreeSet<String> {
    let mut events = BTreeSet::new();
    for name in names {
        events.extend(events_for_counter(name));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_names_are_known() {
        assert!(is_known_counter("ExitStreamByteCount"));
        assert!(is_known_counter("ZeroCount"));
        assert!(!is_known_counter("TotallyMadeUpCounter"));
    }

    #[test]
    fn dynamic_registration() {
        let name = "ExitStreamTrafficModelEmissionCount_Thinking_+";
        assert!(!is_known_counter(name));
        register_dynamic_counter(name, [EVENT_STREAM_BYTES.to_string()]);
        assert!(is_known_counter(name));
        assert!(events_for_counter(name).contains(EVENT_STREAM_BYTES));
    }

    #[test]
    fn events_union() {
        let names = vec!["ExitStreamCount".to_string(), "EntryConnectionCount".to_string()];
        let events = events_for_counters(names.iter());
        assert!(events.contains(EVENT_STREAM_ENDED));
        assert!(events.contains(EVENT_CONNECTION_ENDED));
        assert!(!events.contains(EVENT_HSDIR_STORE));
    }
}
