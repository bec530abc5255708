//! Outcome files: the per-round tallies document and the outcome document
//! with its sanitized context.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use privcount_core::sampling::counter_modulus;
use privcount_core::{Counts, SecureCounters};

use crate::error::{Error, Result};
use crate::round::CollectionRound;

/// Sum the round's stored counts and recover the signed tally.
///
/// The tally is built over the combined bins-and-sigmas config so the
/// published document records the sigma each count was noised with.
pub fn assemble_tally(round: &CollectionRound) -> Result<Counts> {
    if round.final_counts().is_empty() {
        return Err(Error::Round("no tally results to write".into()));
    }
    let combined = privcount_core::counter::combine_counters(
        round.counters_config(),
        &round.noise_config().sigmas_config(),
    );
    let mut tallied = SecureCounters::new(&combined, counter_modulus(), false)?;
    let all: Vec<Counts> = round.final_counts().values().cloned().collect();
    if !tallied.tally_counters(&all) {
        return Err(Error::Round(
            "problem tallying counters, did all counters and bins match?".into(),
        ));
    }
    Ok(tallied.detach_counts()?)
}

/// Render the tallies document: counter name to bins and sigma, ready for
/// later analysis without the outcome context.
fn tallies_document(tally: &Counts) -> Value {
    serde_json::to_value(tally).unwrap_or(Value::Null)
}

/// Scrub one client's config echo: path values and counter structures must
/// never reach the published outcome.
fn sanitize_client_config(config: &mut Value) {
    let Some(map) = config.as_object_mut() else {
        return;
    };
    for path_key in ["state", "secret_handshake", "key", "cert"] {
        if map.contains_key(path_key) {
            map.insert(path_key.into(), format!("({path_key} path)").into());
        }
    }
    if let Some(start) = map.get_mut("Start").and_then(Value::as_object_mut) {
        if start.contains_key("counters") {
            start.insert("counters".into(), "(counter bins, no counts)".into());
        }
        if let Some(noise) = start.get_mut("noise").and_then(Value::as_object_mut) {
            if noise.contains_key("counters") {
                noise.insert("counters".into(), "(counter sigmas, no counts)".into());
            }
        }
        if let Some(sharekeepers) = start.get_mut("sharekeepers").and_then(Value::as_object_mut) {
            for value in sharekeepers.values_mut() {
                *value = "(public key)".into();
            }
        }
        if start.contains_key("shares") {
            start.insert("shares".into(), "(encrypted blinding shares)".into());
        }
    }
}

/// Scrub one client's status snapshot.
fn sanitize_client_status(status: &mut Value) {
    if let Some(map) = status.as_object_mut() {
        if map.contains_key("public_key") {
            map.insert("public_key".into(), "(public key)".into());
        }
        map.remove("type");
    }
}

/// Build the `Context` section: round timing, per-role client sections, and
/// the tally server's own status and sanitized config.
pub fn result_context(
    round: &CollectionRound,
    end_time: f64,
    client_statuses: &Value,
    ts_status: Value,
    ts_sanitized_config: Value,
) -> Value {
    let starting_ts = round.starting_ts().unwrap_or(0.0);
    let stopping_ts = round.stopping_ts().unwrap_or(end_time);
    let mut context = Map::new();
    context.insert(
        "Time".into(),
        json!({
            "Start": starting_ts,
            "Stopping": stopping_ts,
            "End": end_time,
            "CollectStopping": stopping_ts - starting_ts,
            "CollectEnd": end_time - starting_ts,
            "StoppingDelay": end_time - stopping_ts,
            "ClockPadding": round.clock_padding(),
        }),
    );

    // group participating clients by role, attaching status and config echo
    let mut by_type: Map<String, Value> = Map::new();
    if let Some(statuses) = client_statuses.as_object() {
        for (uid, status) in statuses {
            if !round.is_participating(uid) {
                continue;
            }
            let type_name = match status.get("type").and_then(Value::as_str) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let mut status = status.clone();
            sanitize_client_status(&mut status);
            let mut entry = Map::new();
            entry.insert("Status".into(), status);
            if let Some(config) = round.client_configs().get(uid) {
                let mut config = config.clone();
                sanitize_client_config(&mut config);
                entry.insert("Config".into(), config);
            }
            let section = by_type
                .entry(type_name)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(section) = section.as_object_mut() {
                section.insert(uid.clone(), Value::Object(entry));
            }
        }
    }
    for (type_name, section) in by_type {
        context.insert(type_name, section);
    }

    context.insert(
        "TallyServer".into(),
        json!({
            "Status": ts_status,
            "Config": ts_sanitized_config,
        }),
    );
    Value::Object(context)
}

/// File names for a round: `privcount.<kind>.<start>-<end>.json`.
fn outcome_path(prefix: &Path, kind: &str, begin: i64, end: i64) -> PathBuf {
    prefix.join(format!("privcount.{kind}.{begin}-{end}.json"))
}

/// Write the tallies and outcome documents for a stopped round.
///
/// Returns the tallies path. Both documents use sorted keys and 4-space
/// indentation; counts are arbitrary-precision JSON numbers.
pub fn write_results(
    round: &CollectionRound,
    path_prefix: &Path,
    end_time: f64,
    client_statuses: &Value,
    ts_status: Value,
    ts_sanitized_config: Value,
) -> Result<PathBuf> {
    if !round.is_stopped() {
        return Err(Error::Round(
            "trying to write results before the round is stopped".into(),
        ));
    }
    let tally = assemble_tally(round)?;

    let begin = round.starting_ts().unwrap_or(0.0).round() as i64;
    let end = round.stopping_ts().unwrap_or(end_time).round() as i64;

    let tallies_path = outcome_path(path_prefix, "tallies", begin, end);
    let tallies = tallies_document(&tally);
    std::fs::write(&tallies_path, pretty_json(&tallies)?)?;

    let outcome = json!({
        "Tally": tallies,
        "Context": result_context(round, end_time, client_statuses, ts_status, ts_sanitized_config),
    });
    let outcome_path = outcome_path(path_prefix, "outcome", begin, end);
    std::fs::write(&outcome_path, pretty_json(&outcome)?)?;

    tracing::info!(
        "tally was successful, outcome of round from {} to {} written to '{}'",
        begin,
        end,
        outcome_path.display()
    );
    Ok(tallies_path)
}

/// 4-space-indented JSON. `serde_json` maps already iterate in sorted key
/// order, matching the reference output.
fn pretty_json(value: &Value) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(value, &mut serializer)?;
    let mut text = String::from_utf8(buf)
        .map_err(|_| Error::Round("outcome JSON is not UTF-8".into()))?;
    text.push('\n');
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;
    use privcount_core::counter::{Bin, CounterSpec};
    use privcount_core::noise::{NoiseCounter, NoiseSpec};
    use privcount_core::CountersConfig;
    use std::collections::BTreeMap;

    fn stopped_round_with_counts() -> CollectionRound {
        let mut counters = CountersConfig::new();
        counters.insert(
            "ExitStreamByteCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, 512.0), Bin::new(512.0, f64::INFINITY)]),
                sigma: None,
            },
        );
        let mut noise_counters = BTreeMap::new();
        noise_counters.insert(
            "ExitStreamByteCount".to_string(),
            NoiseCounter {
                sigma: Some(0.0),
                ..Default::default()
            },
        );
        let mut weights = BTreeMap::new();
        weights.insert("*".to_string(), 1.0);
        let mut round = CollectionRound::new(
            60.0,
            counters.clone(),
            NoiseSpec {
                privacy: None,
                counters: noise_counters,
            },
            weights,
            1,
            None,
            vec!["sk1".into()],
            BTreeMap::new(),
            vec!["dc1".into()],
            0.0,
        );
        round.start();

        // run the real share/count cycle through the engine
        let modulus = counter_modulus();
        let mut dc = SecureCounters::new(&counters, modulus, false).expect("dc");
        let mut sk = SecureCounters::new(&counters, modulus, false).expect("sk");
        dc.generate_blinding_shares(&["sk1".into()]);
        let shares = dc.detach_blinding_shares().expect("shares");
        assert!(sk.import_blinding_share(&shares["sk1"]));
        dc.increment("ExitStreamByteCount", 100.0, 41);
        dc.increment("ExitStreamByteCount", 600.0, 1);

        let dc_counts = dc.detach_counts().expect("dc counts");
        let sk_counts = sk.detach_counts().expect("sk counts");
        let wrap = |counts: &Counts| {
            json!({
                "Counts": serde_json::to_value(counts).expect("counts"),
                "Config": {"state": "/tmp/x.state", "name": "n"},
            })
        };
        round.store_start_result("dc1", &json!({"sk1": {
            "sk_uid": "sk1",
            "secret": {"pk_encrypted_secret_key": "a2V5", "sym_encrypted_data": "ZGF0YQ=="},
        }}));
        round.store_start_result("sk1", &json!({}));
        round.stop();
        round.store_stop_result("dc1", &wrap(&dc_counts));
        round.store_stop_result("sk1", &wrap(&sk_counts));
        round.stop();
        assert!(round.is_stopped());
        round
    }

    #[test]
    fn tally_matches_increments() {
        let round = stopped_round_with_counts();
        let tally = assemble_tally(&round).expect("tally");
        let bins = &tally["ExitStreamByteCount"].bins;
        assert_eq!(bins[0].count, BigInt::from(41));
        assert_eq!(bins[1].count, BigInt::from(1));
    }

    #[test]
    fn outcome_files_round_trip() {
        let round = stopped_round_with_counts();
        let dir = tempfile::tempdir().expect("tempdir");
        let statuses = json!({
            "dc1": {"type": "DataCollector", "name": "n", "state": "active", "public_key": null},
            "sk1": {"type": "ShareKeeper", "name": "k", "state": "active", "public_key": "PEM"},
        });
        let tallies_path = write_results(
            &round,
            dir.path(),
            privcount_core::node::now_epoch(),
            &statuses,
            json!({"state": "active"}),
            json!({"counters": "(counter bins, no counts)"}),
        )
        .expect("write");

        let text = std::fs::read_to_string(&tallies_path).expect("read tallies");
        assert!(text.contains("    "));
        let parsed: Counts = serde_json::from_str(&text).expect("parse tallies");
        assert_eq!(parsed["ExitStreamByteCount"].bins[0].count, BigInt::from(41));

        // the outcome file exists and its context is sanitized
        let outcome_name = tallies_path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("name")
            .replace("tallies", "outcome");
        let outcome_text =
            std::fs::read_to_string(dir.path().join(outcome_name)).expect("read outcome");
        let outcome: Value = serde_json::from_str(&outcome_text).expect("parse outcome");
        assert_eq!(
            outcome["Context"]["ShareKeeper"]["sk1"]["Status"]["public_key"],
            "(public key)"
        );
        assert_eq!(
            outcome["Context"]["DataCollector"]["dc1"]["Config"]["state"],
            "(state path)"
        );
        assert_eq!(
            outcome["Tally"]["ExitStreamByteCount"]["bins"][0][2],
            json!(41)
        );
    }

    #[test]
    fn empty_round_has_no_outcome() {
        let mut counters = CountersConfig::new();
        counters.insert(
            "ZeroCount".into(),
            CounterSpec {
                bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                sigma: None,
            },
        );
        let round = CollectionRound::new(
            60.0,
            counters,
            NoiseSpec {
                privacy: None,
                counters: BTreeMap::new(),
            },
            BTreeMap::new(),
            1,
            None,
            vec![],
            BTreeMap::new(),
            vec![],
            0.0,
        );
        assert!(assemble_tally(&round).is_err());
    }
}
