//! The per-round aggregator: owns the secure counters, maps feed events to
//! bin increments, tracks rotation windows for IP uniqueness, and feeds the
//! traffic model.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use privcount_core::counter::{BlindingShare, NoiseWeightConfig};
use privcount_core::event::TaggedEvent;
use privcount_core::node::now_epoch;
use privcount_core::registry;
use privcount_core::sampling::counter_modulus;
use privcount_core::traffic::{
    PacketBundle, TrafficModel, TrafficModelConfig, PACKET_ARRIVAL_TIME_TOLERANCE,
    PACKET_BYTE_COUNT, STREAM_EVICT_TIME,
};
use privcount_core::{CountersConfig, Counts, SecureCounters, SINGLE_BIN};

use crate::error::Result;

/// Client IP rotation cadence, seconds. Only fully rotated windows
/// contribute to the `EntryClientIP*` counters.
pub const ROTATION_PERIOD: f64 = 600.0;

/// Streams seen on one circuit, by traffic class.
#[derive(Debug, Default, Clone)]
struct CircuitInfo {
    stream_counts: BTreeMap<&'static str, u64>,
    stream_start_times: BTreeMap<&'static str, Vec<f64>>,
}

/// What one client IP did during a rotation window.
#[derive(Debug, Default, Clone)]
struct ClientIpInfo {
    is_active: bool,
    active_completed: u64,
    inactive_completed: u64,
}

/// Packet bundles accumulated for one live stream.
#[derive(Debug, Default, Clone)]
struct StreamTrack {
    bundles: Vec<PacketBundle>,
    last_bundle_ts: f64,
    last_seen: f64,
}

/// Classify an exit port into the counting classes.
fn stream_class(port: u16) -> &'static str {
    match port {
        80 | 443 => "Web",
        22 | 194 | 994 | 6660..=6670 | 6679 | 6697 | 7000 => "Interactive",
        1214 | 4661..=4666 | 6346..=6429 | 6699 | 6881..=6999 => "P2P",
        _ => "Other",
    }
}

/// Log-2 ratio of outbound to inbound volume, with signed infinities for
/// one-sided transfers.
fn encode_ratio(inval: f64, outval: f64) -> f64 {
    if inval == outval {
        0.0
    } else if inval == 0.0 {
        f64::INFINITY
    } else if outval == 0.0 {
        f64::NEG_INFINITY
    } else {
        (outval / inval).log2()
    }
}

/// Gaps between sorted stream creation times.
fn interstream_creation_times(mut times: Vec<f64>) -> Vec<f64> {
    times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    times.windows(2).map(|w| w[1] - w[0]).collect()
}

/// The aggregator exists from START to STOP of one round.
pub struct Aggregator {
    secure_counters: Option<SecureCounters>,
    noise_weight_config: NoiseWeightConfig,
    noise_weight_value: Option<f64>,
    fingerprint: Option<String>,
    traffic_model: Option<TrafficModel>,

    last_event_time: f64,
    num_rotations: u64,
    circuits: BTreeMap<(u64, u64), CircuitInfo>,
    cli_ips_rotated: f64,
    cli_ips_current: BTreeMap<String, ClientIpInfo>,
    cli_ips_previous: BTreeMap<String, ClientIpInfo>,
    streams: BTreeMap<(u64, u64, u64), StreamTrack>,
}

impl Aggregator {
    /// Build the counters and generate the blinding shares for each share
    /// keeper. Noise is added separately, once the noise weight is known.
    pub fn new(
        counters: &CountersConfig,
        sk_uids: &[String],
        noise_weight_config: NoiseWeightConfig,
        fingerprint: Option<String>,
        traffic_model_config: Option<TrafficModelConfig>,
    ) -> Result<Self> {
        let mut secure_counters = SecureCounters::new(counters, counter_modulus(), true)?;
        secure_counters.generate_blinding_shares(sk_uids);
        let events = registry::events_for_counters(counters.keys());
        tracing::info!(
            "counting {} counters fed by {} event kinds",
            counters.len(),
            events.len()
        );
        let traffic_model = match traffic_model_config {
            Some(config) => {
                let model = TrafficModel::new(config)?;
                model.register_counters();
                Some(model)
            }
            None => None,
        };
        Ok(Aggregator {
            secure_counters: Some(secure_counters),
            noise_weight_config,
            noise_weight_value: None,
            fingerprint,
            traffic_model,
            last_event_time: 0.0,
            num_rotations: 0,
            circuits: BTreeMap::new(),
            cli_ips_rotated: now_epoch(),
            cli_ips_current: BTreeMap::new(),
            cli_ips_previous: BTreeMap::new(),
            streams: BTreeMap::new(),
        })
    }

    /// Detach the per-SK blinding share table for encryption and transport.
    pub fn detach_shares(&mut self) -> Option<BTreeMap<String, BlindingShare>> {
        self.secure_counters
            .as_mut()
            .and_then(SecureCounters::detach_blinding_shares)
    }

    /// Add noise using the weight for our fingerprint.
    ///
    /// A fingerprint covered by neither the explicit weight map nor the
    /// default means we cannot participate: the counters are destroyed and
    /// nothing will be reported (fail-closed).
    pub fn generate_noise(&mut self) -> bool {
        if self.noise_weight_value.is_some() {
            tracing::warn!("asked to add noise twice, ignoring");
            return true;
        }
        let weight = privcount_core::counter::get_noise_weight(
            &self.noise_weight_config,
            self.fingerprint.as_deref(),
        );
        match weight {
            Some(weight) => {
                let Some(counters) = &mut self.secure_counters else {
                    return false;
                };
                match counters.generate_noise(weight) {
                    Ok(()) => {
                        self.noise_weight_value = Some(weight);
                        true
                    }
                    Err(e) => {
                        tracing::warn!("noise generation failed: {}", e);
                        false
                    }
                }
            }
            None => {
                tracing::warn!(
                    "tally server did not provide a noise weight for fingerprint {:?}, \
                     we will not count in this round",
                    self.fingerprint
                );
                self.secure_counters = None;
                false
            }
        }
    }

    /// Whether the aggregator still holds counters.
    pub fn is_counting(&self) -> bool {
        self.secure_counters.is_some()
    }

    /// Stop counting and return the final counts (when valid and wanted).
    pub fn stop(&mut self, counts_are_valid: bool) -> Option<Counts> {
        if self.noise_weight_value.is_none() && counts_are_valid && self.secure_counters.is_some()
        {
            tracing::warn!("noise was never added to the counters, adding now");
            self.generate_noise();
        }
        let counts = self
            .secure_counters
            .take()
            .and_then(|mut counters| counters.detach_counts().ok());
        if counts_are_valid {
            counts
        } else {
            None
        }
    }

    /// Context echoed into status reports and the outcome files.
    pub fn context(&self) -> Value {
        let mut context = json!({});
        if let Some(fingerprint) = &self.fingerprint {
            context["fingerprint"] = json!(fingerprint);
        }
        if self.last_event_time != 0.0 {
            context["last_event_time"] = json!(self.last_event_time);
        }
        if let Some(weight) = self.noise_weight_value {
            context["noise_weight_value"] = json!(weight);
        }
        context
    }

    // -- event dispatch ---------------------------------------------------

    /// Map one tagged event onto counter increments. Parse failures drop
    /// the single event with a warning; the round continues.
    pub fn handle_event(&mut self, event: &TaggedEvent) {
        if self.secure_counters.is_none() {
            return;
        }
        self.last_event_time = now_epoch();
        let result = match event.name.as_str() {
            registry::EVENT_STREAM_ENDED => self.handle_stream_event(event),
            registry::EVENT_CIRCUIT_ENDED => self.handle_circuit_event(event),
            registry::EVENT_CONNECTION_ENDED => self.handle_connection_event(event),
            registry::EVENT_HSDIR_STORE => self.handle_hsdir_event(event),
            registry::EVENT_STREAM_BYTES => self.handle_stream_bytes_event(event),
            other => {
                tracing::debug!("ignoring unrecognized event {}", other);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!("dropping event: {}", e);
        }
    }

    fn increment(&mut self, counter_name: &str, bin_key: f64, inc: i64) {
        if let Some(counters) = &mut self.secure_counters {
            counters.increment(counter_name, bin_key, inc);
        }
    }

    fn handle_stream_event(&mut self, event: &TaggedEvent) -> privcount_core::Result<()> {
        let chan_id = event.get_uint("ChanID")?;
        let circ_id = event.get_uint("CircID")?;
        let stream_id = event.get_uint("StreamID")?;
        let port = u16::try_from(event.get_uint("ExitPort")?).unwrap_or(0);
        let read_bw = event.get_uint("ReadBW")? as f64;
        let write_bw = event.get_uint("WriteBW")? as f64;
        let start = event.get_float("TimeStart")?;
        let end = event.get_float("TimeEnd")?;
        let _is_dns = event.get_flag("IsDNS")?;
        let _is_dir = event.get_flag("IsDir")?;

        // finalize the traffic model for this stream regardless of volume
        self.finish_stream((chan_id, circ_id, stream_id));

        // only count streams with legitimate transfers
        let total_bw = read_bw + write_bw;
        if total_bw <= 0.0 {
            return Ok(());
        }

        let class = stream_class(port);
        let ratio = encode_ratio(read_bw, write_bw);
        let lifetime = end - start;

        let circuit = self.circuits.entry((chan_id, circ_id)).or_default();
        *circuit.stream_counts.entry(class).or_insert(0) += 1;
        circuit
            .stream_start_times
            .entry(class)
            .or_default()
            .push(start);

        self.increment("ExitStreamCount", SINGLE_BIN, 1);
        self.increment("ExitStreamByteCount", total_bw, 1);
        self.increment("ExitStreamOutboundByteCount", write_bw, 1);
        self.increment("ExitStreamInboundByteCount", read_bw, 1);
        self.increment("ExitStreamByteRatio", ratio, 1);
        self.increment("ExitStreamLifeTime", lifetime, 1);

        self.increment(&format!("Exit{class}StreamCount"), SINGLE_BIN, 1);
        self.increment(&format!("Exit{class}StreamByteCount"), total_bw, 1);
        self.increment(&format!("Exit{class}StreamOutboundByteCount"), write_bw, 1);
        self.increment(&format!("Exit{class}StreamInboundByteCount"), read_bw, 1);
        self.increment(&format!("Exit{class}StreamByteRatio"), ratio, 1);
        self.increment(&format!("Exit{class}StreamLifeTime"), lifetime, 1);
        Ok(())
    }

    fn handle_circuit_event(&mut self, event: &TaggedEvent) -> privcount_core::Result<()> {
        let chan_id = event.get_uint("ChanID")?;
        let circ_id = event.get_uint("CircID")?;
        let cells_in = event.get_uint("CellsIn")? as f64;
        let cells_out = event.get_uint("CellsOut")? as f64;
        let start = event.get_float("TimeStart")?;
        let end = event.get_float("TimeEnd")?;
        let prev_ip = event.get_str("PrevIP")?.to_string();
        let prev_is_relay = event.get_flag("PrevIsRelay")?;
        let next_is_relay = event.get_flag("NextIsRelay")?;

        if !prev_is_relay {
            // previous hop is not a relay: we are the entry
            self.increment("EntryCircuitCount", SINGLE_BIN, 1);

            // circuits with fewer than 8 cells never carried payload
            let is_active = cells_in + cells_out >= 8.0;
            if is_active {
                self.increment("EntryCircuitActiveCount", SINGLE_BIN, 1);
                self.increment("EntryCircuitCellsIn", cells_in, 1);
                self.increment("EntryCircuitCellsOut", cells_out, 1);
                self.increment("EntryCircuitCellsRatio", encode_ratio(cells_in, cells_out), 1);
            } else {
                self.increment("EntryCircuitInactiveCount", SINGLE_BIN, 1);
            }

            // track the client IP in the current rotation window, and in the
            // previous window when the circuit started before the rotation
            let in_previous = start < self.cli_ips_rotated;
            let entry = self.cli_ips_current.entry(prev_ip.clone()).or_default();
            if is_active {
                entry.is_active = true;
                entry.active_completed += 1;
            } else {
                entry.inactive_completed += 1;
            }
            if in_previous {
                let prev_entry = self.cli_ips_previous.entry(prev_ip).or_default();
                if is_active {
                    prev_entry.is_active = true;
                }
            }
        } else if !next_is_relay {
            // previous hop is a relay but the next is not: we are the exit
            self.increment("ExitCircuitCount", SINGLE_BIN, 1);
            self.increment("ExitCircuitLifeTime", end - start, 1);

            let info = self.circuits.remove(&(chan_id, circ_id));
            let has_completed_stream = info
                .as_ref()
                .map(|i| i.stream_counts.values().sum::<u64>() > 0)
                .unwrap_or(false);

            if let (Some(info), true) = (info, has_completed_stream) {
                self.increment("ExitCircuitActiveCount", SINGLE_BIN, 1);
                self.increment("ExitCircuitActiveLifeTime", end - start, 1);

                let total_streams: u64 = info.stream_counts.values().sum();
                self.increment("ExitCircuitStreamCount", total_streams as f64, 1);

                let all_times: Vec<f64> = info
                    .stream_start_times
                    .values()
                    .flatten()
                    .copied()
                    .collect();
                for gap in interstream_creation_times(all_times) {
                    self.increment("ExitCircuitInterStreamCreationTime", gap, 1);
                }

                for (class, count) in &info.stream_counts {
                    if *count == 0 {
                        continue;
                    }
                    self.increment(&format!("ExitCircuit{class}Count"), SINGLE_BIN, 1);
                    self.increment(
                        &format!("ExitCircuit{class}StreamCount"),
                        *count as f64,
                        1,
                    );
                    let times = info
                        .stream_start_times
                        .get(class)
                        .cloned()
                        .unwrap_or_default();
                    for gap in interstream_creation_times(times) {
                        self.increment(
                            &format!("ExitCircuit{class}InterStreamCreationTime"),
                            gap,
                            1,
                        );
                    }
                }
            } else {
                self.increment("ExitCircuitInactiveCount", SINGLE_BIN, 1);
                self.increment("ExitCircuitInactiveLifeTime", end - start, 1);
            }
        }
        Ok(())
    }

    fn handle_connection_event(&mut self, event: &TaggedEvent) -> privcount_core::Result<()> {
        let start = event.get_float("TimeStart")?;
        let end = event.get_float("TimeEnd")?;
        let is_relay = event.get_flag("IsRelay")?;
        if !is_relay {
            self.increment("EntryConnectionCount", SINGLE_BIN, 1);
            self.increment("EntryConnectionLifeTime", end - start, 1);
        }
        Ok(())
    }

    fn handle_hsdir_event(&mut self, event: &TaggedEvent) -> privcount_core::Result<()> {
        let byte_count = event.get_uint("DescriptorByteCount")? as f64;
        self.increment("HSDirStoreCount", SINGLE_BIN, 1);
        self.increment("HSDirStoreByteCount", byte_count, 1);
        Ok(())
    }

    /// Accumulate a byte transfer into the stream's packet bundles for the
    /// traffic model. Transfers arriving within the packet tolerance merge
    /// into the previous bundle.
    fn handle_stream_bytes_event(&mut self, event: &TaggedEvent) -> privcount_core::Result<()> {
        if self.traffic_model.is_none() {
            return Ok(());
        }
        let chan_id = event.get_uint("ChanID")?;
        let circ_id = event.get_uint("CircID")?;
        let stream_id = event.get_uint("StreamID")?;
        let is_outbound = event.get_flag("IsOutbound")?;
        let byte_count = event.get_uint("ByteCount")?;
        let timestamp = event.get_float("EventTimestamp")?;

        let packet_count =
            u32::try_from(byte_count.div_ceil(PACKET_BYTE_COUNT).max(1)).unwrap_or(u32::MAX);
        let payload_bytes =
            u32::try_from(byte_count % PACKET_BYTE_COUNT).unwrap_or(u32::MAX);

        let track = self
            .streams
            .entry((chan_id, circ_id, stream_id))
            .or_default();
        let delay_micros = if track.last_bundle_ts > 0.0 {
            ((timestamp - track.last_bundle_ts).max(0.0) * 1e6) as u64
        } else {
            0
        };
        let mergeable = delay_micros <= PACKET_ARRIVAL_TIME_TOLERANCE;
        match track.bundles.last_mut() {
            Some(last) if mergeable && last.sent == Some(is_outbound) => {
                last.packet_count = last.packet_count.saturating_add(packet_count);
                last.payload_bytes = payload_bytes;
            }
            _ => {
                track.bundles.push(PacketBundle {
                    sent: Some(is_outbound),
                    delay_micros,
                    timestamp,
                    packet_count,
                    payload_bytes,
                });
            }
        }
        track.last_bundle_ts = timestamp;
        track.last_seen = now_epoch();
        Ok(())
    }

    /// A stream completed: run Viterbi over its bundles and count the
    /// resulting state sequence.
    fn finish_stream(&mut self, key: (u64, u64, u64)) {
        let Some(track) = self.streams.remove(&key) else {
            return;
        };
        let Some(model) = &self.traffic_model else {
            return;
        };
        if track.bundles.is_empty() {
            return;
        }
        let states = model.run_viterbi(&track.bundles);
        if let Some(counters) = &mut self.secure_counters {
            model.increment_stream_counters(&track.bundles, &states, counters);
        }
    }

    /// Rotate the client-IP windows: the previous (fully rotated) window is
    /// counted, the current window becomes the previous one.
    pub fn rotate(&mut self) {
        tracing::info!("rotating client IP window now");
        if let Some(counters) = &mut self.secure_counters {
            for info in self.cli_ips_previous.values() {
                counters.increment("EntryClientIPCount", SINGLE_BIN, 1);
                if info.is_active {
                    counters.increment("EntryClientIPActiveCount", SINGLE_BIN, 1);
                } else {
                    counters.increment("EntryClientIPInactiveCount", SINGLE_BIN, 1);
                }
                if info.active_completed > 0 {
                    counters.increment(
                        "EntryClientIPActiveCircuitCount",
                        info.active_completed as f64,
                        1,
                    );
                }
                if info.inactive_completed > 0 {
                    counters.increment(
                        "EntryClientIPInactiveCircuitCount",
                        info.inactive_completed as f64,
                        1,
                    );
                }
            }
        }
        self.cli_ips_previous = std::mem::take(&mut self.cli_ips_current);
        self.cli_ips_rotated = now_epoch();
        self.num_rotations += 1;
    }

    /// Evict streams idle beyond the TTL so a silent stream cannot hold its
    /// packet bundles forever.
    pub fn evict_stale_streams(&mut self) {
        let now = now_epoch();
        let before = self.streams.len();
        self.streams
            .retain(|_, track| now - track.last_seen < STREAM_EVICT_TIME);
        let evicted = before - self.streams.len();
        if evicted > 0 {
            tracing::info!("evicted {} stale streams", evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;
    use privcount_core::counter::{Bin, CounterSpec};
    use privcount_core::event::parse_tagged_event_line;

    fn test_counters() -> CountersConfig {
        let mut config = CountersConfig::new();
        for name in [
            "ExitStreamCount",
            "ExitWebStreamCount",
            "EntryCircuitCount",
            "EntryCircuitActiveCount",
            "EntryConnectionCount",
            "EntryClientIPCount",
            "EntryClientIPActiveCount",
            "EntryClientIPInactiveCount",
            "HSDirStoreCount",
        ] {
            config.insert(
                name.to_string(),
                CounterSpec {
                    bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
                    sigma: Some(0.0),
                },
            );
        }
        config.insert(
            "ExitStreamByteCount".into(),
            CounterSpec {
                bins: Some(vec![
                    Bin::new(0.0, 1024.0),
                    Bin::new(1024.0, f64::INFINITY),
                ]),
                sigma: Some(0.0),
            },
        );
        config
    }

    fn test_aggregator() -> Aggregator {
        let mut weights = NoiseWeightConfig::new();
        weights.insert("*".into(), 1.0);
        Aggregator::new(
            &test_counters(),
            &["sk1".to_string()],
            weights,
            Some("FP1".into()),
            None,
        )
        .expect("aggregator")
    }

    fn counts(aggregator: &mut Aggregator) -> Counts {
        // single-party round: discard the blinding by importing our own
        // share back
        let shares = aggregator.detach_shares().expect("shares");
        assert!(aggregator.generate_noise());
        let blinded = aggregator.stop(true).expect("counts");
        let mut unblind =
            SecureCounters::new(&test_counters(), counter_modulus(), false).expect("counters");
        assert!(unblind.import_blinding_share(&shares["sk1"]));
        let own = unblind.detach_counts().expect("own");
        let mut tally =
            SecureCounters::new(&test_counters(), counter_modulus(), false).expect("tally");
        assert!(tally.tally_counters(&[blinded, own]));
        tally.detach_counts().expect("tally counts")
    }

    #[test]
    fn stream_events_count_by_class() {
        let mut aggregator = test_aggregator();
        let event = parse_tagged_event_line(
            "650 PRIVCOUNT_STREAM_ENDED ChanID=1 CircID=2 StreamID=3 ExitPort=443 \
             ReadBW=100 WriteBW=200 TimeStart=1000.0 TimeEnd=1009.5 IsDNS=0 IsDir=0",
        )
        .expect("event");
        aggregator.handle_event(&event);

        let result = counts(&mut aggregator);
        assert_eq!(result["ExitStreamCount"].bins[0].count, BigInt::from(1));
        assert_eq!(result["ExitWebStreamCount"].bins[0].count, BigInt::from(1));
        // 300 bytes falls into the first byte bin
        assert_eq!(result["ExitStreamByteCount"].bins[0].count, BigInt::from(1));
        assert_eq!(result["ExitStreamByteCount"].bins[1].count, BigInt::from(0));
    }

    #[test]
    fn zero_volume_streams_are_not_counted() {
        let mut aggregator = test_aggregator();
        let event = parse_tagged_event_line(
            "650 PRIVCOUNT_STREAM_ENDED ChanID=1 CircID=2 StreamID=3 ExitPort=80 \
             ReadBW=0 WriteBW=0 TimeStart=1000.0 TimeEnd=1001.0 IsDNS=0 IsDir=0",
        )
        .expect("event");
        aggregator.handle_event(&event);
        let result = counts(&mut aggregator);
        assert_eq!(result["ExitStreamCount"].bins[0].count, BigInt::from(0));
    }

    #[test]
    fn malformed_events_are_dropped_quietly() {
        let mut aggregator = test_aggregator();
        // ReadBW is not an integer: the event is dropped, nothing counted
        let event = parse_tagged_event_line(
            "650 PRIVCOUNT_STREAM_ENDED ChanID=1 CircID=2 StreamID=3 ExitPort=80 \
             ReadBW=lots WriteBW=1 TimeStart=1.0 TimeEnd=2.0 IsDNS=0 IsDir=0",
        )
        .expect("parses");
        aggregator.handle_event(&event);
        let result = counts(&mut aggregator);
        assert_eq!(result["ExitStreamCount"].bins[0].count, BigInt::from(0));
    }

    #[test]
    fn entry_circuits_track_client_ips_across_rotations() {
        let mut aggregator = test_aggregator();
        let make_event = |ip: &str, cells: u64, start: f64| {
            parse_tagged_event_line(&format!(
                "650 PRIVCOUNT_CIRCUIT_ENDED ChanID=1 CircID=9 CellsIn={cells} CellsOut=0 \
                 TimeStart={start} TimeEnd={} PrevIP={ip} PrevIsClient=1 PrevIsRelay=0 \
                 NextIP=10.0.0.1 NextIsClient=0 NextIsRelay=1",
                start + 10.0
            ))
            .expect("event")
        };
        aggregator.handle_event(&make_event("203.0.113.5", 10, now_epoch()));
        aggregator.handle_event(&make_event("203.0.113.5", 10, now_epoch()));
        aggregator.handle_event(&make_event("203.0.113.6", 2, now_epoch()));

        // IPs only count once fully rotated out
        aggregator.rotate();
        aggregator.rotate();

        let result = counts(&mut aggregator);
        assert_eq!(result["EntryCircuitCount"].bins[0].count, BigInt::from(3));
        assert_eq!(
            result["EntryCircuitActiveCount"].bins[0].count,
            BigInt::from(2)
        );
        assert_eq!(result["EntryClientIPCount"].bins[0].count, BigInt::from(2));
        assert_eq!(
            result["EntryClientIPActiveCount"].bins[0].count,
            BigInt::from(1)
        );
        assert_eq!(
            result["EntryClientIPInactiveCount"].bins[0].count,
            BigInt::from(1)
        );
    }

    #[test]
    fn fail_closed_without_noise_weight() {
        let mut weights = NoiseWeightConfig::new();
        weights.insert("OTHERFP".into(), 1.0);
        let mut aggregator = Aggregator::new(
            &test_counters(),
            &["sk1".to_string()],
            weights,
            Some("FP1".into()),
            None,
        )
        .expect("aggregator");
        assert!(!aggregator.generate_noise());
        assert!(!aggregator.is_counting());
        assert!(aggregator.stop(true).is_none());
    }
}
