//! End-to-end secure counting: one data collector, two share keepers, and a
//! tally, with the blinding shares carried through the hybrid encryption
//! layer exactly as they would travel via the tally server.

use std::collections::BTreeMap;

use num_bigint::BigInt;
use num_traits::Zero;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;

use privcount_core::counter::{BlindingShare, Counts};
use privcount_core::sampling::counter_modulus;
use privcount_core::{crypto, Bin, CounterSpec, CountersConfig, SecureCounters, SINGLE_BIN};

fn scenario_config() -> CountersConfig {
    let mut config = CountersConfig::new();
    config.insert(
        "ExitStreamByteCount".into(),
        CounterSpec {
            bins: Some(vec![
                Bin::new(0.0, 512.0),
                Bin::new(512.0, 1024.0),
                Bin::new(1024.0, f64::INFINITY),
            ]),
            sigma: Some(0.0),
        },
    );
    config.insert(
        "ZeroCount".into(),
        CounterSpec {
            bins: Some(vec![Bin::new(0.0, f64::INFINITY)]),
            sigma: Some(0.0),
        },
    );
    config
}

fn bin_counts(counts: &Counts, name: &str) -> Vec<BigInt> {
    counts[name].bins.iter().map(|b| b.count.clone()).collect()
}

/// Run the full scenario and return every party's detached counts.
fn run_round(increments: &[(f64, i64)]) -> Vec<Counts> {
    let config = scenario_config();
    let modulus = counter_modulus();

    let mut dc = SecureCounters::new(&config, modulus, true).expect("dc counters");
    let mut sk1 = SecureCounters::new(&config, modulus, false).expect("sk1 counters");
    let mut sk2 = SecureCounters::new(&config, modulus, false).expect("sk2 counters");

    dc.generate_blinding_shares(&["sk1".into(), "sk2".into()]);
    let shares = dc.detach_blinding_shares().expect("shares");
    assert!(sk1.import_blinding_share(&shares["sk1"]));
    assert!(sk2.import_blinding_share(&shares["sk2"]));

    dc.generate_noise(1.0).expect("noise");

    for (bin_key, inc) in increments {
        dc.increment("ExitStreamByteCount", *bin_key, *inc);
    }

    vec![
        dc.detach_counts().expect("dc counts"),
        sk1.detach_counts().expect("sk1 counts"),
        sk2.detach_counts().expect("sk2 counts"),
    ]
}

fn tally(all_counts: &[Counts]) -> Counts {
    let mut tally =
        SecureCounters::new(&scenario_config(), counter_modulus(), false).expect("tally");
    assert!(tally.tally_counters(all_counts));
    tally.detach_counts().expect("tally counts")
}

#[test]
fn tally_recovers_true_counts() {
    let mut increments = Vec::new();
    increments.extend(std::iter::repeat((0.0, 1)).take(500));
    increments.extend(std::iter::repeat((600.0, 1)).take(250));
    increments.extend(std::iter::repeat((2047.0, 1)).take(250));

    let all = run_round(&increments);

    // blinded snapshots must not reveal the counts
    let blinded = bin_counts(&all[0], "ExitStreamByteCount");
    assert_ne!(blinded, vec![BigInt::from(500), BigInt::from(250), BigInt::from(250)]);

    let result = tally(&all);
    assert_eq!(
        bin_counts(&result, "ExitStreamByteCount"),
        vec![BigInt::from(500), BigInt::from(250), BigInt::from(250)]
    );
    assert_eq!(bin_counts(&result, "ZeroCount"), vec![BigInt::zero()]);
}

#[test]
fn tally_is_order_independent() {
    let increments = vec![(0.0, 3), (600.0, 7)];
    let all = run_round(&increments);

    let expected = tally(&all);
    for permutation in [[0, 1, 2], [1, 2, 0], [2, 1, 0], [0, 2, 1]] {
        let reordered: Vec<Counts> =
            permutation.iter().map(|&i| all[i].clone()).collect();
        assert_eq!(tally(&reordered), expected);
    }
}

#[test]
fn shares_cancel_before_any_events() {
    // without increments or noise, the sum of all parties is the zero vector
    let all = run_round(&[]);
    let result = tally(&all);
    assert!(bin_counts(&result, "ExitStreamByteCount")
        .iter()
        .all(BigInt::is_zero));
    assert!(bin_counts(&result, "ZeroCount").iter().all(BigInt::is_zero));
}

#[test]
fn negative_increments_cancel_in_the_tally() {
    let mut increments = vec![(0.0, 1), (0.0, -1)];
    increments.extend(std::iter::repeat((600.0, 1)).take(4));
    let all = run_round(&increments);
    let result = tally(&all);
    assert_eq!(
        bin_counts(&result, "ExitStreamByteCount"),
        vec![BigInt::zero(), BigInt::from(4), BigInt::zero()]
    );
}

#[test]
fn shares_survive_hybrid_encryption() {
    let config = scenario_config();
    let modulus = counter_modulus();

    // each SK holds a long-term keypair; small keys keep the test fast
    let sk1_key = RsaPrivateKey::new(&mut OsRng, 1024).expect("keygen");
    let sk2_key = RsaPrivateKey::new(&mut OsRng, 1024).expect("keygen");

    let mut dc = SecureCounters::new(&config, modulus, true).expect("dc counters");
    let mut sk1 = SecureCounters::new(&config, modulus, false).expect("sk1 counters");
    let mut sk2 = SecureCounters::new(&config, modulus, false).expect("sk2 counters");

    dc.generate_blinding_shares(&["sk1".into(), "sk2".into()]);
    let shares = dc.detach_blinding_shares().expect("shares");

    // the DC encrypts each share to its SK; the TS only ever relays these
    let encrypted: BTreeMap<String, privcount_core::crypto::EncryptedPayload> = shares
        .iter()
        .map(|(uid, share)| {
            let key = if uid == "sk1" { &sk1_key } else { &sk2_key };
            let payload =
                crypto::encrypt(&key.to_public_key(), &share.secret).expect("encrypt share");
            (uid.clone(), payload)
        })
        .collect();

    dc.generate_noise(1.0).expect("noise");
    dc.increment("ExitStreamByteCount", 100.0, 42);
    dc.increment("ZeroCount", SINGLE_BIN, 7);

    for (uid, sk, key) in [("sk1", &mut sk1, &sk1_key), ("sk2", &mut sk2, &sk2_key)] {
        let secret: Counts = crypto::decrypt(key, &encrypted[uid]).expect("decrypt share");
        let share = BlindingShare {
            sk_uid: uid.to_string(),
            dc_name: Some("dc1".into()),
            secret,
        };
        assert!(sk.import_blinding_share(&share));
    }

    let all = vec![
        dc.detach_counts().expect("dc counts"),
        sk1.detach_counts().expect("sk1 counts"),
        sk2.detach_counts().expect("sk2 counts"),
    ];
    let result = tally(&all);
    assert_eq!(
        bin_counts(&result, "ExitStreamByteCount"),
        vec![BigInt::from(42), BigInt::zero(), BigInt::zero()]
    );
    assert_eq!(bin_counts(&result, "ZeroCount"), vec![BigInt::from(7)]);
}

#[test]
fn counts_survive_json_transport() {
    // STOP responses carry counts as JSON; magnitudes above 2^64 must be
    // preserved exactly
    let all = run_round(&[(0.0, i64::MAX), (0.0, i64::MAX)]);
    let mut transported = Vec::new();
    for counts in &all {
        let json = serde_json::to_string(counts).expect("serialize");
        let back: Counts = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(&back, counts);
        transported.push(back);
    }
    let result = tally(&transported);
    let expected = BigInt::from(i64::MAX) * 2;
    assert_eq!(
        bin_counts(&result, "ExitStreamByteCount")[0],
        expected
    );
}
