//! Integration tests for vat_runtime.
//!
//! All tests use temporary directories for isolation. The vat under test
//! is a small ledger: its root opens virtual accounts, and each account
//! keeps a balance in the vatstore.

use std::rc::Rc;

use vat_core::{
    CapData, Delivery, Effect, LiveSlots, Result as VatResult, Value, VatConfig, VatError,
    VatObject, VatRef, VirtualKind, Wrapper,
};
use vat_runtime::drift;
use vat_runtime::replay;
use vat_runtime::snapshot;
use vat_runtime::transcript_store::TranscriptStore;
use vat_runtime::{RootBuilder, RuntimeError, Session, SessionConfig};

struct Account;

impl VirtualKind for Account {
    fn tag(&self) -> &str {
        "account"
    }

    fn invoke(&self, vat: &mut LiveSlots, this: &Wrapper, method: &str, args: Vec<Value>) -> VatResult<Value> {
        let balance = vat.vo_get(this, "balance")?.as_int().unwrap_or(0);
        match method {
            "deposit" => {
                let amount = args.first().and_then(Value::as_int).unwrap_or(0);
                vat.vo_set(this, "balance", Value::Int(balance + amount))?;
                Ok(Value::Int(balance + amount))
            }
            "balance" => Ok(Value::Int(balance)),
            other => Err(VatError::NoSuchMethod { target: "account".into(), method: other.into() }),
        }
    }
}

fn ledger() -> Rc<RootBuilder> {
    Rc::new(|vat: &mut LiveSlots| -> VatResult<Box<dyn VatObject>> {
        let kind = vat.define_kind(Rc::new(Account));
        Ok(Box::new(move |vat: &mut LiveSlots, method: &str, _: Vec<Value>| -> VatResult<Value> {
            match method {
                "open" => {
                    let initial = [("balance".to_string(), Value::Int(0))].into_iter().collect();
                    Ok(Value::Remotable(vat.make_virtual(kind, initial)?))
                }
                other => Err(VatError::NoSuchMethod { target: "ledger".into(), method: other.into() }),
            }
        }))
    })
}

fn r(s: &str) -> VatRef {
    s.parse().unwrap()
}

fn msg(target: &str, method: &str, body: &str, result: &str) -> Delivery {
    Delivery::Message {
        target: r(target),
        method: method.into(),
        args: CapData::new(body, vec![]),
        result: Some(r(result)),
    }
}

/// Five accounts (one more than the cache holds), then deposits that
/// fetch evicted accounts back.
fn workload() -> Vec<Delivery> {
    let mut deliveries: Vec<Delivery> = (1..=5).map(|i| msg("o+0", "open", "[]", &format!("p-{i}"))).collect();
    deliveries.push(msg("o+1/1", "deposit", "[10]", "p-6"));
    deliveries.push(msg("o+1/2", "deposit", "[5]", "p-7"));
    deliveries.push(msg("o+1/1", "deposit", "[1]", "p-8"));
    deliveries
}

fn config(snapshot_interval: u64) -> SessionConfig {
    SessionConfig { snapshot_interval, vat: VatConfig::default() }
}

// ─────────────────────────────────────────────────────────────
// Test 1: session_reopens_to_the_same_state
// ─────────────────────────────────────────────────────────────

#[test]
fn session_reopens_to_the_same_state() {
    let dir = tempfile::tempdir().unwrap();
    let (hash, contents) = {
        let mut session = Session::open(dir.path(), "ledger", config(0), ledger()).unwrap();
        for (i, delivery) in workload().iter().enumerate() {
            assert_eq!(session.deliver(delivery).unwrap(), i as u64 + 1);
        }
        assert!(session.vatstore().get("vom.o+1/1").is_some(), "evicted account was written back");
        (session.current_hash().unwrap(), session.vatstore().contents())
    };

    let session = Session::open(dir.path(), "ledger", config(0), ledger()).unwrap();
    assert_eq!(session.current_sequence(), workload().len() as u64);
    assert_eq!(session.current_hash().unwrap(), hash);
    assert_eq!(session.vatstore().contents(), contents);
}

// ─────────────────────────────────────────────────────────────
// Test 2: replay_matches_the_live_session
// ─────────────────────────────────────────────────────────────

#[test]
fn replay_matches_the_live_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::open(dir.path(), "ledger", config(0), ledger()).unwrap();
    for delivery in &workload() {
        session.deliver(delivery).unwrap();
    }

    let replayed = session.replay_full().unwrap();
    assert_eq!(replayed.hash, session.current_hash().unwrap());
    assert_eq!(replayed.effects, session.effects());
    assert_eq!(replayed.vatstore, session.vatstore().contents());

    // The third deposit saw the first one's balance.
    let last = replayed.effects.iter().rev().find(|e| e.is_syscall()).unwrap();
    assert_eq!(
        *last,
        Effect::Resolve {
            resolutions: vec![vat_core::VatResolution {
                vpid: r("p-8"),
                rejected: false,
                data: CapData::new("11", vec![]),
            }],
        }
    );
}

// ─────────────────────────────────────────────────────────────
// Test 3: replay_is_deterministic
// ─────────────────────────────────────────────────────────────

#[test]
fn replay_is_deterministic() {
    let build = ledger();
    let hash = drift::verify_determinism(&VatConfig::default(), &workload(), &*build).unwrap();
    assert_eq!(hash, replay::rebuild_hash(&VatConfig::default(), &workload(), &*build).unwrap());

    // A different cache size changes store traffic, and so the hash.
    let small = VatConfig { virtual_object_cache_size: 1, ..VatConfig::default() };
    let (effects_small, hash_small) = replay::rebuild(&small, &workload(), &*build).unwrap();
    let (effects, _) = replay::rebuild(&VatConfig::default(), &workload(), &*build).unwrap();
    assert_ne!(hash_small, hash);
    let report = drift::compare_effects(&effects, &effects_small);
    assert!(!report.is_identical());
    assert_eq!(report.kinds_a.get("resolve"), report.kinds_b.get("resolve"));
}

// ─────────────────────────────────────────────────────────────
// Test 4: failed_crank_is_not_persisted
// ─────────────────────────────────────────────────────────────

#[test]
fn failed_crank_is_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::open(dir.path(), "ledger", config(0), ledger()).unwrap();
    session.deliver(&msg("o+0", "open", "[]", "p-1")).unwrap();
    let before = session.current_hash().unwrap();

    let err = session.deliver(&msg("o+9", "open", "[]", "p-2")).unwrap_err();
    assert!(matches!(err, RuntimeError::Vat(VatError::UnknownObject { .. })));
    assert_eq!(session.current_sequence(), 1);
    assert_eq!(session.current_hash().unwrap(), before);

    // The session keeps going after the rollback.
    assert_eq!(session.deliver(&msg("o+1/1", "deposit", "[3]", "p-2")).unwrap(), 2);
    let transcript = TranscriptStore::open(&dir.path().join("ledger").join("transcript.log")).unwrap();
    assert_eq!(transcript.load_deliveries().unwrap().len(), 2);
}

// ─────────────────────────────────────────────────────────────
// Test 5: snapshots_verify_against_replay
// ─────────────────────────────────────────────────────────────

#[test]
fn snapshots_verify_against_replay() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::open(dir.path(), "ledger", config(2), ledger()).unwrap();
    for delivery in &workload()[..5] {
        session.deliver(delivery).unwrap();
    }

    let snap_dir = session.snapshot_dir();
    assert!(snapshot::load_snapshot(&snap_dir, 2).unwrap().is_some());
    let latest = snapshot::load_latest_snapshot(&snap_dir).unwrap().unwrap();
    assert_eq!(latest.sequence, 4);
    assert!(snapshot::verify_snapshot_hash(&latest));
    assert_eq!(session.verify_latest_snapshot().unwrap(), Some(4));

    // A snapshot whose effect hash disagrees with replay is refused.
    let contents = snapshot::restore_vatstore(&latest).unwrap();
    snapshot::save_snapshot(&snap_dir, 4, &contents, "not-a-hash").unwrap();
    assert!(matches!(
        session.verify_latest_snapshot(),
        Err(RuntimeError::SnapshotMismatch { sequence: 4, .. })
    ));
}

// ─────────────────────────────────────────────────────────────
// Test 6: sessions_are_isolated
// ─────────────────────────────────────────────────────────────

#[test]
fn sessions_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = Session::open(dir.path(), "a", config(0), ledger()).unwrap();
    let mut b = Session::open(dir.path(), "b", config(0), ledger()).unwrap();

    for delivery in &workload() {
        a.deliver(delivery).unwrap();
    }
    for delivery in &workload()[..2] {
        b.deliver(delivery).unwrap();
    }

    assert_eq!(a.current_sequence(), 8);
    assert_eq!(b.current_sequence(), 2);
    assert_ne!(a.current_hash().unwrap(), b.current_hash().unwrap());
    assert_eq!(
        b.current_hash().unwrap(),
        replay::rebuild_hash(&VatConfig::default(), &workload()[..2], &*ledger()).unwrap()
    );
    assert!(b.vatstore().contents().is_empty());
}

// ─────────────────────────────────────────────────────────────
// Test 7: session_config_parses_with_defaults
// ─────────────────────────────────────────────────────────────

#[test]
fn session_config_parses_with_defaults() {
    let parsed = SessionConfig::from_json(r#"{"snapshot_interval":10,"vat":{"vat_id":"v1"}}"#).unwrap();
    assert_eq!(parsed.snapshot_interval, 10);
    assert_eq!(parsed.vat.vat_id, "v1");
    assert_eq!(parsed.vat.virtual_object_cache_size, 3);

    assert!(matches!(SessionConfig::from_json(r#"{"interval":1}"#), Err(RuntimeError::Json(_))));
    assert!(matches!(
        SessionConfig::from_json(r#"{"vat":{"virtual_object_cache_size":0}}"#),
        Err(RuntimeError::Vat(VatError::Config(_)))
    ));
}
