//! Replay orchestrator: rebuild a vat from its delivery transcript.
//!
//! Delegates all dispatch to `vat_core::LiveSlots`. A fresh vat with an
//! in-memory store is built and every delivery runs as one crank, in
//! order. No shortcuts, no cached state.

use std::collections::BTreeMap;

use tracing::debug;
use vat_core::hashing::canonical_hash;
use vat_core::{Delivery, Effect, EffectLog, LiveSlots, MemoryStore, RecordingSyscall, VatConfig, VatObject};

use crate::error::Result;

/// Builds a vat's root object. Called once per vat incarnation, so it
/// must be repeatable for replay to be deterministic.
pub type RootBuilder = dyn Fn(&mut LiveSlots) -> vat_core::Result<Box<dyn VatObject>>;

/// Everything a replay leaves behind.
#[derive(Debug, Clone)]
pub struct Replayed {
    pub effects: Vec<Effect>,
    /// Canonical hash of `effects`.
    pub hash: String,
    /// Store contents after the last crank.
    pub vatstore: BTreeMap<String, String>,
}

/// Run `deliveries` through a fresh vat.
///
/// 1. Build the vat over an empty in-memory store
/// 2. Run each delivery as one crank; the first failure aborts the replay
/// 3. Return the effect log, its canonical hash and the final store
pub fn rebuild_state(config: &VatConfig, deliveries: &[Delivery], build: &RootBuilder) -> Result<Replayed> {
    let log = EffectLog::new();
    let store = MemoryStore::new(log.clone());
    let mut vat = LiveSlots::build(
        config.clone(),
        Box::new(RecordingSyscall::new(log.clone())),
        Box::new(store.clone()),
        |vat| build(vat),
    )?;
    for delivery in deliveries {
        vat.run_crank(delivery)?;
    }
    let effects = log.snapshot();
    let hash = canonical_hash(&effects)?;
    debug!(vat = %config.vat_id, cranks = deliveries.len(), effects = effects.len(), "replay complete");
    Ok(Replayed { effects, hash, vatstore: store.contents() })
}

/// Replay and return the effect log with its hash.
pub fn rebuild(config: &VatConfig, deliveries: &[Delivery], build: &RootBuilder) -> Result<(Vec<Effect>, String)> {
    let replayed = rebuild_state(config, deliveries, build)?;
    Ok((replayed.effects, replayed.hash))
}

pub fn rebuild_hash(config: &VatConfig, deliveries: &[Delivery], build: &RootBuilder) -> Result<String> {
    Ok(rebuild_state(config, deliveries, build)?.hash)
}
