//! Session manager: a persistent vat with apply-before-persist semantics.
//!
//! Each session gets its own directory with a delivery transcript, a
//! vatstore file and snapshots.
//!
//! Apply-before-persist order:
//!   1. vat.run_crank(delivery)       may fail; nothing is persisted then
//!   2. transcript.append(delivery)   only if step 1 succeeded
//!   3. snapshot if interval reached
//!
//! The transcript is the source of truth. Opening a session replays it
//! into a fresh vat and a reset vatstore, and a failed crank rolls the
//! in-memory vat back the same way.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vat_core::hashing::canonical_hash;
use vat_core::{Delivery, Effect, EffectLog, LiveSlots, RecordingSyscall, VatConfig};

use crate::error::{Result, RuntimeError};
use crate::replay::{self, Replayed, RootBuilder};
use crate::snapshot;
use crate::transcript_store::TranscriptStore;
use crate::vatstore::FileVatStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Snapshot after every N-th delivery; 0 disables snapshots.
    pub snapshot_interval: u64,
    pub vat: VatConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { snapshot_interval: 0, vat: VatConfig::default() }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.vat.validate()?;
        Ok(config)
    }
}

/// One vat incarnation and the handles the session keeps on it.
struct Incarnation {
    vat: LiveSlots,
    log: EffectLog,
    vatstore: FileVatStore,
}

/// An isolated vat session with its own transcript and vatstore.
pub struct Session {
    session_id: String,
    dir: PathBuf,
    config: SessionConfig,
    build: Rc<RootBuilder>,
    transcript: TranscriptStore,
    current: Incarnation,
}

impl Session {
    /// Open (or create) a session under `base_dir`.
    ///
    /// Directory structure:
    ///   <base_dir>/<session_id>/transcript.log
    ///   <base_dir>/<session_id>/vatstore.json
    ///   <base_dir>/<session_id>/snapshots/
    pub fn open(
        base_dir: &Path,
        session_id: &str,
        config: SessionConfig,
        build: Rc<RootBuilder>,
    ) -> Result<Self> {
        config.vat.validate()?;
        let dir = base_dir.join(session_id);
        let transcript = TranscriptStore::open(&dir.join("transcript.log"))?;
        let deliveries = transcript.load_deliveries()?;
        let current = incarnate(&dir, &config.vat, &*build, &deliveries)?;
        info!(session = session_id, replayed = deliveries.len(), "session opened");
        Ok(Self {
            session_id: session_id.to_string(),
            dir,
            config,
            build,
            transcript,
            current,
        })
    }

    /// Run one delivery as a crank, then persist it. Returns its sequence.
    ///
    /// A failed crank is not persisted; the vat is rebuilt from the
    /// transcript and the crank's error is returned.
    pub fn deliver(&mut self, delivery: &Delivery) -> Result<u64> {
        if let Err(err) = self.current.vat.run_crank(delivery) {
            warn!(session = %self.session_id, error = %err, "crank failed; rolling back");
            let deliveries = self.transcript.load_deliveries()?;
            self.current = incarnate(&self.dir, &self.config.vat, &*self.build, &deliveries)?;
            return Err(err.into());
        }

        let sequence = self.transcript.append(delivery)?;

        let interval = self.config.snapshot_interval;
        if interval > 0 && sequence % interval == 0 {
            let hash = self.current_hash()?;
            snapshot::save_snapshot(&self.snapshot_dir(), sequence, &self.current.vatstore.contents(), &hash)?;
        }
        debug!(session = %self.session_id, sequence, "delivery persisted");
        Ok(sequence)
    }

    /// Replay the whole transcript into a throwaway vat.
    pub fn replay_full(&self) -> Result<Replayed> {
        let deliveries = self.transcript.load_deliveries()?;
        replay::rebuild_state(&self.config.vat, &deliveries, &*self.build)
    }

    /// Check the latest snapshot against a replay of the transcript up to
    /// its sequence. Returns the verified sequence, or `None` if there is
    /// no snapshot.
    pub fn verify_latest_snapshot(&self) -> Result<Option<u64>> {
        let Some(snap) = snapshot::load_latest_snapshot(&self.snapshot_dir())? else {
            return Ok(None);
        };
        let vatstore = snapshot::restore_vatstore(&snap)?;
        let deliveries = self.transcript.load_deliveries()?;
        let upto = usize::try_from(snap.sequence).unwrap_or(usize::MAX);
        let prefix = deliveries.get(..upto).ok_or_else(|| RuntimeError::SnapshotMismatch {
            sequence: snap.sequence,
            detail: format!("transcript ends at {}", deliveries.len()),
        })?;

        let replayed = replay::rebuild_state(&self.config.vat, prefix, &*self.build)?;
        if replayed.hash != snap.effects_hash {
            return Err(RuntimeError::SnapshotMismatch {
                sequence: snap.sequence,
                detail: format!("effects hash {} != {}", replayed.hash, snap.effects_hash),
            });
        }
        if replayed.vatstore != vatstore {
            return Err(RuntimeError::SnapshotMismatch {
                sequence: snap.sequence,
                detail: "vatstore content differs from replay".into(),
            });
        }
        Ok(Some(snap.sequence))
    }

    /// Canonical hash of every effect of the current incarnation.
    pub fn current_hash(&self) -> Result<String> {
        Ok(canonical_hash(&self.current.log.snapshot())?)
    }

    pub fn effects(&self) -> Vec<Effect> {
        self.current.log.snapshot()
    }

    pub fn vat(&mut self) -> &mut LiveSlots {
        &mut self.current.vat
    }

    pub fn vatstore(&self) -> &FileVatStore {
        &self.current.vatstore
    }

    pub fn current_sequence(&self) -> u64 {
        self.transcript.last_sequence()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.dir.join("snapshots")
    }
}

/// Build a fresh vat over a reset vatstore and run `deliveries` through it.
fn incarnate(
    dir: &Path,
    config: &VatConfig,
    build: &RootBuilder,
    deliveries: &[Delivery],
) -> Result<Incarnation> {
    let log = EffectLog::new();
    let vatstore = FileVatStore::reset(&dir.join("vatstore.json"), log.clone())?;
    let mut vat = LiveSlots::build(
        config.clone(),
        Box::new(RecordingSyscall::new(log.clone())),
        Box::new(vatstore.clone()),
        |vat| build(vat),
    )?;
    for delivery in deliveries {
        vat.run_crank(delivery)?;
    }
    Ok(Incarnation { vat, log, vatstore })
}
