//! Runtime error type.

use std::io;

use thiserror::Error;
use vat_core::VatError;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The vat core refused a delivery or a build step.
    #[error(transparent)]
    Vat(#[from] VatError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A transcript frame could not be decoded.
    #[error("transcript decode error: {0}")]
    Decode(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sequence violation: expected {expected}, got {got}")]
    SequenceViolation { expected: u64, got: u64 },

    /// Two replays of the same transcript produced different effects.
    #[error("replay is not deterministic: diverged at effect {first_divergence:?} ({hash_a} vs {hash_b})")]
    Nondeterministic { first_divergence: Option<usize>, hash_a: String, hash_b: String },

    /// A snapshot disagrees with its own content or with replay.
    #[error("snapshot mismatch at sequence {sequence}: {detail}")]
    SnapshotMismatch { sequence: u64, detail: String },
}

impl From<prost::DecodeError> for RuntimeError {
    fn from(err: prost::DecodeError) -> Self {
        RuntimeError::Decode(err.to_string())
    }
}
