//! Vat core - Error Type
//!
//! One error enum for everything the core can report to its caller.
//! Local usage errors are raised before any syscall is attempted.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VatError>;

/// All failures surfaced by the vat core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VatError {
    /// A ref string did not match `<o|p|d><+|-><id>[/<sub>]`.
    #[error("malformed vref {vref:?}: {detail}")]
    MalformedRef { vref: String, detail: String },

    /// A ref of the wrong kind was supplied.
    #[error("vref {vref} is not a {expected}")]
    WrongRefKind { vref: String, expected: &'static str },

    /// The kernel mentioned a promise this vat has no record of.
    #[error("unknown promise {vpid}")]
    UnknownPromise { vpid: String },

    /// A vat-allocated object ref that this vat never allocated.
    #[error("vref {vref} was not allocated by this vat")]
    UnknownObject { vref: String },

    /// Resolution attempted on a promise this vat does not decide.
    #[error("vat is not the decider of {promise}")]
    NotDecider { promise: String },

    /// Resolution attempted on a promise that already settled.
    #[error("{promise} has already been resolved")]
    AlreadyResolved { promise: String },

    /// A message was sent to a promise that resolved to plain data.
    #[error("data is not callable: cannot send {method} to {target}")]
    NotCallable { target: String, method: String },

    /// A message was sent to a rejected promise; carries the rejection body.
    #[error("cannot send {method} to rejected promise: {reason}")]
    Rejected { method: String, reason: String },

    /// `call_now` arguments contained a promise.
    #[error("device call {method} arguments cannot include a promise")]
    PromiseToDevice { method: String },

    /// A device reported an error through `call_now`.
    #[error("device error: {0}")]
    Device(String),

    /// Every cache slot eligible for eviction is pinned.
    #[error("cache overflowed with objects being initialized")]
    CacheOverflow,

    /// The backing store has no state for a virtual object.
    #[error("no stored state for virtual object {vref}")]
    MissingState { vref: String },

    /// A virtual object property that was never initialised.
    #[error("virtual object {vref} has no property {prop:?}")]
    NoSuchProperty { vref: String, prop: String },

    /// The backing store failed a fetch or store.
    #[error("backing store failure on {key}: {detail}")]
    Store { key: String, detail: String },

    /// CapData could not be encoded or decoded.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// The kernel broke the dispatch protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No object answers to the requested method.
    #[error("{target} has no method {method:?}")]
    NoSuchMethod { target: String, method: String },

    /// Application code raised an error.
    #[error("{0}")]
    App(String),

    /// Configuration failed validation.
    #[error("invalid vat config: {0}")]
    Config(String),
}

impl VatError {
    /// Errors that abort the current crank instead of rejecting a result
    /// promise: durability and cache consistency failures, and kernel
    /// protocol violations.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VatError::Store { .. }
                | VatError::CacheOverflow
                | VatError::MissingState { .. }
                | VatError::Protocol(_)
        )
    }
}

impl From<serde_json::Error> for VatError {
    fn from(err: serde_json::Error) -> Self {
        VatError::Marshal(err.to_string())
    }
}
