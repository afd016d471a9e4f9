#![forbid(unsafe_code)]

//! Vat runtime: persistence and replay around the vat core.
//!
//! Delivery transcripts, a file-backed vatstore, snapshots, persistent
//! sessions and drift detection. No dispatch logic lives here; every
//! crank is delegated to `vat_core::LiveSlots`.

pub mod error;
pub mod proto_types;
pub mod proto_bridge;
pub mod transcript_store;
pub mod vatstore;
pub mod replay;
pub mod snapshot;
pub mod session;
pub mod drift;

pub use error::{Result, RuntimeError};
pub use replay::RootBuilder;
pub use session::{Session, SessionConfig};
