#![forbid(unsafe_code)]

/// Core v1. Any change to effect ordering requires core v2.
pub const CORE_VERSION: u32 = 1;

pub mod error;
pub mod vref;
pub mod capdata;
pub mod effects;
pub mod store;
pub mod cache;
pub mod weak;
pub mod promise;
pub mod syscall;
pub mod config;
pub mod hashing;
pub mod liveslots;

pub use capdata::{CapData, Value};
pub use config::VatConfig;
pub use effects::{Effect, EffectLog};
pub use error::{Result, VatError};
pub use liveslots::{KindId, LiveSlots, VatObject, VirtualKind};
pub use promise::{PromiseId, PromiseStatus, Resolution};
pub use store::{BackingStore, MemoryStore};
pub use syscall::{Delivery, RecordingSyscall, Syscall, VatResolution};
pub use vref::{Direction, RefKind, VatRef};
pub use weak::{Representative, WeakCollectionId, WeakRefBridge, Wrapper};
