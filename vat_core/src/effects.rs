//! Vat core - Effect Log
//!
//! Every externally observable effect of a vat, in program order: backing
//! store I/O and kernel-facing syscalls. Two runs over the same deliveries
//! must produce equal logs; `hashing::canonical_hash` condenses one.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::capdata::CapData;
use crate::syscall::VatResolution;
use crate::vref::VatRef;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    Fetch {
        key: String,
        value: Option<String>,
    },
    Store {
        key: String,
        value: String,
    },
    Send {
        target: VatRef,
        method: String,
        args: CapData,
        result: Option<VatRef>,
    },
    Subscribe {
        target: VatRef,
    },
    Resolve {
        resolutions: Vec<VatResolution>,
    },
    CallNow {
        target: VatRef,
        method: String,
        args: CapData,
    },
}

impl Effect {
    /// Short name used in logs and drift reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::Fetch { .. } => "fetch",
            Effect::Store { .. } => "store",
            Effect::Send { .. } => "send",
            Effect::Subscribe { .. } => "subscribe",
            Effect::Resolve { .. } => "resolve",
            Effect::CallNow { .. } => "call_now",
        }
    }

    pub fn is_syscall(&self) -> bool {
        !matches!(self, Effect::Fetch { .. } | Effect::Store { .. })
    }
}

/// Shared, append-only effect log. Clones write to the same log, so the
/// store and the syscall gateway interleave in true program order.
#[derive(Debug, Clone, Default)]
pub struct EffectLog {
    entries: Rc<RefCell<Vec<Effect>>>,
}

impl EffectLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, effect: Effect) {
        self.entries.borrow_mut().push(effect);
    }

    pub fn snapshot(&self) -> Vec<Effect> {
        self.entries.borrow().clone()
    }

    pub fn drain(&self) -> Vec<Effect> {
        std::mem::take(&mut *self.entries.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Syscalls only, dropping store I/O.
    pub fn syscalls(&self) -> Vec<Effect> {
        self.entries
            .borrow()
            .iter()
            .filter(|e| e.is_syscall())
            .cloned()
            .collect()
    }
}
