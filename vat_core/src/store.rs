//! Vat core - Durable Backing Store
//!
//! Opaque key → serialized-state map. Only the virtual object cache calls
//! it. Both operations are synchronous and durable on return.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::effects::{Effect, EffectLog};
use crate::error::{Result, VatError};
use crate::vref::VatRef;

pub trait BackingStore {
    fn fetch(&mut self, key: &str) -> Result<Option<String>>;
    fn store(&mut self, key: &str, value: String) -> Result<()>;
}

/// Store key holding the state of a virtual object.
pub fn state_key(vref: &VatRef) -> String {
    format!("vom.{vref}")
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<String, String>,
    fail_stores: bool,
}

/// In-memory store. Clones share the same map, so a test can keep a handle
/// while the cache owns another. Every call is recorded in the effect log.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Rc<RefCell<Inner>>,
    log: EffectLog,
}

impl MemoryStore {
    pub fn new(log: EffectLog) -> Self {
        Self { inner: Rc::default(), log }
    }

    pub fn with_data(log: EffectLog, data: BTreeMap<String, String>) -> Self {
        let store = Self::new(log);
        store.inner.borrow_mut().data = data;
        store
    }

    /// Make every subsequent `store` fail.
    pub fn fail_stores(&self, fail: bool) {
        self.inner.borrow_mut().fail_stores = fail;
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.borrow().data.get(key).cloned()
    }

    pub fn contents(&self) -> BTreeMap<String, String> {
        self.inner.borrow().data.clone()
    }

    pub fn log(&self) -> &EffectLog {
        &self.log
    }
}

impl BackingStore for MemoryStore {
    fn fetch(&mut self, key: &str) -> Result<Option<String>> {
        let value = self.inner.borrow().data.get(key).cloned();
        self.log.push(Effect::Fetch { key: key.to_string(), value: value.clone() });
        Ok(value)
    }

    fn store(&mut self, key: &str, value: String) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_stores {
            return Err(VatError::Store {
                key: key.to_string(),
                detail: "store disabled".to_string(),
            });
        }
        self.log.push(Effect::Store { key: key.to_string(), value: value.clone() });
        inner.data.insert(key.to_string(), value);
        Ok(())
    }
}
