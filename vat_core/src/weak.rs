//! Vat core - Weak Reference Bridge
//!
//! Application code holds capabilities as `Wrapper`s (`Rc<Representative>`).
//! The identity table maps each ref to a `Weak` pointer at its single
//! canonical wrapper; it never keeps a wrapper alive.
//!
//! Weak collections are keyed by the wrapper's ref, not its allocation, so a
//! virtual object or import whose wrapper is reclaimed and later re-minted is
//! still found. A lookup only matches the canonical wrapper currently live
//! for that ref. Ceasing recognition of a ref drops it from every collection.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::error::{Result, VatError};
use crate::vref::VatRef;

/// In-memory stand-in for a ref: a presence, local object, virtual object
/// representative or device node.
#[derive(Debug, PartialEq, Eq)]
pub struct Representative {
    vref: VatRef,
}

impl Representative {
    pub fn vref(&self) -> &VatRef {
        &self.vref
    }

    /// A wrapper that is not registered in any identity table. Never
    /// matches a weak-collection lookup.
    pub fn pro_forma(vref: VatRef) -> Wrapper {
        Rc::new(Representative { vref })
    }
}

pub type Wrapper = Rc<Representative>;

/// Handle naming one weak collection inside a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WeakCollectionId(usize);

#[derive(Debug)]
enum Collection<V> {
    Map(BTreeMap<VatRef, V>),
    Set(BTreeSet<VatRef>),
}

impl<V> Collection<V> {
    fn remove(&mut self, vref: &VatRef) -> bool {
        match self {
            Collection::Map(m) => m.remove(vref).is_some(),
            Collection::Set(s) => s.remove(vref),
        }
    }

    fn len(&self) -> usize {
        match self {
            Collection::Map(m) => m.len(),
            Collection::Set(s) => s.len(),
        }
    }
}

/// Identity table plus every ref-keyed weak collection of one vat.
#[derive(Debug)]
pub struct WeakRefBridge<V> {
    live: BTreeMap<VatRef, Weak<Representative>>,
    collections: Vec<Collection<V>>,
    recognizers: BTreeMap<VatRef, BTreeSet<WeakCollectionId>>,
}

impl<V> Default for WeakRefBridge<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> WeakRefBridge<V> {
    pub fn new() -> Self {
        Self {
            live: BTreeMap::new(),
            collections: Vec::new(),
            recognizers: BTreeMap::new(),
        }
    }

    // -- identity table --

    /// Return the live canonical wrapper for `vref`, minting one if the
    /// previous wrapper was reclaimed or none existed.
    pub fn mint(&mut self, vref: &VatRef) -> Wrapper {
        if let Some(existing) = self.live_wrapper(vref) {
            return existing;
        }
        let wrapper = Rc::new(Representative { vref: vref.clone() });
        self.live.insert(vref.clone(), Rc::downgrade(&wrapper));
        debug!(vref = %vref, "wrapper minted");
        wrapper
    }

    pub fn live_wrapper(&self, vref: &VatRef) -> Option<Wrapper> {
        self.live.get(vref).and_then(Weak::upgrade)
    }

    /// True iff `wrapper` is the canonical wrapper currently live for its ref.
    pub fn is_canonical(&self, wrapper: &Wrapper) -> bool {
        self.live_wrapper(wrapper.vref())
            .map_or(false, |current| Rc::ptr_eq(&current, wrapper))
    }

    /// Drop identity entries whose wrapper has been reclaimed.
    ///
    /// Re-mintable refs keep their collection memberships; any other ref can
    /// never be presented again, so its memberships are deleted too.
    /// Returns the swept refs in ref order.
    pub fn sweep(&mut self) -> Vec<VatRef> {
        let dead: Vec<VatRef> = self
            .live
            .iter()
            .filter(|(_, weak)| weak.strong_count() == 0)
            .map(|(vref, _)| vref.clone())
            .collect();
        for vref in &dead {
            self.live.remove(vref);
            if !vref.is_remintable() {
                self.cease_recognition(vref);
            }
        }
        dead
    }

    /// Delete the identity entry for `vref` and its membership in every
    /// collection. Returns how many collections held it.
    pub fn cease_recognition(&mut self, vref: &VatRef) -> usize {
        self.live.remove(vref);
        let Some(ids) = self.recognizers.remove(vref) else {
            return 0;
        };
        for id in &ids {
            self.collections[id.0].remove(vref);
        }
        debug!(vref = %vref, collections = ids.len(), "recognition ceased");
        ids.len()
    }

    // -- collections --

    pub fn make_weak_map(&mut self) -> WeakCollectionId {
        self.collections.push(Collection::Map(BTreeMap::new()));
        WeakCollectionId(self.collections.len() - 1)
    }

    pub fn make_weak_set(&mut self) -> WeakCollectionId {
        self.collections.push(Collection::Set(BTreeSet::new()));
        WeakCollectionId(self.collections.len() - 1)
    }

    pub fn set(&mut self, id: WeakCollectionId, key: &Wrapper, value: V) -> Result<()> {
        let vref = self.insist_key(key)?;
        match self.collection_mut(id)? {
            Collection::Map(m) => {
                m.insert(vref.clone(), value);
            }
            Collection::Set(_) => return Err(not_a("map", id)),
        }
        self.recognizers.entry(vref).or_default().insert(id);
        Ok(())
    }

    pub fn add(&mut self, id: WeakCollectionId, key: &Wrapper) -> Result<()> {
        let vref = self.insist_key(key)?;
        match self.collection_mut(id)? {
            Collection::Set(s) => {
                s.insert(vref.clone());
            }
            Collection::Map(_) => return Err(not_a("set", id)),
        }
        self.recognizers.entry(vref).or_default().insert(id);
        Ok(())
    }

    pub fn get(&self, id: WeakCollectionId, key: &Wrapper) -> Option<&V> {
        if !self.is_canonical(key) {
            return None;
        }
        match self.collections.get(id.0)? {
            Collection::Map(m) => m.get(key.vref()),
            Collection::Set(_) => None,
        }
    }

    pub fn has(&self, id: WeakCollectionId, key: &Wrapper) -> bool {
        if !self.is_canonical(key) {
            return false;
        }
        match self.collections.get(id.0) {
            Some(Collection::Map(m)) => m.contains_key(key.vref()),
            Some(Collection::Set(s)) => s.contains(key.vref()),
            None => false,
        }
    }

    pub fn delete(&mut self, id: WeakCollectionId, key: &Wrapper) -> bool {
        if !self.is_canonical(key) {
            return false;
        }
        let vref = key.vref();
        let removed = match self.collections.get_mut(id.0) {
            Some(c) => c.remove(vref),
            None => false,
        };
        if removed {
            if let Some(ids) = self.recognizers.get_mut(vref) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.recognizers.remove(vref);
                }
            }
        }
        removed
    }

    pub fn len(&self, id: WeakCollectionId) -> usize {
        self.collections.get(id.0).map_or(0, Collection::len)
    }

    /// Number of collections that currently hold `vref`.
    pub fn collections_for(&self, vref: &VatRef) -> usize {
        self.recognizers.get(vref).map_or(0, BTreeSet::len)
    }

    fn insist_key(&self, key: &Wrapper) -> Result<VatRef> {
        if self.is_canonical(key) {
            Ok(key.vref().clone())
        } else {
            Err(VatError::UnknownObject {
                vref: key.vref().to_string(),
            })
        }
    }

    fn collection_mut(&mut self, id: WeakCollectionId) -> Result<&mut Collection<V>> {
        self.collections
            .get_mut(id.0)
            .ok_or_else(|| VatError::Protocol(format!("no weak collection #{}", id.0)))
    }
}

fn not_a(expected: &str, id: WeakCollectionId) -> VatError {
    VatError::Protocol(format!("weak collection #{} is not a {}", id.0, expected))
}
