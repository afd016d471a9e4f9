//! Vat core - Virtual Object Cache
//!
//! LRU write-back cache from a virtual object's ref to its deserialized
//! state. The only component that talks to the backing store.
//!
//! Slots live in an arena and form an intrusive doubly linked recency
//! list (head = most recently used). Room is made *before* an insertion,
//! evicting from the tail while more than `size` slots are resident, so a
//! single operation may leave `size + 1` slots resident. A dirty slot is
//! written exactly once when it leaves the cache or is flushed; a slot that
//! was never dirtied is never written.

use std::collections::BTreeMap;

use tracing::debug;

use crate::capdata::CapData;
use crate::error::{Result, VatError};
use crate::store::{state_key, BackingStore};
use crate::vref::VatRef;

/// Property name → serialized property value.
pub type RawState = BTreeMap<String, CapData>;

#[derive(Debug)]
struct Slot {
    vref: VatRef,
    raw: RawState,
    dirty: bool,
    pinned: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct VirtualObjectCache {
    size: usize,
    arena: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: BTreeMap<VatRef, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    store: Box<dyn BackingStore>,
}

impl VirtualObjectCache {
    pub fn new(size: usize, store: Box<dyn BackingStore>) -> Self {
        Self {
            size,
            arena: Vec::new(),
            free: Vec::new(),
            index: BTreeMap::new(),
            head: None,
            tail: None,
            store,
        }
    }

    /// Make `vref` resident with `raw` as its state, as most recently used.
    /// An already-resident slot has its state replaced.
    pub fn remember(&mut self, vref: &VatRef, raw: RawState) -> Result<()> {
        if let Some(idx) = self.index.get(vref).copied() {
            self.slot_mut(idx).raw = raw;
            self.promote(idx);
            return Ok(());
        }
        self.make_room()?;
        self.insert_front(vref.clone(), raw);
        Ok(())
    }

    /// Current state of `vref`, fetching it from the store if absent.
    pub fn lookup(&mut self, vref: &VatRef) -> Result<&RawState> {
        let idx = self.resident_or_fetch(vref)?;
        Ok(&self.slot(idx).raw)
    }

    /// Like [`lookup`](Self::lookup), for in-place mutation. Callers must
    /// follow a change with [`mark_dirty`](Self::mark_dirty).
    pub fn lookup_mut(&mut self, vref: &VatRef) -> Result<&mut RawState> {
        let idx = self.resident_or_fetch(vref)?;
        Ok(&mut self.slot_mut(idx).raw)
    }

    /// Promote a resident slot to most recently used. No I/O.
    pub fn refresh(&mut self, vref: &VatRef) -> bool {
        match self.index.get(vref).copied() {
            Some(idx) => {
                self.promote(idx);
                true
            }
            None => false,
        }
    }

    /// Flag a resident slot for write-back. No I/O.
    pub fn mark_dirty(&mut self, vref: &VatRef) -> bool {
        match self.index.get(vref).copied() {
            Some(idx) => {
                self.slot_mut(idx).dirty = true;
                true
            }
            None => false,
        }
    }

    /// Exempt a resident slot from eviction (initialization in progress).
    pub fn pin(&mut self, vref: &VatRef) -> bool {
        self.set_pinned(vref, true)
    }

    pub fn unpin(&mut self, vref: &VatRef) -> bool {
        self.set_pinned(vref, false)
    }

    /// Drop a resident slot without writing it back, dirty or not.
    pub fn forget(&mut self, vref: &VatRef) -> bool {
        let Some(idx) = self.index.remove(vref) else {
            return false;
        };
        self.unlink(idx);
        self.arena[idx] = None;
        self.free.push(idx);
        debug!(vref = %vref, "cache slot discarded");
        true
    }

    /// Write every dirty slot, least recently used first, then drop them all.
    pub fn flush(&mut self) -> Result<()> {
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            self.write_back(idx)?;
            cursor = self.slot(idx).prev;
        }
        debug!(evicted = self.index.len(), "cache flushed");
        self.arena.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Configured size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Upper bound on resident slots at any moment.
    pub fn max_resident(&self) -> usize {
        self.size + 1
    }

    pub fn contains(&self, vref: &VatRef) -> bool {
        self.index.contains_key(vref)
    }

    pub fn is_dirty(&self, vref: &VatRef) -> Option<bool> {
        self.index.get(vref).map(|idx| self.slot(*idx).dirty)
    }

    /// Resident refs, most recently used first.
    pub fn resident_refs(&self) -> Vec<VatRef> {
        let mut out = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let slot = self.slot(idx);
            out.push(slot.vref.clone());
            cursor = slot.next;
        }
        out
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn resident_or_fetch(&mut self, vref: &VatRef) -> Result<usize> {
        if let Some(idx) = self.index.get(vref).copied() {
            self.promote(idx);
            return Ok(idx);
        }
        let key = state_key(vref);
        let stored = self
            .store
            .fetch(&key)?
            .ok_or_else(|| VatError::MissingState { vref: vref.to_string() })?;
        let raw: RawState = serde_json::from_str(&stored).map_err(|e| VatError::Store {
            key: key.clone(),
            detail: format!("corrupt state: {e}"),
        })?;
        self.make_room()?;
        Ok(self.insert_front(vref.clone(), raw))
    }

    /// Evict from the tail until at most `size` slots remain. Pinned tail
    /// slots are moved to the head instead; if every slot is pinned the
    /// cache has overflowed.
    fn make_room(&mut self) -> Result<()> {
        let mut refreshed = 0;
        while self.index.len() > self.size {
            let Some(idx) = self.tail else { break };
            if self.slot(idx).pinned {
                refreshed += 1;
                if refreshed >= self.index.len() {
                    return Err(VatError::CacheOverflow);
                }
                self.promote(idx);
                continue;
            }
            self.evict(idx)?;
        }
        Ok(())
    }

    fn evict(&mut self, idx: usize) -> Result<()> {
        let dirty = self.slot(idx).dirty;
        self.write_back(idx)?;
        self.unlink(idx);
        if let Some(slot) = self.arena[idx].take() {
            debug!(vref = %slot.vref, dirty, "cache evicted");
            self.index.remove(&slot.vref);
        }
        self.free.push(idx);
        Ok(())
    }

    /// Store the slot if dirty and clear the flag. A failed store leaves the
    /// slot dirty and resident.
    fn write_back(&mut self, idx: usize) -> Result<()> {
        let slot = self.slot(idx);
        if !slot.dirty {
            return Ok(());
        }
        let key = state_key(&slot.vref);
        let value = serde_json::to_string(&slot.raw)?;
        self.store.store(&key, value)?;
        self.slot_mut(idx).dirty = false;
        Ok(())
    }

    fn set_pinned(&mut self, vref: &VatRef, pinned: bool) -> bool {
        match self.index.get(vref).copied() {
            Some(idx) => {
                self.slot_mut(idx).pinned = pinned;
                true
            }
            None => false,
        }
    }

    fn insert_front(&mut self, vref: VatRef, raw: RawState) -> usize {
        let slot = Slot { vref: vref.clone(), raw, dirty: false, pinned: false, prev: None, next: None };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.arena[idx] = Some(slot);
                idx
            }
            None => {
                self.arena.push(Some(slot));
                self.arena.len() - 1
            }
        };
        self.index.insert(vref, idx);
        self.link_front(idx);
        idx
    }

    fn promote(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slot_mut(idx);
            slot.prev = None;
            slot.next = old_head;
        }
        match old_head {
            Some(h) => self.slot_mut(h).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slot(idx);
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let slot = self.slot_mut(idx);
        slot.prev = None;
        slot.next = None;
    }

    fn slot(&self, idx: usize) -> &Slot {
        match self.arena.get(idx) {
            Some(Some(slot)) => slot,
            _ => panic!("Invariant violation: cache slot {idx} is not live"),
        }
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        match self.arena.get_mut(idx) {
            Some(Some(slot)) => slot,
            _ => panic!("Invariant violation: cache slot {idx} is not live"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;
    use crate::effects::{Effect, EffectLog};
    use crate::store::MemoryStore;

    fn t(n: u64) -> VatRef {
        VatRef::virtual_object(1, n)
    }

    fn state(n: i64) -> RawState {
        let mut raw = RawState::new();
        raw.insert("n".to_string(), CapData::new(n.to_string(), vec![]));
        raw
    }

    fn cache(size: usize) -> (VirtualObjectCache, MemoryStore) {
        let store = MemoryStore::new(EffectLog::new());
        (VirtualObjectCache::new(size, Box::new(store.clone())), store)
    }

    fn io(store: &MemoryStore) -> Vec<String> {
        store
            .log()
            .snapshot()
            .iter()
            .map(|e| match e {
                Effect::Fetch { key, .. } => format!("fetch {key}"),
                Effect::Store { key, .. } => format!("store {key}"),
                other => other.kind().to_string(),
            })
            .collect()
    }

    #[test]
    fn six_dirty_inserts_into_a_cache_of_three() {
        let (mut cache, store) = cache(3);
        for n in 0..6 {
            cache.remember(&t(n), state(n as i64)).unwrap();
            cache.mark_dirty(&t(n));
        }
        assert_eq!(cache.resident_refs(), vec![t(5), t(4), t(3), t(2)]);
        assert_eq!(io(&store), vec!["store vom.o+1/0", "store vom.o+1/1"]);

        // Resident: promoted without I/O.
        cache.lookup(&t(2)).unwrap();
        assert_eq!(cache.resident_refs(), vec![t(2), t(5), t(4), t(3)]);
        assert_eq!(store.log().len(), 2);

        // Absent: fetched, then the LRU slot (t3, dirty) is written out.
        assert_eq!(cache.lookup(&t(0)).unwrap(), &state(0));
        assert_eq!(
            io(&store)[2..],
            ["fetch vom.o+1/0".to_string(), "store vom.o+1/3".to_string()]
        );
        assert_eq!(cache.resident_refs(), vec![t(0), t(2), t(5), t(4)]);
        assert_eq!(cache.is_dirty(&t(0)), Some(false));
    }

    #[test]
    fn clean_slots_are_never_written() {
        let (mut cache, store) = cache(1);
        for n in 0..4 {
            cache.remember(&t(n), state(0)).unwrap();
        }
        cache.flush().unwrap();
        assert!(store.log().is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn flush_writes_dirty_slots_lru_first() {
        let (mut cache, store) = cache(3);
        for n in 0..3 {
            cache.remember(&t(n), state(n as i64)).unwrap();
        }
        cache.mark_dirty(&t(2));
        cache.mark_dirty(&t(0));
        cache.refresh(&t(0));
        cache.flush().unwrap();
        assert_eq!(io(&store), vec!["store vom.o+1/2", "store vom.o+1/0"]);
        assert_eq!(cache.len(), 0);
        assert_eq!(store.get("vom.o+1/0").unwrap(), r#"{"n":{"body":"0","slots":[]}}"#);
    }

    #[test]
    fn failing_store_keeps_the_dirty_slot() {
        let (mut cache, store) = cache(1);
        cache.remember(&t(0), state(0)).unwrap();
        cache.mark_dirty(&t(0));
        cache.remember(&t(1), state(1)).unwrap();
        store.fail_stores(true);
        let err = cache.remember(&t(2), state(2)).unwrap_err();
        assert!(matches!(err, VatError::Store { .. }));
        assert!(cache.contains(&t(0)));
        assert_eq!(cache.is_dirty(&t(0)), Some(true));
        assert!(!cache.contains(&t(2)));
    }

    #[test]
    fn missing_state_is_reported() {
        let (mut cache, _store) = cache(2);
        assert_eq!(
            cache.lookup(&t(9)).unwrap_err(),
            VatError::MissingState { vref: "o+1/9".to_string() }
        );
    }

    #[test]
    fn pinned_slots_are_skipped_then_overflow() {
        let (mut cache, _store) = cache(1);
        cache.remember(&t(0), state(0)).unwrap();
        cache.pin(&t(0));
        cache.remember(&t(1), state(1)).unwrap();
        // t0 is pinned at the tail: it is refreshed and t1 goes instead.
        cache.remember(&t(2), state(2)).unwrap();
        assert_eq!(cache.resident_refs(), vec![t(2), t(0)]);

        cache.pin(&t(2));
        assert_eq!(cache.remember(&t(3), state(3)).unwrap_err(), VatError::CacheOverflow);

        cache.unpin(&t(0));
        cache.remember(&t(3), state(3)).unwrap();
        assert_eq!(cache.resident_refs(), vec![t(3), t(2)]);
    }

    #[test]
    fn forgotten_slots_are_not_written() {
        let (mut cache, store) = cache(2);
        for n in 0..3 {
            cache.remember(&t(n), state(n as i64)).unwrap();
            cache.mark_dirty(&t(n));
        }
        assert!(cache.forget(&t(1)));
        assert!(!cache.forget(&t(1)));
        assert_eq!(cache.resident_refs(), vec![t(2), t(0)]);

        // The freed arena slot is reused.
        cache.remember(&t(3), state(3)).unwrap();
        cache.flush().unwrap();
        assert_eq!(io(&store), vec!["store vom.o+1/0", "store vom.o+1/2"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Remember(u64),
        Lookup(u64),
        Dirty(u64),
        Refresh(u64),
        Flush,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..8u64).prop_map(Op::Remember),
            (0..8u64).prop_map(Op::Lookup),
            (0..8u64).prop_map(Op::Dirty),
            (0..8u64).prop_map(Op::Refresh),
            Just(Op::Flush),
        ]
    }

    proptest! {
        #[test]
        fn every_dirty_period_is_written_exactly_once(
            size in 1usize..5,
            ops in proptest::collection::vec(op(), 0..64),
        ) {
            let log = EffectLog::new();
            let seed = (0..8)
                .map(|n| (state_key(&t(n)), serde_json::to_string(&state(0)).unwrap()))
                .collect();
            let store = MemoryStore::with_data(log.clone(), seed);
            let mut cache = VirtualObjectCache::new(size, Box::new(store));
            let mut dirty: BTreeSet<String> = BTreeSet::new();

            for op in ops {
                let seen = log.len();
                match op {
                    Op::Remember(n) => cache.remember(&t(n), state(n as i64)).unwrap(),
                    Op::Lookup(n) => {
                        cache.lookup(&t(n)).unwrap();
                    }
                    Op::Dirty(n) => {
                        if cache.mark_dirty(&t(n)) {
                            dirty.insert(state_key(&t(n)));
                        }
                    }
                    Op::Refresh(n) => {
                        cache.refresh(&t(n));
                    }
                    Op::Flush => {
                        cache.flush().unwrap();
                        prop_assert!(cache.is_empty());
                    }
                }
                for effect in &log.snapshot()[seen..] {
                    if let Effect::Store { key, .. } = effect {
                        prop_assert!(dirty.remove(key), "store of clean slot {}", key);
                    }
                }
                prop_assert!(cache.len() <= cache.max_resident());
            }

            let seen = log.len();
            cache.flush().unwrap();
            for effect in &log.snapshot()[seen..] {
                if let Effect::Store { key, .. } = effect {
                    prop_assert!(dirty.remove(key), "store of clean slot {}", key);
                }
            }
            prop_assert!(dirty.is_empty(), "dirty slots never written: {:?}", dirty);
        }
    }
}
