//! Vat core - Promise Registry
//!
//! Per-vat table of promises. A record is created when the vat makes a
//! promise, allocates a result vpid for an outbound send, or first hears of
//! a kernel vpid. Each record transitions exactly once from unresolved to a
//! terminal [`Resolution`]; the transition's effects are applied by the
//! dispatcher, after which the vpid is retired and may never be used again.
//!
//! Handles are reference counted. A record whose vpid is retired and whose
//! handles have all been dropped can no longer be named by the kernel or by
//! vat code, and [`PromiseRegistry::reclaim`] frees it.
//!
//! The registry holds state only. It never emits syscalls.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::capdata::Value;
use crate::error::{Result, VatError};
use crate::liveslots::LiveSlots;
use crate::vref::{Direction, RefKind, VatRef};
use crate::weak::Wrapper;

/// Vat-local promise handle. Stable for the life of the promise, unlike the
/// vpid, which is replaced on retirement. Clones share one count.
#[derive(Clone)]
pub struct PromiseId(Rc<u64>);

impl PromiseId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        PromiseId(Rc::new(raw))
    }

    pub fn raw(&self) -> u64 {
        *self.0
    }
}

impl PartialEq for PromiseId {
    fn eq(&self, other: &Self) -> bool {
        self.raw() == other.raw()
    }
}

impl Eq for PromiseId {}

impl PartialOrd for PromiseId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PromiseId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw().cmp(&other.raw())
    }
}

impl Hash for PromiseId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw().hash(state);
    }
}

impl fmt::Debug for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PromiseId").field(&self.raw()).finish()
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise#{}", self.raw())
    }
}

/// Who may resolve a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decider {
    /// This vat. The kernel expects exactly one `resolve` once a vpid exists.
    Vat,
    /// Another vat, reached through the kernel (result of an outbound send).
    Kernel,
    /// Imported without a decider claim; settled by kernel notification.
    None,
}

/// Terminal state of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// An object owned elsewhere; sends go out as syscalls.
    Presence(Wrapper),
    /// An object owned by this vat; sends are delivered in-process.
    LocalObject(Wrapper),
    /// Plain data; not callable.
    Data(Value),
    /// Rejected with a reason.
    Rejected(Value),
}

impl Resolution {
    pub fn status(&self) -> PromiseStatus {
        match self {
            Resolution::Presence(_) => PromiseStatus::ResolvedToPresence,
            Resolution::LocalObject(_) => PromiseStatus::ResolvedToLocalObject,
            Resolution::Data(_) => PromiseStatus::ResolvedToData,
            Resolution::Rejected(_) => PromiseStatus::Rejected,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Resolution::Rejected(_))
    }

    /// The value a continuation observes, and what a `resolve` syscall carries.
    pub fn value(&self) -> Value {
        match self {
            Resolution::Presence(w) | Resolution::LocalObject(w) => Value::Remotable(w.clone()),
            Resolution::Data(v) | Resolution::Rejected(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStatus {
    Unresolved,
    ResolvedToPresence,
    ResolvedToLocalObject,
    ResolvedToData,
    Rejected,
}

/// Continuation registered with `then`; its result settles the derived promise.
pub type Continuation = Box<dyn FnOnce(&mut LiveSlots, &Resolution) -> Result<Value>>;

/// Something waiting on a promise, fired in registration order.
pub enum Subscriber {
    Callback {
        derived: PromiseId,
        callback: Continuation,
    },
    /// Settle another promise with the same resolution.
    Forward(PromiseId),
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Callback { derived, .. } => {
                f.debug_struct("Callback").field("derived", derived).finish()
            }
            Subscriber::Forward(target) => f.debug_tuple("Forward").field(target).finish(),
        }
    }
}

/// A send held on a promise that has no vpid (or that this vat was asked
/// to handle) until it settles.
#[derive(Debug, Clone)]
pub struct QueuedSend {
    pub method: String,
    pub args: Vec<Value>,
    pub result: Option<PromiseId>,
}

#[derive(Debug)]
pub struct PromiseRecord {
    /// Observes the handles without keeping them alive.
    handle: Weak<u64>,
    /// Current kernel-visible name, if any. Cleared on retirement.
    pub vpid: Option<VatRef>,
    pub decider: Decider,
    pub resolution: Option<Resolution>,
    /// Set once resolved to another still-pending promise.
    pub following: Option<PromiseId>,
    pub subscribers: Vec<Subscriber>,
    pub queued: Vec<QueuedSend>,
}

impl PromiseRecord {
    fn new(handle: Weak<u64>, vpid: Option<VatRef>, decider: Decider) -> Self {
        Self {
            handle,
            vpid,
            decider,
            resolution: None,
            following: None,
            subscribers: Vec::new(),
            queued: Vec::new(),
        }
    }

    pub fn status(&self) -> PromiseStatus {
        self.resolution
            .as_ref()
            .map_or(PromiseStatus::Unresolved, Resolution::status)
    }

    pub fn is_settled(&self) -> bool {
        self.resolution.is_some()
    }

    /// Nothing can name this promise any more.
    fn is_unreachable(&self) -> bool {
        self.vpid.is_none() && self.handle.strong_count() == 0
    }
}

/// Everything the dispatcher must propagate after a transition.
#[derive(Debug)]
pub struct Settled {
    pub resolution: Resolution,
    pub subscribers: Vec<Subscriber>,
    pub queued: Vec<QueuedSend>,
    pub vpid: Option<VatRef>,
    pub decider: Decider,
}

/// Outcome of giving a promise a kernel-visible name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exported {
    /// The promise already had a live vpid.
    Existing(VatRef),
    /// A vpid was allocated now.
    Fresh(VatRef),
}

impl Exported {
    pub fn vpid(&self) -> &VatRef {
        match self {
            Exported::Existing(v) | Exported::Fresh(v) => v,
        }
    }
}

#[derive(Debug)]
pub struct PromiseRegistry {
    records: BTreeMap<u64, PromiseRecord>,
    /// Live vpids hold a handle: the kernel can still name the promise.
    by_vpid: BTreeMap<VatRef, PromiseId>,
    next_local: u64,
    next_vpid: u64,
}

impl PromiseRegistry {
    pub fn new(first_promise_id: u64) -> Self {
        Self {
            records: BTreeMap::new(),
            by_vpid: BTreeMap::new(),
            next_local: 1,
            next_vpid: first_promise_id,
        }
    }

    fn insert(&mut self, vpid: Option<VatRef>, decider: Decider) -> PromiseId {
        let id = PromiseId(Rc::new(self.next_local));
        self.next_local += 1;
        if let Some(v) = &vpid {
            self.by_vpid.insert(v.clone(), id.clone());
        }
        self.records
            .insert(id.raw(), PromiseRecord::new(Rc::downgrade(&id.0), vpid, decider));
        id
    }

    fn allocate_vpid(&mut self) -> VatRef {
        let vpid = VatRef::promise(Direction::Exported, self.next_vpid);
        self.next_vpid += 1;
        vpid
    }

    /// A promise made by vat code, decided by this vat, not yet exported.
    pub fn create_local(&mut self) -> PromiseId {
        self.insert(None, Decider::Vat)
    }

    /// Result promise for an outbound send: vat-allocated vpid, decided by
    /// whoever handles the message.
    pub fn allocate_result(&mut self) -> (PromiseId, VatRef) {
        let vpid = self.allocate_vpid();
        let id = self.insert(Some(vpid.clone()), Decider::Kernel);
        (id, vpid)
    }

    /// First reference to an unknown kernel-allocated vpid.
    pub fn import(&mut self, vpid: &VatRef) -> Result<PromiseId> {
        vpid.insist_kind(RefKind::Promise)?;
        if vpid.allocated_by_vat() {
            return Err(VatError::UnknownPromise { vpid: vpid.to_string() });
        }
        Ok(self.insert(Some(vpid.clone()), Decider::None))
    }

    /// Give `id` a kernel-visible vpid, allocating one if it has none.
    ///
    /// A settled promise gets a fresh vpid that this vat decides: its old
    /// vpid was retired and the kernel must learn the resolution anew.
    pub fn export(&mut self, id: &PromiseId) -> Result<Exported> {
        if let Some(vpid) = &self.record(id)?.vpid {
            return Ok(Exported::Existing(vpid.clone()));
        }
        let vpid = self.allocate_vpid();
        self.by_vpid.insert(vpid.clone(), id.clone());
        let record = self.record_mut(id)?;
        record.vpid = Some(vpid.clone());
        if record.is_settled() {
            record.decider = Decider::Vat;
        }
        debug!(promise = %id, vpid = %vpid, "vpid allocated");
        Ok(Exported::Fresh(vpid))
    }

    /// Claim resolution authority for `vpid`, named as the result of an
    /// inbound message.
    pub fn become_decider(&mut self, vpid: &VatRef) -> Result<PromiseId> {
        vpid.insist_kind(RefKind::Promise)?;
        let id = match self.lookup(vpid) {
            Some(id) => id,
            None if vpid.allocated_by_vat() => {
                return Err(VatError::UnknownPromise { vpid: vpid.to_string() })
            }
            None => self.insert(Some(vpid.clone()), Decider::None),
        };
        let record = self.record_mut(&id)?;
        if record.decider == Decider::Vat {
            return Err(VatError::Protocol(format!(
                "{vpid} named as a result twice"
            )));
        }
        record.decider = Decider::Vat;
        debug!(vpid = %vpid, "became decider");
        Ok(id)
    }

    /// Fail unless this vat may resolve `id` right now.
    pub fn insist_resolvable(&self, id: &PromiseId) -> Result<()> {
        let record = self.record(id)?;
        if record.decider != Decider::Vat {
            return Err(VatError::NotDecider { promise: self.label(id) });
        }
        if record.is_settled() || record.following.is_some() {
            return Err(VatError::AlreadyResolved { promise: self.label(id) });
        }
        Ok(())
    }

    /// Fail unless the kernel may notify this vat about `vpid`.
    pub fn insist_notifiable(&self, vpid: &VatRef) -> Result<PromiseId> {
        let id = self
            .lookup(vpid)
            .ok_or_else(|| VatError::UnknownPromise { vpid: vpid.to_string() })?;
        if self.record(&id)?.decider == Decider::Vat {
            return Err(VatError::Protocol(format!(
                "kernel notified {vpid}, which this vat decides"
            )));
        }
        Ok(id)
    }

    /// Mark `id` as following `target`; settles later through a Forward.
    pub fn follow(&mut self, id: &PromiseId, target: &PromiseId) -> Result<()> {
        self.record_mut(id)?.following = Some(target.clone());
        self.record_mut(target)?.subscribers.push(Subscriber::Forward(id.clone()));
        Ok(())
    }

    /// Apply the one transition of `id` and hand back what must be propagated.
    pub fn settle(&mut self, id: &PromiseId, resolution: Resolution) -> Result<Settled> {
        let record = self.record_mut(id)?;
        if record.is_settled() {
            return Err(VatError::AlreadyResolved { promise: id.to_string() });
        }
        record.resolution = Some(resolution.clone());
        record.following = None;
        debug!(
            promise = %id,
            vpid = ?record.vpid.as_ref().map(ToString::to_string),
            status = ?resolution.status(),
            "promise settled"
        );
        Ok(Settled {
            resolution,
            subscribers: std::mem::take(&mut record.subscribers),
            queued: std::mem::take(&mut record.queued),
            vpid: record.vpid.clone(),
            decider: record.decider,
        })
    }

    /// Permanently invalidate the current vpid of `id`.
    pub fn retire(&mut self, id: &PromiseId) -> Result<()> {
        let record = self.record_mut(id)?;
        if let Some(vpid) = record.vpid.take() {
            self.by_vpid.remove(&vpid);
            debug!(promise = %id, vpid = %vpid, "vpid retired");
        }
        Ok(())
    }

    /// Free every record that neither the kernel nor vat code can name.
    /// Dropping a record can release handles it held, so this repeats until
    /// nothing more is freed. Returns the number of records freed.
    pub fn reclaim(&mut self) -> usize {
        let mut freed = 0;
        loop {
            let dead: Vec<u64> = self
                .records
                .iter()
                .filter(|(_, record)| record.is_unreachable())
                .map(|(raw, _)| *raw)
                .collect();
            if dead.is_empty() {
                break;
            }
            for raw in &dead {
                self.records.remove(raw);
            }
            freed += dead.len();
        }
        if freed > 0 {
            debug!(freed, remaining = self.records.len(), "promise records reclaimed");
        }
        freed
    }

    pub fn lookup(&self, vpid: &VatRef) -> Option<PromiseId> {
        self.by_vpid.get(vpid).cloned()
    }

    pub fn record(&self, id: &PromiseId) -> Result<&PromiseRecord> {
        self.records.get(&id.raw()).ok_or_else(|| unknown(id))
    }

    pub fn record_mut(&mut self, id: &PromiseId) -> Result<&mut PromiseRecord> {
        self.records.get_mut(&id.raw()).ok_or_else(|| unknown(id))
    }

    pub fn status(&self, id: &PromiseId) -> Option<PromiseStatus> {
        self.records.get(&id.raw()).map(PromiseRecord::status)
    }

    pub fn vpid_of(&self, id: &PromiseId) -> Option<&VatRef> {
        self.records.get(&id.raw()).and_then(|r| r.vpid.as_ref())
    }

    /// Number of vpids currently live.
    pub fn live_vpids(&self) -> usize {
        self.by_vpid.len()
    }

    /// Number of records held, reachable or not yet reclaimed.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn label(&self, id: &PromiseId) -> String {
        match self.vpid_of(id) {
            Some(vpid) => vpid.to_string(),
            None => id.to_string(),
        }
    }
}

fn unknown(id: &PromiseId) -> VatError {
    VatError::UnknownPromise { vpid: id.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p_minus(n: u64) -> VatRef {
        VatRef::promise(Direction::Imported, n)
    }

    #[test]
    fn result_vpids_start_at_configured_id() {
        let mut reg = PromiseRegistry::new(5);
        let (a, va) = reg.allocate_result();
        let (_, vb) = reg.allocate_result();
        assert_eq!(va.to_string(), "p+5");
        assert_eq!(vb.to_string(), "p+6");
        assert_eq!(reg.lookup(&va), Some(a.clone()));
        assert_eq!(reg.record(&a).unwrap().decider, Decider::Kernel);
    }

    #[test]
    fn become_decider_on_unknown_import() {
        let mut reg = PromiseRegistry::new(5);
        let id = reg.become_decider(&p_minus(8)).unwrap();
        assert_eq!(reg.record(&id).unwrap().decider, Decider::Vat);
        assert!(reg.insist_resolvable(&id).is_ok());
        assert!(matches!(
            reg.become_decider(&p_minus(8)),
            Err(VatError::Protocol(_))
        ));
        assert!(matches!(
            reg.become_decider(&VatRef::promise(Direction::Exported, 40)),
            Err(VatError::UnknownPromise { .. })
        ));
    }

    #[test]
    fn only_the_decider_may_resolve_and_only_once() {
        let mut reg = PromiseRegistry::new(5);
        let (theirs, _) = reg.allocate_result();
        assert!(matches!(
            reg.insist_resolvable(&theirs),
            Err(VatError::NotDecider { .. })
        ));

        let mine = reg.create_local();
        reg.settle(&mine, Resolution::Data(Value::Int(1))).unwrap();
        assert!(matches!(
            reg.insist_resolvable(&mine),
            Err(VatError::AlreadyResolved { .. })
        ));
        assert!(reg.settle(&mine, Resolution::Data(Value::Int(2))).is_err());
    }

    #[test]
    fn settle_hands_back_subscribers_in_order() {
        let mut reg = PromiseRegistry::new(5);
        let a = reg.create_local();
        let b = reg.create_local();
        let c = reg.create_local();
        reg.follow(&b, &a).unwrap();
        reg.follow(&c, &a).unwrap();
        assert!(matches!(reg.insist_resolvable(&b), Err(VatError::AlreadyResolved { .. })));

        let settled = reg.settle(&a, Resolution::Data(Value::Null)).unwrap();
        let order: Vec<_> = settled
            .subscribers
            .iter()
            .map(|s| match s {
                Subscriber::Forward(p) => p.clone(),
                Subscriber::Callback { derived, .. } => derived.clone(),
            })
            .collect();
        assert_eq!(order, vec![b, c]);
        assert_eq!(reg.status(&a), Some(PromiseStatus::ResolvedToData));
    }

    #[test]
    fn retirement_forces_a_fresh_vpid() {
        let mut reg = PromiseRegistry::new(5);
        let id = reg.become_decider(&p_minus(8)).unwrap();
        reg.settle(&id, Resolution::Data(Value::Int(3))).unwrap();
        reg.retire(&id).unwrap();
        assert_eq!(reg.lookup(&p_minus(8)), None);
        assert_eq!(reg.vpid_of(&id), None);

        let exported = reg.export(&id).unwrap();
        assert_eq!(exported, Exported::Fresh(VatRef::promise(Direction::Exported, 5)));
        assert_eq!(reg.record(&id).unwrap().decider, Decider::Vat);
        assert_eq!(reg.export(&id).unwrap(), Exported::Existing(exported.vpid().clone()));
    }

    #[test]
    fn notify_is_refused_for_vat_decided_promises() {
        let mut reg = PromiseRegistry::new(5);
        reg.become_decider(&p_minus(3)).unwrap();
        assert!(matches!(
            reg.insist_notifiable(&p_minus(3)),
            Err(VatError::Protocol(_))
        ));
        assert!(matches!(
            reg.insist_notifiable(&p_minus(4)),
            Err(VatError::UnknownPromise { .. })
        ));
        let imported = reg.import(&p_minus(4)).unwrap();
        assert_eq!(reg.insist_notifiable(&p_minus(4)).unwrap(), imported);
    }

    #[test]
    fn records_are_reclaimed_once_unnameable() {
        let mut reg = PromiseRegistry::new(5);

        // Held only by a live vpid: kept until retired.
        let (theirs, vpid) = reg.allocate_result();
        drop(theirs);
        assert_eq!(reg.reclaim(), 0);
        let theirs = reg.lookup(&vpid).unwrap();
        reg.settle(&theirs, Resolution::Data(Value::Int(1))).unwrap();
        reg.retire(&theirs).unwrap();
        assert_eq!(reg.reclaim(), 0, "vat code still holds a handle");
        drop(theirs);
        assert_eq!(reg.reclaim(), 1);

        // A follower's handle lives in its leader's subscriber list.
        let leader = reg.create_local();
        let follower = reg.create_local();
        reg.follow(&follower, &leader).unwrap();
        let raw = follower.raw();
        drop(follower);
        assert_eq!(reg.reclaim(), 0);
        let settled = reg.settle(&leader, Resolution::Data(Value::Null)).unwrap();
        drop(settled);
        drop(leader);
        assert_eq!(reg.reclaim(), 2);
        assert!(reg.is_empty());
        assert!(reg.record(&PromiseId::from_raw(raw)).is_err());
    }

    #[test]
    fn a_resolution_keeps_the_promises_it_names() {
        let mut reg = PromiseRegistry::new(5);
        let inner = reg.create_local();
        let outer = reg.create_local();
        reg.settle(&outer, Resolution::Data(Value::List(vec![Value::Promise(inner.clone())])))
            .unwrap();
        drop(inner);
        assert_eq!(reg.reclaim(), 0);
        drop(outer);
        // Freeing the outer record releases the inner one on the next pass.
        assert_eq!(reg.reclaim(), 2);
        assert_eq!(reg.len(), 0);
    }
}
