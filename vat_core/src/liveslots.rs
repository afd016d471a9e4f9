//! Vat core - Dispatcher
//!
//! `LiveSlots` is one vat: the export table, virtual object kinds, the
//! cache, the weak reference bridge and the promise registry, wired to a
//! syscall gateway. The kernel drives it one crank at a time through
//! [`LiveSlots::run_crank`]; vat code reaches it through the powers below
//! (eventual send, promises, `then`, `call_now`, virtual objects).
//!
//! A crank processes one delivery, then drains the ready queue to
//! exhaustion. Local resolution is synchronous: when `resolve` returns,
//! subscribers have fired, the `resolve` syscall (if owed) has been made
//! and the vpid is retired.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::cache::{RawState, VirtualObjectCache};
use crate::capdata::{self, CapData, SlotMapper, Value};
use crate::config::VatConfig;
use crate::error::{Result, VatError};
use crate::promise::{
    Continuation, Decider, Exported, PromiseId, PromiseRegistry, PromiseStatus, QueuedSend,
    Resolution, Subscriber,
};
use crate::store::BackingStore;
use crate::syscall::{Delivery, Syscall, VatResolution};
use crate::vref::{RefKind, VatRef};
use crate::weak::{WeakRefBridge, Wrapper};

/// An object exported by this vat and held in memory.
pub trait VatObject {
    fn invoke(&mut self, vat: &mut LiveSlots, method: &str, args: Vec<Value>) -> Result<Value>;
}

impl<F> VatObject for F
where
    F: FnMut(&mut LiveSlots, &str, Vec<Value>) -> Result<Value>,
{
    fn invoke(&mut self, vat: &mut LiveSlots, method: &str, args: Vec<Value>) -> Result<Value> {
        self(vat, method, args)
    }
}

/// Behavior shared by every instance of a virtual object kind. Instance
/// state lives in the cache and is reached through `vo_get` / `vo_set`.
pub trait VirtualKind {
    fn tag(&self) -> &str;

    /// Runs once per instance, after its initial state is in place. The
    /// instance stays resident until this returns.
    fn init(&self, _vat: &mut LiveSlots, _this: &Wrapper) -> Result<()> {
        Ok(())
    }

    fn invoke(&self, vat: &mut LiveSlots, this: &Wrapper, method: &str, args: Vec<Value>)
        -> Result<Value>;
}

/// Handle on a defined virtual object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KindId(u64);

struct KindEntry {
    behavior: Rc<dyn VirtualKind>,
    next_instance: u64,
}

/// Work queued for the current crank.
enum Job {
    Deliver {
        target: Wrapper,
        method: String,
        args: Vec<Value>,
        result: Option<PromiseId>,
    },
    Callback {
        derived: PromiseId,
        callback: Continuation,
        resolution: Resolution,
    },
    /// A settled promise was exported under a fresh vpid; tell the kernel.
    ResolveFresh { promise: PromiseId },
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Deliver { target, method, .. } => write!(f, "Deliver({}.{})", target.vref(), method),
            Job::Callback { derived, .. } => write!(f, "Callback({derived})"),
            Job::ResolveFresh { promise } => write!(f, "ResolveFresh({promise})"),
        }
    }
}

pub struct LiveSlots {
    config: VatConfig,
    syscall: Box<dyn Syscall>,
    cache: VirtualObjectCache,
    bridge: WeakRefBridge<Value>,
    promises: PromiseRegistry,
    exports: BTreeMap<VatRef, Box<dyn VatObject>>,
    /// Exported in-memory objects are kept alive by the export table.
    export_wrappers: BTreeMap<VatRef, Wrapper>,
    kinds: BTreeMap<u64, KindEntry>,
    next_export_id: u64,
    ready: VecDeque<Job>,
}

impl LiveSlots {
    /// Build a vat. `root` runs with full vat powers and returns the object
    /// exported as `o+0`.
    pub fn build<F>(
        config: VatConfig,
        syscall: Box<dyn Syscall>,
        store: Box<dyn BackingStore>,
        root: F,
    ) -> Result<Self>
    where
        F: FnOnce(&mut LiveSlots) -> Result<Box<dyn VatObject>>,
    {
        config.validate()?;
        let mut vat = Self {
            cache: VirtualObjectCache::new(config.virtual_object_cache_size, store),
            promises: PromiseRegistry::new(config.first_promise_id),
            next_export_id: config.first_export_id,
            config,
            syscall,
            bridge: WeakRefBridge::new(),
            exports: BTreeMap::new(),
            export_wrappers: BTreeMap::new(),
            kinds: BTreeMap::new(),
            ready: VecDeque::new(),
        };
        let object = root(&mut vat)?;
        vat.register_export(VatRef::root(), object);
        // Anything the build step queued runs now.
        vat.drain()?;
        debug!(vat = %vat.config.vat_id, "vat built");
        Ok(vat)
    }

    pub fn config(&self) -> &VatConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Crank loop
    // -----------------------------------------------------------------------

    /// Process one delivery and every continuation it makes ready.
    pub fn run_crank(&mut self, delivery: &Delivery) -> Result<()> {
        let outcome = match delivery {
            Delivery::Message { target, method, args, result } => {
                debug!(vat = %self.config.vat_id, target = %target, method = %method, "crank: message");
                self.deliver_message(target, method, args, result.as_ref())
            }
            Delivery::Notify { resolutions } => {
                debug!(vat = %self.config.vat_id, count = resolutions.len(), "crank: notify");
                self.deliver_notify(resolutions)
            }
        }
        .and_then(|()| self.drain());

        match outcome {
            Ok(()) => {
                self.bridge.sweep();
                self.promises.reclaim();
                Ok(())
            }
            Err(err) => {
                debug!(vat = %self.config.vat_id, error = %err, dropped = self.ready.len(), "crank failed");
                self.ready.clear();
                Err(err)
            }
        }
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(job) = self.ready.pop_front() {
            match job {
                Job::Deliver { target, method, args, result } => {
                    self.deliver_to(&target, &method, args, result)?
                }
                Job::Callback { derived, callback, resolution } => {
                    self.run_callback(derived, callback, &resolution)?
                }
                Job::ResolveFresh { promise } => self.resolve_fresh(promise)?,
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// An inbound message. If `result` is given this vat becomes its decider.
    pub fn deliver_message(
        &mut self,
        target: &VatRef,
        method: &str,
        args: &CapData,
        result: Option<&VatRef>,
    ) -> Result<()> {
        let args = match capdata::unserialize(args, self)? {
            Value::List(items) => items,
            other => {
                return Err(VatError::Protocol(format!(
                    "message arguments must be a list, got {other:?}"
                )))
            }
        };
        let result = result.map(|vpid| self.promises.become_decider(vpid)).transpose()?;

        match target.kind {
            RefKind::Promise => {
                let id = self
                    .promises
                    .lookup(target)
                    .ok_or_else(|| VatError::UnknownPromise { vpid: target.to_string() })?;
                let queued = QueuedSend { method: method.to_string(), args, result };
                let settled = self.promises.record(&id)?.resolution.clone();
                match settled {
                    Some(resolution) => self.route_queued(&resolution, queued),
                    None => {
                        self.promises.record_mut(&id)?.queued.push(queued);
                        Ok(())
                    }
                }
            }
            RefKind::Object if target.allocated_by_vat() => {
                let wrapper = match self.value_for_slot(target)? {
                    Value::Remotable(w) => w,
                    _ => return Err(VatError::UnknownObject { vref: target.to_string() }),
                };
                self.deliver_to(&wrapper, method, args, result)
            }
            _ => Err(VatError::Protocol(format!(
                "message for {target}, which this vat does not own"
            ))),
        }
    }

    /// Kernel resolutions of promises this vat does not decide. Never emits
    /// a `resolve` syscall.
    pub fn deliver_notify(&mut self, resolutions: &[VatResolution]) -> Result<()> {
        for resolution in resolutions {
            let id = self.promises.insist_notifiable(&resolution.vpid)?;
            let value = capdata::unserialize(&resolution.data, self)?;
            if resolution.rejected {
                self.settle(&id, Resolution::Rejected(value))?;
            } else {
                self.fulfill(&id, value)?;
            }
        }
        Ok(())
    }

    /// Invoke a local or virtual object and settle its result promise.
    /// Application errors reject the result; fatal errors abort the crank.
    fn deliver_to(
        &mut self,
        target: &Wrapper,
        method: &str,
        args: Vec<Value>,
        result: Option<PromiseId>,
    ) -> Result<()> {
        let outcome = self.invoke(target, method, args);
        let Some(result) = result else {
            return match outcome {
                Err(err) if err.is_fatal() => Err(err),
                _ => Ok(()),
            };
        };
        match outcome {
            Ok(value) => self.fulfill(&result, value),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!(target = %target.vref(), method, error = %err, "method failed");
                self.settle(&result, Resolution::Rejected(Value::error(err.to_string())))
            }
        }
    }

    fn invoke(&mut self, target: &Wrapper, method: &str, args: Vec<Value>) -> Result<Value> {
        let vref = target.vref().clone();
        if vref.is_virtual() {
            let behavior = self.kind_behavior(vref.id)?;
            self.cache.refresh(&vref);
            return behavior.invoke(self, target, method, args);
        }
        let mut object = self
            .exports
            .remove(&vref)
            .ok_or_else(|| VatError::UnknownObject { vref: vref.to_string() })?;
        let outcome = object.invoke(self, method, args);
        self.exports.insert(vref, object);
        outcome
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Resolve a promise this vat decides. Resolving to another promise makes
    /// it follow that promise.
    pub fn resolve(&mut self, promise: &PromiseId, value: Value) -> Result<()> {
        self.promises.insist_resolvable(promise)?;
        self.fulfill(promise, value)
    }

    pub fn reject(&mut self, promise: &PromiseId, reason: Value) -> Result<()> {
        self.promises.insist_resolvable(promise)?;
        self.settle(promise, Resolution::Rejected(reason))
    }

    fn fulfill(&mut self, promise: &PromiseId, value: Value) -> Result<()> {
        match value {
            Value::Promise(target) if &target == promise => self.settle(
                promise,
                Resolution::Rejected(Value::error("promise cannot be resolved to itself")),
            ),
            Value::Promise(target) => {
                let leader = self.promises.record(&target)?.resolution.clone();
                match leader {
                    Some(resolution) => self.settle(promise, resolution),
                    None => self.promises.follow(promise, &target),
                }
            }
            Value::Remotable(w) if w.vref().allocated_by_vat() => {
                self.settle(promise, Resolution::LocalObject(w))
            }
            Value::Remotable(w) => self.settle(promise, Resolution::Presence(w)),
            data => self.settle(promise, Resolution::Data(data)),
        }
    }

    /// The single transition point: record the resolution, fire subscribers
    /// in order, re-route held sends, emit the one `resolve` the kernel is
    /// owed, retire the vpid.
    fn settle(&mut self, promise: &PromiseId, resolution: Resolution) -> Result<()> {
        let settled = self.promises.settle(promise, resolution)?;

        for subscriber in settled.subscribers {
            match subscriber {
                Subscriber::Forward(follower) => self.settle(&follower, settled.resolution.clone())?,
                Subscriber::Callback { derived, callback } => {
                    self.run_callback(derived, callback, &settled.resolution)?
                }
            }
        }
        for queued in settled.queued {
            self.route_queued(&settled.resolution, queued)?;
        }

        if let (Decider::Vat, Some(vpid)) = (settled.decider, &settled.vpid) {
            self.emit_resolve(vpid, &settled.resolution)?;
        }
        self.retire_unless_named(promise, &settled.resolution)
    }

    fn emit_resolve(&mut self, vpid: &VatRef, resolution: &Resolution) -> Result<()> {
        let data = capdata::serialize(&resolution.value(), self)?;
        self.syscall.resolve(&[VatResolution {
            vpid: vpid.clone(),
            rejected: resolution.is_rejected(),
            data,
        }])
    }

    /// A vpid named inside its own resolution stays live: the kernel still
    /// refers to it.
    fn retire_unless_named(&mut self, promise: &PromiseId, resolution: &Resolution) -> Result<()> {
        if resolution.value().mentions_promise(promise) {
            debug!(promise = %promise, "vpid kept: named by its own resolution");
            return Ok(());
        }
        self.promises.retire(promise)
    }

    fn resolve_fresh(&mut self, promise: PromiseId) -> Result<()> {
        let record = self.promises.record(&promise)?;
        let (Some(resolution), Some(vpid)) = (record.resolution.clone(), record.vpid.clone()) else {
            panic!("Invariant violation: {promise} queued for a fresh resolve without a vpid and resolution");
        };
        self.emit_resolve(&vpid, &resolution)?;
        self.retire_unless_named(&promise, &resolution)
    }

    fn run_callback(
        &mut self,
        derived: PromiseId,
        callback: Continuation,
        resolution: &Resolution,
    ) -> Result<()> {
        match callback(self, resolution) {
            Ok(value) => self.fulfill(&derived, value),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => self.settle(&derived, Resolution::Rejected(Value::error(err.to_string()))),
        }
    }

    /// Deliver a send that was held on a promise, now that it has settled.
    /// Failures reject the held send's result instead of raising.
    fn route_queued(&mut self, resolution: &Resolution, queued: QueuedSend) -> Result<()> {
        let QueuedSend { method, args, result } = queued;
        match resolution {
            Resolution::Presence(w) => {
                let remote = self.send_remote(w.vref(), &method, args)?;
                if let Some(result) = result {
                    self.promises.follow(&result, &remote)?;
                }
                Ok(())
            }
            Resolution::LocalObject(w) => {
                self.ready.push_back(Job::Deliver { target: w.clone(), method, args, result });
                Ok(())
            }
            Resolution::Data(_) => match result {
                Some(result) => {
                    let reason = Value::error(
                        VatError::NotCallable { target: "data".into(), method }.to_string(),
                    );
                    self.settle(&result, Resolution::Rejected(reason))
                }
                None => Ok(()),
            },
            Resolution::Rejected(reason) => match result {
                Some(result) => self.settle(&result, Resolution::Rejected(reason.clone())),
                None => Ok(()),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Vat powers
    // -----------------------------------------------------------------------

    /// A new unresolved promise decided by this vat.
    pub fn make_promise(&mut self) -> PromiseId {
        self.promises.create_local()
    }

    /// Eventual send. Returns the result promise. Sending to data or to a
    /// rejected promise fails here, before any syscall.
    pub fn send(&mut self, target: &Value, method: &str, args: Vec<Value>) -> Result<PromiseId> {
        match target {
            Value::Remotable(w) => self.send_to_object(w, method, args),
            Value::Promise(p) => self.send_to_promise(p, method, args),
            other => Err(VatError::NotCallable { target: format!("{other:?}"), method: method.into() }),
        }
    }

    fn send_to_object(&mut self, target: &Wrapper, method: &str, args: Vec<Value>) -> Result<PromiseId> {
        if target.vref().allocated_by_vat() {
            let result = self.promises.create_local();
            self.ready.push_back(Job::Deliver {
                target: target.clone(),
                method: method.to_string(),
                args,
                result: Some(result.clone()),
            });
            return Ok(result);
        }
        self.send_remote(target.vref(), method, args)
    }

    fn send_to_promise(&mut self, promise: &PromiseId, method: &str, args: Vec<Value>) -> Result<PromiseId> {
        let record = self.promises.record(promise)?;
        match (record.resolution.clone(), record.vpid.clone(), record.following.clone()) {
            // Pipelined: the kernel re-routes it once the promise settles.
            (None, Some(vpid), _) => self.send_remote(&vpid, method, args),
            (None, None, Some(leader)) => self.send_to_promise(&leader, method, args),
            (None, None, None) => {
                let result = self.promises.create_local();
                self.promises.record_mut(promise)?.queued.push(QueuedSend {
                    method: method.to_string(),
                    args,
                    result: Some(result.clone()),
                });
                Ok(result)
            }
            (Some(Resolution::Presence(w)), _, _) | (Some(Resolution::LocalObject(w)), _, _) => {
                self.send_to_object(&w, method, args)
            }
            (Some(Resolution::Data(data)), _, _) => Err(VatError::NotCallable {
                target: format!("{data:?}"),
                method: method.to_string(),
            }),
            (Some(Resolution::Rejected(reason)), _, _) => Err(VatError::Rejected {
                method: method.to_string(),
                reason: format!("{reason:?}"),
            }),
        }
    }

    /// Serialize the arguments, allocate the result vpid, then `send` and
    /// `subscribe`, in that order.
    fn send_remote(&mut self, target: &VatRef, method: &str, args: Vec<Value>) -> Result<PromiseId> {
        let data = capdata::serialize(&Value::List(args), self)?;
        let (result, vpid) = self.promises.allocate_result();
        self.syscall.send(target, method, &data, Some(&vpid))?;
        self.syscall.subscribe(&vpid)?;
        Ok(result)
    }

    /// Register a continuation. Returns a promise settled with its outcome.
    /// Continuations of an already settled promise run later in this crank.
    pub fn then<F>(&mut self, promise: &PromiseId, callback: F) -> Result<PromiseId>
    where
        F: FnOnce(&mut LiveSlots, &Resolution) -> Result<Value> + 'static,
    {
        let resolution = self.promises.record(promise)?.resolution.clone();
        let derived = self.promises.create_local();
        let callback: Continuation = Box::new(callback);
        match resolution {
            Some(resolution) => self.ready.push_back(Job::Callback {
                derived: derived.clone(),
                callback,
                resolution,
            }),
            None => self
                .promises
                .record_mut(promise)?
                .subscribers
                .push(Subscriber::Callback { derived: derived.clone(), callback }),
        }
        Ok(derived)
    }

    pub fn promise_status(&self, promise: &PromiseId) -> Option<PromiseStatus> {
        self.promises.status(promise)
    }

    /// The promise's current vpid, if it has one.
    pub fn vpid_of(&self, promise: &PromiseId) -> Option<VatRef> {
        self.promises.vpid_of(promise).cloned()
    }

    pub fn resolution_of(&self, promise: &PromiseId) -> Option<Resolution> {
        self.promises.record(promise).ok().and_then(|r| r.resolution.clone())
    }

    /// Promise records currently held, including any a later crank will reclaim.
    pub fn promise_count(&self) -> usize {
        self.promises.len()
    }

    /// Synchronous device call. Promises may not be passed to a device.
    pub fn call_now(&mut self, device: &Wrapper, method: &str, args: Vec<Value>) -> Result<Value> {
        if args.iter().any(Value::contains_promise) {
            return Err(VatError::PromiseToDevice { method: method.to_string() });
        }
        device.vref().insist_kind(RefKind::Device)?;
        let data = capdata::serialize(&Value::List(args), self)?;
        let reply = self.syscall.call_now(device.vref(), method, &data)?;
        capdata::unserialize(&reply, self)
    }

    /// Export an in-memory object under a fresh `o+N`.
    pub fn export(&mut self, object: Box<dyn VatObject>) -> Wrapper {
        let vref = VatRef::export_object(self.next_export_id);
        self.next_export_id += 1;
        self.register_export(vref, object)
    }

    fn register_export(&mut self, vref: VatRef, object: Box<dyn VatObject>) -> Wrapper {
        let wrapper = self.bridge.mint(&vref);
        self.export_wrappers.insert(vref.clone(), wrapper.clone());
        self.exports.insert(vref.clone(), object);
        debug!(vat = %self.config.vat_id, vref = %vref, "object exported");
        wrapper
    }

    pub fn weak_refs(&mut self) -> &mut WeakRefBridge<Value> {
        &mut self.bridge
    }

    // -----------------------------------------------------------------------
    // Virtual objects
    // -----------------------------------------------------------------------

    pub fn define_kind(&mut self, behavior: Rc<dyn VirtualKind>) -> KindId {
        let id = self.next_export_id;
        self.next_export_id += 1;
        debug!(vat = %self.config.vat_id, kind = id, tag = behavior.tag(), "kind defined");
        self.kinds.insert(id, KindEntry { behavior, next_instance: 1 });
        KindId(id)
    }

    /// Create an instance with the given properties. The state is written to
    /// the cache as dirty; nothing reaches the store until eviction or flush.
    pub fn make_virtual(&mut self, kind: KindId, initial: BTreeMap<String, Value>) -> Result<Wrapper> {
        let entry = self
            .kinds
            .get_mut(&kind.0)
            .ok_or_else(|| VatError::UnknownObject { vref: VatRef::export_object(kind.0).to_string() })?;
        let instance = entry.next_instance;
        entry.next_instance += 1;
        let behavior = entry.behavior.clone();
        let vref = VatRef::virtual_object(kind.0, instance);

        let mut raw = RawState::new();
        for (prop, value) in &initial {
            raw.insert(prop.clone(), self.serialize_property(&vref, prop, value)?);
        }
        self.cache.remember(&vref, raw)?;
        self.cache.mark_dirty(&vref);
        let this = self.bridge.mint(&vref);

        self.cache.pin(&vref);
        let outcome = behavior.init(self, &this);
        self.cache.unpin(&vref);
        if let Err(err) = outcome {
            self.cache.forget(&vref);
            return Err(err);
        }
        Ok(this)
    }

    pub fn vo_get(&mut self, this: &Wrapper, prop: &str) -> Result<Value> {
        let vref = self.insist_virtual(this)?;
        let data = self
            .cache
            .lookup(&vref)?
            .get(prop)
            .cloned()
            .ok_or_else(|| VatError::NoSuchProperty { vref: vref.to_string(), prop: prop.into() })?;
        capdata::unserialize(&data, self)
    }

    pub fn vo_set(&mut self, this: &Wrapper, prop: &str, value: Value) -> Result<()> {
        let vref = self.insist_virtual(this)?;
        let data = self.serialize_property(&vref, prop, &value)?;
        let state = self.cache.lookup_mut(&vref)?;
        match state.get_mut(prop) {
            Some(slot) => *slot = data,
            None => {
                return Err(VatError::NoSuchProperty { vref: vref.to_string(), prop: prop.into() })
            }
        }
        self.cache.mark_dirty(&vref);
        Ok(())
    }

    /// Write back every dirty instance and empty the cache.
    pub fn flush_cache(&mut self) -> Result<()> {
        self.cache.flush()
    }

    pub fn cache(&self) -> &VirtualObjectCache {
        &self.cache
    }

    fn serialize_property(&mut self, vref: &VatRef, prop: &str, value: &Value) -> Result<CapData> {
        if value.contains_promise() {
            return Err(VatError::Marshal(format!(
                "property {prop:?} of {vref} cannot hold a promise"
            )));
        }
        capdata::serialize(value, self)
    }

    fn insist_virtual(&self, this: &Wrapper) -> Result<VatRef> {
        let vref = this.vref();
        if vref.is_virtual() && self.kinds.contains_key(&vref.id) {
            Ok(vref.clone())
        } else {
            Err(VatError::UnknownObject { vref: vref.to_string() })
        }
    }

    fn kind_behavior(&self, kind: u64) -> Result<Rc<dyn VirtualKind>> {
        self.kinds
            .get(&kind)
            .map(|entry| entry.behavior.clone())
            .ok_or_else(|| VatError::UnknownObject { vref: VatRef::export_object(kind).to_string() })
    }
}

// ---------------------------------------------------------------------------
// Slot mapping
// ---------------------------------------------------------------------------

impl SlotMapper for LiveSlots {
    fn slot_for_remotable(&mut self, rep: &Wrapper) -> Result<VatRef> {
        let vref = rep.vref();
        // The export table lends an object out while its method runs; its
        // wrapper stays registered.
        if vref.allocated_by_vat() && !vref.is_virtual() && !self.export_wrappers.contains_key(vref) {
            return Err(VatError::UnknownObject { vref: vref.to_string() });
        }
        Ok(vref.clone())
    }

    fn slot_for_promise(&mut self, promise: &PromiseId) -> Result<VatRef> {
        match self.promises.export(promise)? {
            Exported::Existing(vpid) => Ok(vpid),
            Exported::Fresh(vpid) => {
                if self.promises.record(promise)?.is_settled() {
                    self.ready.push_back(Job::ResolveFresh { promise: promise.clone() });
                }
                Ok(vpid)
            }
        }
    }

    fn value_for_slot(&mut self, slot: &VatRef) -> Result<Value> {
        match slot.kind {
            RefKind::Promise => {
                if let Some(id) = self.promises.lookup(slot) {
                    return Ok(Value::Promise(id));
                }
                let id = self.promises.import(slot)?;
                self.syscall.subscribe(slot)?;
                Ok(Value::Promise(id))
            }
            RefKind::Object if slot.is_virtual() => {
                if !self.kinds.contains_key(&slot.id) {
                    return Err(VatError::UnknownObject { vref: slot.to_string() });
                }
                Ok(Value::Remotable(self.bridge.mint(slot)))
            }
            RefKind::Object if slot.allocated_by_vat() => self
                .export_wrappers
                .get(slot)
                .cloned()
                .map(Value::Remotable)
                .ok_or_else(|| VatError::UnknownObject { vref: slot.to_string() }),
            RefKind::Object | RefKind::Device => {
                if slot.allocated_by_vat() {
                    return Err(VatError::UnknownObject { vref: slot.to_string() });
                }
                Ok(Value::Remotable(self.bridge.mint(slot)))
            }
        }
    }
}
