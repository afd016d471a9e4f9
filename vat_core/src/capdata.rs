//! Vat core - CapData & Marshalling
//!
//! `CapData` is the only shape in which identity crosses the vat boundary:
//! a JSON `body` plus an ordered list of `slots`. Inside the body a
//! capability appears as `{"@qclass":"slot","index":N}` naming `slots[N]`.
//! Errors travel as `{"@qclass":"error","message":...}`.
//!
//! The marshaller is pure: turning a capability into a slot (and back) is
//! delegated to a [`SlotMapper`], which the dispatcher implements.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::error::{Result, VatError};
use crate::promise::PromiseId;
use crate::vref::VatRef;
use crate::weak::Wrapper;

/// Key reserved for marshal markers inside bodies.
pub const QCLASS: &str = "@qclass";

/// Serialized form of a value: JSON body + capability slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapData {
    pub body: String,
    pub slots: Vec<VatRef>,
}

impl CapData {
    pub fn new(body: impl Into<String>, slots: Vec<VatRef>) -> Self {
        Self { body: body.into(), slots }
    }

    /// Body consisting of a single slot marker for `slots[0]`.
    pub fn for_slot(vref: VatRef) -> Self {
        Self {
            body: slot_marker(0).to_string(),
            slots: vec![vref],
        }
    }

    /// If the body is exactly one slot marker, the ref it names.
    pub fn sole_slot(&self) -> Option<&VatRef> {
        let body: Json = serde_json::from_str(&self.body).ok()?;
        let index = marker_index(&body)?;
        if index == 0 && self.slots.len() == 1 {
            self.slots.first()
        } else {
            None
        }
    }
}

/// The in-vat value model.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    /// A presence, local object, virtual object representative or device node.
    Remotable(Wrapper),
    Promise(PromiseId),
    Error(String),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Value::Error(message.into())
    }

    pub fn record<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Record(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_remotable(&self) -> Option<&Wrapper> {
        match self {
            Value::Remotable(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&PromiseId> {
        match self {
            Value::Promise(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// True if `promise` appears anywhere inside this value.
    pub fn mentions_promise(&self, promise: &PromiseId) -> bool {
        match self {
            Value::Promise(p) => p == promise,
            Value::List(items) => items.iter().any(|v| v.mentions_promise(promise)),
            Value::Record(fields) => fields.values().any(|v| v.mentions_promise(promise)),
            _ => false,
        }
    }

    /// True if a promise appears anywhere inside this value.
    pub fn contains_promise(&self) -> bool {
        match self {
            Value::Promise(_) => true,
            Value::List(items) => items.iter().any(Value::contains_promise),
            Value::Record(fields) => fields.values().any(Value::contains_promise),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<Wrapper> for Value {
    fn from(w: Wrapper) -> Self {
        Value::Remotable(w)
    }
}

impl From<PromiseId> for Value {
    fn from(p: PromiseId) -> Self {
        Value::Promise(p)
    }
}

/// Converts capabilities to slots and back. Implemented by the dispatcher,
/// which owns the export/import tables.
pub trait SlotMapper {
    fn slot_for_remotable(&mut self, rep: &Wrapper) -> Result<VatRef>;
    fn slot_for_promise(&mut self, promise: &PromiseId) -> Result<VatRef>;
    fn value_for_slot(&mut self, slot: &VatRef) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Serialize
// ---------------------------------------------------------------------------

/// Serialize a value. Each distinct ref occupies one slot, in first-seen order.
pub fn serialize(value: &Value, mapper: &mut dyn SlotMapper) -> Result<CapData> {
    let mut slots = Vec::new();
    let mut slot_index: BTreeMap<VatRef, usize> = BTreeMap::new();
    let body = encode(value, mapper, &mut slots, &mut slot_index)?;
    Ok(CapData {
        body: serde_json::to_string(&body)?,
        slots,
    })
}

fn encode(
    value: &Value,
    mapper: &mut dyn SlotMapper,
    slots: &mut Vec<VatRef>,
    slot_index: &mut BTreeMap<VatRef, usize>,
) -> Result<Json> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::Number((*n).into()),
        Value::Str(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(
            items
                .iter()
                .map(|item| encode(item, mapper, slots, slot_index))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Record(fields) => {
            if fields.contains_key(QCLASS) {
                return Err(VatError::Marshal(format!(
                    "records may not use the reserved key {QCLASS:?}"
                )));
            }
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k.clone(), encode(v, mapper, slots, slot_index)?);
            }
            Json::Object(map)
        }
        Value::Remotable(rep) => {
            let vref = mapper.slot_for_remotable(rep)?;
            slot_marker(intern_slot(vref, slots, slot_index))
        }
        Value::Promise(p) => {
            let vpid = mapper.slot_for_promise(p)?;
            slot_marker(intern_slot(vpid, slots, slot_index))
        }
        Value::Error(message) => {
            let mut map = Map::new();
            map.insert(QCLASS.to_string(), Json::String("error".to_string()));
            map.insert("message".to_string(), Json::String(message.clone()));
            Json::Object(map)
        }
    })
}

fn intern_slot(vref: VatRef, slots: &mut Vec<VatRef>, slot_index: &mut BTreeMap<VatRef, usize>) -> usize {
    *slot_index.entry(vref.clone()).or_insert_with(|| {
        slots.push(vref);
        slots.len() - 1
    })
}

fn slot_marker(index: usize) -> Json {
    let mut map = Map::new();
    map.insert(QCLASS.to_string(), Json::String("slot".to_string()));
    map.insert("index".to_string(), Json::Number(index.into()));
    Json::Object(map)
}

fn marker_index(body: &Json) -> Option<usize> {
    let obj = body.as_object()?;
    if obj.get(QCLASS)?.as_str()? != "slot" {
        return None;
    }
    usize::try_from(obj.get("index")?.as_u64()?).ok()
}

// ---------------------------------------------------------------------------
// Unserialize
// ---------------------------------------------------------------------------

/// Rebuild a value from CapData, asking the mapper for each referenced slot.
pub fn unserialize(data: &CapData, mapper: &mut dyn SlotMapper) -> Result<Value> {
    let body: Json = serde_json::from_str(&data.body)?;
    decode(&body, &data.slots, mapper)
}

fn decode(body: &Json, slots: &[VatRef], mapper: &mut dyn SlotMapper) -> Result<Value> {
    Ok(match body {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => Value::Int(
            n.as_i64()
                .ok_or_else(|| VatError::Marshal(format!("unsupported number {n}")))?,
        ),
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::List(
            items
                .iter()
                .map(|item| decode(item, slots, mapper))
                .collect::<Result<Vec<_>>>()?,
        ),
        Json::Object(map) => match map.get(QCLASS) {
            Some(qclass) => decode_marker(qclass, map, slots, mapper)?,
            None => {
                let mut fields = BTreeMap::new();
                for (k, v) in map {
                    fields.insert(k.clone(), decode(v, slots, mapper)?);
                }
                Value::Record(fields)
            }
        },
    })
}

fn decode_marker(
    qclass: &Json,
    map: &Map<String, Json>,
    slots: &[VatRef],
    mapper: &mut dyn SlotMapper,
) -> Result<Value> {
    match qclass.as_str() {
        Some("slot") => {
            let index = map
                .get("index")
                .and_then(Json::as_u64)
                .ok_or_else(|| VatError::Marshal("slot marker without index".to_string()))?;
            let slot = usize::try_from(index)
                .ok()
                .and_then(|i| slots.get(i))
                .ok_or_else(|| {
                    VatError::Marshal(format!("slot index {index} out of range ({} slots)", slots.len()))
                })?;
            mapper.value_for_slot(slot)
        }
        Some("error") => {
            let message = map.get("message").and_then(Json::as_str).unwrap_or("");
            Ok(Value::Error(message.to_string()))
        }
        other => Err(VatError::Marshal(format!("unknown {QCLASS} {other:?}"))),
    }
}
