//! Vat core - Reference Model
//!
//! Canonical identifiers for objects, promises and devices.
//!
//! String form: `<kind><dir><id>[/<sub>]`
//!   kind: `o` object | `p` promise | `d` device
//!   dir:  `+` allocated by the vat (exported) | `-` allocated by the kernel (imported)
//!
//! Refs are never recycled within a vat incarnation. Ordering is derived
//! field-by-field so BTreeMap iteration over refs is deterministic.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, VatError};

/// Who allocated the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Allocated by this vat (`+`).
    Exported,
    /// Allocated by the kernel (`-`).
    Imported,
}

/// What the ref designates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefKind {
    Object,
    Promise,
    Device,
}

impl RefKind {
    fn tag(self) -> char {
        match self {
            RefKind::Object => 'o',
            RefKind::Promise => 'p',
            RefKind::Device => 'd',
        }
    }

    fn name(self) -> &'static str {
        match self {
            RefKind::Object => "object",
            RefKind::Promise => "promise",
            RefKind::Device => "device",
        }
    }
}

/// A vat-local reference ("vref"); a promise vref is a "vpid".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VatRef {
    pub kind: RefKind,
    pub direction: Direction,
    pub id: u64,
    pub sub_id: Option<u64>,
}

impl VatRef {
    /// `o+<id>`
    pub fn export_object(id: u64) -> Self {
        Self { kind: RefKind::Object, direction: Direction::Exported, id, sub_id: None }
    }

    /// `o-<id>`
    pub fn import_object(id: u64) -> Self {
        Self { kind: RefKind::Object, direction: Direction::Imported, id, sub_id: None }
    }

    /// `o+<kind>/<instance>`
    pub fn virtual_object(kind_id: u64, instance: u64) -> Self {
        Self {
            kind: RefKind::Object,
            direction: Direction::Exported,
            id: kind_id,
            sub_id: Some(instance),
        }
    }

    /// `p+<id>` or `p-<id>`
    pub fn promise(direction: Direction, id: u64) -> Self {
        Self { kind: RefKind::Promise, direction, id, sub_id: None }
    }

    /// `d-<id>`
    pub fn import_device(id: u64) -> Self {
        Self { kind: RefKind::Device, direction: Direction::Imported, id, sub_id: None }
    }

    /// The root object every vat exports at `o+0`.
    pub fn root() -> Self {
        Self::export_object(0)
    }

    pub fn is_promise(&self) -> bool {
        self.kind == RefKind::Promise
    }

    pub fn is_object(&self) -> bool {
        self.kind == RefKind::Object
    }

    pub fn is_device(&self) -> bool {
        self.kind == RefKind::Device
    }

    pub fn allocated_by_vat(&self) -> bool {
        self.direction == Direction::Exported
    }

    /// Virtual objects are exported objects carrying a sub-id.
    pub fn is_virtual(&self) -> bool {
        self.sub_id.is_some()
    }

    /// Refs whose wrapper may be reclaimed and later re-minted.
    pub fn is_remintable(&self) -> bool {
        match self.kind {
            RefKind::Object => !self.allocated_by_vat() || self.is_virtual(),
            RefKind::Device => true,
            RefKind::Promise => false,
        }
    }

    /// Fail unless this ref is of the given kind.
    pub fn insist_kind(&self, kind: RefKind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(VatError::WrongRefKind {
                vref: self.to_string(),
                expected: kind.name(),
            })
        }
    }

    /// Parse a compact ref string.
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = |detail: &str| VatError::MalformedRef {
            vref: s.to_string(),
            detail: detail.to_string(),
        };

        let mut chars = s.chars();
        let kind = match chars.next() {
            Some('o') => RefKind::Object,
            Some('p') => RefKind::Promise,
            Some('d') => RefKind::Device,
            _ => return Err(malformed("kind must be one of o, p, d")),
        };
        let direction = match chars.next() {
            Some('+') => Direction::Exported,
            Some('-') => Direction::Imported,
            _ => return Err(malformed("direction must be + or -")),
        };

        let rest = chars.as_str();
        let (id_str, sub_str) = match rest.split_once('/') {
            Some((id, sub)) => (id, Some(sub)),
            None => (rest, None),
        };
        let id = parse_number(id_str).ok_or_else(|| malformed("id must be a decimal number"))?;
        let sub_id = match sub_str {
            Some(sub) => {
                Some(parse_number(sub).ok_or_else(|| malformed("sub-id must be a decimal number"))?)
            }
            None => None,
        };

        if sub_id.is_some() && (kind != RefKind::Object || direction != Direction::Exported) {
            return Err(malformed("only exported objects may carry a sub-id"));
        }

        Ok(Self { kind, direction, id, sub_id })
    }
}

/// Decimal digits only, no sign, no leading zeros (except "0").
fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for VatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Exported => '+',
            Direction::Imported => '-',
        };
        write!(f, "{}{}{}", self.kind.tag(), dir, self.id)?;
        if let Some(sub) = self.sub_id {
            write!(f, "/{}", sub)?;
        }
        Ok(())
    }
}

impl FromStr for VatRef {
    type Err = VatError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for VatRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VatRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VatRef::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_kind_and_direction() {
        let cases = ["o+0", "o-12", "p+5", "p-8", "d-1", "o+2/7"];
        for case in cases {
            let vref = VatRef::parse(case).unwrap();
            assert_eq!(vref.to_string(), case);
        }
        let v = VatRef::parse("o+2/7").unwrap();
        assert!(v.is_virtual());
        assert_eq!(v, VatRef::virtual_object(2, 7));
    }

    #[test]
    fn rejects_malformed_refs() {
        for bad in ["", "x+1", "o*1", "o+", "o+01", "o+1/", "p+1/2", "o-1/2", "o+-3", "o+1a"] {
            assert!(
                matches!(VatRef::parse(bad), Err(VatError::MalformedRef { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn remintable_refs() {
        assert!(VatRef::import_object(3).is_remintable());
        assert!(VatRef::virtual_object(1, 1).is_remintable());
        assert!(VatRef::import_device(1).is_remintable());
        assert!(!VatRef::export_object(4).is_remintable());
        assert!(!VatRef::promise(Direction::Imported, 9).is_remintable());
    }

    #[test]
    fn serde_uses_compact_string() {
        let v = VatRef::promise(Direction::Exported, 5);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"p+5\"");
        let back: VatRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn insist_kind_reports_expected_kind() {
        let err = VatRef::import_object(1).insist_kind(RefKind::Promise).unwrap_err();
        assert_eq!(
            err,
            VatError::WrongRefKind { vref: "o-1".to_string(), expected: "promise" }
        );
    }
}
