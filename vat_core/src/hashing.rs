//! Vat core - Canonical Hashing
//!
//! Deterministic canonical serialization + SHA-256 of an effect log.
//! Two replays of the same deliveries must hash identically.
//!
//! Rules:
//!   - core_version first, then effects in program order
//!   - effect fields in declaration order, refs in compact string form
//!   - UTF-8 JSON, no whitespace, no float

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::effects::Effect;
use crate::error::Result;
use crate::CORE_VERSION;

/// Canonical serialization of an effect log to UTF-8 JSON bytes.
pub fn canonical_serialize(effects: &[Effect]) -> Result<Vec<u8>> {
    let mut root = Map::new();
    // core_version binds the hash to the dispatch semantics.
    root.insert("core_version".to_string(), Value::Number(CORE_VERSION.into()));
    root.insert("effects".to_string(), serde_json::to_value(effects)?);
    Ok(serde_json::to_string(&Value::Object(root))?.into_bytes())
}

/// SHA-256 of the canonical serialization. Lowercase hex string.
pub fn canonical_hash(effects: &[Effect]) -> Result<String> {
    let bytes = canonical_serialize(effects)?;
    Ok(hex(&Sha256::digest(&bytes)))
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vref::VatRef;

    fn sample() -> Vec<Effect> {
        vec![
            Effect::Fetch { key: "vom.o+1/1".into(), value: None },
            Effect::Subscribe { target: VatRef::import_object(1) },
        ]
    }

    #[test]
    fn serialization_is_compact_and_versioned() {
        let bytes = canonical_serialize(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(r#"{"core_version":1,"effects":[{"type":"fetch""#));
        assert!(!text.contains(' '));
    }

    #[test]
    fn hash_is_stable_and_order_sensitive() {
        let a = canonical_hash(&sample()).unwrap();
        assert_eq!(a, canonical_hash(&sample()).unwrap());
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let mut reversed = sample();
        reversed.reverse();
        assert_ne!(a, canonical_hash(&reversed).unwrap());
    }
}
