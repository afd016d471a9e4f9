//! Vat core - Configuration

use serde::{Deserialize, Serialize};

use crate::error::{Result, VatError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VatConfig {
    /// Label attached to log events.
    pub vat_id: String,
    pub virtual_object_cache_size: usize,
    /// First `o+N` handed to an exported object or virtual kind.
    pub first_export_id: u64,
    /// First `p+N` allocated by the vat.
    pub first_promise_id: u64,
}

impl Default for VatConfig {
    fn default() -> Self {
        Self {
            vat_id: "unknown".to_string(),
            virtual_object_cache_size: 3,
            first_export_id: 1,
            first_promise_id: 5,
        }
    }
}

impl VatConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: VatConfig =
            serde_json::from_str(json).map_err(|e| VatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.virtual_object_cache_size == 0 {
            return Err(VatError::Config("virtual_object_cache_size must be at least 1".into()));
        }
        if self.first_export_id == 0 {
            // o+0 is the root object.
            return Err(VatError::Config("first_export_id must be at least 1".into()));
        }
        if self.first_promise_id == 0 {
            return Err(VatError::Config("first_promise_id must be at least 1".into()));
        }
        Ok(())
    }
}
