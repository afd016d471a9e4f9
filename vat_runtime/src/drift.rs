//! Drift detection: determinism verification and effect-log comparison.

use std::collections::BTreeMap;

use vat_core::{Delivery, Effect, VatConfig};

use crate::error::{Result, RuntimeError};
use crate::replay::{self, RootBuilder};

/// Replay the same deliveries twice and fail unless both runs hash
/// identically. Returns the agreed hash.
pub fn verify_determinism(config: &VatConfig, deliveries: &[Delivery], build: &RootBuilder) -> Result<String> {
    let (effects_a, hash_a) = replay::rebuild(config, deliveries, build)?;
    let (effects_b, hash_b) = replay::rebuild(config, deliveries, build)?;
    if hash_a != hash_b {
        let report = compare_effects(&effects_a, &effects_b);
        return Err(RuntimeError::Nondeterministic {
            first_divergence: report.first_divergence,
            hash_a,
            hash_b,
        });
    }
    Ok(hash_a)
}

/// Structured comparison of two effect logs.
pub fn compare_effects(a: &[Effect], b: &[Effect]) -> DriftReport {
    let first_divergence = a
        .iter()
        .zip(b)
        .position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())));

    DriftReport {
        effect_count_a: a.len(),
        effect_count_b: b.len(),
        first_divergence,
        effect_a: first_divergence.and_then(|i| a.get(i).cloned()),
        effect_b: first_divergence.and_then(|i| b.get(i).cloned()),
        kinds_a: count_kinds(a),
        kinds_b: count_kinds(b),
    }
}

fn count_kinds(effects: &[Effect]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for effect in effects {
        *counts.entry(effect.kind()).or_insert(0) += 1;
    }
    counts
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    pub effect_count_a: usize,
    pub effect_count_b: usize,
    /// Index of the first differing effect; `None` when the logs are equal.
    pub first_divergence: Option<usize>,
    pub effect_a: Option<Effect>,
    pub effect_b: Option<Effect>,
    pub kinds_a: BTreeMap<&'static str, usize>,
    pub kinds_b: BTreeMap<&'static str, usize>,
}

impl DriftReport {
    pub fn is_identical(&self) -> bool {
        self.first_divergence.is_none()
    }
}
