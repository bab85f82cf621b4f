// ============================================================
// Layer 3 — Trainability Selector
// ============================================================
// Instead of flipping a flag stored on each parameter, the
// selector returns a side-table: parameter name → trainable.
// The table is passed alongside the model (reporter, burn's
// require_grad hand-off, JSON next to the checkpoint).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::{error::PeftError, traits::ParamInventory};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trainability {
    flags: BTreeMap<String, bool>,
}

impl Trainability {
    /// Unknown names are frozen.
    pub fn is_trainable(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn trainable_names(&self) -> BTreeSet<String> {
        self.flags
            .iter()
            .filter(|(_, on)| **on)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.flags.iter().map(|(n, on)| (n.as_str(), *on))
    }
}

/// Mark exactly `trainable` as trainable and every other parameter of
/// `model` as frozen.
///
/// Every name in `trainable` must exist in the model; the error lists all
/// names that don't.
pub fn set_trainable_params<M: ParamInventory + ?Sized>(
    model: &M,
    trainable: &BTreeSet<String>,
) -> Result<Trainability, PeftError> {
    let names = model.param_names();
    let known: BTreeSet<&str> = names.iter().map(String::as_str).collect();

    let unknown: Vec<String> = trainable
        .iter()
        .filter(|n| !known.contains(n.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(PeftError::UnknownParameters(unknown));
    }

    let flags = names
        .into_iter()
        .map(|n| {
            let on = trainable.contains(&n);
            (n, on)
        })
        .collect();
    Ok(Trainability { flags })
}
