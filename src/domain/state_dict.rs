// ============================================================
// Layer 3 — Parameter Mapping (state dict)
// ============================================================
// An ordered name → value mapping of every parameter in a
// model. Order is the model's traversal order so exports are
// stable and diffs between two runs line up.
//
// Values are kept on the host as f32 with their shape, which
// is enough to move weights between two models built from
// the same architecture preset.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::domain::error::PeftError;

/// One exported parameter: row-major values plus shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamValue {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParamValue {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    pub fn numel(&self) -> usize {
        self.values.len()
    }

    /// The value count must match the product of the shape.
    pub fn check(&self, name: &str) -> Result<(), PeftError> {
        let expected: usize = self.shape.iter().product();
        if self.numel() == expected {
            return Ok(());
        }
        Err(PeftError::TensorData {
            name: name.to_string(),
            detail: format!("shape {:?} needs {expected} values, found {}", self.shape, self.numel()),
        })
    }

    /// Compare the raw bit patterns, so NaN payloads and signed zeros count.
    pub fn bit_eq(&self, other: &ParamValue) -> bool {
        self.shape == other.shape
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    pub fn is_all_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }
}

/// Serialised as a plain list of `[name, value]` pairs; the lookup index
/// is rebuilt on the way in and duplicate names are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(
    try_from = "Vec<(String, ParamValue)>",
    into = "Vec<(String, ParamValue)>"
)]
pub struct StateDict {
    entries: Vec<(String, ParamValue)>,
    index: HashMap<String, usize>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        let name = name.into();
        match self.index.get(&name) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, value));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Keep only the named parameters, in their original order.
    pub fn filter(&self, keep: &BTreeSet<String>) -> StateDict {
        let mut out = StateDict::new();
        for (name, value) in self.iter().filter(|(n, _)| keep.contains(*n)) {
            out.insert(name, value.clone());
        }
        out
    }
}

impl TryFrom<Vec<(String, ParamValue)>> for StateDict {
    type Error = PeftError;

    fn try_from(entries: Vec<(String, ParamValue)>) -> Result<Self, Self::Error> {
        let mut out = StateDict::new();
        let mut duplicates = Vec::new();
        for (name, value) in entries {
            if out.contains(&name) {
                duplicates.push(name);
            } else {
                out.insert(name, value);
            }
        }
        if duplicates.is_empty() {
            Ok(out)
        } else {
            Err(PeftError::InvalidConfig(format!(
                "duplicate parameter names in state dict: {duplicates:?}"
            )))
        }
    }
}

impl From<StateDict> for Vec<(String, ParamValue)> {
    fn from(sd: StateDict) -> Self {
        sd.entries
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn value(v: f32) -> ParamValue {
        ParamValue::new(vec![2], vec![v, v])
    }

    #[test]
    fn test_insert_keeps_order_and_replaces_in_place() {
        let mut sd = StateDict::new();
        sd.insert("b", value(1.0));
        sd.insert("a", value(2.0));
        sd.insert("b", value(3.0));

        let names: Vec<&str> = sd.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(sd.get("b").unwrap().values, vec![3.0, 3.0]);
        assert_eq!(sd.len(), 2);
    }

    #[test]
    fn test_lookup_works_after_json() {
        let mut sd = StateDict::new();
        sd.insert("x", value(1.0));
        sd.insert("y", value(2.0));
        let keep: BTreeSet<String> = ["y".to_string()].into();

        let json = serde_json::to_string(&sd.filter(&keep)).unwrap();
        let back: StateDict = serde_json::from_str(&json).unwrap();
        assert!(back.contains("y"));
        assert!(!back.contains("x"));
        assert_eq!(back.get("y").unwrap().values, vec![2.0, 2.0]);
    }

    #[test]
    fn test_duplicate_names_in_json_are_rejected() {
        let json = r#"[["w", {"shape": [1], "values": [1.0]}], ["w", {"shape": [1], "values": [2.0]}]]"#;
        let err = serde_json::from_str::<StateDict>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate parameter names"));
    }

    #[test]
    fn test_value_count_must_match_shape() {
        assert!(ParamValue::new(vec![2, 3], vec![0.0; 6]).check("w").is_ok());
        let err = ParamValue::new(vec![64], vec![0.0; 3]).check("norm.scale").unwrap_err();
        assert!(matches!(err, PeftError::TensorData { ref name, .. } if name == "norm.scale"));
    }

    #[test]
    fn test_bit_eq_distinguishes_signed_zero() {
        let a = ParamValue::new(vec![1], vec![0.0]);
        let b = ParamValue::new(vec![1], vec![-0.0]);
        assert!(a.bit_eq(&a.clone()));
        assert!(!a.bit_eq(&b));
        assert!(a.is_all_zero() && b.is_all_zero());
    }
}
