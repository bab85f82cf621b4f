//! Configuration and weight-transfer errors.

use thiserror::Error;

/// Errors raised while building, loading or partitioning a model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeftError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The `missing` or `unexpected` key set of a load did not match
    /// what the caller declared.
    #[error(
        "{kind} keys differ from expectation: not expected {surplus:?}, expected but absent {absent:?}"
    )]
    KeyMismatch {
        kind: KeyKind,
        surplus: Vec<String>,
        absent: Vec<String>,
    },

    #[error("Unknown parameter names: {0:?}")]
    UnknownParameters(Vec<String>),

    #[error("Shape mismatch for '{name}': model has {expected:?}, source has {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Tensor data error for '{name}': {detail}")]
    TensorData { name: String, detail: String },
}

/// Which side of a load a key mismatch was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Present in the target model, absent from the source mapping
    Missing,
    /// Present in the source mapping, absent from the target model
    Unexpected,
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyKind::Missing => write!(f, "Missing"),
            KeyKind::Unexpected => write!(f, "Unexpected"),
        }
    }
}
