// ============================================================
// Layer 3 — Adapter Targets
// ============================================================
// The four linear projections inside a self-attention block
// that can carry a low-rank adapter. The string form is the
// projection's name inside the model, so it doubles as the
// CLI spelling and the parameter-name segment
// (e.g. "layers.0.attn.q_proj.weight").

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::domain::error::PeftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LoraTarget {
    #[serde(rename = "q_proj")]
    QProj,
    #[serde(rename = "k_proj")]
    KProj,
    #[serde(rename = "v_proj")]
    VProj,
    #[serde(rename = "output_proj")]
    OutputProj,
}

impl LoraTarget {
    pub const ALL: [LoraTarget; 4] = [
        LoraTarget::QProj,
        LoraTarget::KProj,
        LoraTarget::VProj,
        LoraTarget::OutputProj,
    ];

    /// Name of the projection inside an attention block
    pub fn as_str(&self) -> &'static str {
        match self {
            LoraTarget::QProj => "q_proj",
            LoraTarget::KProj => "k_proj",
            LoraTarget::VProj => "v_proj",
            LoraTarget::OutputProj => "output_proj",
        }
    }
}

impl fmt::Display for LoraTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoraTarget {
    type Err = PeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LoraTarget::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| {
                PeftError::InvalidConfig(format!(
                    "unknown attention projection '{s}', expected one of q_proj, k_proj, v_proj, output_proj"
                ))
            })
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_targets() {
        assert_eq!("q_proj".parse::<LoraTarget>().unwrap(), LoraTarget::QProj);
        assert_eq!(" v_proj".parse::<LoraTarget>().unwrap(), LoraTarget::VProj);
        assert_eq!(
            "output_proj".parse::<LoraTarget>().unwrap(),
            LoraTarget::OutputProj
        );
    }

    #[test]
    fn test_parse_unknown_target_is_config_error() {
        let err = "o_proj".parse::<LoraTarget>().unwrap_err();
        assert!(matches!(err, PeftError::InvalidConfig(_)));
    }

    #[test]
    fn test_serde_uses_projection_names() {
        let json = serde_json::to_string(&vec![LoraTarget::QProj, LoraTarget::VProj]).unwrap();
        assert_eq!(json, r#"["q_proj","v_proj"]"#);
    }
}
