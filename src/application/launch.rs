// ============================================================
// Layer 2 — Distributed Launch Command
// ============================================================
// Fine-tuning runs in an external distributed launcher. This
// module only renders the command line; it never spawns it.
//
//   tune run --nnodes 1 --nproc_per_node 2 \
//       lora_finetune_distributed --config gemma/2B_lora

use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const LAUNCHER: &str = "tune";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub nnodes:         usize,
    pub nproc_per_node: usize,
    pub recipe:         String,
    pub config:         String,
}

impl Default for LaunchPlan {
    fn default() -> Self {
        Self {
            nnodes:         1,
            nproc_per_node: 2,
            recipe:         "lora_finetune_distributed".to_string(),
            config:         "gemma/2B_lora".to_string(),
        }
    }
}

impl LaunchPlan {
    pub fn validate(&self) -> Result<()> {
        if self.nnodes == 0 {
            bail!("--nnodes must be at least 1");
        }
        if self.nproc_per_node == 0 {
            bail!("--nproc-per-node must be at least 1");
        }
        if self.recipe.trim().is_empty() || self.config.trim().is_empty() {
            bail!("recipe and config must not be empty");
        }
        Ok(())
    }

    /// Arguments after the launcher binary.
    pub fn argv(&self) -> Vec<String> {
        vec![
            "run".to_string(),
            "--nnodes".to_string(),
            self.nnodes.to_string(),
            "--nproc_per_node".to_string(),
            self.nproc_per_node.to_string(),
            self.recipe.clone(),
            "--config".to_string(),
            self.config.clone(),
        ]
    }
}

impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{LAUNCHER}")?;
        for arg in self.argv() {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}
