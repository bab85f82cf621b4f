// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Four subcommands:
//   inspect — show base vs LoRA attention for one layer
//   base    — save a base checkpoint to start from
//   prepare — build, transfer, mark trainable, report
//   launch  — print the distributed fine-tuning command
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{Args, Subcommand, ValueEnum};

use crate::application::{launch::LaunchPlan, prepare_use_case::PrepareConfig};
use crate::domain::target::LoraTarget;
use crate::ml::{lora::LoraConfig, model::ModelSize};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the attention block of the base and the LoRA model
    Inspect(InspectArgs),

    /// Build a base model and save it as a checkpoint
    Base(BaseArgs),

    /// Load base weights into a LoRA model and mark adapters trainable
    Prepare(PrepareArgs),

    /// Print the distributed fine-tuning command (not executed)
    Launch(LaunchArgs),
}

/// Tensor backend the models are built on
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum BackendKind {
    /// CPU (ndarray)
    #[default]
    Ndarray,
    /// GPU through WGPU (needs the `wgpu` feature)
    Wgpu,
}

/// Architecture preset plus backend, shared by every model command
#[derive(Args, Debug)]
pub struct ModelArgs {
    /// Architecture preset: `small` or `gemma-2b`
    #[arg(long, default_value = "small")]
    pub size: ModelSize,

    #[arg(long, value_enum, default_value_t = BackendKind::Ndarray)]
    pub backend: BackendKind,
}

/// Which projections get adapters
#[derive(Args, Debug)]
pub struct LoraArgs {
    /// Attention projections to adapt, comma separated
    /// (q_proj, k_proj, v_proj, output_proj)
    #[arg(long, value_delimiter = ',', default_value = "q_proj,k_proj,v_proj")]
    pub lora_attn_modules: Vec<LoraTarget>,

    /// Also adapt the MLP projections
    #[arg(long)]
    pub apply_lora_to_mlp: bool,

    /// Also adapt the final output projection (untied presets only)
    #[arg(long)]
    pub apply_lora_to_output: bool,

    /// Rank of the low-rank update
    #[arg(long, default_value_t = 8)]
    pub rank: usize,

    /// Update scale numerator; the update is scaled by alpha / rank
    #[arg(long, default_value_t = 16.0)]
    pub alpha: f64,

    /// Dropout applied to the adapter input
    #[arg(long, default_value_t = 0.0)]
    pub dropout: f64,
}

impl From<&LoraArgs> for LoraConfig {
    fn from(a: &LoraArgs) -> Self {
        LoraConfig::new(a.lora_attn_modules.clone())
            .with_apply_lora_to_mlp(a.apply_lora_to_mlp)
            .with_apply_lora_to_output(a.apply_lora_to_output)
            .with_rank(a.rank)
            .with_alpha(a.alpha)
            .with_dropout(a.dropout)
    }
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub lora: LoraArgs,

    /// Index of the decoder layer to print
    #[arg(long, default_value_t = 0)]
    pub layer: usize,
}

#[derive(Args, Debug)]
pub struct BaseArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Directory to write `base_model.mpk.gz` into
    #[arg(long, default_value = "checkpoints/base")]
    pub out_dir: String,
}

#[derive(Args, Debug)]
pub struct PrepareArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub lora: LoraArgs,

    /// Directory with a base checkpoint written by `base`;
    /// without it the base model keeps its random init
    #[arg(long)]
    pub base_checkpoint: Option<String>,

    /// Directory for the prepared model and its JSON side files
    #[arg(long)]
    pub out_dir: Option<String>,
}

/// Convert CLI PrepareArgs into the application-layer PrepareConfig.
/// The application layer never sees clap types.
impl From<PrepareArgs> for PrepareConfig {
    fn from(a: PrepareArgs) -> Self {
        PrepareConfig {
            size:            a.model.size,
            lora:            LoraConfig::from(&a.lora),
            base_checkpoint: a.base_checkpoint,
            out_dir:         a.out_dir,
        }
    }
}

#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Number of nodes
    #[arg(long, default_value_t = 1)]
    pub nnodes: usize,

    /// Processes (GPUs) per node
    #[arg(long, default_value_t = 2)]
    pub nproc_per_node: usize,

    /// Recipe the launcher should run
    #[arg(long, default_value = "lora_finetune_distributed")]
    pub recipe: String,

    /// Recipe config name or path
    #[arg(long, default_value = "gemma/2B_lora")]
    pub config: String,
}

impl From<LaunchArgs> for LaunchPlan {
    fn from(a: LaunchArgs) -> Self {
        LaunchPlan {
            nnodes:         a.nnodes,
            nproc_per_node: a.nproc_per_node,
            recipe:         a.recipe,
            config:         a.config,
        }
    }
}
