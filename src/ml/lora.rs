// ============================================================
// Layer 5 — Low-Rank Adapters
// ============================================================
// A projection is either a plain Linear or a Linear with a
// LoRA correction:
//
//   y = W x + (alpha / rank) · B (A (dropout(x)))
//
//   A: in  → rank   Kaiming-uniform init (Burn's Linear default)
//   B: rank → out   zero init, so y == W x right after building
//
// The frozen W keeps the parameter names a plain Linear would
// have ("q_proj.weight"), which is what lets a base model's
// state dict load into the LoRA model without any renaming.
// The adapter weights live under "q_proj.lora_a.weight" and
// "q_proj.lora_b.weight".

use std::collections::BTreeSet;

use burn::{
    nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig},
    prelude::*,
};

use crate::domain::{error::PeftError, target::LoraTarget};
use crate::ml::named::{join, NamedParams, ParamMapper, ParamVisitor, ShapeCollector};

/// Which projections receive adapters, and the adapter hyperparameters.
#[derive(Config, Debug)]
pub struct LoraConfig {
    /// Attention projections to adapt
    pub lora_attn_modules: Vec<LoraTarget>,
    /// Also adapt the MLP projections (w1, w2, w3)
    #[config(default = false)]
    pub apply_lora_to_mlp: bool,
    /// Also adapt the final output projection
    #[config(default = false)]
    pub apply_lora_to_output: bool,
    #[config(default = 8)]
    pub rank: usize,
    #[config(default = 16.0)]
    pub alpha: f64,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl LoraConfig {
    pub fn validate(&self) -> Result<(), PeftError> {
        if self.lora_attn_modules.is_empty() && !self.apply_lora_to_mlp && !self.apply_lora_to_output
        {
            return Err(PeftError::InvalidConfig(
                "no projection selected for LoRA".to_string(),
            ));
        }
        let unique: BTreeSet<_> = self.lora_attn_modules.iter().collect();
        if unique.len() != self.lora_attn_modules.len() {
            return Err(PeftError::InvalidConfig(format!(
                "duplicate entries in lora_attn_modules: {:?}",
                self.lora_attn_modules
            )));
        }
        if self.rank == 0 {
            return Err(PeftError::InvalidConfig("LoRA rank must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(PeftError::InvalidConfig(format!(
                "LoRA dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    pub fn targets(&self, target: LoraTarget) -> bool {
        self.lora_attn_modules.contains(&target)
    }

    pub fn init_linear<B: Backend>(
        &self,
        d_input: usize,
        d_output: usize,
        device: &B::Device,
    ) -> LoraLinear<B> {
        LoraLinear {
            base: LinearConfig::new(d_input, d_output).with_bias(false).init(device),
            lora_a: LinearConfig::new(d_input, self.rank).with_bias(false).init(device),
            lora_b: LinearConfig::new(self.rank, d_output)
                .with_bias(false)
                .with_initializer(Initializer::Zeros)
                .init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            rank: self.rank,
            alpha: self.alpha,
        }
    }
}

#[derive(Module, Debug)]
pub struct LoraLinear<B: Backend> {
    /// Frozen pretrained weight
    pub base: Linear<B>,
    pub lora_a: Linear<B>,
    pub lora_b: Linear<B>,
    pub dropout: Dropout,
    pub rank: usize,
    pub alpha: f64,
}

impl<B: Backend> LoraLinear<B> {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let frozen = self.base.forward(x.clone());
        let update = self
            .lora_b
            .forward(self.lora_a.forward(self.dropout.forward(x)))
            .mul_scalar(self.scaling());
        frozen + update
    }

    /// Visit only the adapter weights.
    pub fn visit_adapter<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.lora_a.visit_named(&join(prefix, "lora_a"), visitor);
        self.lora_b.visit_named(&join(prefix, "lora_b"), visitor);
    }
}

impl<B: Backend> NamedParams<B> for LoraLinear<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.base.visit_named(prefix, visitor);
        self.visit_adapter(prefix, visitor);
    }

    fn map_named<M: ParamMapper<B>>(
        mut self,
        prefix: &str,
        mapper: &mut M,
    ) -> Result<Self, PeftError> {
        self.base = self.base.map_named(prefix, mapper)?;
        self.lora_a = self.lora_a.map_named(&join(prefix, "lora_a"), mapper)?;
        self.lora_b = self.lora_b.map_named(&join(prefix, "lora_b"), mapper)?;
        Ok(self)
    }
}

// ─── Projection ───────────────────────────────────────────────────────────────
/// A linear projection slot in the decoder. Adapter discovery is a match
/// on this variant.
#[derive(Module, Debug)]
pub enum Projection<B: Backend> {
    Plain(Linear<B>),
    Lora(LoraLinear<B>),
}

impl<B: Backend> Projection<B> {
    pub fn plain(d_input: usize, d_output: usize, device: &B::Device) -> Self {
        Projection::Plain(LinearConfig::new(d_input, d_output).with_bias(false).init(device))
    }

    /// Plain when `lora` is `None`, adapted otherwise.
    pub fn build(
        d_input: usize,
        d_output: usize,
        lora: Option<&LoraConfig>,
        device: &B::Device,
    ) -> Self {
        match lora {
            Some(cfg) => Projection::Lora(cfg.init_linear(d_input, d_output, device)),
            None => Projection::plain(d_input, d_output, device),
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Projection::Plain(linear) => linear.forward(x),
            Projection::Lora(lora) => lora.forward(x),
        }
    }

    /// Names of the adapter parameters under `prefix`; empty for a plain projection.
    pub fn adapter_param_names(&self, prefix: &str) -> Vec<String> {
        match self {
            Projection::Plain(_) => Vec::new(),
            Projection::Lora(lora) => {
                let mut shapes = ShapeCollector::default();
                lora.visit_adapter(prefix, &mut shapes);
                shapes.shapes.into_iter().map(|p| p.name).collect()
            }
        }
    }

    /// One-line summary, e.g. `LoRALinear(in_dim=64, out_dim=64, rank=8, alpha=16)`.
    pub fn describe(&self) -> String {
        match self {
            Projection::Plain(linear) => {
                let dims = linear.weight.lazy_shape().dims;
                let (d_in, d_out) = (dims[0], dims[1]);
                format!(
                    "Linear(in_features={d_in}, out_features={d_out}, bias={})",
                    linear.bias.is_some()
                )
            }
            Projection::Lora(lora) => {
                let dims = lora.base.weight.lazy_shape().dims;
                let (d_in, d_out) = (dims[0], dims[1]);
                format!(
                    "LoRALinear(in_dim={d_in}, out_dim={d_out}, rank={}, alpha={})",
                    lora.rank, lora.alpha
                )
            }
        }
    }
}

impl<B: Backend> NamedParams<B> for Projection<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        match self {
            Projection::Plain(linear) => linear.visit_named(prefix, visitor),
            Projection::Lora(lora) => lora.visit_named(prefix, visitor),
        }
    }

    fn map_named<M: ParamMapper<B>>(self, prefix: &str, mapper: &mut M) -> Result<Self, PeftError> {
        Ok(match self {
            Projection::Plain(linear) => Projection::Plain(linear.map_named(prefix, mapper)?),
            Projection::Lora(lora) => Projection::Lora(lora.map_named(prefix, mapper)?),
        })
    }
}
