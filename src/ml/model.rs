// ============================================================
// Layer 5 — Decoder-only Transformer (Gemma style)
// ============================================================
// One config builds both variants of the model:
//
//   init_base — every projection is Projection::Plain
//   init_lora — selected projections are Projection::Lora
//
// Both share the same parameter names for everything that is
// not an adapter, so the base state dict loads straight into
// the LoRA model.
//
// Parameter layout (per layer i):
//   tok_embeddings.weight
//   layers.i.sa_norm.scale
//   layers.i.attn.{q_proj,k_proj,v_proj,output_proj}.weight
//   layers.i.mlp_norm.scale
//   layers.i.mlp.{w1,w2,w3}.weight
//   norm.scale
//   output.weight            (only when embeddings are untied)

use std::{fmt, str::FromStr};

use burn::{
    module::Param,
    nn::{Embedding, EmbeddingConfig},
    prelude::*,
    tensor::TensorData,
};
use serde::{Deserialize, Serialize};

use crate::domain::{
    error::PeftError,
    target::LoraTarget,
    traits::{ParamInventory, ParamShape},
};
use crate::ml::{
    lora::{LoraConfig, Projection},
    named::{join, NamedParams, ParamMapper, ParamVisitor, ShapeCollector},
};

// ─── Presets ──────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelSize {
    /// 2 layers, 4 heads, embed 64 — builds in milliseconds on CPU
    Small,
    /// Gemma 2B: 18 layers, 8 query heads, 1 kv head
    Gemma2b,
}

impl ModelSize {
    pub fn config(&self) -> DecoderConfig {
        match self {
            ModelSize::Small => {
                DecoderConfig::new(1024, 2, 4, 4, 16, 64, 256).with_tie_embeddings(false)
            }
            ModelSize::Gemma2b => DecoderConfig::new(256_000, 18, 8, 1, 256, 2048, 16_384)
                .with_max_seq_len(8192),
        }
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSize::Small => write!(f, "small"),
            ModelSize::Gemma2b => write!(f, "gemma-2b"),
        }
    }
}

impl FromStr for ModelSize {
    type Err = PeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(ModelSize::Small),
            "gemma-2b" | "gemma_2b" => Ok(ModelSize::Gemma2b),
            other => Err(PeftError::InvalidConfig(format!(
                "unknown model size '{other}', expected 'small' or 'gemma-2b'"
            ))),
        }
    }
}

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
// internally — do NOT add them again or you get conflicting impls.
#[derive(Config, Debug)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub embed_dim: usize,
    pub intermediate_dim: usize,
    #[config(default = 2048)]
    pub max_seq_len: usize,
    #[config(default = 1e-6)]
    pub norm_eps: f64,
    #[config(default = 10000.0)]
    pub rope_base: f64,
    /// Reuse the token embedding as the output projection
    #[config(default = true)]
    pub tie_embeddings: bool,
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<(), PeftError> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
            ("embed_dim", self.embed_dim),
            ("intermediate_dim", self.intermediate_dim),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(PeftError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(PeftError::InvalidConfig(format!(
                "num_heads ({}) must be divisible by num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(PeftError::InvalidConfig(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim
            )));
        }
        Ok(())
    }

    /// Build the plain model.
    pub fn init_base<B: Backend>(&self, device: &B::Device) -> Result<Decoder<B>, PeftError> {
        self.validate()?;
        Ok(self.build(None, device))
    }

    /// Build the same architecture with adapters on the projections `lora` selects.
    pub fn init_lora<B: Backend>(
        &self,
        lora: &LoraConfig,
        device: &B::Device,
    ) -> Result<Decoder<B>, PeftError> {
        self.validate_lora(lora)?;
        Ok(self.build(Some(lora), device))
    }

    /// Check that `lora` can be applied to this architecture.
    pub fn validate_lora(&self, lora: &LoraConfig) -> Result<(), PeftError> {
        self.validate()?;
        lora.validate()?;
        if lora.apply_lora_to_output && self.tie_embeddings {
            return Err(PeftError::InvalidConfig(
                "apply_lora_to_output needs an untied output projection; this preset ties it to the embeddings"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn build<B: Backend>(&self, lora: Option<&LoraConfig>, device: &B::Device) -> Decoder<B> {
        let tok_embeddings = EmbeddingConfig::new(self.vocab_size, self.embed_dim).init(device);
        let layers = (0..self.num_layers)
            .map(|_| self.build_layer(lora, device))
            .collect();
        let norm = RmsNorm::new(self.embed_dim, self.norm_eps, device);
        let output = (!self.tie_embeddings).then(|| {
            let adapt = lora.filter(|c| c.apply_lora_to_output);
            Projection::build(self.embed_dim, self.vocab_size, adapt, device)
        });
        Decoder {
            tok_embeddings,
            layers,
            norm,
            output,
            embed_dim: self.embed_dim,
        }
    }

    fn build_layer<B: Backend>(&self, lora: Option<&LoraConfig>, device: &B::Device) -> DecoderLayer<B> {
        let q_dim = self.num_heads * self.head_dim;
        let kv_dim = self.num_kv_heads * self.head_dim;
        let attn_proj = |target: LoraTarget, d_in: usize, d_out: usize| {
            Projection::build(d_in, d_out, lora.filter(|c| c.targets(target)), device)
        };
        let attn = CausalSelfAttention {
            q_proj: attn_proj(LoraTarget::QProj, self.embed_dim, q_dim),
            k_proj: attn_proj(LoraTarget::KProj, self.embed_dim, kv_dim),
            v_proj: attn_proj(LoraTarget::VProj, self.embed_dim, kv_dim),
            output_proj: attn_proj(LoraTarget::OutputProj, q_dim, self.embed_dim),
            num_heads: self.num_heads,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            rope_base: self.rope_base,
        };

        let mlp_lora = lora.filter(|c| c.apply_lora_to_mlp);
        let mlp = FeedForward {
            w1: Projection::build(self.embed_dim, self.intermediate_dim, mlp_lora, device),
            w2: Projection::build(self.intermediate_dim, self.embed_dim, mlp_lora, device),
            w3: Projection::build(self.embed_dim, self.intermediate_dim, mlp_lora, device),
        };

        DecoderLayer {
            sa_norm: RmsNorm::new(self.embed_dim, self.norm_eps, device),
            attn,
            mlp_norm: RmsNorm::new(self.embed_dim, self.norm_eps, device),
            mlp,
        }
    }
}

// ─── RMS norm ─────────────────────────────────────────────────────────────────
/// x / rms(x) · (1 + scale), with `scale` starting at zero.
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    pub scale: Param<Tensor<B, 1>>,
    pub eps: f64,
}

impl<B: Backend> RmsNorm<B> {
    pub fn new(dim: usize, eps: f64, device: &B::Device) -> Self {
        Self {
            scale: Param::from_tensor(Tensor::zeros([dim], device)),
            eps,
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let rms = x
            .clone()
            .powf_scalar(2.0)
            .mean_dim(D - 1)
            .add_scalar(self.eps)
            .sqrt();
        let gain = self.scale.val().add_scalar(1.0).unsqueeze::<D>();
        x.div(rms).mul(gain)
    }
}

impl<B: Backend> NamedParams<B> for RmsNorm<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        visitor.visit(&join(prefix, "scale"), &self.scale);
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Result<Self, PeftError> {
        self.scale = mapper.map(&join(prefix, "scale"), self.scale)?;
        Ok(self)
    }
}

// ─── Attention ────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct CausalSelfAttention<B: Backend> {
    pub q_proj: Projection<B>,
    pub k_proj: Projection<B>,
    pub v_proj: Projection<B>,
    pub output_proj: Projection<B>,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub rope_base: f64,
}

impl<B: Backend> CausalSelfAttention<B> {
    /// The four projections in a fixed order, tagged with their target.
    pub fn projections(&self) -> [(LoraTarget, &Projection<B>); 4] {
        [
            (LoraTarget::QProj, &self.q_proj),
            (LoraTarget::KProj, &self.k_proj),
            (LoraTarget::VProj, &self.v_proj),
            (LoraTarget::OutputProj, &self.output_proj),
        ]
    }

    /// x: [batch, seq_len, embed_dim] → [batch, seq_len, embed_dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq_len, _] = x.dims();
        let device = x.device();

        let split_heads = |t: Tensor<B, 3>, heads: usize| {
            t.reshape([batch, seq_len, heads, self.head_dim]).swap_dims(1, 2)
        };
        let q = split_heads(self.q_proj.forward(x.clone()), self.num_heads);
        let k = split_heads(self.k_proj.forward(x.clone()), self.num_kv_heads);
        let v = split_heads(self.v_proj.forward(x), self.num_kv_heads);

        let (cos, sin) = rotary_tables::<B>(seq_len, self.head_dim, self.rope_base, &device);
        let q = q.clone().mul(cos.clone()) + rotate_half(q).mul(sin.clone());
        let k = k.clone().mul(cos) + rotate_half(k).mul(sin);

        let k = self.repeat_kv(k);
        let v = self.repeat_kv(v);

        let scores = q
            .matmul(k.swap_dims(2, 3))
            .div_scalar((self.head_dim as f64).sqrt())
            + causal_mask::<B>(seq_len, &device);
        let weights = burn::tensor::activation::softmax(scores, 3);

        let context = weights
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch, seq_len, self.num_heads * self.head_dim]);
        self.output_proj.forward(context)
    }

    /// [batch, kv_heads, seq, head_dim] → [batch, heads, seq, head_dim]
    fn repeat_kv(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let groups = self.num_heads / self.num_kv_heads;
        if groups == 1 {
            return x;
        }
        let [batch, kv_heads, seq_len, head_dim] = x.dims();
        x.unsqueeze_dim::<5>(2)
            .expand([batch, kv_heads, groups, seq_len, head_dim])
            .reshape([batch, kv_heads * groups, seq_len, head_dim])
    }

    pub fn describe(&self) -> String {
        let mut out = String::from("CausalSelfAttention(\n");
        for (target, proj) in self.projections() {
            out.push_str(&format!("  ({target}): {}\n", proj.describe()));
        }
        out.push_str(&format!(
            "  heads={}, kv_heads={}, head_dim={}\n)",
            self.num_heads, self.num_kv_heads, self.head_dim
        ));
        out
    }
}

impl<B: Backend> NamedParams<B> for CausalSelfAttention<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        for (target, proj) in self.projections() {
            proj.visit_named(&join(prefix, target.as_str()), visitor);
        }
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Result<Self, PeftError> {
        self.q_proj = self.q_proj.map_named(&join(prefix, "q_proj"), mapper)?;
        self.k_proj = self.k_proj.map_named(&join(prefix, "k_proj"), mapper)?;
        self.v_proj = self.v_proj.map_named(&join(prefix, "v_proj"), mapper)?;
        self.output_proj = self.output_proj.map_named(&join(prefix, "output_proj"), mapper)?;
        Ok(self)
    }
}

/// cos/sin tables shaped [1, 1, seq_len, head_dim] for rotate-half RoPE.
fn rotary_tables<B: Backend>(
    seq_len: usize,
    head_dim: usize,
    base: f64,
    device: &B::Device,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let half = head_dim / 2;
    let mut cos = Vec::with_capacity(seq_len * head_dim);
    let mut sin = Vec::with_capacity(seq_len * head_dim);
    for pos in 0..seq_len {
        for i in 0..head_dim {
            let inv_freq = base.powf(-((2 * (i % half)) as f64) / head_dim as f64);
            let angle = pos as f64 * inv_freq;
            cos.push(angle.cos() as f32);
            sin.push(angle.sin() as f32);
        }
    }
    let table = |values: Vec<f32>| {
        Tensor::<B, 2>::from_data(TensorData::new(values, vec![seq_len, head_dim]), device)
            .unsqueeze::<4>()
    };
    (table(cos), table(sin))
}

fn rotate_half<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let half = x.dims()[3] / 2;
    let x1 = x.clone().narrow(3, 0, half);
    let x2 = x.narrow(3, half, half);
    Tensor::cat(vec![x2.neg(), x1], 3)
}

/// Additive mask [1, 1, seq_len, seq_len]: 0 on and below the diagonal.
fn causal_mask<B: Backend>(seq_len: usize, device: &B::Device) -> Tensor<B, 4> {
    let values: Vec<f32> = (0..seq_len)
        .flat_map(|row| (0..seq_len).map(move |col| if col <= row { 0.0 } else { -1.0e9 }))
        .collect();
    Tensor::<B, 2>::from_data(TensorData::new(values, vec![seq_len, seq_len]), device)
        .unsqueeze::<4>()
}

// ─── Feed-forward ─────────────────────────────────────────────────────────────
/// Gated MLP: w2(gelu(w1 x) * w3 x)
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    pub w1: Projection<B>,
    pub w2: Projection<B>,
    pub w3: Projection<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let gate = burn::tensor::activation::gelu(self.w1.forward(x.clone()));
        self.w2.forward(gate * self.w3.forward(x))
    }

    pub fn projections(&self) -> [(&'static str, &Projection<B>); 3] {
        [("w1", &self.w1), ("w2", &self.w2), ("w3", &self.w3)]
    }
}

impl<B: Backend> NamedParams<B> for FeedForward<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        for (name, proj) in self.projections() {
            proj.visit_named(&join(prefix, name), visitor);
        }
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Result<Self, PeftError> {
        self.w1 = self.w1.map_named(&join(prefix, "w1"), mapper)?;
        self.w2 = self.w2.map_named(&join(prefix, "w2"), mapper)?;
        self.w3 = self.w3.map_named(&join(prefix, "w3"), mapper)?;
        Ok(self)
    }
}

// ─── Decoder layer ────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct DecoderLayer<B: Backend> {
    pub sa_norm: RmsNorm<B>,
    pub attn: CausalSelfAttention<B>,
    pub mlp_norm: RmsNorm<B>,
    pub mlp: FeedForward<B>,
}

impl<B: Backend> DecoderLayer<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let h = x.clone() + self.attn.forward(self.sa_norm.forward(x));
        h.clone() + self.mlp.forward(self.mlp_norm.forward(h))
    }
}

impl<B: Backend> NamedParams<B> for DecoderLayer<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.sa_norm.visit_named(&join(prefix, "sa_norm"), visitor);
        self.attn.visit_named(&join(prefix, "attn"), visitor);
        self.mlp_norm.visit_named(&join(prefix, "mlp_norm"), visitor);
        self.mlp.visit_named(&join(prefix, "mlp"), visitor);
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Result<Self, PeftError> {
        self.sa_norm = self.sa_norm.map_named(&join(prefix, "sa_norm"), mapper)?;
        self.attn = self.attn.map_named(&join(prefix, "attn"), mapper)?;
        self.mlp_norm = self.mlp_norm.map_named(&join(prefix, "mlp_norm"), mapper)?;
        self.mlp = self.mlp.map_named(&join(prefix, "mlp"), mapper)?;
        Ok(self)
    }
}

// ─── Decoder ──────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    pub tok_embeddings: Embedding<B>,
    pub layers: Vec<DecoderLayer<B>>,
    pub norm: RmsNorm<B>,
    /// `None` when the output projection is tied to `tok_embeddings`
    pub output: Option<Projection<B>>,
    pub embed_dim: usize,
}

impl<B: Backend> Decoder<B> {
    /// tokens: [batch, seq_len] → logits: [batch, seq_len, vocab_size]
    pub fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let mut h = self
            .tok_embeddings
            .forward(tokens)
            .mul_scalar((self.embed_dim as f64).sqrt());
        for layer in &self.layers {
            h = layer.forward(h);
        }
        let h = self.norm.forward(h);

        match &self.output {
            Some(output) => output.forward(h),
            None => {
                let [batch, _, _] = h.dims();
                let [vocab, embed] = self.tok_embeddings.weight.val().dims();
                let tied = self
                    .tok_embeddings
                    .weight
                    .val()
                    .transpose()
                    .unsqueeze::<3>()
                    .expand([batch, embed, vocab]);
                h.matmul(tied)
            }
        }
    }

    /// Every projection slot with its full dotted prefix, in traversal order.
    pub fn projections(&self) -> Vec<(String, &Projection<B>)> {
        let mut out = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_prefix = join("layers", &i.to_string());
            let attn_prefix = join(&layer_prefix, "attn");
            for (target, proj) in layer.attn.projections() {
                out.push((join(&attn_prefix, target.as_str()), proj));
            }
            let mlp_prefix = join(&layer_prefix, "mlp");
            for (name, proj) in layer.mlp.projections() {
                out.push((join(&mlp_prefix, name), proj));
            }
        }
        if let Some(output) = &self.output {
            out.push(("output".to_string(), output));
        }
        out
    }

    /// Text summary of one layer's attention block; `None` past the last layer.
    pub fn describe_attention(&self, layer: usize) -> Option<String> {
        self.layers.get(layer).map(|l| l.attn.describe())
    }
}

impl<B: Backend> NamedParams<B> for Decoder<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.tok_embeddings.visit_named(&join(prefix, "tok_embeddings"), visitor);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit_named(&join(&join(prefix, "layers"), &i.to_string()), visitor);
        }
        self.norm.visit_named(&join(prefix, "norm"), visitor);
        if let Some(output) = &self.output {
            output.visit_named(&join(prefix, "output"), visitor);
        }
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Result<Self, PeftError> {
        self.tok_embeddings = self
            .tok_embeddings
            .map_named(&join(prefix, "tok_embeddings"), mapper)?;
        let layers_prefix = join(prefix, "layers");
        self.layers = self
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| layer.map_named(&join(&layers_prefix, &i.to_string()), mapper))
            .collect::<Result<_, _>>()?;
        self.norm = self.norm.map_named(&join(prefix, "norm"), mapper)?;
        self.output = match self.output {
            Some(output) => Some(output.map_named(&join(prefix, "output"), mapper)?),
            None => None,
        };
        Ok(self)
    }
}

impl<B: Backend> ParamInventory for Decoder<B> {
    fn param_shapes(&self) -> Vec<ParamShape> {
        let mut shapes = ShapeCollector::default();
        self.visit_named("", &mut shapes);
        shapes.shapes
    }
}
