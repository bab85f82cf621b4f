// ============================================================
// Layer 2 — InspectUseCase
// ============================================================
// Builds the base and LoRA variants of one preset and renders
// the same attention block from both, so the extra adapter
// weights can be compared side by side.

use anyhow::{anyhow, Result};
use burn::prelude::*;

use crate::ml::{
    lora::LoraConfig,
    model::{Decoder, ModelSize},
    peft::get_adapter_params,
};

pub struct AttentionComparison {
    pub base:           String,
    pub lora:           String,
    pub adapter_params: usize,
}

pub fn compare_attention<B: Backend>(
    size:   ModelSize,
    lora:   &LoraConfig,
    layer:  usize,
    device: &B::Device,
) -> Result<AttentionComparison> {
    let cfg = size.config();
    let base_model: Decoder<B> = cfg.init_base(device)?;
    let lora_model: Decoder<B> = cfg.init_lora(lora, device)?;

    let out_of_range = || anyhow!("layer {layer} out of range, '{size}' has {} layers", cfg.num_layers);
    Ok(AttentionComparison {
        base:           base_model.describe_attention(layer).ok_or_else(out_of_range)?,
        lora:           lora_model.describe_attention(layer).ok_or_else(out_of_range)?,
        adapter_params: get_adapter_params(&lora_model).len(),
    })
}
