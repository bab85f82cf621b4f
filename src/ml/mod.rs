// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All Burn framework specific code lives here. The domain
// layer sees these models only through `ParamInventory`.
//
//   named.rs — dotted-name traversal over Burn params
//              (visitor for reading, mapper for replacing)
//
//   lora.rs  — LoraConfig, LoraLinear and the Projection
//              variant (Plain | Lora)
//
//   model.rs — decoder-only transformer, presets, base and
//              LoRA factories, forward pass
//
//   peft.rs  — state dict export/import with key checks,
//              adapter discovery, require_grad hand-off
//
// Reference: Hu et al. (2021) LoRA: Low-Rank Adaptation of
//            Large Language Models

/// Named parameter traversal
pub mod named;

/// Low-rank adapter layers
pub mod lora;

/// Decoder architecture and presets
pub mod model;

/// Weight transfer and adapter utilities
pub mod peft;
