// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// File-system concerns that don't belong to the model or the
// domain:
//
//   checkpoint.rs — model weights via Burn's file recorder,
//                   plus the JSON side files of a prepared
//                   run (config, trainability, report,
//                   adapter-only state dict)
//
// Reference: Rust Book §9 (Error Handling with anyhow)
//            Burn Book §5 (Checkpointing)

/// Model checkpoint saving and loading
pub mod checkpoint;
