// ============================================================
// Layer 2 — Application Layer (Use Cases)
// ============================================================
// Each use case strings the lower layers together for one CLI
// command. No clap types and no printing in here; the CLI
// layer decides how results are shown.
//
//   prepare_use_case.rs — base → LoRA → transfer → trainable
//                         → report → save
//   inspect_use_case.rs — base vs LoRA attention block
//   launch.rs           — the external fine-tuning command

pub mod prepare_use_case;

pub mod inspect_use_case;

pub mod launch;
