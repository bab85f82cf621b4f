// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types that describe a LoRA preparation run:
// which projections get adapters, the exported parameter
// mapping, the trainability side-table and the final report.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only plain Rust structs, enums, and traits
//
// The ML layer implements `ParamInventory` for its models so
// everything in here can be tested against tiny fakes.

/// Errors shared by every layer below the CLI
pub mod error;

/// Adapter targets (q_proj, k_proj, v_proj, output_proj)
pub mod target;

/// Ordered name → value parameter mapping
pub mod state_dict;

/// Core abstraction over "something with named parameters"
pub mod traits;

/// Trainability side-table and the selector that builds it
pub mod trainability;

/// Total / trainable parameter counts
pub mod report;
