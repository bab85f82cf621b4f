// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The trainability selector and the reporter only need the
// names and shapes of a model's parameters. They program
// against `ParamInventory` instead of a concrete Burn model:
//
//   - Decoder<B> (ml layer) → walks its projections
//   - test fakes            → a hand-written list of shapes

/// Name and dimensions of one parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamShape {
    pub name: String,
    pub dims: Vec<usize>,
}

impl ParamShape {
    pub fn new(name: impl Into<String>, dims: Vec<usize>) -> Self {
        Self { name: name.into(), dims }
    }

    /// Element count. A zero-rank shape is a scalar and counts as one.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }
}

// ─── ParamInventory ───────────────────────────────────────────────────────────
/// Anything that can enumerate its named parameters.
pub trait ParamInventory {
    /// Every parameter in traversal order. Names are unique.
    fn param_shapes(&self) -> Vec<ParamShape>;

    fn param_names(&self) -> Vec<String> {
        self.param_shapes().into_iter().map(|p| p.name).collect()
    }
}

impl ParamInventory for Vec<ParamShape> {
    fn param_shapes(&self) -> Vec<ParamShape> {
        self.clone()
    }
}
