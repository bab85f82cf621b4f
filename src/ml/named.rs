// ============================================================
// Layer 5 — Named Parameter Traversal
// ============================================================
// Burn's ModuleVisitor / ModuleMapper walk parameters by id.
// Weight transfer between a base model and its LoRA variant
// needs stable *names* instead ("layers.0.attn.q_proj.weight"),
// so every building block implements `NamedParams` and passes
// a dotted prefix down the tree.
//
//   visit_named — read-only walk (shapes, export)
//   map_named   — consuming walk that may replace each Param
//                 (weight loading, require_grad hand-off)

use burn::{
    module::Param,
    nn::{Embedding, Linear},
    prelude::*,
};

use crate::domain::{error::PeftError, traits::ParamShape};

/// Join a parent prefix and a child segment with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

pub trait ParamVisitor<B: Backend> {
    fn visit<const D: usize>(&mut self, name: &str, param: &Param<Tensor<B, D>>);
}

pub trait ParamMapper<B: Backend> {
    fn map<const D: usize>(
        &mut self,
        name: &str,
        param: Param<Tensor<B, D>>,
    ) -> Result<Param<Tensor<B, D>>, PeftError>;
}

pub trait NamedParams<B: Backend>: Sized {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V);

    fn map_named<M: ParamMapper<B>>(self, prefix: &str, mapper: &mut M)
        -> Result<Self, PeftError>;
}

impl<B: Backend> NamedParams<B> for Linear<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        visitor.visit(&join(prefix, "weight"), &self.weight);
        if let Some(bias) = &self.bias {
            visitor.visit(&join(prefix, "bias"), bias);
        }
    }

    fn map_named<M: ParamMapper<B>>(
        mut self,
        prefix: &str,
        mapper: &mut M,
    ) -> Result<Self, PeftError> {
        self.weight = mapper.map(&join(prefix, "weight"), self.weight)?;
        self.bias = match self.bias {
            Some(bias) => Some(mapper.map(&join(prefix, "bias"), bias)?),
            None => None,
        };
        Ok(self)
    }
}

impl<B: Backend> NamedParams<B> for Embedding<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        visitor.visit(&join(prefix, "weight"), &self.weight);
    }

    fn map_named<M: ParamMapper<B>>(
        mut self,
        prefix: &str,
        mapper: &mut M,
    ) -> Result<Self, PeftError> {
        self.weight = mapper.map(&join(prefix, "weight"), self.weight)?;
        Ok(self)
    }
}

// ─── Shape collection ─────────────────────────────────────────────────────────
/// Records the name and dims of every visited parameter. Shapes are read
/// without initialising lazy parameters.
#[derive(Debug, Default)]
pub struct ShapeCollector {
    pub shapes: Vec<ParamShape>,
}

impl<B: Backend> ParamVisitor<B> for ShapeCollector {
    fn visit<const D: usize>(&mut self, name: &str, param: &Param<Tensor<B, D>>) {
        let dims = param.lazy_shape().dims.to_vec();
        self.shapes.push(ParamShape::new(name, dims));
    }
}
