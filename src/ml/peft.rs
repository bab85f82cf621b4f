// ============================================================
// Layer 5 — Weight Transfer and Adapter Utilities
// ============================================================
// The four operations that turn a freshly built LoRA model
// into one that is ready to fine-tune:
//
//   state_dict          — export name → value from any decoder
//   load_state_dict     — copy matching names into a decoder,
//                         with the missing/extra key sets checked
//                         against an explicit KeyPolicy
//   get_adapter_params  — structural walk over Projection::Lora
//   apply_trainability  — push the side-table into Burn's
//                         require_grad flags before training
//
// Keys, shapes and value counts are all validated before any
// value is copied, so a rejected load never leaves a half-loaded
// model behind.

use std::collections::BTreeSet;

use burn::{module::Param, prelude::*, tensor::TensorData};

use crate::domain::{
    error::{KeyKind, PeftError},
    state_dict::{ParamValue, StateDict},
    traits::ParamInventory,
    trainability::Trainability,
};
use crate::ml::{
    model::Decoder,
    named::{NamedParams, ParamMapper, ParamVisitor},
};

// ─── Export ───────────────────────────────────────────────────────────────────
struct StateDictExporter {
    out: StateDict,
    error: Option<PeftError>,
}

impl<B: Backend> ParamVisitor<B> for StateDictExporter {
    fn visit<const D: usize>(&mut self, name: &str, param: &Param<Tensor<B, D>>) {
        if self.error.is_some() {
            return;
        }
        let tensor = param.val();
        let shape = tensor.dims().to_vec();
        match tensor.into_data().convert::<f32>().to_vec::<f32>() {
            Ok(values) => self.out.insert(name, ParamValue::new(shape, values)),
            Err(e) => {
                self.error = Some(PeftError::TensorData {
                    name: name.to_string(),
                    detail: format!("{e:?}"),
                })
            }
        }
    }
}

/// Export every parameter of `model`, in traversal order.
pub fn state_dict<B: Backend>(model: &Decoder<B>) -> Result<StateDict, PeftError> {
    let mut exporter = StateDictExporter {
        out: StateDict::new(),
        error: None,
    };
    model.visit_named("", &mut exporter);
    match exporter.error {
        Some(e) => Err(e),
        None => Ok(exporter.out),
    }
}

// ─── Import ───────────────────────────────────────────────────────────────────
/// What a load is allowed to leave unmatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Source and target must have exactly the same names.
    Strict,
    /// The target-only (`missing`) and source-only (`unexpected`) name sets
    /// must equal these sets exactly.
    Expect {
        missing: BTreeSet<String>,
        unexpected: BTreeSet<String>,
    },
}

impl KeyPolicy {
    /// Loading a base model into its LoRA variant: exactly the adapter
    /// weights are missing and nothing is left over.
    pub fn for_lora(adapter_params: BTreeSet<String>) -> Self {
        KeyPolicy::Expect {
            missing: adapter_params,
            unexpected: BTreeSet::new(),
        }
    }

    fn check(&self, missing: &BTreeSet<String>, unexpected: &BTreeSet<String>) -> Result<(), PeftError> {
        let none = BTreeSet::new();
        let (want_missing, want_unexpected) = match self {
            KeyPolicy::Strict => (&none, &none),
            KeyPolicy::Expect { missing, unexpected } => (missing, unexpected),
        };
        compare(KeyKind::Missing, missing, want_missing)?;
        compare(KeyKind::Unexpected, unexpected, want_unexpected)
    }
}

fn compare(kind: KeyKind, actual: &BTreeSet<String>, expected: &BTreeSet<String>) -> Result<(), PeftError> {
    if actual == expected {
        return Ok(());
    }
    Err(PeftError::KeyMismatch {
        kind,
        surplus: actual.difference(expected).cloned().collect(),
        absent: expected.difference(actual).cloned().collect(),
    })
}

/// Outcome of a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: BTreeSet<String>,
    pub unexpected: BTreeSet<String>,
}

struct StateDictLoader<'a> {
    source: &'a StateDict,
    loaded: usize,
}

impl<B: Backend> ParamMapper<B> for StateDictLoader<'_> {
    fn map<const D: usize>(
        &mut self,
        name: &str,
        param: Param<Tensor<B, D>>,
    ) -> Result<Param<Tensor<B, D>>, PeftError> {
        let Some(value) = self.source.get(name) else {
            return Ok(param);
        };
        let (id, current, mapper) = param.consume();
        let data = TensorData::new(value.values.clone(), value.shape.clone());
        let tensor = Tensor::<B, D>::from_data(data, &current.device());
        self.loaded += 1;
        Ok(Param::from_mapped_value(id, tensor, mapper))
    }
}

/// Copy every identically named value of `source` into `model`.
///
/// Names only in the model keep their current values, names only in the
/// source are ignored, and both sets must match `policy`. Every common
/// name must agree on shape and carry exactly that many values.
pub fn load_state_dict<B: Backend>(
    model: Decoder<B>,
    source: &StateDict,
    policy: &KeyPolicy,
) -> Result<(Decoder<B>, LoadReport), PeftError> {
    let shapes = model.param_shapes();
    let target: BTreeSet<String> = shapes.iter().map(|s| s.name.clone()).collect();
    let provided = source.names();

    let missing: BTreeSet<String> = target.difference(&provided).cloned().collect();
    let unexpected: BTreeSet<String> = provided.difference(&target).cloned().collect();
    policy.check(&missing, &unexpected)?;

    for shape in &shapes {
        let Some(value) = source.get(&shape.name) else {
            continue;
        };
        if value.shape != shape.dims {
            return Err(PeftError::ShapeMismatch {
                name: shape.name.clone(),
                expected: shape.dims.clone(),
                actual: value.shape.clone(),
            });
        }
        value.check(&shape.name)?;
    }

    let mut loader = StateDictLoader { source, loaded: 0 };
    let model = model.map_named("", &mut loader)?;
    Ok((
        model,
        LoadReport {
            loaded: loader.loaded,
            missing,
            unexpected,
        },
    ))
}

// ─── Adapters ─────────────────────────────────────────────────────────────────
/// Names of every parameter that belongs to a LoRA adapter.
pub fn get_adapter_params<B: Backend>(model: &Decoder<B>) -> BTreeSet<String> {
    model
        .projections()
        .into_iter()
        .flat_map(|(prefix, proj)| proj.adapter_param_names(&prefix))
        .collect()
}

/// Export only the adapter weights, e.g. to save next to a checkpoint.
pub fn get_adapter_state_dict<B: Backend>(model: &Decoder<B>) -> Result<StateDict, PeftError> {
    Ok(state_dict(model)?.filter(&get_adapter_params(model)))
}

struct RequireGrad<'a> {
    table: &'a Trainability,
}

impl<B: Backend> ParamMapper<B> for RequireGrad<'_> {
    fn map<const D: usize>(
        &mut self,
        name: &str,
        param: Param<Tensor<B, D>>,
    ) -> Result<Param<Tensor<B, D>>, PeftError> {
        Ok(param.set_require_grad(self.table.is_trainable(name)))
    }
}

/// Set Burn's `require_grad` on every parameter from the side-table.
/// The table must cover exactly the model's parameters.
pub fn apply_trainability<B: Backend>(
    model: Decoder<B>,
    table: &Trainability,
) -> Result<Decoder<B>, PeftError> {
    let names: BTreeSet<String> = model.param_names().into_iter().collect();
    let covered: BTreeSet<String> = table.iter().map(|(n, _)| n.to_string()).collect();
    let unknown: Vec<String> = covered.difference(&names).cloned().collect();
    if !unknown.is_empty() {
        return Err(PeftError::UnknownParameters(unknown));
    }
    let uncovered: Vec<String> = names.difference(&covered).cloned().collect();
    if !uncovered.is_empty() {
        return Err(PeftError::InvalidConfig(format!(
            "trainability table does not cover {uncovered:?}"
        )));
    }
    model.map_named("", &mut RequireGrad { table })
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{report::ParamReport, target::LoraTarget, trainability::set_trainable_params};
    use crate::ml::{lora::LoraConfig, model::ModelSize};
    use burn::backend::{Autodiff, NdArray};

    type TB = NdArray;

    fn build_pair(targets: Vec<LoraTarget>) -> (Decoder<TB>, Decoder<TB>) {
        let device = Default::default();
        let cfg = ModelSize::Small.config();
        let base = cfg.init_base(&device).unwrap();
        let lora = cfg.init_lora(&LoraConfig::new(targets), &device).unwrap();
        (base, lora)
    }

    #[test]
    fn test_adapter_params_for_q_and_v() {
        let (_, lora) = build_pair(vec![LoraTarget::QProj, LoraTarget::VProj]);
        let expected: BTreeSet<String> = [0, 1]
            .iter()
            .flat_map(|i| {
                ["q_proj", "v_proj"].iter().flat_map(move |p| {
                    ["lora_a", "lora_b"]
                        .iter()
                        .map(move |ab| format!("layers.{i}.attn.{p}.{ab}.weight"))
                })
            })
            .collect();
        assert_eq!(get_adapter_params(&lora), expected);
        assert_eq!(expected.len(), 8);
    }

    #[test]
    fn test_transfer_copies_common_and_keeps_adapters() {
        let (base, lora) = build_pair(vec![LoraTarget::QProj, LoraTarget::VProj]);
        let base_sd = state_dict(&base).unwrap();
        let before = state_dict(&lora).unwrap();
        let adapters = get_adapter_params(&lora);

        let (lora, report) =
            load_state_dict(lora, &base_sd, &KeyPolicy::for_lora(adapters.clone())).unwrap();
        assert_eq!(report.missing, adapters);
        assert!(report.unexpected.is_empty());
        assert_eq!(report.loaded, base_sd.len());

        let after = state_dict(&lora).unwrap();
        for (name, value) in after.iter() {
            match base_sd.get(name) {
                Some(base_value) => assert!(value.bit_eq(base_value), "{name} not copied"),
                None => {
                    assert!(adapters.contains(name));
                    assert!(value.bit_eq(before.get(name).unwrap()), "{name} overwritten");
                    if name.contains("lora_a") {
                        assert!(!value.is_all_zero(), "{name} lost its init");
                    }
                }
            }
        }
    }

    #[test]
    fn test_strict_policy_rejects_adapter_model() {
        let (base, lora) = build_pair(vec![LoraTarget::QProj]);
        let base_sd = state_dict(&base).unwrap();
        let err = load_state_dict(lora, &base_sd, &KeyPolicy::Strict).unwrap_err();
        match err {
            PeftError::KeyMismatch { kind, surplus, absent } => {
                assert_eq!(kind, KeyKind::Missing);
                assert_eq!(surplus.len(), 4);
                assert!(absent.is_empty());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_strict_policy_accepts_identical_architecture() {
        let (base, _) = build_pair(vec![LoraTarget::QProj]);
        let device = Default::default();
        let other: Decoder<TB> = ModelSize::Small.config().init_base(&device).unwrap();
        let (other, report) =
            load_state_dict(other, &state_dict(&base).unwrap(), &KeyPolicy::Strict).unwrap();
        assert!(report.missing.is_empty());
        let a = state_dict(&base).unwrap();
        let b = state_dict(&other).unwrap();
        assert!(a.iter().all(|(n, v)| v.bit_eq(b.get(n).unwrap())));
    }

    #[test]
    fn test_unexpected_source_keys_are_reported() {
        let (base, lora) = build_pair(vec![LoraTarget::KProj]);
        let mut sd = state_dict(&base).unwrap();
        sd.insert("layers.9.attn.q_proj.weight", ParamValue::new(vec![1], vec![0.5]));

        let err = load_state_dict(lora.clone(), &sd, &KeyPolicy::for_lora(get_adapter_params(&lora)))
            .unwrap_err();
        assert_eq!(
            err,
            PeftError::KeyMismatch {
                kind: KeyKind::Unexpected,
                surplus: vec!["layers.9.attn.q_proj.weight".to_string()],
                absent: vec![],
            }
        );
    }

    #[test]
    fn test_wrong_expectation_is_config_error() {
        let (base, lora) = build_pair(vec![LoraTarget::QProj, LoraTarget::VProj]);
        let only_q: BTreeSet<String> = get_adapter_params(&lora)
            .into_iter()
            .filter(|n| n.contains("q_proj"))
            .collect();
        let err = load_state_dict(lora, &state_dict(&base).unwrap(), &KeyPolicy::for_lora(only_q))
            .unwrap_err();
        assert!(matches!(err, PeftError::KeyMismatch { kind: KeyKind::Missing, .. }));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let (base, lora) = build_pair(vec![LoraTarget::QProj]);
        let mut sd = state_dict(&base).unwrap();
        sd.insert("norm.scale", ParamValue::new(vec![3], vec![0.0; 3]));
        let err = load_state_dict(lora.clone(), &sd, &KeyPolicy::for_lora(get_adapter_params(&lora)))
            .unwrap_err();
        assert!(matches!(err, PeftError::ShapeMismatch { ref name, .. } if name == "norm.scale"));
    }

    #[test]
    fn test_value_count_mismatch_is_rejected_before_copying() {
        let (base, _) = build_pair(vec![LoraTarget::QProj]);
        let mut sd = state_dict(&base).unwrap();
        sd.insert("norm.scale", ParamValue::new(vec![64], vec![0.0; 3]));

        let device = Default::default();
        let other: Decoder<TB> = ModelSize::Small.config().init_base(&device).unwrap();
        let err = load_state_dict(other, &sd, &KeyPolicy::Strict).unwrap_err();
        assert!(matches!(err, PeftError::TensorData { ref name, .. } if name == "norm.scale"));
    }

    #[test]
    fn test_transfer_from_json_state_dict() {
        let (base, lora) = build_pair(vec![LoraTarget::QProj, LoraTarget::VProj]);
        let base_sd = state_dict(&base).unwrap();
        let json = serde_json::to_string(&base_sd).unwrap();
        let from_json: StateDict = serde_json::from_str(&json).unwrap();

        let adapters = get_adapter_params(&lora);
        let (lora, report) =
            load_state_dict(lora, &from_json, &KeyPolicy::for_lora(adapters)).unwrap();
        assert_eq!(report.loaded, base_sd.len());

        let after = state_dict(&lora).unwrap();
        for (name, value) in base_sd.iter() {
            assert!(after.get(name).unwrap().bit_eq(value), "{name} not copied");
        }
    }

    #[test]
    fn test_adapter_state_dict_holds_only_adapters() {
        let (_, lora) = build_pair(vec![LoraTarget::VProj]);
        let sd = get_adapter_state_dict(&lora).unwrap();
        assert_eq!(sd.names(), get_adapter_params(&lora));
    }

    #[test]
    fn test_end_to_end_small_q_v() {
        let (base, lora) = build_pair(vec![LoraTarget::QProj, LoraTarget::VProj]);
        let adapters = get_adapter_params(&lora);
        let (lora, _) = load_state_dict(
            lora,
            &state_dict(&base).unwrap(),
            &KeyPolicy::for_lora(adapters.clone()),
        )
        .unwrap();
        let table = set_trainable_params(&lora, &adapters).unwrap();
        let report = ParamReport::new(&lora, &table);

        assert!(report.trainable <= report.total);
        assert!(report.percent > 0.0 && report.percent < 100.0);
        // 2 layers * 2 projections * (64*8 + 8*64)
        assert_eq!(report.trainable, 2 * 2 * 2 * 64 * 8);
    }

    #[test]
    fn test_apply_trainability_sets_require_grad() {
        type AB = Autodiff<NdArray>;
        let device = Default::default();
        let lora: Decoder<AB> = ModelSize::Small
            .config()
            .init_lora(&LoraConfig::new(vec![LoraTarget::QProj]), &device)
            .unwrap();
        let table = set_trainable_params(&lora, &get_adapter_params(&lora)).unwrap();
        let lora = apply_trainability(lora, &table).unwrap();

        let attn = &lora.layers[0].attn;
        match &attn.q_proj {
            crate::ml::lora::Projection::Lora(q) => {
                assert!(q.lora_a.weight.val().is_require_grad());
                assert!(!q.base.weight.val().is_require_grad());
            }
            _ => panic!("q_proj should carry an adapter"),
        }
        match &attn.k_proj {
            crate::ml::lora::Projection::Plain(k) => assert!(!k.weight.val().is_require_grad()),
            _ => panic!("k_proj should be plain"),
        }
    }

    #[test]
    fn test_apply_trainability_requires_full_table() {
        let (base, lora) = build_pair(vec![LoraTarget::QProj]);
        let table = set_trainable_params(&base, &BTreeSet::new()).unwrap();
        let err = apply_trainability(lora, &table).unwrap_err();
        assert!(matches!(err, PeftError::InvalidConfig(_)));
    }
}
