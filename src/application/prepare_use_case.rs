// ============================================================
// Layer 2 — PrepareUseCase
// ============================================================
// Orchestrates a LoRA preparation run, strictly in order:
//
//   Step 1: Build the base model        (Layer 5 - ml)
//           and optionally load a base checkpoint (Layer 6)
//   Step 2: Build the LoRA model        (Layer 5 - ml)
//   Step 3: Copy base weights across    (Layer 5 - ml)
//           missing keys must be exactly the adapter weights
//   Step 4: Mark adapters trainable     (Layer 3 - domain)
//   Step 5: Report parameter counts     (Layer 3 - domain)
//   Step 6: Save the prepared run       (Layer 6 - infra)
//
// Training itself happens elsewhere (see `lora-prep launch`).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use burn::{prelude::*, tensor::backend::AutodiffBackend};
use serde::{Deserialize, Serialize};

use crate::domain::{
    report::ParamReport,
    target::LoraTarget,
    trainability::{set_trainable_params, Trainability},
};
use crate::infra::checkpoint::{CheckpointManager, BASE_CONFIG, BASE_MODEL, LORA_MODEL};
use crate::ml::{
    lora::LoraConfig,
    model::{Decoder, ModelSize},
    peft::{
        apply_trainability, get_adapter_params, get_adapter_state_dict, load_state_dict,
        state_dict, KeyPolicy, LoadReport,
    },
};

// ─── Preparation Configuration ───────────────────────────────────────────────
// Everything a run needs. Saved next to the prepared checkpoint
// so the run can be reproduced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareConfig {
    pub size:            ModelSize,
    pub lora:            LoraConfig,
    /// Directory holding `base_model.mpk.gz`; random base weights when unset
    pub base_checkpoint: Option<String>,
    /// Where to write the prepared run; nothing is written when unset
    pub out_dir:         Option<String>,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            size:            ModelSize::Small,
            lora:            LoraConfig::new(vec![LoraTarget::QProj, LoraTarget::KProj, LoraTarget::VProj]),
            base_checkpoint: None,
            out_dir:         None,
        }
    }
}

/// A LoRA model ready to hand to a training loop.
pub struct PreparedModel<B: Backend> {
    pub model:        Decoder<B>,
    pub trainability: Trainability,
    pub report:       ParamReport,
    pub load:         LoadReport,
}

pub struct PrepareUseCase {
    config: PrepareConfig,
}

impl PrepareUseCase {
    pub fn new(config: PrepareConfig) -> Self {
        Self { config }
    }

    /// Runs on an autodiff backend so the require_grad flags set in
    /// step 4 are live when the model reaches a training loop.
    pub fn execute<B: AutodiffBackend>(&self, device: &B::Device) -> Result<PreparedModel<B>> {
        let cfg       = &self.config;
        let model_cfg = cfg.size.config();
        let lora_cfg  = &cfg.lora;
        model_cfg.validate_lora(lora_cfg)?;

        // ── Step 1: Base model ────────────────────────────────────────────────
        let base_ckpt = match &cfg.base_checkpoint {
            Some(dir) => Some(open_base_checkpoint(dir, cfg.size)?),
            None => None,
        };
        tracing::info!("Building base model '{}'", cfg.size);
        let mut base: Decoder<B> = model_cfg.init_base(device)?;
        if let Some(ckpt) = &base_ckpt {
            base = ckpt.load_model(base, BASE_MODEL, device)?;
        }

        // ── Step 2: LoRA model ────────────────────────────────────────────────
        tracing::info!(
            "Building LoRA model: attn={:?}, mlp={}, output={}, rank={}, alpha={}",
            lora_cfg.lora_attn_modules,
            lora_cfg.apply_lora_to_mlp,
            lora_cfg.apply_lora_to_output,
            lora_cfg.rank,
            lora_cfg.alpha,
        );
        let lora: Decoder<B> = model_cfg.init_lora(lora_cfg, device)?;

        // ── Step 3: Weight transfer ───────────────────────────────────────────
        // The adapter weights are the only names the base model cannot provide.
        let adapters = get_adapter_params(&lora);
        let base_sd  = state_dict(&base)?;
        drop(base);
        tracing::debug!("Exported {} base tensors", base_sd.len());

        let (lora, load) = load_state_dict(lora, &base_sd, &KeyPolicy::for_lora(adapters.clone()))
            .context("Base weights do not fit the LoRA model")?;
        tracing::info!(
            "Copied {} base tensors; {} adapter tensors keep their initialisation",
            load.loaded,
            load.missing.len()
        );

        // ── Step 4: Trainable parameters ──────────────────────────────────────
        let trainability = set_trainable_params(&lora, &adapters)?;
        tracing::debug!("Trainable: {:?}", trainability.trainable_names());
        let model        = apply_trainability(lora, &trainability)?;

        // ── Step 5: Report ────────────────────────────────────────────────────
        let report = ParamReport::new(&model, &trainability);
        tracing::info!(
            "{} of {} parameters trainable ({:.2}%)",
            report.trainable,
            report.total,
            report.percent
        );

        let prepared = PreparedModel { model, trainability, report, load };

        // ── Step 6: Save ──────────────────────────────────────────────────────
        if let Some(dir) = &cfg.out_dir {
            self.save(dir, &prepared)?;
        }
        Ok(prepared)
    }

    fn save<B: Backend>(&self, dir: &str, prepared: &PreparedModel<B>) -> Result<()> {
        let ckpt = CheckpointManager::new(dir)?;
        ckpt.save_model(&prepared.model, LORA_MODEL)?;
        ckpt.save_json("prepare_config.json", &self.config)?;
        ckpt.save_json("trainability.json", &prepared.trainability)?;
        ckpt.save_json("param_report.json", &prepared.report)?;
        ckpt.save_json("adapter_state.json", &get_adapter_state_dict(&prepared.model)?)?;
        tracing::info!("Prepared run saved to '{}'", ckpt.dir().display());
        Ok(())
    }
}

/// Open a base checkpoint directory and make sure it was written for `size`.
fn open_base_checkpoint(dir: &str, size: ModelSize) -> Result<CheckpointManager> {
    let ckpt = CheckpointManager::new(dir)?;
    let saved: ModelSize = ckpt.load_json(BASE_CONFIG)?;
    if saved != size {
        bail!("Base checkpoint in '{dir}' was saved for --size {saved}, not {size}");
    }
    Ok(ckpt)
}

/// Build a base model for `size` and save it as the run's base checkpoint.
pub fn save_base_checkpoint<B: Backend>(
    size:    ModelSize,
    out_dir: &str,
    device:  &B::Device,
) -> Result<PathBuf> {
    let model: Decoder<B> = size.config().init_base(device)?;
    let ckpt = CheckpointManager::new(out_dir)?;
    ckpt.save_model(&model, BASE_MODEL)?;
    ckpt.save_json(BASE_CONFIG, &size)?;
    Ok(ckpt.dir().join(format!("{BASE_MODEL}.mpk.gz")))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::state_dict::StateDict;
    use crate::ml::lora::Projection;
    use burn::backend::{Autodiff, NdArray};

    type TB = Autodiff<NdArray>;

    #[test]
    fn test_prepare_small_q_v_in_memory() {
        let config = PrepareConfig {
            lora: LoraConfig::new(vec![LoraTarget::QProj, LoraTarget::VProj]),
            ..PrepareConfig::default()
        };
        let device = Default::default();
        let prepared = PrepareUseCase::new(config).execute::<TB>(&device).unwrap();

        assert_eq!(prepared.load.missing.len(), 8);
        assert_eq!(prepared.trainability.trainable_names(), prepared.load.missing);
        assert!(prepared.report.percent > 0.0 && prepared.report.percent < 100.0);
    }

    #[test]
    fn test_prepared_model_tracks_gradients_for_adapters_only() {
        let device = Default::default();
        let prepared = PrepareUseCase::new(PrepareConfig::default())
            .execute::<TB>(&device)
            .unwrap();

        let attn = &prepared.model.layers[0].attn;
        match &attn.q_proj {
            Projection::Lora(q) => {
                assert!(q.lora_a.weight.val().is_require_grad());
                assert!(q.lora_b.weight.val().is_require_grad());
                assert!(!q.base.weight.val().is_require_grad());
            }
            Projection::Plain(_) => panic!("q_proj should carry an adapter"),
        }
        match &attn.output_proj {
            Projection::Plain(o) => assert!(!o.weight.val().is_require_grad()),
            Projection::Lora(_) => panic!("output_proj should be plain"),
        }
    }

    #[test]
    fn test_base_checkpoint_for_other_size_is_rejected() {
        let tmp    = tempfile::tempdir().unwrap();
        let base   = tmp.path().join("base");
        let device = Default::default();
        save_base_checkpoint::<NdArray>(ModelSize::Small, base.to_str().unwrap(), &device).unwrap();

        let config = PrepareConfig {
            size:            ModelSize::Gemma2b,
            base_checkpoint: Some(base.to_string_lossy().into_owned()),
            ..PrepareConfig::default()
        };
        let err = PrepareUseCase::new(config).execute::<TB>(&device).err().unwrap();
        assert!(err.to_string().contains("was saved for --size small"));
    }

    fn prepared_targets() -> Vec<LoraTarget> {
        PrepareConfig::default().lora.lora_attn_modules
    }

    #[test]
    fn test_prepare_from_base_checkpoint_writes_run() {
        let tmp    = tempfile::tempdir().unwrap();
        let base   = tmp.path().join("base");
        let out    = tmp.path().join("out");
        let device = Default::default();

        save_base_checkpoint::<NdArray>(ModelSize::Small, base.to_str().unwrap(), &device).unwrap();

        let config = PrepareConfig {
            base_checkpoint: Some(base.to_string_lossy().into_owned()),
            out_dir:         Some(out.to_string_lossy().into_owned()),
            ..PrepareConfig::default()
        };
        let prepared = PrepareUseCase::new(config).execute::<TB>(&device).unwrap();

        for file in [
            "lora_model.mpk.gz",
            "prepare_config.json",
            "trainability.json",
            "param_report.json",
            "adapter_state.json",
        ] {
            assert!(out.join(file).exists(), "{file} missing");
        }

        let ckpt = CheckpointManager::new(&out).unwrap();
        let report: ParamReport = ckpt.load_json("param_report.json").unwrap();
        assert_eq!(report.total, prepared.report.total);
        assert_eq!(report.trainable, prepared.report.trainable);
        let adapters: StateDict = ckpt.load_json("adapter_state.json").unwrap();
        assert_eq!(adapters.names(), prepared.trainability.trainable_names());
        for name in adapters.names() {
            assert!(adapters.get(&name).is_some(), "{name} not retrievable");
        }
        let saved: PrepareConfig = ckpt.load_json("prepare_config.json").unwrap();
        assert_eq!(saved.lora.lora_attn_modules, prepared_targets());
    }

    #[test]
    fn test_prepare_rejects_output_lora_on_tied_preset() {
        let config = PrepareConfig {
            size: ModelSize::Gemma2b,
            lora: PrepareConfig::default().lora.with_apply_lora_to_output(true),
            ..PrepareConfig::default()
        };
        let device = Default::default();
        assert!(PrepareUseCase::new(config).execute::<TB>(&device).is_err());
    }
}
