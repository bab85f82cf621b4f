// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores decoders with Burn's named MessagePack
// recorder, and writes the JSON side files of a prepared run.
//
// Full precision is used (not CompactRecorder's half
// precision) so that a base checkpoint loaded here and copied
// into the LoRA model keeps bit-identical values.
//
// Layout of a prepared run:
//   out_dir/
//     base_model.mpk.gz        ← written by `lora-prep base`
//     base_config.json         ← preset the base model was built from
//     lora_model.mpk.gz        ← base weights + fresh adapters
//     prepare_config.json      ← PrepareConfig used for the run
//     trainability.json        ← name → trainable side-table
//     param_report.json        ← total / trainable counts
//     adapter_state.json       ← adapter weights only
//
// Reference: Burn Book §5 (Records and Checkpointing)

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder},
};
use serde::{de::DeserializeOwned, Serialize};

use crate::ml::model::Decoder;

pub const BASE_MODEL: &str = "base_model";
pub const BASE_CONFIG: &str = "base_config.json";
pub const LORA_MODEL: &str = "lora_model";

type FileRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Open (and create if needed) a checkpoint directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Save model weights as `{dir}/{name}.mpk.gz`.
    pub fn save_model<B: Backend>(&self, model: &Decoder<B>, name: &str) -> Result<()> {
        // recorder adds the extension
        let path = self.dir.join(name);
        FileRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))?;

        tracing::debug!("Saved checkpoint '{}'", path.display());
        Ok(())
    }

    /// Load weights saved by `save_model` into a model of the same architecture.
    pub fn load_model<B: Backend>(
        &self,
        model: Decoder<B>,
        name: &str,
        device: &B::Device,
    ) -> Result<Decoder<B>> {
        let path = self.dir.join(name);
        tracing::info!("Loading checkpoint '{}'", path.display());

        let record = FileRecorder::new().load(path.clone(), device).with_context(|| {
            format!(
                "Cannot load checkpoint '{}'. Was it written by `lora-prep base` with the same --size?",
                path.display()
            )
        })?;
        Ok(model.load_record(record))
    }

    /// Write `value` as pretty JSON to `{dir}/{file}`.
    pub fn save_json<T: Serialize>(&self, file: &str, value: &T) -> Result<PathBuf> {
        let path = self.dir.join(file);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json).with_context(|| format!("Cannot write '{}'", path.display()))?;

        tracing::debug!("Wrote '{}'", path.display());
        Ok(path)
    }

    pub fn load_json<T: DeserializeOwned>(&self, file: &str) -> Result<T> {
        let path = self.dir.join(file);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Invalid JSON in '{}'", path.display()))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::state_dict::StateDict;
    use crate::domain::trainability::{set_trainable_params, Trainability};
    use crate::ml::{model::ModelSize, peft::state_dict};
    use burn::backend::NdArray;
    use std::collections::BTreeSet;

    type TB = NdArray;

    #[test]
    fn test_model_round_trip_is_bit_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let ckpt = CheckpointManager::new(tmp.path().join("run")).unwrap();
        let device = Default::default();
        let cfg = ModelSize::Small.config();

        let saved: Decoder<TB> = cfg.init_base(&device).unwrap();
        ckpt.save_model(&saved, BASE_MODEL).unwrap();

        let fresh: Decoder<TB> = cfg.init_base(&device).unwrap();
        let loaded = ckpt.load_model(fresh, BASE_MODEL, &device).unwrap();

        let a = state_dict(&saved).unwrap();
        let b = state_dict(&loaded).unwrap();
        assert_eq!(a.len(), b.len());
        assert!(a.iter().all(|(n, v)| v.bit_eq(b.get(n).unwrap())));
    }

    #[test]
    fn test_missing_checkpoint_has_helpful_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ckpt = CheckpointManager::new(tmp.path()).unwrap();
        let device = Default::default();
        let model: Decoder<TB> = ModelSize::Small.config().init_base(&device).unwrap();

        let err = ckpt.load_model(model, BASE_MODEL, &device).unwrap_err();
        assert!(err.to_string().contains("Cannot load checkpoint"));
    }

    #[test]
    fn test_json_side_files() {
        let tmp = tempfile::tempdir().unwrap();
        let ckpt = CheckpointManager::new(tmp.path()).unwrap();
        let device = Default::default();
        let model: Decoder<TB> = ModelSize::Small.config().init_base(&device).unwrap();

        let table = set_trainable_params(&model, &BTreeSet::new()).unwrap();
        ckpt.save_json("trainability.json", &table).unwrap();
        let back: Trainability = ckpt.load_json("trainability.json").unwrap();
        assert_eq!(back, table);

        let sd = state_dict(&model).unwrap();
        ckpt.save_json("state.json", &sd).unwrap();
        let back: StateDict = ckpt.load_json("state.json").unwrap();
        assert!(back.get("norm.scale").unwrap().bit_eq(sd.get("norm.scale").unwrap()));
    }
}
