//! Checkpoint weight loading. Tensors are read onto the CPU first, adapters
//! merged and dtypes converted there, and only then moved to the compute
//! device; loading straight to the accelerator spikes peak memory under some
//! library versions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;

use super::utils::LlavaError;

/// Read every weight tensor under `dir` onto the CPU. Safetensors shards are
/// preferred; pickled `*.bin` checkpoints are the fallback.
pub fn load_weights(dir: &Path) -> Result<HashMap<String, Tensor>, LlavaError> {
    let mut weights = HashMap::new();
    for shard in weight_files(dir, "safetensors")? {
        weights.extend(candle_core::safetensors::load(&shard, &Device::Cpu)?);
    }
    if weights.is_empty() {
        for shard in weight_files(dir, "bin")? {
            for (name, tensor) in candle_core::pickle::read_all(&shard)? {
                weights.insert(name, tensor);
            }
        }
    }
    if weights.is_empty() {
        return Err(LlavaError::WeightsNotFound(dir.to_path_buf()));
    }
    Ok(weights)
}

fn weight_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, LlavaError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().map_or(false, |ext| ext == extension)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Convert floating-point tensors to `dtype`, then move everything to
/// `device`.
pub fn finalize_weights(
    weights: &mut HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<(), LlavaError> {
    for value in weights.values_mut() {
        if value.dtype().is_float() && value.dtype() != dtype {
            *value = value.to_dtype(dtype)?;
        }
        *value = value.to_device(device)?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AdapterConfig {
    r: usize,
    lora_alpha: f64,
}

/// Fold a low-rank adapter into the base weights: for every
/// `lora_A`/`lora_B` pair, `W += (alpha / r) * B * A` on the matching base
/// tensor. Returns the number of merged deltas.
pub fn merge_adapter(
    weights: &mut HashMap<String, Tensor>,
    adapter_dir: &Path,
) -> Result<usize, LlavaError> {
    let config: AdapterConfig =
        serde_json::from_slice(&fs::read(adapter_dir.join("adapter_config.json"))?)?;
    let scale = config.lora_alpha / config.r as f64;
    let adapter = load_weights(adapter_dir)?;

    let mut merged = 0;
    for (name, lora_a) in &adapter {
        let Some(stem) = name.strip_suffix(".lora_A.weight") else {
            continue;
        };
        let Some(lora_b) = adapter.get(&format!("{stem}.lora_B.weight")) else {
            continue;
        };
        // adapter checkpoints prefix the wrapped model's keys
        let base_key = format!("{}.weight", stem.trim_start_matches("base_model.model."));
        let base = weights
            .get(&base_key)
            .ok_or_else(|| LlavaError::WeightMissing(base_key.clone()))?;

        let delta = lora_b
            .to_dtype(DType::F32)?
            .matmul(&lora_a.to_dtype(DType::F32)?)?
            .affine(scale, 0.0)?;
        let updated = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
        weights.insert(base_key, updated);
        merged += 1;
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn write_safetensors(path: &Path, tensors: &[(&str, Tensor)]) {
        let map: HashMap<String, Tensor> = tensors
            .iter()
            .map(|(name, tensor)| (name.to_string(), tensor.clone()))
            .collect();
        candle_core::safetensors::save(&map, path).unwrap();
    }

    #[test]
    fn loads_safetensors_shards() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let tensor = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
        write_safetensors(
            &tmp.path().join("model-00001-of-00002.safetensors"),
            &[("a", tensor.clone())],
        );
        write_safetensors(
            &tmp.path().join("model-00002-of-00002.safetensors"),
            &[("b", tensor)],
        );
        let weights = load_weights(tmp.path()).unwrap();
        assert_eq!(weights.len(), 2);
        assert!(weights.contains_key("a") && weights.contains_key("b"));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_weights(tmp.path()),
            Err(LlavaError::WeightsNotFound(_))
        ));
    }

    #[test]
    fn finalize_converts_floats_and_keeps_integers() {
        let device = Device::Cpu;
        let mut weights = HashMap::new();
        weights.insert(
            "w".to_string(),
            Tensor::zeros((2, 2), DType::F32, &device).unwrap(),
        );
        weights.insert(
            "ids".to_string(),
            Tensor::zeros((4,), DType::I64, &device).unwrap(),
        );
        finalize_weights(&mut weights, DType::F16, &device).unwrap();
        assert_eq!(weights["w"].dtype(), DType::F16);
        assert_eq!(weights["ids"].dtype(), DType::I64);
    }

    #[test]
    fn merge_folds_scaled_delta_into_base() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Device::Cpu;

        // base W = I (2x2); A = [[1, 1]], B = [[1], [0]]; r=1, alpha=2
        // => W' = I + 2 * B*A = [[3, 2], [0, 1]]
        let base = Tensor::new(&[[1f32, 0.], [0., 1.]], &device).unwrap();
        let lora_a = Tensor::new(&[[1f32, 1.]], &device).unwrap();
        let lora_b = Tensor::new(&[[1f32], [0.]], &device).unwrap();

        fs::write(
            tmp.path().join("adapter_config.json"),
            r#"{"r": 1, "lora_alpha": 2}"#,
        )
        .unwrap();
        write_safetensors(
            &tmp.path().join("adapter_model.safetensors"),
            &[
                (
                    "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight",
                    lora_a,
                ),
                (
                    "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight",
                    lora_b,
                ),
            ],
        );

        let mut weights = HashMap::new();
        weights.insert(
            "model.layers.0.self_attn.q_proj.weight".to_string(),
            base,
        );
        weights.insert(
            "model.norm.weight".to_string(),
            Tensor::ones((2,), DType::F32, &device).unwrap(),
        );

        let merged = merge_adapter(&mut weights, tmp.path()).unwrap();
        assert_eq!(merged, 1);

        let updated = weights["model.layers.0.self_attn.q_proj.weight"]
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(updated, vec![vec![3.0, 2.0], vec![0.0, 1.0]]);
        // untouched tensors stay as they were
        let norm = weights["model.norm.weight"].to_vec1::<f32>().unwrap();
        assert_eq!(norm, vec![1.0, 1.0]);
    }

    #[test]
    fn merge_requires_the_base_tensor() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        fs::write(
            tmp.path().join("adapter_config.json"),
            r#"{"r": 1, "lora_alpha": 1}"#,
        )
        .unwrap();
        write_safetensors(
            &tmp.path().join("adapter_model.safetensors"),
            &[
                (
                    "base_model.model.missing.lora_A.weight",
                    Tensor::zeros((1, 2), DType::F32, &device).unwrap(),
                ),
                (
                    "base_model.model.missing.lora_B.weight",
                    Tensor::zeros((2, 1), DType::F32, &device).unwrap(),
                ),
            ],
        );
        let mut weights = HashMap::new();
        assert!(matches!(
            merge_adapter(&mut weights, tmp.path()),
            Err(LlavaError::WeightMissing(_))
        ));
    }
}
