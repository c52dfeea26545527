use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::config::KeypointViTConfig;
use crate::model::KeypointViT;

/// A model directory: `config.json` plus safetensors weights.
pub struct ModelFiles {
    pub config: KeypointViTConfig,
    pub weights: Vec<PathBuf>,
}

/// Parse and validate a JSON model config.
pub fn load_config(path: &Path) -> anyhow::Result<KeypointViTConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: KeypointViTConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Locate the config and weight shards in `dir`.
pub fn find_model_files(dir: &Path) -> anyhow::Result<ModelFiles> {
    let config = load_config(&dir.join("config.json"))?;
    let weights = safetensor_paths(dir)?;
    Ok(ModelFiles { config, weights })
}

/// Creates a VarBuilder from safetensor weight files.
pub fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> anyhow::Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Build a model from a directory on the device named in its config.
pub fn load_model(dir: &Path, dtype: DType) -> anyhow::Result<KeypointViT> {
    let files = find_model_files(dir)?;
    let device = files.config.device.to_device()?;
    tracing::info!(
        dir = %dir.display(),
        shards = files.weights.len(),
        device = %files.config.device,
        ?dtype,
        "loading keypoint ViT weights"
    );
    let vb = load_weights(&files.weights, dtype, &device)?;
    Ok(KeypointViT::new(&files.config, vb)?)
}

/// Natural sort key: splits a filename into alternating text/numeric segments
/// so that "model-2-of-10" sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut rest = basename;
    while let Some(first) = rest.chars().next() {
        let digits = first.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != digits)
            .unwrap_or(rest.len());
        let (segment, tail) = rest.split_at(end);
        if digits {
            parts.push(Ok(segment.parse::<u64>().unwrap_or(u64::MAX)));
        } else {
            parts.push(Err(segment.to_string()));
        }
        rest = tail;
    }
    parts
}

fn safetensor_paths(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    // Single file first
    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }

    // Multi-file: read model.safetensors.index.json
    let index_path = dir.join("model.safetensors.index.json");
    if index_path.is_file() {
        let index: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
        let weight_map = index["weight_map"]
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("missing weight_map in index"))?;

        let mut filenames: Vec<String> = weight_map
            .values()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        filenames.sort_by_key(|a| natural_sort_key(a));
        filenames.dedup();
        return Ok(filenames.iter().map(|f| dir.join(f)).collect());
    }

    // Any shards lying around
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    if paths.is_empty() {
        anyhow::bail!("no safetensors weights found in {}", dir.display());
    }
    paths.sort_by_key(|p| natural_sort_key(&p.to_string_lossy()));
    Ok(paths)
}
