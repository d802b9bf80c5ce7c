// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Model cache for RUN_MODEL inference.
//
// Models load from `<dir>/<name>.bin` (a raw little-endian linear layer:
// out:u32, in:u32, then out*in weights and out biases as f32). When no file
// exists a built-in fallback is created by name, mirroring what the kernel
// expects: "identity", "sum", "mean", "linear" (784 -> 10) and a small
// default MLP (784 -> 128 -> 10). Built-in weights are deterministic so a
// given input always maps to the same output across runs.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{BridgeError, Result};
use crate::tensor::{Tensor, TensorView};

pub trait Model: Send {
    fn forward(&self, input: &TensorView<'_>) -> Result<Tensor>;
}

pub struct ModelCache {
    model_dir: PathBuf,
    cache: HashMap<String, Box<dyn Model>>,
}

impl ModelCache {
    pub fn new(model_dir: &Path) -> Self {
        Self {
            model_dir: model_dir.to_path_buf(),
            cache: HashMap::new(),
        }
    }

    /// Get a model by name, loading from disk or falling back to the
    /// built-in with that name.
    pub fn get_or_load(&mut self, name: &str) -> Result<&dyn Model> {
        match self.cache.entry(name.to_owned()) {
            Entry::Occupied(e) => Ok(&**e.into_mut()),
            Entry::Vacant(v) => {
                let model = load_model(&self.model_dir, name)?;
                Ok(&**v.insert(model))
            }
        }
    }

    /// Model names with a `.bin` file in the model directory.
    pub fn list_available(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.model_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "bin") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_owned());
                    }
                }
            }
        }
        names.sort();
        names
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

fn load_model(dir: &Path, name: &str) -> Result<Box<dyn Model>> {
    let path = dir.join(format!("{name}.bin"));
    if path.exists() {
        info!(model = name, path = %path.display(), "loading model");
        match LinearModel::from_file(&path) {
            Ok(m) => return Ok(Box::new(m)),
            Err(e) => {
                warn!(model = name, error = %e, "model file unreadable, using built-in");
            }
        }
    }

    Ok(match name {
        "identity" => Box::new(IdentityModel),
        "sum" => Box::new(SumModel),
        "mean" => Box::new(MeanModel),
        "linear" => Box::new(LinearModel::seeded(784, 10, 0x11E4)),
        other => {
            if other != "default" {
                info!(model = other, "no such model, creating default");
            }
            Box::new(MlpModel::seeded(784, 128, 10, 0xD3FA))
        }
    })
}

// ---------------------------------------------------------------------------
// Built-in models
// ---------------------------------------------------------------------------

/// Pass-through.
pub struct IdentityModel;

impl Model for IdentityModel {
    fn forward(&self, input: &TensorView<'_>) -> Result<Tensor> {
        Tensor::from_f32(input.dims(), &input.to_f32_vec())
    }
}

/// Scalar sum of all elements.
pub struct SumModel;

impl Model for SumModel {
    fn forward(&self, input: &TensorView<'_>) -> Result<Tensor> {
        let sum: f32 = input.to_f32_vec().iter().sum();
        Tensor::from_f32(&[1], &[sum])
    }
}

/// Scalar mean of all elements.
pub struct MeanModel;

impl Model for MeanModel {
    fn forward(&self, input: &TensorView<'_>) -> Result<Tensor> {
        let values = input.to_f32_vec();
        let mean = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f32>() / values.len() as f32
        };
        Tensor::from_f32(&[1], &[mean])
    }
}

/// Dense layer: input is flattened to (batch, in_features) and mapped to
/// (batch, out_features).
pub struct LinearModel {
    in_features: usize,
    out_features: usize,
    weight: Vec<f32>, // row-major, out x in
    bias: Vec<f32>,
}

impl LinearModel {
    pub fn new(in_features: usize, out_features: usize, weight: Vec<f32>, bias: Vec<f32>) -> Self {
        assert_eq!(weight.len(), in_features * out_features);
        assert_eq!(bias.len(), out_features);
        Self {
            in_features,
            out_features,
            weight,
            bias,
        }
    }

    fn seeded(in_features: usize, out_features: usize, seed: u64) -> Self {
        let weight = seeded_weights(seed, in_features * out_features);
        let bias = seeded_weights(seed ^ 0xB1A5, out_features);
        Self::new(in_features, out_features, weight, bias)
    }

    /// Read a raw linear layer: `out:u32, in:u32, weight[out*in], bias[out]`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 8 {
            return Err(BridgeError::Decode("model file truncated".into()));
        }
        let out = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let inp = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let expected = 8 + (out * inp + out) * 4;
        if out == 0 || inp == 0 || bytes.len() < expected {
            return Err(BridgeError::Decode(format!(
                "model file: expected {expected} bytes for {out}x{inp}, have {}",
                bytes.len()
            )));
        }
        let mut floats = bytes[8..expected]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        let weight: Vec<f32> = floats.by_ref().take(out * inp).collect();
        let bias: Vec<f32> = floats.collect();
        Ok(Self::new(inp, out, weight, bias))
    }

    fn apply(&self, input: &[f32]) -> Result<Vec<Vec<f32>>> {
        if input.is_empty() || input.len() % self.in_features != 0 {
            return Err(BridgeError::SizeMismatch {
                len: input.len(),
                capacity: self.in_features,
            });
        }
        let batch = input.len() / self.in_features;
        let mut rows = Vec::with_capacity(batch);
        for b in 0..batch {
            let x = &input[b * self.in_features..(b + 1) * self.in_features];
            let mut row = Vec::with_capacity(self.out_features);
            for o in 0..self.out_features {
                let w = &self.weight[o * self.in_features..(o + 1) * self.in_features];
                let dot: f32 = w.iter().zip(x).map(|(wi, xi)| wi * xi).sum();
                row.push(dot + self.bias[o]);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

impl Model for LinearModel {
    fn forward(&self, input: &TensorView<'_>) -> Result<Tensor> {
        let rows = self.apply(&input.to_f32_vec())?;
        let batch = rows.len() as u32;
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Tensor::from_f32(&[batch, self.out_features as u32], &flat)
    }
}

/// Two-layer MLP with ReLU, the "default" model.
pub struct MlpModel {
    l1: LinearModel,
    l2: LinearModel,
}

impl MlpModel {
    fn seeded(in_features: usize, hidden: usize, out_features: usize, seed: u64) -> Self {
        Self {
            l1: LinearModel::seeded(in_features, hidden, seed),
            l2: LinearModel::seeded(hidden, out_features, seed ^ 0x7E57),
        }
    }
}

impl Model for MlpModel {
    fn forward(&self, input: &TensorView<'_>) -> Result<Tensor> {
        let hidden = self.l1.apply(&input.to_f32_vec())?;
        let batch = hidden.len() as u32;
        let mut activated: Vec<f32> = hidden.into_iter().flatten().collect();
        for v in &mut activated {
            *v = v.max(0.0);
        }
        let rows = self.l2.apply(&activated)?;
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Tensor::from_f32(&[batch, self.l2.out_features as u32], &flat)
    }
}

/// Deterministic pseudo-random weights in [-0.1, 0.1].
fn seeded_weights(seed: u64, n: usize) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9E3779B97F4A7C15).max(1);
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let unit = (state >> 33) as f32 / u32::MAX as f32;
            (unit - 0.5) * 0.2
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, TensorHeader};

    fn view_from(shape: &[u32], values: &[f32]) -> (TensorHeader, Vec<u8>) {
        let header = TensorHeader::contiguous(DType::F32, shape).unwrap();
        let mut data = Vec::new();
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        (header, data)
    }

    #[test]
    fn identity_round_trips() {
        let (header, data) = view_from(&[1, 4], &[1.0, 2.0, 3.0, 4.0]);
        let view = TensorView::new(header, &data).unwrap();
        let out = IdentityModel.forward(&view).unwrap();
        assert_eq!(out.dims(), &[1, 4]);
        assert_eq!(out.as_f32_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn sum_and_mean() {
        let (header, data) = view_from(&[4], &[1.0, 2.0, 3.0, 4.0]);
        let view = TensorView::new(header, &data).unwrap();
        assert_eq!(SumModel.forward(&view).unwrap().as_f32_vec(), vec![10.0]);
        assert_eq!(MeanModel.forward(&view).unwrap().as_f32_vec(), vec![2.5]);
    }

    #[test]
    fn linear_shapes_and_bias() {
        let m = LinearModel::new(2, 3, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![0.5, 0.5, 0.5]);
        let (header, data) = view_from(&[1, 2], &[2.0, 3.0]);
        let view = TensorView::new(header, &data).unwrap();
        let out = m.forward(&view).unwrap();
        assert_eq!(out.dims(), &[1, 3]);
        assert_eq!(out.as_f32_vec(), vec![2.5, 3.5, 5.5]);
    }

    #[test]
    fn linear_rejects_bad_width() {
        let m = LinearModel::seeded(784, 10, 1);
        let (header, data) = view_from(&[3], &[1.0, 2.0, 3.0]);
        let view = TensorView::new(header, &data).unwrap();
        assert!(m.forward(&view).is_err());
    }

    #[test]
    fn default_mlp_output_shape() {
        let mut cache = ModelCache::new(Path::new("./does-not-exist"));
        let model = cache.get_or_load("default").unwrap();
        let input = vec![0.5f32; 784];
        let (header, data) = view_from(&[1, 784], &input);
        let view = TensorView::new(header, &data).unwrap();
        let out = model.forward(&view).unwrap();
        assert_eq!(out.dims(), &[1, 10]);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes()); // out
        bytes.extend_from_slice(&2u32.to_le_bytes()); // in
        for v in [1.0f32, 0.0, 0.0, 1.0, 0.0, 0.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, bytes).unwrap();

        let m = LinearModel::from_file(&path).unwrap();
        let (header, data) = view_from(&[1, 2], &[7.0, 9.0]);
        let view = TensorView::new(header, &data).unwrap();
        assert_eq!(m.forward(&view).unwrap().as_f32_vec(), vec![7.0, 9.0]);
    }
}
