use std::collections::HashMap;

use candle_core::Tensor;
use candle_nn::{Linear, Module};
use serde::Deserialize;

use super::utils::LlavaError;

fn default_depth() -> usize {
    2
}

fn default_bias() -> bool {
    true
}

/// Shape of the projector MLP, read from the bundle's
/// `projector/config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectorConfig {
    pub visual_hidden_size: usize,
    pub llm_hidden_size: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_bias")]
    pub bias: bool,
}

/// MLP bridging vision-encoder features into the language model's embedding
/// space. The checkpoint stores it as a flat Linear/GELU stack, weights keyed
/// `model.0`, `model.2`, ...
pub struct Projector {
    layers: Vec<Linear>,
}

impl Projector {
    pub fn load(
        config: &ProjectorConfig,
        weights: &HashMap<String, Tensor>,
    ) -> Result<Self, LlavaError> {
        let mut layers = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            let key = format!("model.{}", 2 * i);
            let weight = weights
                .get(&format!("{key}.weight"))
                .ok_or_else(|| LlavaError::WeightMissing(format!("{key}.weight")))?
                .clone();
            let bias = if config.bias {
                Some(
                    weights
                        .get(&format!("{key}.bias"))
                        .ok_or_else(|| LlavaError::WeightMissing(format!("{key}.bias")))?
                        .clone(),
                )
            } else {
                None
            };
            layers.push(Linear::new(weight, bias));
        }
        Ok(Self { layers })
    }

    /// Exact-erf GELU between layers, none after the last.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        let mut xs = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i + 1 != self.layers.len() {
                xs = xs.gelu_erf()?;
            }
        }
        Ok(xs)
    }
}
