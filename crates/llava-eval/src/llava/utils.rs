use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum LlavaError {
    #[error(transparent)]
    HubApi(#[from] hf_hub::api::sync::ApiError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Tokenizer(#[from] tokenizers::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    #[error("checkpoint bundle not found at {0}")]
    BundleNotFound(PathBuf),

    #[error("the bundle already contains `llm`, drop the explicit llm path")]
    LlmPathConflict,

    #[error("the bundle has no `llm` directory, an explicit llm path is required")]
    LlmPathMissing,

    #[error("the bundle already contains `visual_encoder`, drop the explicit visual encoder path")]
    VisualEncoderPathConflict,

    #[error("the bundle has no `visual_encoder` directory, an explicit visual encoder path is required")]
    VisualEncoderPathMissing,

    #[error("bundle is missing the required projector directory at {0}")]
    ProjectorMissing(PathBuf),

    #[error("no model weights found under {0}")]
    WeightsNotFound(PathBuf),

    #[error("weight tensor `{0}` not found in checkpoint")]
    WeightMissing(String),

    #[error("unknown prompt template `{0}`")]
    UnknownTemplate(String),

    #[error("hidden-state layer {layer} out of range for {available} recorded states")]
    LayerOutOfRange { layer: isize, available: usize },

    #[error("prompt must contain the image placeholder exactly once, found {0}")]
    ImagePlaceholder(usize),

    #[error("record field `{0}` is missing or null")]
    MissingField(String),

    #[error("`image` and `image_path` lists differ in length: {images} vs {names}")]
    MismatchedImageList { images: usize, names: usize },

    #[error("multi-image records are not supported by `generate`")]
    MultiImageUnsupported,

    #[error("cannot find an end-of-sequence token in the tokenizer")]
    EosTokenNotFound,
}

/// Resolved generation settings for a single adapter instance.
#[derive(Debug, Clone, Copy)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temp: f64,
    pub top_p: f64,
    pub seed: u64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub eos_token_id: u32,
    pub pad_token_id: u32,
}

impl GenerationConfig {
    /// Defaults: greedy decoding capped at 100 new tokens, end/pad ids taken
    /// from the tokenizer (pad falls back to eos when the tokenizer defines
    /// none).
    pub fn new(eos_token_id: u32, pad_token_id: Option<u32>) -> Self {
        Self {
            max_new_tokens: 100,
            do_sample: false,
            temp: 0.7,
            top_p: 0.9,
            seed: 299792458,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            eos_token_id,
            pad_token_id: pad_token_id.unwrap_or(eos_token_id),
        }
    }

    /// Overlay caller-supplied overrides key by key, leaving unset fields at
    /// their defaults.
    pub fn apply(&mut self, overrides: &GenerationOverrides) {
        if let Some(v) = overrides.max_new_tokens {
            self.max_new_tokens = v;
        }
        if let Some(v) = overrides.do_sample {
            self.do_sample = v;
        }
        if let Some(v) = overrides.temp {
            self.temp = v;
        }
        if let Some(v) = overrides.top_p {
            self.top_p = v;
        }
        if let Some(v) = overrides.seed {
            self.seed = v;
        }
        if let Some(v) = overrides.repeat_penalty {
            self.repeat_penalty = v;
        }
    }
}

/// Partial override of [`GenerationConfig`]; every unset field keeps its
/// default.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationOverrides {
    pub max_new_tokens: Option<usize>,
    pub do_sample: Option<bool>,
    pub temp: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: Option<u64>,
    pub repeat_penalty: Option<f32>,
}

impl GenerationOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// One-line listing of the set fields, for the construction-time warning.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = self.max_new_tokens {
            parts.push(format!("max_new_tokens={v}"));
        }
        if let Some(v) = self.do_sample {
            parts.push(format!("do_sample={v}"));
        }
        if let Some(v) = self.temp {
            parts.push(format!("temp={v}"));
        }
        if let Some(v) = self.top_p {
            parts.push(format!("top_p={v}"));
        }
        if let Some(v) = self.seed {
            parts.push(format!("seed={v}"));
        }
        if let Some(v) = self.repeat_penalty {
            parts.push(format!("repeat_penalty={v}"));
        }
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_generation_config_is_greedy() {
        let config = GenerationConfig::new(2, None);
        assert_eq!(config.max_new_tokens, 100);
        assert!(!config.do_sample);
        assert_eq!(config.eos_token_id, 2);
        assert_eq!(config.pad_token_id, 2);
    }

    #[test]
    fn pad_token_overrides_eos_fallback() {
        let config = GenerationConfig::new(2, Some(0));
        assert_eq!(config.pad_token_id, 0);
    }

    #[test]
    fn overrides_overlay_key_by_key() {
        let mut config = GenerationConfig::new(2, None);
        let overrides = GenerationOverrides {
            max_new_tokens: Some(512),
            do_sample: Some(true),
            ..Default::default()
        };
        assert!(!overrides.is_empty());
        config.apply(&overrides);
        assert_eq!(config.max_new_tokens, 512);
        assert!(config.do_sample);
        // untouched fields keep their defaults
        assert_eq!(config.temp, 0.7);
        assert_eq!(config.seed, 299792458);
    }

    #[test]
    fn describe_lists_only_set_fields() {
        let overrides = GenerationOverrides {
            max_new_tokens: Some(256),
            temp: Some(1.0),
            ..Default::default()
        };
        assert_eq!(overrides.describe(), "max_new_tokens=256, temp=1");
    }
}
