//! The LLaVA adapter: wires a checkpoint bundle's sub-models (language
//! backbone, CLIP vision encoder, projector, optional low-rank adapters)
//! into a single instance exposing `build_prompt` and `generate`.

mod bundle;
mod preprocessor;
mod projector;
mod templates;
pub mod utils;
mod weights;

pub use bundle::{BundleManifest, HubResolver, ModelSource, SnapshotResolver};
pub use preprocessor::{expand_to_square, ClipImagePreprocessor};
pub use projector::{Projector, ProjectorConfig};
pub use templates::PromptTemplate;

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::clip::text_model::Activation;
use candle_transformers::models::clip::vision_model::{ClipVisionConfig, ClipVisionTransformer};
use candle_transformers::models::llama::{Cache, Config as LlamaModelConfig, Llama, LlamaConfig};
use log::{info, warn};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::harness::{self, EvalRecord, PromptInput};
use utils::{GenerationConfig, GenerationOverrides, LlavaError};

/// Placeholder marking the image splice point in the prompt text.
pub const IMAGE_PLACEHOLDER: &str = "<image>";

/// Construction parameters for [`Llava`]. `bundle` is a local directory or a
/// remote registry identifier; everything else has a usable default.
pub struct LlavaOptions {
    pub bundle: String,
    /// Required when the bundle has no `llm/` directory, forbidden when it
    /// does.
    pub llm_path: Option<PathBuf>,
    /// Same rule for `visual_encoder/`.
    pub visual_encoder_path: Option<PathBuf>,
    /// Hidden-state layer fed to the projector; negative counts from the
    /// end.
    pub visual_select_layer: isize,
    pub prompt_template: Option<String>,
    /// Explicit weight dtype; the default follows the device (half precision
    /// on an accelerator, f32 on CPU).
    pub dtype: Option<DType>,
    pub generation: GenerationOverrides,
}

impl LlavaOptions {
    pub fn new(bundle: impl Into<String>) -> Self {
        Self {
            bundle: bundle.into(),
            llm_path: None,
            visual_encoder_path: None,
            visual_select_layer: -2,
            prompt_template: None,
            dtype: None,
            generation: GenerationOverrides::default(),
        }
    }
}

/// A loaded LLaVA checkpoint bundle, ready to answer image + text prompts.
pub struct Llava {
    llm: Llama,
    llm_config: LlamaModelConfig,
    tokenizer: Tokenizer,
    visual_encoder: ClipVisionTransformer,
    projector: Projector,
    preprocessor: ClipImagePreprocessor,
    template: Option<&'static PromptTemplate>,
    visual_select_layer: isize,
    gen_config: GenerationConfig,
    logits_processor: LogitsProcessor,
    device: Device,
    dtype: DType,
}

impl Llava {
    /// Load a bundle through the default hub resolver.
    pub fn new(options: LlavaOptions) -> Result<Self, LlavaError> {
        Self::with_resolver(options, &HubResolver)
    }

    /// Load a bundle, resolving remote identifiers through `resolver`.
    pub fn with_resolver(
        options: LlavaOptions,
        resolver: &dyn SnapshotResolver,
    ) -> Result<Self, LlavaError> {
        let root = bundle::resolve_bundle(&options.bundle, resolver)?;
        let manifest = BundleManifest::scan(&root)?;
        let (device, dtype) = select_device(options.dtype);

        // language model + tokenizer
        let llm_dir = manifest
            .llm_source(options.llm_path.as_deref())?
            .path()
            .to_path_buf();
        let mut llm_weights = weights::load_weights(&llm_dir)?;
        if let Some(adapter_dir) = manifest.llm_adapter() {
            let merged = weights::merge_adapter(&mut llm_weights, adapter_dir)?;
            info!("Merged {merged} LLM low-rank deltas from {}", adapter_dir.display());
        }
        weights::finalize_weights(&mut llm_weights, dtype, &device)?;
        let llm_config: LlamaConfig =
            serde_json::from_slice(&fs::read(llm_dir.join("config.json"))?)?;
        let llm_config = llm_config.into_config(false);
        let llm = Llama::load(
            VarBuilder::from_tensors(llm_weights, dtype, &device),
            &llm_config,
        )?;
        let tokenizer = Tokenizer::from_file(llm_dir.join("tokenizer.json"))?;
        info!("Load LLM from {}", llm_dir.display());

        // vision encoder + image preprocessor
        let visual_dir = manifest
            .visual_encoder_source(options.visual_encoder_path.as_deref())?
            .path()
            .to_path_buf();
        let mut visual_weights = weights::load_weights(&visual_dir)?;
        if let Some(adapter_dir) = manifest.visual_encoder_adapter() {
            let merged = weights::merge_adapter(&mut visual_weights, adapter_dir)?;
            info!(
                "Merged {merged} visual encoder low-rank deltas from {}",
                adapter_dir.display()
            );
        }
        weights::finalize_weights(&mut visual_weights, dtype, &device)?;
        let vision_config = read_vision_config(&visual_dir)?;
        let visual_encoder = ClipVisionTransformer::new(
            VarBuilder::from_tensors(visual_weights, dtype, &device).pp("vision_model"),
            &vision_config.to_clip_config(),
        )?;
        let preprocessor = ClipImagePreprocessor::from_dir(&visual_dir)?;
        info!("Load visual_encoder from {}", visual_dir.display());

        // projector, always taken from the bundle
        let projector_dir = manifest.projector()?;
        let projector_config: ProjectorConfig =
            serde_json::from_slice(&fs::read(projector_dir.join("config.json"))?)?;
        let mut projector_weights = weights::load_weights(projector_dir)?;
        weights::finalize_weights(&mut projector_weights, dtype, &device)?;
        let projector = Projector::load(&projector_config, &projector_weights)?;
        info!("Load projector from {}", projector_dir.display());

        let template = match &options.prompt_template {
            Some(name) => Some(
                templates::lookup(name)
                    .ok_or_else(|| LlavaError::UnknownTemplate(name.clone()))?,
            ),
            None => None,
        };

        let (eos_token_id, pad_token_id) = special_token_ids(&tokenizer, &llm_dir)?;
        let mut gen_config = GenerationConfig::new(eos_token_id, pad_token_id);
        if !options.generation.is_empty() {
            warn!(
                "Generation overrides received: {}; using them over the defaults",
                options.generation.describe()
            );
            gen_config.apply(&options.generation);
        }
        let logits_processor = build_logits_processor(&gen_config);

        Ok(Self {
            llm,
            llm_config,
            tokenizer,
            visual_encoder,
            projector,
            preprocessor,
            template,
            visual_select_layer: options.visual_select_layer,
            gen_config,
            logits_processor,
            device,
            dtype,
        })
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.gen_config
    }

    /// Dataset-aware prompt assembly: materialize the row's image payload(s)
    /// into the shared cache and format the question for the dataset kind.
    pub fn build_prompt(
        &self,
        record: &EvalRecord,
        dataset: Option<&str>,
    ) -> Result<PromptInput, LlavaError> {
        let img_root = Path::new("images").join(harness::image_root(dataset));
        let image = harness::materialize_images(record, &img_root)?;
        let text = harness::prompt_text(record, dataset)?;
        Ok(PromptInput { image, text })
    }

    /// Single-turn multimodal inference: encode the image, splice its
    /// embedding tokens into the prompt at the placeholder, decode an answer.
    pub fn generate(
        &mut self,
        image_path: &Path,
        prompt: &str,
        dataset: Option<&str>,
    ) -> Result<String, LlavaError> {
        // accepted for interface uniformity with build_prompt
        let _ = dataset;

        let image = image::open(image_path)?.to_rgb8();
        let pixels = self.preprocessor.preprocess(&image, &self.device, self.dtype)?;
        let image_embeds = self.encode_image(&pixels)?;

        let text = format!("{IMAGE_PLACEHOLDER}\n{prompt}");
        let text = match self.template {
            Some(template) => template.apply(&text),
            None => text,
        };
        let (before, after) = split_image_placeholder(&text)?;
        let before_ids = self.tokenizer.encode(before, true)?.get_ids().to_vec();
        let after_ids = self.tokenizer.encode(after, false)?.get_ids().to_vec();

        let input_embeds = self.splice_image_embeds(&before_ids, &after_ids, &image_embeds)?;
        self.decode_loop(&input_embeds)
    }

    /// Vision forward pass: all hidden states, select one layer, drop the
    /// class token, project into the language embedding space.
    fn encode_image(&self, pixels: &Tensor) -> Result<Tensor, LlavaError> {
        let hidden_states = self.visual_encoder.output_hidden_states(pixels)?;
        let available = hidden_states.len();
        let index = if self.visual_select_layer < 0 {
            available as isize + self.visual_select_layer
        } else {
            self.visual_select_layer
        };
        if index < 0 || index as usize >= available {
            return Err(LlavaError::LayerOutOfRange {
                layer: self.visual_select_layer,
                available,
            });
        }
        let features = hidden_states[index as usize].i((.., 1..))?;
        Ok(self.projector.forward(&features)?)
    }

    /// Embed both text segments and concatenate them around the image tokens
    /// at the placeholder split point.
    fn splice_image_embeds(
        &self,
        before_ids: &[u32],
        after_ids: &[u32],
        image_embeds: &Tensor,
    ) -> Result<Tensor, LlavaError> {
        let mut parts = Vec::with_capacity(3);
        if !before_ids.is_empty() {
            let ids = Tensor::new(before_ids, &self.device)?.unsqueeze(0)?;
            parts.push(self.llm.embed(&ids)?);
        }
        parts.push(image_embeds.clone());
        if !after_ids.is_empty() {
            let ids = Tensor::new(after_ids, &self.device)?.unsqueeze(0)?;
            parts.push(self.llm.embed(&ids)?);
        }
        Ok(Tensor::cat(&parts, 1)?)
    }

    fn decode_loop(&mut self, input_embeds: &Tensor) -> Result<String, LlavaError> {
        let mut cache = Cache::new(true, self.dtype, &self.llm_config, &self.device)?;
        let stop_words = self.template.map_or(&[][..], |t| t.stop_words);

        let mut generated: Vec<u32> = Vec::new();
        let mut logits = self.llm.forward_input_embed(input_embeds, 0, &mut cache)?;
        let mut index_pos = input_embeds.dim(1)?;

        for _ in 0..self.gen_config.max_new_tokens {
            let last = logits.squeeze(0)?;
            let last = if self.gen_config.do_sample && self.gen_config.repeat_penalty != 1.0 {
                let start = generated
                    .len()
                    .saturating_sub(self.gen_config.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &last,
                    self.gen_config.repeat_penalty,
                    &generated[start..],
                )?
            } else {
                last
            };
            let next = self.logits_processor.sample(&last)?;
            if next == self.gen_config.eos_token_id {
                break;
            }
            generated.push(next);

            let raw = self.tokenizer.decode(&generated, false)?;
            if stop_words.iter().any(|stop| raw.ends_with(stop)) {
                break;
            }

            let ids = Tensor::new(&[next][..], &self.device)?.unsqueeze(0)?;
            let embeds = self.llm.embed(&ids)?;
            logits = self.llm.forward_input_embed(&embeds, index_pos, &mut cache)?;
            index_pos += 1;
        }

        let mut answer = self.tokenizer.decode(&generated, true)?;
        for stop in stop_words {
            if let Some(stripped) = answer.strip_suffix(stop) {
                answer = stripped.to_string();
                break;
            }
        }
        Ok(answer.trim().to_string())
    }
}

/// Split the composed prompt on the image placeholder; exactly one
/// occurrence is a hard invariant.
fn split_image_placeholder(text: &str) -> Result<(&str, &str), LlavaError> {
    let mut segments = text.split(IMAGE_PLACEHOLDER);
    match (segments.next(), segments.next(), segments.next()) {
        (Some(before), Some(after), None) => Ok((before, after)),
        _ => Err(LlavaError::ImagePlaceholder(
            text.matches(IMAGE_PLACEHOLDER).count(),
        )),
    }
}

#[cfg(feature = "cuda")]
fn select_device(dtype: Option<DType>) -> (Device, DType) {
    match Device::cuda_if_available(0) {
        Ok(device) => (device, dtype.unwrap_or(DType::F16)),
        Err(e) => {
            warn!("CUDA not available, defaulting to CPU: {e}");
            (Device::Cpu, dtype.unwrap_or(DType::F32))
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn select_device(dtype: Option<DType>) -> (Device, DType) {
    (Device::Cpu, dtype.unwrap_or(DType::F32))
}

fn build_logits_processor(config: &GenerationConfig) -> LogitsProcessor {
    if config.do_sample {
        LogitsProcessor::new(config.seed, Some(config.temp), Some(config.top_p))
    } else {
        LogitsProcessor::from_sampling(config.seed, Sampling::ArgMax)
    }
}

/// Flat view of the vision encoder's `config.json`; some checkpoints nest
/// these fields under `vision_config`.
#[derive(Debug, Clone, Deserialize)]
struct VisionConfigFile {
    #[serde(default = "default_hidden_size")]
    hidden_size: usize,
    #[serde(default = "default_intermediate_size")]
    intermediate_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    num_attention_heads: usize,
    #[serde(default = "default_projection_dim")]
    projection_dim: usize,
    #[serde(default = "default_image_size")]
    image_size: usize,
    #[serde(default = "default_patch_size")]
    patch_size: usize,
}

// clip-vit-large-patch14-336, the encoder the reference bundles ship
fn default_hidden_size() -> usize {
    1024
}
fn default_intermediate_size() -> usize {
    4096
}
fn default_num_hidden_layers() -> usize {
    24
}
fn default_num_attention_heads() -> usize {
    16
}
fn default_projection_dim() -> usize {
    768
}
fn default_image_size() -> usize {
    336
}
fn default_patch_size() -> usize {
    14
}

impl VisionConfigFile {
    fn to_clip_config(&self) -> ClipVisionConfig {
        ClipVisionConfig {
            embed_dim: self.hidden_size,
            activation: Activation::QuickGelu,
            intermediate_size: self.intermediate_size,
            num_hidden_layers: self.num_hidden_layers,
            num_attention_heads: self.num_attention_heads,
            projection_dim: self.projection_dim,
            num_channels: 3,
            image_size: self.image_size,
            patch_size: self.patch_size,
        }
    }
}

fn read_vision_config(dir: &Path) -> Result<VisionConfigFile, LlavaError> {
    let raw: serde_json::Value = serde_json::from_slice(&fs::read(dir.join("config.json"))?)?;
    let node = raw.get("vision_config").cloned().unwrap_or(raw);
    Ok(serde_json::from_value(node)?)
}

/// Token strings in `tokenizer_config.json` appear bare or as added-token
/// entries.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenSpec {
    Plain(String),
    Entry { content: String },
}

impl TokenSpec {
    fn content(&self) -> &str {
        match self {
            TokenSpec::Plain(s) => s,
            TokenSpec::Entry { content } => content,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfigFile {
    #[serde(default)]
    eos_token: Option<TokenSpec>,
    #[serde(default)]
    pad_token: Option<TokenSpec>,
}

/// End/pad ids derived from the tokenizer; pad is reported separately so the
/// caller can fall back to eos.
fn special_token_ids(
    tokenizer: &Tokenizer,
    llm_dir: &Path,
) -> Result<(u32, Option<u32>), LlavaError> {
    let config_path = llm_dir.join("tokenizer_config.json");
    let config: TokenizerConfigFile = if config_path.is_file() {
        serde_json::from_slice(&fs::read(config_path)?)?
    } else {
        TokenizerConfigFile::default()
    };
    let eos = config
        .eos_token
        .and_then(|token| tokenizer.token_to_id(token.content()))
        .or_else(|| tokenizer.token_to_id("</s>"))
        .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
        .ok_or(LlavaError::EosTokenNotFound)?;
    let pad = config
        .pad_token
        .and_then(|token| tokenizer.token_to_id(token.content()));
    Ok((eos, pad))
}
