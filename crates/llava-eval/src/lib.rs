//! # llava-eval
//!
//! Adapter exposing LLaVA-style multimodal checkpoints through the common
//! model interface of vision-language benchmark harnesses: the harness feeds
//! an image and a text prompt and receives a generated answer.
//!
//! A checkpoint bundle is a directory holding up to five pretrained
//! sub-models (`llm/`, `visual_encoder/`, `llm_adapter/`,
//! `visual_encoder_adapter/`, `projector/`). The adapter wires them into a
//! single [`llava::Llava`] instance with two operations:
//!
//! - `build_prompt`: dataset-aware prompt and image-path construction
//!   (multiple-choice option lists, bilingual instruction suffixes, an
//!   on-disk image cache for base64 payloads)
//! - `generate`: single-turn image + prompt → answer inference

/// Dataset-facing helpers: eval records, dataset registries and the on-disk
/// image cache shared across calls.
pub mod harness;

/// The LLaVA adapter: bundle resolution, sub-model loading and the
/// generation loop.
pub mod llava;
