//! # JoyCaption
//!
//! Image captioning with the JoyCaption LLaVA checkpoint (SigLIP vision tower, MLP
//! projector, Llama 3.1 language model) running on candle.
//!
//! # Features
//!
//! - Four captioning modes with fixed prompts, or a custom instruction
//! - Checkpoints from the HuggingFace Hub or a local directory
//! - Optional in-memory 4-bit quantization of the language model
//! - CUDA support behind the `cuda` feature

/// Caption modes and their prompts.
pub mod mode;

/// Runtime and checkpoint configuration.
pub mod config;

/// Execution device and weight precision selection.
pub mod device;

/// Error type shared by the crate.
pub mod error;

/// Checkpoint file resolution (Hub or local directory).
pub mod files;

/// Image loading and normalization for the vision tower.
pub mod image_processor;

/// LLaVA composition of the vision tower, projector and language model.
pub mod model;

/// End-to-end captioning pipeline.
pub mod pipeline;

/// Linear layers with optionally quantized weights.
pub mod quantized;

/// Llama language model.
pub mod text_model;

/// Chat prompt rendering, tokenization and sampling.
pub mod text_processor;

/// SigLIP vision encoder.
pub mod vision_model;

pub use config::{JoyCaptionConfig, ModelSource};
pub use image::DynamicImage;
pub use error::JoyCaptionError;
pub use image_processor::load_image;
pub use mode::CaptionMode;
pub use pipeline::JoyCaption;

#[cfg(test)]
pub(crate) mod test_utils {
    use serde_json::json;

    use crate::config::{
        Activation, EosTokenId, LlavaConfig, RopeScaling, TextConfig, VisionConfig,
    };

    pub const TINY_BOS_TOKEN: u32 = 1;
    pub const TINY_IMAGE_TOKEN: u32 = 60;

    /// `tokenizer.json` of a WordLevel tokenizer over the tiny vocabulary: `[UNK]`, `<s>`, `</s>`,
    /// `w3` to `w63`, with `<image>` at `TINY_IMAGE_TOKEN`. Its post-processor prepends `<s>`.
    pub fn tiny_tokenizer_json() -> serde_json::Value {
        let vocab: serde_json::Map<String, serde_json::Value> = (0..64u32)
            .map(|id| {
                let token = match id {
                    0 => "[UNK]".to_string(),
                    TINY_BOS_TOKEN => "<s>".to_string(),
                    2 => "</s>".to_string(),
                    TINY_IMAGE_TOKEN => "<image>".to_string(),
                    _ => format!("w{id}"),
                };
                (token, id.into())
            })
            .collect();
        let special = |id: u32, content: &str| {
            json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        };
        let bos = json!({"SpecialToken": {"id": "<s>", "type_id": 0}});

        json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [
                special(TINY_BOS_TOKEN, "<s>"),
                special(2, "</s>"),
                special(TINY_IMAGE_TOKEN, "<image>"),
            ],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": {
                "type": "TemplateProcessing",
                "single": [bos.clone(), {"Sequence": {"id": "A", "type_id": 0}}],
                "pair": [
                    bos,
                    {"Sequence": {"id": "A", "type_id": 0}},
                    {"Sequence": {"id": "B", "type_id": 1}}
                ],
                "special_tokens": {
                    "<s>": {"id": "<s>", "ids": [TINY_BOS_TOKEN], "tokens": ["<s>"]}
                }
            },
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
        })
    }

    pub fn tiny_vision_config() -> VisionConfig {
        VisionConfig {
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 3,
            num_attention_heads: 4,
            num_channels: 3,
            image_size: 28,
            patch_size: 14,
            hidden_act: Activation::GeluPytorchTanh,
            layer_norm_eps: 1e-6,
        }
    }

    pub fn tiny_text_config() -> TextConfig {
        TextConfig {
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            head_dim: Some(8),
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            rope_scaling: Some(RopeScaling {
                rope_type: "llama3".to_string(),
                factor: 8.0,
                low_freq_factor: 1.0,
                high_freq_factor: 4.0,
                original_max_position_embeddings: 64,
            }),
            max_position_embeddings: 64,
            vocab_size: 64,
            tie_word_embeddings: false,
            eos_token_id: Some(EosTokenId::Single(2)),
        }
    }

    pub fn tiny_llava_config() -> LlavaConfig {
        LlavaConfig {
            text_config: tiny_text_config(),
            vision_config: tiny_vision_config(),
            image_token_index: TINY_IMAGE_TOKEN,
            ..Default::default()
        }
    }
}
