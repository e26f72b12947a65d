use std::path::PathBuf;

use candle_core::{Result, Tensor};
use serde::Deserialize;

/// Where the checkpoint files (config, tokenizer, weights) come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// A HuggingFace Hub repository.
    Hub { model_id: String, revision: String },
    /// A local directory with the same layout as the Hub repository.
    Local(PathBuf),
}

impl ModelSource {
    pub const DEFAULT_MODEL_ID: &'static str = "fancyfeast/llama-joycaption-beta-one-hf-llava";

    pub fn hub<S: Into<String>>(model_id: S) -> Self {
        Self::Hub {
            model_id: model_id.into(),
            revision: "main".to_string(),
        }
    }
}

impl Default for ModelSource {
    fn default() -> Self {
        Self::hub(Self::DEFAULT_MODEL_ID)
    }
}

/// Configuration for the JoyCaption pipeline
#[derive(Debug, Clone)]
pub struct JoyCaptionConfig {
    pub source: ModelSource,
    /// Optional path to custom safetensor weights files. If provided, these will be used
    /// instead of the shards listed by the model source.
    pub weights_path: Option<Vec<PathBuf>>,
    pub seed: u64,
    pub temperature: f64,
    pub top_p: f64,
    pub do_sample: bool,
    pub max_new_tokens: usize,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    /// Quantize the language model weights to 4 bits.
    pub low_vram: bool,
    pub force_cpu: bool,
    pub debug: bool,
}

impl Default for JoyCaptionConfig {
    fn default() -> Self {
        Self {
            source: ModelSource::default(),
            weights_path: None,
            seed: 299792458,
            temperature: 0.6,
            top_p: 0.9,
            do_sample: true,
            max_new_tokens: 512,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            low_vram: false,
            force_cpu: false,
            debug: false,
        }
    }
}

/// Activation functions found in LLaVA checkpoint configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Gelu,
    GeluPytorchTanh,
    QuickGelu,
    Silu,
    Relu,
}

impl Activation {
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Gelu => xs.gelu_erf(),
            Activation::GeluPytorchTanh => xs.gelu(),
            Activation::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702)?)?,
            Activation::Silu => xs.silu(),
            Activation::Relu => xs.relu(),
        }
    }
}

/// Either a single token id or a list of them, as found in HF configs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenId {
    pub fn ids(&self) -> Vec<u32> {
        match self {
            EosTokenId::Single(id) => vec![*id],
            EosTokenId::Multiple(ids) => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RopeScaling {
    #[serde(alias = "type")]
    pub rope_type: String,
    pub factor: f32,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f32,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f32,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
}

/// Llama text model configuration. Defaults are the Llama 3.1 8B values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextConfig {
    #[serde(default = "default_text_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_text_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_text_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_text_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
}

impl TextConfig {
    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_text_hidden_size(),
            intermediate_size: default_text_intermediate_size(),
            num_hidden_layers: default_text_num_hidden_layers(),
            num_attention_heads: default_text_num_attention_heads(),
            num_key_value_heads: Some(8),
            head_dim: Some(128),
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            rope_scaling: Some(RopeScaling {
                rope_type: "llama3".to_string(),
                factor: 8.0,
                low_freq_factor: default_low_freq_factor(),
                high_freq_factor: default_high_freq_factor(),
                original_max_position_embeddings: default_original_max_position_embeddings(),
            }),
            max_position_embeddings: default_max_position_embeddings(),
            vocab_size: default_vocab_size(),
            tie_word_embeddings: false,
            eos_token_id: Some(EosTokenId::Multiple(vec![128001, 128008, 128009])),
        }
    }
}

/// SigLIP vision tower configuration. Defaults are the so400m-patch14-384 values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_vision_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_vision_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_vision_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_vision_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_vision_hidden_act")]
    pub hidden_act: Activation,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl VisionConfig {
    pub fn num_patches(&self) -> usize {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_vision_hidden_size(),
            intermediate_size: default_vision_intermediate_size(),
            num_hidden_layers: default_vision_num_hidden_layers(),
            num_attention_heads: default_vision_num_attention_heads(),
            num_channels: default_num_channels(),
            image_size: default_image_size(),
            patch_size: default_patch_size(),
            hidden_act: default_vision_hidden_act(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

/// Top-level `config.json` of a LLaVA checkpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LlavaConfig {
    #[serde(default)]
    pub text_config: TextConfig,
    #[serde(default)]
    pub vision_config: VisionConfig,
    #[serde(default = "default_image_token_index")]
    pub image_token_index: u32,
    #[serde(default = "default_projector_hidden_act")]
    pub projector_hidden_act: Activation,
    #[serde(default = "default_vision_feature_layer")]
    pub vision_feature_layer: i64,
    #[serde(default = "default_vision_feature_select_strategy")]
    pub vision_feature_select_strategy: String,
    #[serde(default = "default_true")]
    pub multimodal_projector_bias: bool,
}

impl LlavaConfig {
    /// Number of embeddings the vision tower contributes for one image.
    pub fn num_image_tokens(&self) -> usize {
        let patches = self.vision_config.num_patches();
        if self.vision_feature_select_strategy == "default" {
            patches.saturating_sub(1)
        } else {
            patches
        }
    }
}

impl Default for LlavaConfig {
    fn default() -> Self {
        Self {
            text_config: TextConfig::default(),
            vision_config: VisionConfig::default(),
            image_token_index: default_image_token_index(),
            projector_hidden_act: default_projector_hidden_act(),
            vision_feature_layer: default_vision_feature_layer(),
            vision_feature_select_strategy: default_vision_feature_select_strategy(),
            multimodal_projector_bias: true,
        }
    }
}

/// The subset of `generation_config.json` consumed by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
}

fn default_true() -> bool {
    true
}

fn default_text_hidden_size() -> usize {
    4096
}

fn default_text_intermediate_size() -> usize {
    14336
}

fn default_text_num_hidden_layers() -> usize {
    32
}

fn default_text_num_attention_heads() -> usize {
    32
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f32 {
    500000.0
}

fn default_max_position_embeddings() -> usize {
    131072
}

fn default_vocab_size() -> usize {
    128256
}

fn default_low_freq_factor() -> f32 {
    1.0
}

fn default_high_freq_factor() -> f32 {
    4.0
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

fn default_vision_hidden_size() -> usize {
    1152
}

fn default_vision_intermediate_size() -> usize {
    4304
}

fn default_vision_num_hidden_layers() -> usize {
    27
}

fn default_vision_num_attention_heads() -> usize {
    16
}

fn default_num_channels() -> usize {
    3
}

fn default_image_size() -> usize {
    384
}

fn default_patch_size() -> usize {
    14
}

fn default_vision_hidden_act() -> Activation {
    Activation::GeluPytorchTanh
}

fn default_layer_norm_eps() -> f64 {
    1e-6
}

fn default_image_token_index() -> u32 {
    128077
}

fn default_projector_hidden_act() -> Activation {
    Activation::Gelu
}

fn default_vision_feature_layer() -> i64 {
    -2
}

fn default_vision_feature_select_strategy() -> String {
    "full".to_string()
}
