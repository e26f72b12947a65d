use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::{Activation, LlavaConfig};
use crate::device::QuantDType;
use crate::error::JoyCaptionError;
use crate::text_model::TextModel;
use crate::vision_model::VisionModel;

/// Tensor naming scheme of a LLaVA checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// `language_model.model.*`, `language_model.lm_head`, `vision_tower.*`
    Legacy,
    /// `model.language_model.*`, `lm_head`, `model.vision_tower.*`
    Current,
}

impl WeightLayout {
    pub fn detect(vb: &VarBuilder) -> Result<Self, JoyCaptionError> {
        if vb.contains_tensor("language_model.model.embed_tokens.weight") {
            Ok(Self::Legacy)
        } else if vb.contains_tensor("model.language_model.embed_tokens.weight") {
            Ok(Self::Current)
        } else {
            Err(JoyCaptionError::MissingWeights(
                "no language model embeddings found in the checkpoint".to_string(),
            ))
        }
    }

    fn vision_tower(self) -> &'static str {
        match self {
            Self::Legacy => "vision_tower.vision_model",
            Self::Current => "model.vision_tower.vision_model",
        }
    }

    fn projector(self) -> &'static str {
        match self {
            Self::Legacy => "multi_modal_projector",
            Self::Current => "model.multi_modal_projector",
        }
    }

    fn language_model(self) -> &'static str {
        match self {
            Self::Legacy => "language_model.model",
            Self::Current => "model.language_model",
        }
    }

    fn lm_head(self) -> &'static str {
        match self {
            Self::Legacy => "language_model.lm_head",
            Self::Current => "lm_head",
        }
    }
}

/// Two-layer MLP mapping vision features into the language model embedding space.
pub struct Projector {
    linear_1: Linear,
    linear_2: Linear,
    act: Activation,
}

impl Projector {
    fn load(cfg: &LlavaConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let vision_hidden = cfg.vision_config.hidden_size;
        let text_hidden = cfg.text_config.hidden_size;
        let bias = cfg.multimodal_projector_bias;
        Ok(Self {
            linear_1: candle_nn::linear_b(vision_hidden, text_hidden, bias, vb.pp("linear_1"))?,
            linear_2: candle_nn::linear_b(text_hidden, text_hidden, bias, vb.pp("linear_2"))?,
            act: cfg.projector_hidden_act,
        })
    }
}

impl Module for Projector {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.linear_1.forward(xs)?;
        let xs = self.act.forward(&xs)?;
        self.linear_2.forward(&xs)
    }
}

/// Replace the rows of `inputs_embeds` flagged by `image_token_mask` with consecutive rows
/// of `image_features`.
///
/// # Arguments
///
/// * `image_token_mask` - `[seq]` u8 mask, non-zero at image token positions
/// * `image_features` - `[num_image_tokens, hidden]` projected image features
/// * `inputs_embeds` - `[seq, hidden]` text embeddings
pub fn merge_image_features(
    image_token_mask: &Tensor,
    image_features: &Tensor,
    inputs_embeds: &Tensor,
) -> Result<Tensor, JoyCaptionError> {
    let (seq_len, hidden_size) = inputs_embeds.dims2()?;
    let (num_features, _) = image_features.dims2()?;

    let mask_f32 = image_token_mask.to_dtype(DType::F32)?;
    let num_image_tokens = mask_f32.sum_all()?.to_scalar::<f32>()? as usize;
    if num_image_tokens != num_features {
        return Err(JoyCaptionError::MismatchedImageFeatures {
            tokens: num_image_tokens,
            features: num_features,
        });
    }
    if num_image_tokens == 0 {
        return Ok(inputs_embeds.clone());
    }

    // cumulative sum minus one maps every image position to its feature row,
    // text positions get clamped dummy indices that are masked out below
    let image_indices = mask_f32
        .cumsum(0)?
        .affine(1.0, -1.0)?
        .clamp(0f32, (num_image_tokens - 1) as f32)?
        .to_dtype(DType::U32)?;
    let gathered = image_features.index_select(&image_indices, 0)?;

    Ok(image_token_mask
        .unsqueeze(1)?
        .expand((seq_len, hidden_size))?
        .contiguous()?
        .where_cond(&gathered, inputs_embeds)?)
}

/// LLaVA model: SigLIP vision tower, MLP projector and Llama language model.
pub struct LlavaModel {
    vision_tower: VisionModel,
    projector: Projector,
    text_model: TextModel,
    image_token_index: u32,
    num_image_tokens: usize,
    dtype: DType,
    device: Device,
}

impl LlavaModel {
    pub fn load(
        cfg: &LlavaConfig,
        quant: Option<QuantDType>,
        vb: VarBuilder,
    ) -> Result<Self, JoyCaptionError> {
        let layout = WeightLayout::detect(&vb)?;
        log::debug!("checkpoint weight layout: {layout:?}");
        Self::load_with_layout(cfg, quant, layout, vb)
    }

    pub fn load_with_layout(
        cfg: &LlavaConfig,
        quant: Option<QuantDType>,
        layout: WeightLayout,
        vb: VarBuilder,
    ) -> Result<Self, JoyCaptionError> {
        let vision_tower = VisionModel::load(
            &cfg.vision_config,
            cfg.vision_feature_layer,
            vb.pp(layout.vision_tower()),
        )?;
        let projector = Projector::load(cfg, vb.pp(layout.projector()))?;
        let text_model = TextModel::load(
            &cfg.text_config,
            quant,
            vb.pp(layout.language_model()),
            vb.pp(layout.lm_head()),
        )?;

        Ok(Self {
            vision_tower,
            projector,
            text_model,
            image_token_index: cfg.image_token_index,
            num_image_tokens: cfg.num_image_tokens(),
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    pub fn num_image_tokens(&self) -> usize {
        self.num_image_tokens
    }

    pub fn image_token_index(&self) -> u32 {
        self.image_token_index
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Encode and project one image `[1, channels, height, width]` into
    /// `[num_image_tokens, text_hidden]` embeddings.
    pub fn encode_image(&self, pixel_values: &Tensor) -> candle_core::Result<Tensor> {
        let features = self.vision_tower.forward(pixel_values)?;
        let features = if features.dim(1)? > self.num_image_tokens {
            // the "default" strategy drops the leading class embedding
            features.narrow(1, 1, self.num_image_tokens)?
        } else {
            features
        };
        self.projector.forward(&features)?.flatten(0, 1)
    }

    /// Next token logits `[vocab]` for `input_ids` (`[seq]`) starting at `index_pos`.
    ///
    /// When `pixel_values` is given, the embeddings at the image token positions are replaced
    /// by the projected image features.
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        pixel_values: Option<&Tensor>,
        index_pos: usize,
    ) -> Result<Tensor, JoyCaptionError> {
        let inputs_embeds = self.text_model.embed(input_ids)?;
        let inputs_embeds = match pixel_values {
            Some(pixel_values) => {
                let image_features = self.encode_image(pixel_values)?;
                let image_token_mask = input_ids.eq(self.image_token_index)?;
                merge_image_features(&image_token_mask, &image_features, &inputs_embeds)?
            }
            None => inputs_embeds,
        };

        let logits = self
            .text_model
            .forward_input_embed(&inputs_embeds.unsqueeze(0)?, index_pos)?;
        Ok(logits.squeeze(0)?)
    }

    pub fn clear_kv_cache(&mut self) {
        self.text_model.clear_kv_cache();
    }
}
