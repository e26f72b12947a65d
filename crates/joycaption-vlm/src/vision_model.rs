use candle_core::{DType, IndexOp, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear, VarBuilder};

use crate::config::{Activation, VisionConfig};
use crate::error::JoyCaptionError;

/// Map a HF-style hidden state index to the number of encoder layers to run.
///
/// Index `0` is the output of the embeddings, index `i` the output of layer `i`, and
/// negative indices count from the end of the `num_layers + 1` hidden states.
pub fn resolve_feature_layer(layer: i64, num_layers: usize) -> Result<usize, JoyCaptionError> {
    let num_states = num_layers as i64 + 1;
    let resolved = if layer < 0 { num_states + layer } else { layer };
    if (0..num_states).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(JoyCaptionError::InvalidFeatureLayer { layer, num_layers })
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            q_proj: candle_nn::linear(h, h, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(h, h, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(h, h, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(h, h, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (batches, patches, hidden_size) = x.dims3()?;
        let split_heads = |t: Tensor| {
            t.reshape((batches, patches, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split_heads(self.q_proj.forward(x)?)?;
        let k = split_heads(self.k_proj.forward(x)?)?;
        let v = split_heads(self.v_proj.forward(x)?)?;

        let y = {
            let in_dtype = q.dtype();
            let q = q.to_dtype(DType::F32)?;
            let k = k.to_dtype(DType::F32)?;
            let v = v.to_dtype(DType::F32)?;

            let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
            let att = candle_nn::ops::softmax_last_dim(&att)?;
            att.matmul(&v)?.contiguous()?.to_dtype(in_dtype)?
        };
        let y = y
            .transpose(1, 2)?
            .reshape((batches, patches, hidden_size))?;
        self.out_proj.forward(&y)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
    act: Activation,
}

impl Mlp {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?,
            fc2: candle_nn::linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?,
            act: cfg.hidden_act,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.fc1.forward(xs)?;
        let xs = self.act.forward(&xs)?;
        self.fc2.forward(&xs)
    }
}

struct Block {
    layer_norm1: LayerNorm,
    self_attn: Attention,
    layer_norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let eps = cfg.layer_norm_eps;
        Ok(Self {
            layer_norm1: candle_nn::layer_norm(cfg.hidden_size, eps, vb.pp("layer_norm1"))?,
            self_attn: Attention::load(cfg, vb.pp("self_attn"))?,
            layer_norm2: candle_nn::layer_norm(cfg.hidden_size, eps, vb.pp("layer_norm2"))?,
            mlp: Mlp::load(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let residual = xs;
        let x = self.layer_norm1.forward(xs)?;
        let x = self.self_attn.forward(&x)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.layer_norm2.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        residual + x
    }
}

/// SigLIP vision encoder truncated at the hidden state used as image features.
pub struct VisionModel {
    patch_embedding: Conv2d,
    position_embedding: Embedding,
    position_ids: Tensor,
    blocks: Vec<Block>,
}

impl VisionModel {
    /// Load the encoder from `vb` (pointing at `vision_model`), keeping only the layers
    /// needed to compute hidden state `feature_layer`.
    pub fn load(
        cfg: &VisionConfig,
        feature_layer: i64,
        vb: VarBuilder,
    ) -> Result<Self, JoyCaptionError> {
        let num_blocks = resolve_feature_layer(feature_layer, cfg.num_hidden_layers)?;
        log::debug!(
            "vision tower: running {num_blocks} of {} layers",
            cfg.num_hidden_layers
        );

        let vb_embed = vb.pp("embeddings");
        let patch_embedding = candle_nn::conv2d(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            Conv2dConfig {
                stride: cfg.patch_size,
                ..Default::default()
            },
            vb_embed.pp("patch_embedding"),
        )?;
        let num_patches = cfg.num_patches();
        let position_embedding = candle_nn::embedding(
            num_patches,
            cfg.hidden_size,
            vb_embed.pp("position_embedding"),
        )?;
        let position_ids = Tensor::arange(0u32, num_patches as u32, vb.device())?;

        let vb_layers = vb.pp("encoder").pp("layers");
        let blocks = (0..num_blocks)
            .map(|i| Block::load(cfg, vb_layers.pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            patch_embedding,
            position_embedding,
            position_ids,
            blocks,
        })
    }

    /// Encode `pixel_values` of shape `[batch, channels, height, width]` into
    /// `[batch, patches, hidden]` features.
    pub fn forward(&self, pixel_values: &Tensor) -> candle_core::Result<Tensor> {
        // B,C,H,W => B,E,H/P,W/P => B,E,N => B,N,E
        let xs = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let num_patches = xs.dim(1)?;
        let positions = self
            .position_embedding
            .forward(&self.position_ids.i(..num_patches)?)?;
        let mut xs = xs.broadcast_add(&positions)?;

        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    use crate::test_utils::tiny_vision_config;

    #[test]
    fn feature_layer_resolution() -> Result<(), JoyCaptionError> {
        assert_eq!(resolve_feature_layer(-2, 27)?, 26);
        assert_eq!(resolve_feature_layer(-1, 27)?, 27);
        assert_eq!(resolve_feature_layer(0, 27)?, 0);
        assert_eq!(resolve_feature_layer(27, 27)?, 27);
        assert!(matches!(
            resolve_feature_layer(28, 27),
            Err(JoyCaptionError::InvalidFeatureLayer { layer: 28, .. })
        ));
        assert!(matches!(
            resolve_feature_layer(-29, 27),
            Err(JoyCaptionError::InvalidFeatureLayer { layer: -29, .. })
        ));
        Ok(())
    }

    #[test]
    fn vision_forward_shape() -> Result<(), JoyCaptionError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = tiny_vision_config();
        let model = VisionModel::load(&cfg, -2, vb)?;
        assert_eq!(model.blocks.len(), 2);

        let pixels = Tensor::randn(0f32, 1., (1, 3, 28, 28), &Device::Cpu)?;
        let features = model.forward(&pixels)?;
        assert_eq!(features.dims(), &[1, 4, 32]);
        Ok(())
    }

    #[test]
    fn embeddings_only() -> Result<(), JoyCaptionError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VisionModel::load(&tiny_vision_config(), 0, vb)?;
        assert!(model.blocks.is_empty());

        let pixels = Tensor::zeros((2, 3, 28, 28), DType::F32, &Device::Cpu)?;
        assert_eq!(model.forward(&pixels)?.dims(), &[2, 4, 32]);
        Ok(())
    }
}
