use candle_core::{DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::{rotary_emb::rope, Embedding, Linear, RmsNorm, VarBuilder};
use candle_transformers::utils::repeat_kv;

use crate::config::TextConfig;
use crate::device::QuantDType;
use crate::quantized::QLinear;

// rotary tables are built for at most this many positions
const MAX_CONTEXT: usize = 8192;

/// Rotary frequencies, with the Llama 3 long-context rescaling when configured.
fn calculate_inv_freq(cfg: &TextConfig) -> Vec<f32> {
    let head_dim = cfg.head_dim();
    let inv_freq = (0..head_dim)
        .step_by(2)
        .map(|i| 1f32 / cfg.rope_theta.powf(i as f32 / head_dim as f32));

    match &cfg.rope_scaling {
        Some(scaling) if scaling.rope_type == "llama3" => {
            let original_max = scaling.original_max_position_embeddings as f32;
            let low_freq_wavelen = original_max / scaling.low_freq_factor;
            let high_freq_wavelen = original_max / scaling.high_freq_factor;
            inv_freq
                .map(|freq| {
                    let wavelen = 2. * std::f32::consts::PI / freq;
                    if wavelen < high_freq_wavelen {
                        freq
                    } else if wavelen > low_freq_wavelen {
                        freq / scaling.factor
                    } else {
                        let smooth = (original_max / wavelen - scaling.low_freq_factor)
                            / (scaling.high_freq_factor - scaling.low_freq_factor);
                        (1. - smooth) * freq / scaling.factor + smooth * freq
                    }
                })
                .collect()
        }
        _ => inv_freq.collect(),
    }
}

struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(cfg: &TextConfig, dtype: DType, device: &Device) -> Result<Self> {
        let max_len = cfg.max_position_embeddings.min(MAX_CONTEXT);
        let inv_freq = calculate_inv_freq(cfg);
        let num_freqs = inv_freq.len();
        let theta = Tensor::new(inv_freq, device)?;
        // 0 -> max position embedding
        let idx_theta = Tensor::arange(0, max_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_len, 1))?
            .matmul(&theta.reshape((1, num_freqs))?)?;
        Ok(Self {
            cos: idx_theta.cos()?.to_dtype(dtype)?,
            sin: idx_theta.sin()?.to_dtype(dtype)?,
        })
    }

    fn max_len(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Rotate `x` of shape `[batch, heads, seq, head_dim]` starting at `index_pos`.
    fn apply(&self, x: &Tensor, index_pos: usize) -> Result<Tensor> {
        let (_b, _h, seq_len, _d) = x.dims4()?;
        if index_pos + seq_len > self.max_len() {
            return Err(candle_core::Error::Msg(format!(
                "context length exceeded: {} tokens, limit {}",
                index_pos + seq_len,
                self.max_len()
            )));
        }
        rope(
            x,
            &self.cos.narrow(0, index_pos, seq_len)?,
            &self.sin.narrow(0, index_pos, seq_len)?,
        )
    }
}

fn causal_mask(seq_len: usize, total_len: usize, device: &Device) -> Result<Tensor> {
    let offset = total_len - seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| if j > i + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_vec(mask, (seq_len, total_len), device)
}

struct Attention {
    q_proj: QLinear,
    k_proj: QLinear,
    v_proj: QLinear,
    o_proj: QLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,

    // keys and values of the positions seen so far
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn load(cfg: &TextConfig, quant: Option<QuantDType>, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_key_value_heads();
        let head_dim = cfg.head_dim();
        Ok(Self {
            q_proj: QLinear::load(hidden, num_heads * head_dim, false, quant, vb.pp("q_proj"))?,
            k_proj: QLinear::load(hidden, num_kv_heads * head_dim, false, quant, vb.pp("k_proj"))?,
            v_proj: QLinear::load(hidden, num_kv_heads * head_dim, false, quant, vb.pp("v_proj"))?,
            o_proj: QLinear::load(num_heads * head_dim, hidden, false, quant, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            head_dim,
            kv_cache: None,
        })
    }

    fn forward(&mut self, x: &Tensor, index_pos: usize, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (batches, seq_len, _hidden) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((batches, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((batches, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((batches, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rotary.apply(&q, index_pos)?;
        let k = rotary.apply(&k, index_pos)?;

        // new tokens always extend the cached sequence
        let (k, v) = match &self.kv_cache {
            Some((k_cache, v_cache)) => (
                Tensor::cat(&[k_cache, &k], 2)?,
                Tensor::cat(&[v_cache, &v], 2)?,
            ),
            None => (k, v),
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;
        let total_len = k.dim(2)?;

        let y = {
            let in_dtype = q.dtype();
            let q = q.to_dtype(DType::F32)?;
            let k = k.to_dtype(DType::F32)?;
            let v = v.to_dtype(DType::F32)?;

            let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
            let att = if seq_len == 1 {
                att
            } else {
                let mask = causal_mask(seq_len, total_len, x.device())?;
                att.broadcast_add(&mask)?
            };
            let att = candle_nn::ops::softmax_last_dim(&att)?;
            att.matmul(&v)?.contiguous()?.to_dtype(in_dtype)?
        };

        let y = y
            .transpose(1, 2)?
            .reshape((batches, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&y)
    }
}

struct Mlp {
    gate_proj: QLinear,
    up_proj: QLinear,
    down_proj: QLinear,
}

impl Mlp {
    fn load(cfg: &TextConfig, quant: Option<QuantDType>, vb: VarBuilder) -> Result<Self> {
        let (h, i) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: QLinear::load(h, i, false, quant, vb.pp("gate_proj"))?,
            up_proj: QLinear::load(h, i, false, quant, vb.pp("up_proj"))?,
            down_proj: QLinear::load(i, h, false, quant, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.silu()?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn load(cfg: &TextConfig, quant: Option<QuantDType>, vb: VarBuilder) -> Result<Self> {
        let (h, eps) = (cfg.hidden_size, cfg.rms_norm_eps);
        Ok(Self {
            input_layernorm: candle_nn::rms_norm(h, eps, vb.pp("input_layernorm"))?,
            self_attn: Attention::load(cfg, quant, vb.pp("self_attn"))?,
            post_attention_layernorm: candle_nn::rms_norm(
                h,
                eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(cfg, quant, vb.pp("mlp"))?,
        })
    }

    fn forward(&mut self, x: &Tensor, index_pos: usize, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, index_pos, rotary)?;
        let x = (residual + h)?;

        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        residual + h
    }
}

/// Llama decoder with a per-layer KV cache.
pub struct TextModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
}

impl TextModel {
    /// Load the decoder. `vb` points at the decoder weights (`embed_tokens`, `layers`,
    /// `norm`) and `vb_lm_head` at the output projection.
    pub fn load(
        cfg: &TextConfig,
        quant: Option<QuantDType>,
        vb: VarBuilder,
        vb_lm_head: VarBuilder,
    ) -> Result<Self> {
        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb_lm_head)?
        };

        let vb_layers = vb.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| DecoderLayer::load(cfg, quant, vb_layers.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            norm: candle_nn::rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?,
            rotary: RotaryEmbedding::new(cfg, vb.dtype(), vb.device())?,
            embed_tokens,
            layers,
            lm_head,
        })
    }

    /// Token ids `[batch, seq]` to embeddings `[batch, seq, hidden]`.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)
    }

    /// Run the decoder on embeddings of the positions following `index_pos` and return the
    /// F32 logits `[batch, vocab]` of the last position.
    pub fn forward_input_embed(&mut self, input_embeds: &Tensor, index_pos: usize) -> Result<Tensor> {
        let (_b, seq_len, _h) = input_embeds.dims3()?;
        let mut x = input_embeds.clone();
        for layer in &mut self.layers {
            x = layer.forward(&x, index_pos, &self.rotary)?;
        }
        let x = self.norm.forward(&x)?;
        let x = x.i((.., seq_len - 1, ..))?.contiguous()?;
        self.lm_head.forward(&x)?.to_dtype(DType::F32)
    }

    pub fn forward(&mut self, input_ids: &Tensor, index_pos: usize) -> Result<Tensor> {
        let embeds = self.embed(input_ids)?;
        self.forward_input_embed(&embeds, index_pos)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in &mut self.layers {
            layer.self_attn.kv_cache = None;
        }
    }
}
