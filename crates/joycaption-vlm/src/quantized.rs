use candle_core::quantized::{QMatMul, QTensor};
use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::device::QuantDType;

#[derive(Debug, Clone)]
enum Inner {
    Full(Linear),
    Quantized { matmul: QMatMul, bias: Option<Tensor> },
}

/// A linear layer whose weight is optionally re-quantized in memory at load time.
#[derive(Debug, Clone)]
pub struct QLinear {
    inner: Inner,
}

impl QLinear {
    pub fn load(
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        quant: Option<QuantDType>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let linear = candle_nn::linear_b(in_dim, out_dim, bias, vb)?;
        match quant {
            Some(quant) if in_dim % quant.block_size() == 0 => Self::quantize(linear, quant),
            Some(quant) => {
                log::debug!(
                    "keeping {out_dim}x{in_dim} linear in full precision, input dim not a multiple of {}",
                    quant.block_size()
                );
                Ok(Self::from(linear))
            }
            None => Ok(Self::from(linear)),
        }
    }

    fn quantize(linear: Linear, quant: QuantDType) -> Result<Self> {
        // ggml quantization reads f32 values
        let weight = linear.weight().to_dtype(DType::F32)?;
        let qtensor = QTensor::quantize(&weight, quant.ggml_dtype())?;
        Ok(Self {
            inner: Inner::Quantized {
                matmul: QMatMul::from_qtensor(qtensor)?,
                bias: linear.bias().cloned(),
            },
        })
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.inner, Inner::Quantized { .. })
    }
}

impl From<Linear> for QLinear {
    fn from(linear: Linear) -> Self {
        Self {
            inner: Inner::Full(linear),
        }
    }
}

impl Module for QLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match &self.inner {
            Inner::Full(linear) => linear.forward(xs),
            Inner::Quantized { matmul, bias } => {
                let in_dtype = xs.dtype();
                let ys = matmul
                    .forward(&xs.to_dtype(DType::F32)?.contiguous()?)?
                    .to_dtype(in_dtype)?;
                match bias {
                    Some(bias) => ys.broadcast_add(bias),
                    None => Ok(ys),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn relative_error(a: &Tensor, b: &Tensor) -> Result<f32> {
        let diff = (a - b)?.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        let norm = b.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        Ok(diff / norm)
    }

    #[test]
    fn full_precision_by_default() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let linear = QLinear::load(256, 8, true, None, vb.pp("proj"))?;
        assert!(!linear.is_quantized());

        let xs = Tensor::randn(0f32, 1., (2, 3, 256), &Device::Cpu)?;
        assert_eq!(linear.forward(&xs)?.dims(), &[2, 3, 8]);
        Ok(())
    }

    #[test]
    fn quantized_matches_full_precision() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let full = QLinear::load(256, 16, true, None, vb.pp("proj"))?;
        let q8 = QLinear::load(256, 16, true, Some(QuantDType::Q8_0), vb.pp("proj"))?;
        let q4 = QLinear::load(256, 16, true, Some(QuantDType::Q4K), vb.pp("proj"))?;
        assert!(q8.is_quantized());
        assert!(q4.is_quantized());

        let xs = Tensor::randn(0f32, 1., (4, 256), &Device::Cpu)?;
        let expected = full.forward(&xs)?;

        let out_q8 = q8.forward(&xs)?;
        assert_eq!(out_q8.dims(), expected.dims());
        assert!(relative_error(&out_q8, &expected)? < 0.02);

        let out_q4 = q4.forward(&xs)?;
        assert!(relative_error(&out_q4, &expected)? < 0.15);
        Ok(())
    }

    #[test]
    fn unaligned_input_stays_full_precision() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let linear = QLinear::load(100, 4, false, Some(QuantDType::Q4K), vb)?;
        assert!(!linear.is_quantized());
        Ok(())
    }
}
