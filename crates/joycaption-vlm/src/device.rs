use candle_core::quantized::GgmlDType;
use candle_core::{DType, Device};

/// Block formats usable for in-memory weight quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantDType {
    /// 4-bit k-quants with 256-element super blocks.
    Q4K,
    /// 8-bit with 32-element blocks.
    Q8_0,
}

impl QuantDType {
    pub fn ggml_dtype(self) -> GgmlDType {
        match self {
            QuantDType::Q4K => GgmlDType::Q4K,
            QuantDType::Q8_0 => GgmlDType::Q8_0,
        }
    }

    /// Number of weights packed in one block; the input dimension must be a multiple of it.
    pub fn block_size(self) -> usize {
        self.ggml_dtype().block_size()
    }
}

/// How the model weights are held in memory for a given device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision {
    /// dtype of activations and full precision weights
    pub dtype: DType,
    /// quantization applied to the language model linear layers
    pub quant: Option<QuantDType>,
}

impl Precision {
    pub fn for_device(device: &Device, low_vram: bool) -> Self {
        let quant = low_vram.then_some(QuantDType::Q4K);
        let dtype = match (device, low_vram) {
            (Device::Cpu, _) => DType::F32,
            (_, true) => DType::F16,
            (_, false) => DType::BF16,
        };
        Self { dtype, quant }
    }
}

/// Pick the device to run on.
///
/// NOTE: to run the model with Cuda, you need to pass the `--features cuda` flag to the `cargo run` command.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        log::info!("Running on CPU as requested");
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    let device = match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            log::warn!("CUDA not available, defaulting to CPU: {e}");
            Device::Cpu
        }
    };

    #[cfg(not(feature = "cuda"))]
    let device = Device::Cpu;

    if device.is_cpu() {
        log::warn!("No GPU. Running on CPU (slow).");
    }
    device
}
