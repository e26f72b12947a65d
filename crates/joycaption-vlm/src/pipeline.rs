use std::fs;
use std::path::Path;
use std::time::Instant;

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use image::DynamicImage;
use log::{debug, info};
use serde::de::DeserializeOwned;

use crate::config::{GenerationConfig, JoyCaptionConfig, LlavaConfig};
use crate::device::{select_device, Precision};
use crate::error::{JoyCaptionError, LoadStage};
use crate::files::ModelFiles;
use crate::image_processor::{ImageProcessor, ImageProcessorConfig};
use crate::mode::CaptionMode;
use crate::model::LlavaModel;
use crate::text_processor::TextProcessor;

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, JoyCaptionError> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// JoyCaption captioning pipeline: processors and model loaded once, reused per image.
pub struct JoyCaption {
    model: LlavaModel,
    txt_processor: TextProcessor,
    img_processor: ImageProcessor,
    config: JoyCaptionConfig,
    device: Device,
}

impl JoyCaption {
    /// Resolve the checkpoint files and load processors and model.
    ///
    /// With the default configuration the checkpoint is downloaded from the HuggingFace Hub.
    pub fn new(config: JoyCaptionConfig) -> Result<Self, JoyCaptionError> {
        let stage = |stage: LoadStage| move |e: JoyCaptionError| JoyCaptionError::load(stage, e);

        info!("Resolving model files");
        let (files, llava, generation) =
            Self::load_files(&config).map_err(stage(LoadStage::ModelFiles))?;

        let device = select_device(config.force_cpu);
        let precision = Precision::for_device(&device, config.low_vram);
        info!(
            "Running with {:?} weights{}",
            precision.dtype,
            match precision.quant {
                Some(quant) => format!(", language model quantized to {quant:?}"),
                None => String::new(),
            }
        );

        info!("Loading processor");
        let (txt_processor, img_processor) = Self::load_processors(
            &files,
            &llava,
            generation.as_ref(),
            &config,
            &precision,
            &device,
        )
        .map_err(stage(LoadStage::Processor))?;

        info!("Loading model");
        let start = Instant::now();
        let model = Self::load_model(&files, &llava, &precision, &device)
            .map_err(stage(LoadStage::Model))?;
        info!("Model loaded in {:.2}s", start.elapsed().as_secs_f64());

        Ok(Self {
            model,
            txt_processor,
            img_processor,
            config,
            device,
        })
    }

    fn load_files(
        config: &JoyCaptionConfig,
    ) -> Result<(ModelFiles, LlavaConfig, Option<GenerationConfig>), JoyCaptionError> {
        let files = ModelFiles::resolve(&config.source, config.weights_path.as_deref())?;
        let llava: LlavaConfig = read_json(&files.config)?;
        let generation = files
            .generation_config
            .as_deref()
            .map(read_json::<GenerationConfig>)
            .transpose()?;
        Ok((files, llava, generation))
    }

    fn load_processors(
        files: &ModelFiles,
        llava: &LlavaConfig,
        generation: Option<&GenerationConfig>,
        config: &JoyCaptionConfig,
        precision: &Precision,
        device: &Device,
    ) -> Result<(TextProcessor, ImageProcessor), JoyCaptionError> {
        let txt_processor = TextProcessor::new(files, llava, generation, config)?;
        let img_processor = ImageProcessor::new(
            ImageProcessorConfig::from_vision_config(&llava.vision_config),
            precision.dtype,
            device,
        )?;
        Ok((txt_processor, img_processor))
    }

    fn load_model(
        files: &ModelFiles,
        llava: &LlavaConfig,
        precision: &Precision,
        device: &Device,
    ) -> Result<LlavaModel, JoyCaptionError> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&files.weights, precision.dtype, device)?
        };
        LlavaModel::load(llava, precision.quant, vb)
    }

    /// Caption `image` with the prompt of `mode`.
    pub fn caption(
        &mut self,
        image: &DynamicImage,
        mode: CaptionMode,
    ) -> Result<String, JoyCaptionError> {
        self.caption_with_prompt(image, mode.prompt())
    }

    /// Caption `image` following a free-form `instruction`.
    pub fn caption_with_prompt(
        &mut self,
        image: &DynamicImage,
        instruction: &str,
    ) -> Result<String, JoyCaptionError> {
        self.model.clear_kv_cache();
        self.txt_processor.reset();

        let prompt = self.txt_processor.build_prompt(instruction)?;
        if self.config.debug {
            debug!("Prompt: {prompt:?}");
        }
        let prompt_tokens = self
            .txt_processor
            .encode_prompt(&prompt, self.model.num_image_tokens())?;
        debug!("Prompt tokens: {}", prompt_tokens.len());

        let pixel_values = self.img_processor.preprocess(image)?;

        let start = Instant::now();
        let mut start_gen = None;
        let mut generated = Vec::new();
        let mut delta_tokens = prompt_tokens;
        let mut index_pos = 0;

        for i in 0..self.config.max_new_tokens {
            let input = Tensor::new(delta_tokens.as_slice(), &self.device)?;
            let pixels = (i == 0).then_some(&pixel_values);
            let logits = self.model.forward(&input, pixels, index_pos)?;
            index_pos += delta_tokens.len();

            if i == 1 {
                start_gen = Some(Instant::now());
            }

            let token = self.txt_processor.sample_logits(&logits)?;
            if self.txt_processor.is_eos(token) {
                break;
            }
            if self.config.debug {
                debug!("token {i}: {token}");
            }
            generated.push(token);
            delta_tokens.clear();
            delta_tokens.push(token);
        }

        match start_gen {
            Some(start_gen) => {
                let dt = start_gen.elapsed();
                info!(
                    "{} tokens generated in {:.2}s ({:.2} token/s)",
                    generated.len(),
                    start.elapsed().as_secs_f64(),
                    (generated.len().saturating_sub(1)) as f64 / dt.as_secs_f64(),
                );
            }
            None => info!(
                "{} tokens generated in {:.2}s",
                generated.len(),
                start.elapsed().as_secs_f64()
            ),
        }

        self.txt_processor.decode(&generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;
    use serde_json::json;

    use crate::config::ModelSource;
    use crate::image_processor::load_image;
    use crate::model::WeightLayout;
    use crate::test_utils::{tiny_llava_config, tiny_tokenizer_json, TINY_IMAGE_TOKEN};

    /// Write a randomly initialized tiny checkpoint with the layout of the Hub repositories.
    fn write_tiny_checkpoint(dir: &Path) -> Result<(), JoyCaptionError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        LlavaModel::load_with_layout(&tiny_llava_config(), None, WeightLayout::Current, vb)?;
        varmap.save(dir.join("model.safetensors"))?;

        let config = json!({
            "image_token_index": TINY_IMAGE_TOKEN,
            "vision_feature_layer": -2,
            "vision_feature_select_strategy": "full",
            "projector_hidden_act": "gelu",
            "text_config": {
                "hidden_size": 32,
                "intermediate_size": 64,
                "num_hidden_layers": 2,
                "num_attention_heads": 4,
                "num_key_value_heads": 2,
                "head_dim": 8,
                "rms_norm_eps": 1e-5,
                "rope_theta": 10000.0,
                "rope_scaling": {
                    "rope_type": "llama3",
                    "factor": 8.0,
                    "low_freq_factor": 1.0,
                    "high_freq_factor": 4.0,
                    "original_max_position_embeddings": 64
                },
                "max_position_embeddings": 512,
                "vocab_size": 64,
                "tie_word_embeddings": false,
                "eos_token_id": 2
            },
            "vision_config": {
                "hidden_size": 32,
                "intermediate_size": 64,
                "num_hidden_layers": 3,
                "num_attention_heads": 4,
                "num_channels": 3,
                "image_size": 28,
                "patch_size": 14,
                "hidden_act": "gelu_pytorch_tanh",
                "layer_norm_eps": 1e-6
            }
        });
        fs::write(dir.join("config.json"), config.to_string())?;
        fs::write(
            dir.join("tokenizer.json"),
            tiny_tokenizer_json().to_string(),
        )?;
        fs::write(
            dir.join("tokenizer_config.json"),
            r#"{"bos_token": "<s>", "eos_token": "</s>"}"#,
        )?;
        Ok(())
    }

    fn tiny_config(dir: &Path) -> JoyCaptionConfig {
        JoyCaptionConfig {
            source: ModelSource::Local(dir.to_path_buf()),
            force_cpu: true,
            max_new_tokens: 8,
            ..Default::default()
        }
    }

    #[test]
    fn tiny_model_captions_are_reproducible() -> Result<(), JoyCaptionError> {
        let dir = tempfile::tempdir()?;
        write_tiny_checkpoint(dir.path())?;
        let image = DynamicImage::new_rgb8(40, 30);

        let mut model = JoyCaption::new(tiny_config(dir.path()))?;
        let first = model.caption(&image, CaptionMode::Descriptive)?;
        model.caption_with_prompt(&image, "w5 w6 w7")?;
        let again = model.caption(&image, CaptionMode::Descriptive)?;
        assert_eq!(first, again);
        assert_eq!(first, first.trim());
        Ok(())
    }

    #[test]
    fn zero_new_tokens_gives_an_empty_caption() -> Result<(), JoyCaptionError> {
        let dir = tempfile::tempdir()?;
        write_tiny_checkpoint(dir.path())?;
        let config = JoyCaptionConfig {
            max_new_tokens: 0,
            ..tiny_config(dir.path())
        };

        let mut model = JoyCaption::new(config)?;
        let image = DynamicImage::new_rgb8(28, 28);
        assert_eq!(model.caption(&image, CaptionMode::Booru)?, "");
        Ok(())
    }

    #[test]
    fn generation_stops_at_eos() -> Result<(), JoyCaptionError> {
        let dir = tempfile::tempdir()?;
        write_tiny_checkpoint(dir.path())?;
        let every_token: Vec<u32> = (0..64).collect();
        fs::write(
            dir.path().join("generation_config.json"),
            json!({ "eos_token_id": every_token }).to_string(),
        )?;
        // prompt plus 512 steps would run past the 512 rotary positions
        let config = JoyCaptionConfig {
            max_new_tokens: 512,
            ..tiny_config(dir.path())
        };

        let mut model = JoyCaption::new(config)?;
        let image = DynamicImage::new_rgb8(28, 28);
        assert_eq!(model.caption(&image, CaptionMode::Training)?, "");
        Ok(())
    }

    #[test]
    fn tiny_model_low_vram() -> Result<(), JoyCaptionError> {
        let dir = tempfile::tempdir()?;
        write_tiny_checkpoint(dir.path())?;
        let config = JoyCaptionConfig {
            low_vram: true,
            do_sample: false,
            ..tiny_config(dir.path())
        };

        let mut model = JoyCaption::new(config)?;
        let image = DynamicImage::new_rgb8(50, 20);
        let caption = model.caption(&image, CaptionMode::Straightforward)?;
        assert_eq!(caption, model.caption(&image, CaptionMode::Straightforward)?);
        Ok(())
    }

    #[test]
    fn missing_local_model_reports_stage() {
        let config = JoyCaptionConfig {
            source: ModelSource::Local("/nonexistent/joycaption".into()),
            force_cpu: true,
            ..Default::default()
        };
        let err = JoyCaption::new(config).err();
        assert_eq!(
            err.as_ref().and_then(|e| e.stage()),
            Some(LoadStage::ModelFiles)
        );
    }

    #[test]
    fn unparsable_config_reports_stage() -> Result<(), JoyCaptionError> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("config.json"), "not json")?;
        fs::write(dir.path().join("tokenizer.json"), "{}")?;
        fs::write(dir.path().join("model.safetensors"), "")?;

        let config = JoyCaptionConfig {
            source: ModelSource::Local(dir.path().to_path_buf()),
            force_cpu: true,
            ..Default::default()
        };
        match JoyCaption::new(config) {
            Err(JoyCaptionError::Load { stage, source }) => {
                assert_eq!(stage, LoadStage::ModelFiles);
                assert!(matches!(*source, JoyCaptionError::SerializationError(_)));
            }
            _ => panic!("expected a model files error"),
        }
        Ok(())
    }

    // JOYCAPTION_TEST_IMAGE=dog.jpeg cargo test -p joycaption-vlm test_joycaption_inference --release -- --nocapture --ignored
    // RUST_LOG=debug JOYCAPTION_TEST_IMAGE=dog.jpeg cargo test -p joycaption-vlm test_joycaption_inference --features cuda -- --nocapture --ignored
    #[test]
    #[ignore = "Requires downloading the JoyCaption weights from HuggingFace"]
    fn test_joycaption_inference() {
        let _ = env_logger::builder().is_test(true).try_init();

        let path = std::env::var("JOYCAPTION_TEST_IMAGE").unwrap();
        let image = load_image(path).unwrap();
        let config = JoyCaptionConfig {
            do_sample: false,
            max_new_tokens: 64,
            low_vram: true,
            debug: true,
            ..Default::default()
        };
        let mut model = JoyCaption::new(config).unwrap();

        let caption = model.caption(&image, CaptionMode::Straightforward).unwrap();
        assert!(!caption.is_empty());
        assert_eq!(caption, caption.trim());

        let tags = model.caption(&image, CaptionMode::Booru).unwrap();
        assert!(!tags.is_empty());
    }
}
