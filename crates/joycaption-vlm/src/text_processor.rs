/*
    Turns a captioning instruction into prompt tokens through the checkpoint chat template,
    samples the generated tokens and decodes them back into the caption.
*/

use std::fs;
use std::path::Path;

use candle_core::{DType, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use minijinja::{context, AutoEscape, Environment, Error, ErrorKind};
use serde::Serialize;
use tokenizers::Tokenizer;

use crate::config::{GenerationConfig, JoyCaptionConfig, LlavaConfig, TextConfig};
use crate::error::JoyCaptionError;
use crate::files::ModelFiles;

pub const SYSTEM_PROMPT: &str = "You are a helpful image captioner.";

const DEFAULT_BOS_TOKEN: &str = "<|begin_of_text|>";
const DEFAULT_EOS_TOKEN: &str = "<|eot_id|>";
const FALLBACK_EOS_TOKENS: [&str; 2] = ["<|eot_id|>", "<|end_of_text|>"];
const USER_HEADER: &str = "<|start_header_id|>user<|end_header_id|>\n\n";

// used when the checkpoint ships no chat template
const LLAMA3_CHAT_TEMPLATE: &str = concat!(
    "{{- bos_token }}",
    "{%- for message in messages %}",
    "{{- '<|start_header_id|>' + message['role'] + '<|end_header_id|>\\n\\n' + message['content'] | trim + '<|eot_id|>' }}",
    "{%- endfor %}",
    "{%- if add_generation_prompt %}",
    "{{- '<|start_header_id|>assistant<|end_header_id|>\\n\\n' }}",
    "{%- endif %}",
);

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Serialize, Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Conversation sent to the model for one caption.
pub fn caption_conversation(instruction: &str) -> Vec<Message> {
    vec![
        Message {
            role: Role::System,
            content: SYSTEM_PROMPT.to_string(),
        },
        Message {
            role: Role::User,
            content: instruction.to_string(),
        },
    ]
}

/// Special tokens may be stored as a bare string or as an added-token object.
fn token_content(value: &serde_json::Value) -> Option<String> {
    value
        .as_str()
        .or_else(|| value.get("content").and_then(|c| c.as_str()))
        .map(str::to_string)
}

fn read_json(path: &Path) -> Result<serde_json::Value, JoyCaptionError> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// A chat template compiled with minijinja.
pub struct ChatTemplate {
    env: Environment<'static>,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplate {
    pub fn new(
        template: String,
        bos_token: String,
        eos_token: String,
    ) -> Result<Self, JoyCaptionError> {
        let mut env = Environment::new();

        // disable auto-escaping (we're producing a plain text prompt, not HTML)
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_function("raise_exception", |msg: String| -> Result<String, Error> {
            Err(Error::new(ErrorKind::InvalidOperation, msg))
        });
        env.add_template_owned("chat", template)?;

        Ok(Self {
            env,
            bos_token,
            eos_token,
        })
    }

    pub fn llama3() -> Result<Self, JoyCaptionError> {
        Self::new(
            LLAMA3_CHAT_TEMPLATE.to_string(),
            DEFAULT_BOS_TOKEN.to_string(),
            DEFAULT_EOS_TOKEN.to_string(),
        )
    }

    /// Load the template from `chat_template.json`, else from the `chat_template` entry of
    /// `tokenizer_config.json`, else fall back to the built-in Llama 3 template.
    pub fn load(
        chat_template: Option<&Path>,
        tokenizer_config: Option<&Path>,
    ) -> Result<Self, JoyCaptionError> {
        let tokenizer_config = tokenizer_config.map(read_json).transpose()?;
        let special = |key: &str, default: &str| {
            tokenizer_config
                .as_ref()
                .and_then(|cfg| cfg.get(key))
                .and_then(token_content)
                .unwrap_or_else(|| default.to_string())
        };
        let bos_token = special("bos_token", DEFAULT_BOS_TOKEN);
        let eos_token = special("eos_token", DEFAULT_EOS_TOKEN);

        let from_chat_template = chat_template
            .map(read_json)
            .transpose()?
            .and_then(|json| json["chat_template"].as_str().map(str::to_string));
        let from_tokenizer_config = || {
            tokenizer_config
                .as_ref()
                .and_then(|cfg| cfg["chat_template"].as_str().map(str::to_string))
        };

        let template = match from_chat_template.or_else(from_tokenizer_config) {
            Some(template) => template,
            None => {
                log::warn!("No chat template in the checkpoint, using the Llama 3 template");
                LLAMA3_CHAT_TEMPLATE.to_string()
            }
        };
        Self::new(template, bos_token, eos_token)
    }

    pub fn bos_token(&self) -> &str {
        &self.bos_token
    }

    pub fn render(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<String, JoyCaptionError> {
        let template = self.env.get_template("chat")?;
        Ok(template.render(context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
            bos_token => &self.bos_token,
            eos_token => &self.eos_token,
        })?)
    }
}

/// Make sure the prompt carries the image placeholder, placing it at the start of the
/// user turn when the template did not emit one. Without a user turn it goes right after
/// a leading BOS token.
pub fn ensure_image_token(prompt: &str, image_token: &str, bos_token: &str) -> String {
    if prompt.contains(image_token) {
        return prompt.to_string();
    }
    let at = match prompt.find(USER_HEADER) {
        Some(start) => start + USER_HEADER.len(),
        None if !bos_token.is_empty() && prompt.starts_with(bos_token) => bos_token.len(),
        None => 0,
    };
    format!("{}{image_token}{}", &prompt[..at], &prompt[at..])
}

/// Replace the single image token of `ids` by `num_image_tokens` copies of it.
pub fn expand_image_tokens(
    ids: &[u32],
    image_token_id: u32,
    num_image_tokens: usize,
) -> Result<Vec<u32>, JoyCaptionError> {
    let count = ids.iter().filter(|&&id| id == image_token_id).count();
    if count != 1 {
        return Err(JoyCaptionError::InvalidImageTokenCount(count));
    }

    let mut expanded = Vec::with_capacity(ids.len() + num_image_tokens - 1);
    for &id in ids {
        if id == image_token_id {
            expanded.extend(std::iter::repeat(image_token_id).take(num_image_tokens));
        } else {
            expanded.push(id);
        }
    }
    Ok(expanded)
}

/// End-of-sequence ids from the generation config, else the text config, else the
/// Llama 3 end tokens found in the vocabulary.
pub fn resolve_eos_token_ids<F>(
    generation: Option<&GenerationConfig>,
    text: &TextConfig,
    token_to_id: F,
) -> Result<Vec<u32>, JoyCaptionError>
where
    F: Fn(&str) -> Option<u32>,
{
    if let Some(eos) = generation.and_then(|g| g.eos_token_id.as_ref()) {
        return Ok(eos.ids());
    }
    if let Some(eos) = &text.eos_token_id {
        return Ok(eos.ids());
    }
    let ids: Vec<u32> = FALLBACK_EOS_TOKENS
        .iter()
        .filter_map(|token| token_to_id(token))
        .collect();
    if ids.is_empty() {
        Err(JoyCaptionError::EosTokenNotFound)
    } else {
        Ok(ids)
    }
}

/// Next token selection with optional repeat penalty.
pub struct Sampler {
    seed: u64,
    sampling: Sampling,
    logits_processor: LogitsProcessor,
    repeat_penalty: f32,
    repeat_last_n: usize,
    token_history: Vec<u32>,
}

impl Sampler {
    pub fn new(config: &JoyCaptionConfig) -> Self {
        let sampling = if config.do_sample && config.temperature > 0.0 {
            Sampling::TopP {
                p: config.top_p,
                temperature: config.temperature,
            }
        } else {
            Sampling::ArgMax
        };
        Self {
            seed: config.seed,
            logits_processor: LogitsProcessor::from_sampling(config.seed, sampling.clone()),
            sampling,
            repeat_penalty: config.repeat_penalty,
            repeat_last_n: config.repeat_last_n,
            token_history: Vec::new(),
        }
    }

    /// Start over with the initial seed and an empty history.
    pub fn reset(&mut self) {
        self.logits_processor = LogitsProcessor::from_sampling(self.seed, self.sampling.clone());
        self.token_history.clear();
    }

    /// Sample one token from `[vocab]` logits.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32, JoyCaptionError> {
        let logits = logits.to_dtype(DType::F32)?;
        let logits = if self.repeat_penalty == 1.0 {
            logits
        } else {
            let start_at = self.token_history.len().saturating_sub(self.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.repeat_penalty,
                &self.token_history[start_at..],
            )?
        };

        if has_non_finite(&logits)? {
            return Err(JoyCaptionError::InvalidLogits(
                "Non-finite values (NaN or +/-Inf) found in logits".to_string(),
            ));
        }
        let token = self.logits_processor.sample(&logits)?;
        self.token_history.push(token);
        Ok(token)
    }
}

/// Return true if any element in `logits` is not finite (NaN or +/-Inf).
fn has_non_finite(logits: &Tensor) -> Result<bool, JoyCaptionError> {
    let logits_vec = logits.flatten_all()?.to_vec1::<f32>()?;
    Ok(logits_vec.iter().any(|v| !v.is_finite()))
}

/// Tokenizer, chat template and sampler of a checkpoint.
pub struct TextProcessor {
    tokenizer: Tokenizer,
    template: ChatTemplate,
    sampler: Sampler,
    image_token: String,
    image_token_id: u32,
    eos_token_ids: Vec<u32>,
}

impl TextProcessor {
    pub fn new(
        files: &ModelFiles,
        llava: &LlavaConfig,
        generation: Option<&GenerationConfig>,
        config: &JoyCaptionConfig,
    ) -> Result<Self, JoyCaptionError> {
        let tokenizer = Tokenizer::from_file(&files.tokenizer)?;
        let template = ChatTemplate::load(
            files.chat_template.as_deref(),
            files.tokenizer_config.as_deref(),
        )?;
        Self::from_parts(tokenizer, template, llava, generation, config)
    }

    pub fn from_parts(
        tokenizer: Tokenizer,
        template: ChatTemplate,
        llava: &LlavaConfig,
        generation: Option<&GenerationConfig>,
        config: &JoyCaptionConfig,
    ) -> Result<Self, JoyCaptionError> {
        let image_token_id = llava.image_token_index;
        let image_token = tokenizer
            .id_to_token(image_token_id)
            .ok_or(JoyCaptionError::MissingImageToken(image_token_id))?;
        let eos_token_ids = resolve_eos_token_ids(generation, &llava.text_config, |token| {
            tokenizer.token_to_id(token)
        })?;
        log::debug!("image token {image_token} ({image_token_id}), eos ids {eos_token_ids:?}");

        Ok(Self {
            sampler: Sampler::new(config),
            tokenizer,
            template,
            image_token,
            image_token_id,
            eos_token_ids,
        })
    }

    /// Render the captioning conversation for `instruction`, image placeholder included.
    pub fn build_prompt(&self, instruction: &str) -> Result<String, JoyCaptionError> {
        let prompt = self
            .template
            .render(&caption_conversation(instruction), true)?;
        Ok(ensure_image_token(
            &prompt,
            &self.image_token,
            self.template.bos_token(),
        ))
    }

    /// Tokenize a rendered prompt and expand its image token to `num_image_tokens` slots.
    pub fn encode_prompt(
        &self,
        prompt: &str,
        num_image_tokens: usize,
    ) -> Result<Vec<u32>, JoyCaptionError> {
        // templates usually render the BOS token themselves
        let add_special_tokens = !prompt.starts_with(self.template.bos_token());
        let encoding = self.tokenizer.encode(prompt, add_special_tokens)?;
        expand_image_tokens(encoding.get_ids(), self.image_token_id, num_image_tokens)
    }

    pub fn reset(&mut self) {
        self.sampler.reset();
    }

    pub fn sample_logits(&mut self, logits: &Tensor) -> Result<u32, JoyCaptionError> {
        self.sampler.sample(logits)
    }

    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }

    /// Decode generated tokens into the caption text.
    pub fn decode(&self, ids: &[u32]) -> Result<String, JoyCaptionError> {
        Ok(self.tokenizer.decode(ids, true)?.trim().to_string())
    }
}
