use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use argh::FromArgs;
use joycaption_vlm::{
    load_image, CaptionMode, DynamicImage, JoyCaption, JoyCaptionConfig, JoyCaptionError,
    ModelSource,
};
use serde::Serialize;

#[derive(FromArgs, Debug)]
/// Caption images with the JoyCaption vision-language model
struct Args {
    /// path to an input image (required), repeat the option to caption several images
    #[argh(option, short = 'i')]
    image: Vec<PathBuf>,

    /// caption mode: descriptive, straightforward, booru or training
    #[argh(option, short = 'm', default = "CaptionMode::Descriptive")]
    mode: CaptionMode,

    /// quantize the language model to 4 bits to reduce memory usage
    #[argh(switch)]
    low_vram: bool,

    /// custom instruction sent instead of the prompt of the mode
    #[argh(option)]
    prompt: Option<String>,

    /// the HuggingFace Hub model id
    #[argh(option, default = "ModelSource::DEFAULT_MODEL_ID.to_string()")]
    model_id: String,

    /// the HuggingFace Hub revision
    #[argh(option, default = "\"main\".to_string()")]
    revision: String,

    /// local directory holding the model files, instead of the Hub
    #[argh(option)]
    model_dir: Option<PathBuf>,

    /// safetensors weight file overriding the checkpoint weights, can be repeated
    #[argh(option)]
    weights: Vec<PathBuf>,

    /// maximum number of generated tokens
    #[argh(option, default = "512")]
    max_new_tokens: usize,

    /// sampling temperature
    #[argh(option, default = "0.6")]
    temperature: f64,

    /// nucleus sampling probability
    #[argh(option, default = "0.9")]
    top_p: f64,

    /// seed of the sampler
    #[argh(option)]
    seed: Option<u64>,

    /// always pick the most likely token
    #[argh(switch)]
    greedy: bool,

    /// run on the CPU even when a GPU is available
    #[argh(switch)]
    cpu: bool,

    /// print one JSON object per image
    #[argh(switch)]
    json: bool,

    /// write each caption to a .txt file next to its image
    #[argh(switch)]
    write_txt: bool,

    /// replace existing caption files
    #[argh(switch)]
    overwrite: bool,

    /// word prepended to the captions written to files
    #[argh(option)]
    trigger_word: Option<String>,

    /// enable debug logging
    #[argh(switch, short = 'v')]
    verbose: bool,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Error: no input image, pass at least one --image")]
    NoImage,

    #[error("Error loading JoyCaption: {0}")]
    Model(#[source] JoyCaptionError),

    #[error("Error loading image {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        source: JoyCaptionError,
    },

    #[error("Error captioning {}: {source}", .path.display())]
    Caption {
        path: PathBuf,
        source: JoyCaptionError,
    },

    #[error("Error writing {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Serialize, Debug, PartialEq)]
struct CaptionResult {
    path: String,
    success: bool,
    caption: String,
    error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    skipped: bool,
}

impl CaptionResult {
    fn new(path: &Path, result: &Result<String, CliError>) -> Self {
        Self {
            path: path.display().to_string(),
            success: result.is_ok(),
            caption: result.as_ref().ok().cloned().unwrap_or_default(),
            error: result.as_ref().err().map(|e| e.to_string()),
            skipped: false,
        }
    }

    /// Record of an image left alone because its caption file exists.
    fn skipped(path: &Path) -> Self {
        Self {
            path: path.display().to_string(),
            success: true,
            caption: String::new(),
            error: None,
            skipped: true,
        }
    }

    fn print(&self) {
        match serde_json::to_string(self) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("Error serializing result: {e}"),
        }
    }
}

impl Args {
    fn to_config(&self) -> JoyCaptionConfig {
        let defaults = JoyCaptionConfig::default();
        let source = match &self.model_dir {
            Some(dir) => ModelSource::Local(dir.clone()),
            None => ModelSource::Hub {
                model_id: self.model_id.clone(),
                revision: self.revision.clone(),
            },
        };
        JoyCaptionConfig {
            source,
            weights_path: (!self.weights.is_empty()).then(|| self.weights.clone()),
            seed: self.seed.unwrap_or(defaults.seed),
            temperature: self.temperature,
            top_p: self.top_p,
            do_sample: !self.greedy,
            max_new_tokens: self.max_new_tokens,
            low_vram: self.low_vram,
            force_cpu: self.cpu,
            debug: self.verbose,
            ..defaults
        }
    }

    fn instruction(&self) -> &str {
        self.prompt.as_deref().unwrap_or_else(|| self.mode.prompt())
    }
}

/// Caption file written next to an image.
fn sidecar_path(image: &Path) -> PathBuf {
    image.with_extension("txt")
}

fn sidecar_content(caption: &str, trigger_word: Option<&str>) -> String {
    match trigger_word.map(str::trim).filter(|t| !t.is_empty()) {
        Some(trigger) => format!("{trigger}, {}", caption.trim()),
        None => caption.trim().to_string(),
    }
}

fn write_sidecar(
    image: &Path,
    caption: &str,
    trigger_word: Option<&str>,
) -> Result<PathBuf, CliError> {
    let path = sidecar_path(image);
    fs::write(&path, sidecar_content(caption, trigger_word)).map_err(|source| {
        CliError::Write {
            path: path.clone(),
            source,
        }
    })?;
    Ok(path)
}

fn open_image(path: &Path) -> Result<DynamicImage, CliError> {
    load_image(path).map_err(|source| CliError::Image {
        path: path.to_path_buf(),
        source,
    })
}

fn caption_image(
    model: &mut JoyCaption,
    args: &Args,
    path: &Path,
    image: &DynamicImage,
) -> Result<String, CliError> {
    let caption = model
        .caption_with_prompt(image, args.instruction())
        .map_err(|source| CliError::Caption {
            path: path.to_path_buf(),
            source,
        })?;

    if args.write_txt {
        let written = write_sidecar(path, &caption, args.trigger_word.as_deref())?;
        log::info!("Caption written to {}", written.display());
    }
    Ok(caption)
}

fn print_result(args: &Args, path: &Path, result: &Result<String, CliError>) {
    if let Err(e) = result {
        eprintln!("{e}");
    }

    if args.json {
        CaptionResult::new(path, result).print();
    } else if let Ok(caption) = result {
        println!("{caption}");
    }
}

/// Caption every image, returning the number of failed images.
///
/// The model is loaded on the first image that opens, so a batch of unreadable images
/// fails without touching the checkpoint.
fn run(args: &Args) -> Result<usize, CliError> {
    if args.image.is_empty() {
        return Err(CliError::NoImage);
    }

    let pending: Vec<&PathBuf> = args
        .image
        .iter()
        .filter(|path| {
            let skip = args.write_txt && !args.overwrite && sidecar_path(path).exists();
            if skip {
                log::info!(
                    "Skipping {}, caption file exists (use --overwrite to replace it)",
                    path.display()
                );
                if args.json {
                    CaptionResult::skipped(path).print();
                }
            }
            !skip
        })
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }

    log::info!(
        "Captioning {} image(s) with {}",
        pending.len(),
        match &args.prompt {
            Some(_) => "a custom prompt".to_string(),
            None => format!("mode {}", args.mode),
        }
    );

    let mut loaded: Option<JoyCaption> = None;
    let mut failures = 0;
    for path in pending {
        let result = match open_image(path) {
            Ok(image) => {
                let model = match loaded {
                    Some(ref mut model) => model,
                    None => {
                        loaded.insert(JoyCaption::new(args.to_config()).map_err(CliError::Model)?)
                    }
                };
                caption_image(model, args, path, &image)
            }
            Err(e) => Err(e),
        };
        if result.is_err() {
            failures += 1;
        }
        print_result(args, path, &result);
    }
    Ok(failures)
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(&args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failures) => {
            log::error!("{failures} image(s) failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
