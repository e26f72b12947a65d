use std::fmt;

/// Loading phase of the pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    ModelFiles,
    Processor,
    Model,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStage::ModelFiles => write!(f, "model files"),
            LoadStage::Processor => write!(f, "processor"),
            LoadStage::Model => write!(f, "model"),
        }
    }
}

/// Errors raised while loading or running a JoyCaption model.
#[derive(thiserror::Error, Debug)]
pub enum JoyCaptionError {
    #[error(transparent)]
    HubError(#[from] hf_hub::api::sync::ApiError),

    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    #[error(transparent)]
    TokenizerError(#[from] tokenizers::Error),

    #[error(transparent)]
    ImageError(#[from] image::ImageError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    JinjaError(#[from] minijinja::Error),

    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    #[error("Image file does not exist: {0}")]
    ImageNotFound(std::path::PathBuf),

    #[error("Unknown caption mode `{0}`, expected one of: descriptive, straightforward, booru, training")]
    UnknownMode(String),

    #[error("Missing model file: {0}")]
    MissingModelFile(String),

    #[error("Missing weights: {0}")]
    MissingWeights(String),

    #[error("Invalid vision feature layer {layer} for a vision tower with {num_layers} layers")]
    InvalidFeatureLayer { layer: i64, num_layers: usize },

    #[error("Image token id {0} is not part of the tokenizer vocabulary")]
    MissingImageToken(u32),

    #[error("Expected exactly one image token in the prompt, found {0}")]
    InvalidImageTokenCount(usize),

    #[error("Mismatched image features: tokens = {tokens}, features = {features}")]
    MismatchedImageFeatures { tokens: usize, features: usize },

    #[error("Invalid logits detected: {0}")]
    InvalidLogits(String),

    #[error("Cannot find an end-of-sequence token")]
    EosTokenNotFound,

    #[error("Failed to load {stage}: {source}")]
    Load {
        stage: LoadStage,
        source: Box<JoyCaptionError>,
    },
}

impl JoyCaptionError {
    pub fn load(stage: LoadStage, source: JoyCaptionError) -> Self {
        Self::Load {
            stage,
            source: Box::new(source),
        }
    }

    /// Stage of a loading failure, if this error happened while loading.
    pub fn stage(&self) -> Option<LoadStage> {
        match self {
            Self::Load { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
