use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};

use crate::config::ModelSource;
use crate::error::JoyCaptionError;

const CONFIG: &str = "config.json";
const GENERATION_CONFIG: &str = "generation_config.json";
const TOKENIZER: &str = "tokenizer.json";
const TOKENIZER_CONFIG: &str = "tokenizer_config.json";
const CHAT_TEMPLATE: &str = "chat_template.json";
const WEIGHTS_INDEX: &str = "model.safetensors.index.json";
const SINGLE_WEIGHTS: &str = "model.safetensors";

/// Paths of every checkpoint file the pipeline reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub generation_config: Option<PathBuf>,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub chat_template: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

enum FileRepo {
    Hub(ApiRepo),
    Local(PathBuf),
}

impl FileRepo {
    fn open(source: &ModelSource) -> Result<Self, JoyCaptionError> {
        match source {
            ModelSource::Hub { model_id, revision } => {
                log::info!("Using model {model_id} ({revision}) from the HuggingFace Hub");
                let api = Api::new()?;
                Ok(Self::Hub(api.repo(Repo::with_revision(
                    model_id.clone(),
                    RepoType::Model,
                    revision.clone(),
                ))))
            }
            ModelSource::Local(dir) => {
                if !dir.is_dir() {
                    return Err(JoyCaptionError::MissingModelFile(format!(
                        "model directory {} does not exist",
                        dir.display()
                    )));
                }
                log::info!("Using model files from {}", dir.display());
                Ok(Self::Local(dir.clone()))
            }
        }
    }

    fn get(&self, name: &str) -> Result<PathBuf, JoyCaptionError> {
        match self {
            Self::Hub(repo) => Ok(repo.get(name)?),
            Self::Local(dir) => {
                let path = dir.join(name);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(JoyCaptionError::MissingModelFile(path.display().to_string()))
                }
            }
        }
    }

    fn get_optional(&self, name: &str) -> Option<PathBuf> {
        match self.get(name) {
            Ok(path) => Some(path),
            Err(e) => {
                log::debug!("optional file {name} not available: {e}");
                None
            }
        }
    }
}

impl ModelFiles {
    /// Locate (downloading when needed) all files of `source`. `weights` replaces the
    /// safetensors shards of the source when given.
    pub fn resolve(
        source: &ModelSource,
        weights: Option<&[PathBuf]>,
    ) -> Result<Self, JoyCaptionError> {
        let repo = FileRepo::open(source)?;

        let config = repo.get(CONFIG)?;
        let tokenizer = repo.get(TOKENIZER)?;
        let generation_config = repo.get_optional(GENERATION_CONFIG);
        let tokenizer_config = repo.get_optional(TOKENIZER_CONFIG);
        let chat_template = repo.get_optional(CHAT_TEMPLATE);

        let weights = match weights {
            Some(paths) => check_weights(paths)?,
            None => load_safetensors(&repo)?,
        };
        log::debug!("weights: {weights:?}");

        Ok(Self {
            config,
            generation_config,
            tokenizer,
            tokenizer_config,
            chat_template,
            weights,
        })
    }
}

fn check_weights(paths: &[PathBuf]) -> Result<Vec<PathBuf>, JoyCaptionError> {
    if paths.is_empty() {
        return Err(JoyCaptionError::MissingWeights(
            "empty list of weight files".to_string(),
        ));
    }
    if let Some(missing) = paths.iter().find(|p| !p.is_file()) {
        return Err(JoyCaptionError::MissingWeights(missing.display().to_string()));
    }
    Ok(paths.to_vec())
}

/// Shards named by the safetensors index, falling back to a single `model.safetensors`.
fn load_safetensors(repo: &FileRepo) -> Result<Vec<PathBuf>, JoyCaptionError> {
    let Some(index) = repo.get_optional(WEIGHTS_INDEX) else {
        return repo
            .get(SINGLE_WEIGHTS)
            .map(|path| vec![path])
            .map_err(|_| {
                JoyCaptionError::MissingWeights(format!(
                    "neither {WEIGHTS_INDEX} nor {SINGLE_WEIGHTS} found"
                ))
            });
    };

    shard_names(&index)?
        .iter()
        .map(|name| repo.get(name))
        .collect()
}

/// Unique shard file names listed in the `weight_map` of a safetensors index.
fn shard_names(index: &Path) -> Result<BTreeSet<String>, JoyCaptionError> {
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(index)?)?;
    let weight_map = json
        .get("weight_map")
        .and_then(|map| map.as_object())
        .ok_or_else(|| {
            JoyCaptionError::MissingWeights(format!("no weight map in {}", index.display()))
        })?;

    Ok(weight_map
        .values()
        .filter_map(|file| file.as_str())
        .map(str::to_string)
        .collect())
}
