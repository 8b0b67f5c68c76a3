use std::path::Path;

use tracing::debug;

use crate::{config::BackendConfig, error::ServiceError, model::Vocabulary};

/// Preprocessed image input, laid out as a dense `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFeatures {
    pub shape: Vec<i64>,
    pub pixels: Vec<f32>,
}

/// The numeric half of a backend: context ids in, next-token scores out.
pub trait LogitsModel: Send {
    /// Scores for the token following `context`, one per vocabulary entry.
    fn next_token_logits(
        &mut self,
        context: &[u32],
        image: Option<&ImageFeatures>,
    ) -> Result<Vec<f32>, ServiceError>;

    fn encode_image(&mut self, path: &Path) -> Result<ImageFeatures, ServiceError> {
        Err(ServiceError::validation(format!(
            "model cannot condition on images ({})",
            path.display()
        )))
    }

    fn device(&self) -> String {
        "cpu".to_string()
    }
}

/// Where backends get their vocabulary and weights from.
pub trait ModelSource: Send + Sync {
    fn load_vocabulary(&self, config: &BackendConfig) -> Result<Vocabulary, ServiceError>;

    fn load_model(&self, config: &BackendConfig) -> Result<Box<dyn LogitsModel>, ServiceError>;
}

/// Loads tokenizers and TorchScript modules from disk.
pub struct ArtifactSource {
    #[cfg_attr(not(feature = "tch-backend"), allow(dead_code))]
    default_device: String,
}

impl ArtifactSource {
    pub fn new(default_device: impl Into<String>) -> Self {
        Self {
            default_device: default_device.into(),
        }
    }
}

impl ModelSource for ArtifactSource {
    fn load_vocabulary(&self, config: &BackendConfig) -> Result<Vocabulary, ServiceError> {
        if let Some(path) = config.tokenizer_path.as_deref() {
            if path.exists() {
                debug!(path = %path.display(), "loading tokenizer file");
                return Vocabulary::from_file(path);
            }
        }

        let sibling = config
            .model_path
            .parent()
            .map(|dir| dir.join("tokenizer.json"))
            .filter(|p| p.exists());
        if let Some(path) = sibling {
            debug!(path = %path.display(), "loading tokenizer next to model");
            return Vocabulary::from_file(&path);
        }

        match config.hub_id.as_deref() {
            Some(id) => {
                debug!(hub_id = id, "fetching tokenizer from hub");
                Vocabulary::from_hub(id)
            }
            None => Err(ServiceError::Tokenizer(format!(
                "no tokenizer found for {}",
                config.model_path.display()
            ))),
        }
    }

    #[cfg(feature = "tch-backend")]
    fn load_model(&self, config: &BackendConfig) -> Result<Box<dyn LogitsModel>, ServiceError> {
        let device = config.device.as_deref().unwrap_or(&self.default_device);
        let model = crate::model::tch_backend::TorchScriptModel::load(
            &config.model_path,
            device,
            config.supports_vision(),
        )?;
        Ok(Box::new(model))
    }

    #[cfg(not(feature = "tch-backend"))]
    fn load_model(&self, config: &BackendConfig) -> Result<Box<dyn LogitsModel>, ServiceError> {
        Err(ServiceError::Other(format!(
            "cannot run {}: service was built without the tch-backend feature",
            config.model_path.display()
        )))
    }
}
