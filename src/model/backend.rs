use std::{path::PathBuf, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::{
    config::BackendConfig,
    decode::{DecodeLoop, DecodeOptions},
    error::ServiceError,
    model::{
        BackendInfo, BackendKind, ChatTurn, GenerationRequest, LogitsModel, ModelSource, Role,
        Vocabulary, merge_adjacent_turns,
    },
};

/// Everything a loaded backend holds while resident.
pub struct ModelRuntime {
    pub vocab: Vocabulary,
    /// One forward pass at a time per backend.
    pub model: Mutex<Box<dyn LogitsModel>>,
    pub context_window: usize,
    pub eos_token_id: Option<u32>,
    pub device: String,
}

/// Text ready for the decode loop, after backend-specific formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedPrompt {
    pub text: String,
    pub image: Option<PathBuf>,
    pub add_special_tokens: bool,
    pub skip_special_tokens: bool,
}

pub struct BackendCore {
    id: String,
    config: BackendConfig,
    runtime: RwLock<Option<Arc<ModelRuntime>>>,
}

impl BackendCore {
    fn new(id: String, config: BackendConfig) -> Self {
        Self {
            id,
            config,
            runtime: RwLock::new(None),
        }
    }

    fn load(&self, source: &dyn ModelSource) -> Result<(), ServiceError> {
        let mut slot = self.runtime.write();
        if slot.is_some() {
            return Ok(());
        }

        let vocab = source.load_vocabulary(&self.config)?;
        let eos_token_id = match (self.config.eos_token_id, self.config.eos_token.as_deref()) {
            (Some(id), _) => Some(id),
            (None, Some(token)) => Some(vocab.token_to_id(token).ok_or_else(|| {
                ServiceError::Tokenizer(format!(
                    "end-of-sequence token {token} is not in the vocabulary"
                ))
            })?),
            (None, None) => None,
        };
        let model = source.load_model(&self.config)?;
        let device = model.device();

        info!(
            backend_id = %self.id,
            kind = self.config.kind.as_str(),
            vocab_size = vocab.size(),
            %device,
            "backend resources initialised"
        );
        *slot = Some(Arc::new(ModelRuntime {
            vocab,
            model: Mutex::new(model),
            context_window: self.config.context_window,
            eos_token_id,
            device,
        }));
        Ok(())
    }

    fn unload(&self) {
        if self.runtime.write().take().is_some() {
            info!(backend_id = %self.id, "backend resources released");
        }
    }

    fn runtime(&self) -> Option<Arc<ModelRuntime>> {
        self.runtime.read().clone()
    }

    fn require_runtime(&self) -> Result<Arc<ModelRuntime>, ServiceError> {
        self.runtime()
            .ok_or_else(|| ServiceError::Generation(format!("backend {} is not loaded", self.id)))
    }

    fn reject_image(&self, request: &GenerationRequest) -> Result<(), ServiceError> {
        if request.image.is_some() {
            return Err(ServiceError::validation(format!(
                "backend {} does not accept image input",
                self.id
            )));
        }
        Ok(())
    }
}

/// Backend-specific prompt handling. Lifecycle and decoding are shared.
pub trait BackendVariant: Send + Sync {
    fn core(&self) -> &BackendCore;

    fn kind(&self) -> BackendKind;

    fn prepare(&self, request: &GenerationRequest) -> Result<PreparedPrompt, ServiceError>;
}

/// Decoder over raw weights with a plain `role: content` transcript.
pub struct DirectDecoder {
    core: BackendCore,
}

impl BackendVariant for DirectDecoder {
    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn kind(&self) -> BackendKind {
        BackendKind::DirectDecoder
    }

    fn prepare(&self, request: &GenerationRequest) -> Result<PreparedPrompt, ServiceError> {
        self.core.reject_image(request)?;
        let turns = request.prompt.clone().into_turns();
        Ok(PreparedPrompt {
            text: self.core.config.template().render(&turns, false),
            image: None,
            add_special_tokens: false,
            skip_special_tokens: false,
        })
    }
}

/// Pretrained causal LM driven through its chat template.
pub struct CausalLmAdapter {
    core: BackendCore,
}

impl BackendVariant for CausalLmAdapter {
    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn kind(&self) -> BackendKind {
        BackendKind::CausalLm
    }

    fn prepare(&self, request: &GenerationRequest) -> Result<PreparedPrompt, ServiceError> {
        self.core.reject_image(request)?;
        let template = self.core.config.template();
        let mut turns = request.prompt.clone().into_turns();
        if template.requires_alternation() {
            let folded = turns
                .into_iter()
                .map(|turn| match turn.role {
                    Role::System => ChatTurn::new(Role::User, turn.content),
                    _ => turn,
                })
                .collect();
            turns = merge_adjacent_turns(folded);
        }
        Ok(PreparedPrompt {
            text: template.render(&turns, false),
            image: None,
            add_special_tokens: false,
            skip_special_tokens: true,
        })
    }
}

/// Image-conditioned adapter. Every request must carry an image.
pub struct VisionAdapter {
    core: BackendCore,
}

impl BackendVariant for VisionAdapter {
    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Vision
    }

    fn prepare(&self, request: &GenerationRequest) -> Result<PreparedPrompt, ServiceError> {
        let image = request.image.clone().ok_or_else(|| {
            ServiceError::validation(format!(
                "vision backend {} requires an image reference",
                self.core.id
            ))
        })?;
        let turns = request.prompt.clone().into_turns();
        Ok(PreparedPrompt {
            text: self.core.config.template().render(&turns, true),
            image: Some(image),
            add_special_tokens: false,
            skip_special_tokens: true,
        })
    }
}

pub enum GenerationBackend {
    Direct(DirectDecoder),
    CausalLm(CausalLmAdapter),
    Vision(VisionAdapter),
}

impl GenerationBackend {
    pub fn from_config(id: impl Into<String>, config: BackendConfig) -> Self {
        let kind = config.kind;
        let core = BackendCore::new(id.into(), config);
        match kind {
            BackendKind::DirectDecoder => GenerationBackend::Direct(DirectDecoder { core }),
            BackendKind::CausalLm => GenerationBackend::CausalLm(CausalLmAdapter { core }),
            BackendKind::Vision => GenerationBackend::Vision(VisionAdapter { core }),
        }
    }

    fn variant(&self) -> &dyn BackendVariant {
        match self {
            GenerationBackend::Direct(b) => b as &dyn BackendVariant,
            GenerationBackend::CausalLm(b) => b as &dyn BackendVariant,
            GenerationBackend::Vision(b) => b as &dyn BackendVariant,
        }
    }

    fn core(&self) -> &BackendCore {
        self.variant().core()
    }

    pub fn id(&self) -> &str {
        &self.core().id
    }

    pub fn kind(&self) -> BackendKind {
        self.variant().kind()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.core().config
    }

    /// Idempotent: a loaded backend is left untouched.
    pub fn load(&self, source: &dyn ModelSource) -> Result<(), ServiceError> {
        self.core().load(source)
    }

    /// Drops the backend's resources. Generations already running keep
    /// their own handle to them until they finish.
    pub fn unload(&self) {
        self.core().unload()
    }

    pub fn is_loaded(&self) -> bool {
        self.core().runtime.read().is_some()
    }

    pub fn supports_vision(&self) -> bool {
        self.config().supports_vision()
    }

    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
        self.core().require_runtime()?.vocab.encode(text, false)
    }

    pub fn detokenize(&self, ids: &[u32]) -> Result<String, ServiceError> {
        self.core().require_runtime()?.vocab.decode(ids, false)
    }

    pub fn describe(&self) -> BackendInfo {
        let core = self.core();
        describe_config(&core.id, &core.config, core.runtime().as_deref())
    }

    /// Formats the prompt and returns the lazy token sequence. Parameter and
    /// contract violations fail here, before any computation.
    pub fn generate_stream(&self, request: &GenerationRequest) -> Result<DecodeLoop, ServiceError> {
        if request.max_tokens == 0 {
            return Err(ServiceError::validation("max_tokens must be greater than 0"));
        }
        request.sampling.validate()?;
        let prepared = self.variant().prepare(request)?;

        let Some(runtime) = self.core().runtime() else {
            return Ok(DecodeLoop::failed(format!(
                "backend {} is not loaded",
                self.id()
            )));
        };
        let options = DecodeOptions {
            max_tokens: request.max_tokens,
            sampling: request.sampling.clone(),
            add_special_tokens: prepared.add_special_tokens,
            skip_special_tokens: prepared.skip_special_tokens,
        };
        Ok(DecodeLoop::new(runtime, prepared.text, prepared.image, options))
    }

    /// The formatted prompt a request would be decoded from.
    pub fn prepare(&self, request: &GenerationRequest) -> Result<PreparedPrompt, ServiceError> {
        self.variant().prepare(request)
    }
}

pub(crate) fn describe_config(
    id: &str,
    config: &BackendConfig,
    runtime: Option<&ModelRuntime>,
) -> BackendInfo {
    BackendInfo {
        id: id.to_string(),
        kind: config.kind,
        model_path: config.model_path.display().to_string(),
        loaded: runtime.is_some(),
        device: runtime
            .map(|rt| rt.device.clone())
            .or_else(|| config.device.clone())
            .unwrap_or_else(|| "unassigned".to_string()),
        supports_vision: config.supports_vision(),
        context_window: config.context_window,
        description: config.description.clone(),
    }
}
