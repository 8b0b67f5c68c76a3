mod backend;
mod loader;
mod registry;
mod template;
mod types;
mod vocab;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use backend::{GenerationBackend, ModelRuntime, PreparedPrompt};
pub use loader::{ArtifactSource, ImageFeatures, LogitsModel, ModelSource};
pub use registry::ModelRegistry;
pub use template::{ChatTemplate, IMAGE_PLACEHOLDER, merge_adjacent_turns};
pub use types::{BackendInfo, BackendKind, ChatTurn, GenerationRequest, Prompt, Role};
pub use vocab::Vocabulary;
