pub mod config;
pub mod decode;
pub mod error;
pub mod model;
pub mod sampling;
pub mod server;
pub mod session;
pub mod store;

pub use config::{AppConfig, BackendConfig};
pub use decode::{DecodeLoop, FinishReason, TokenEvent, spawn_decode};
pub use error::ServiceError;
pub use model::{GenerationBackend, GenerationRequest, ModelRegistry};
pub use sampling::SamplingParams;
pub use server::{AppState, build_router};
pub use session::{ChatMode, ChatSession, SessionRegistry};
pub use store::{ConversationStore, MemoryStore};
