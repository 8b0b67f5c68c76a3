//! Per-connection chat sessions.
//!
//! A [`ChatSession`] owns one socket's inbound frames. It runs at most one
//! generation at a time; while a generation is in flight the same frames are
//! read by [`CancellableSession`], which is where `stop` takes effect.

mod cancellable;
mod protocol;
mod registry;

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    decode::spawn_decode,
    error::ServiceError,
    model::{ChatTurn, GenerationRequest, Prompt, Role},
    sampling::SamplingParams,
    server::AppState,
    store::{Conversation, User, title_from_message},
};

pub use cancellable::{CancellableSession, Disposition, GenerationOutcome};
pub use protocol::{
    ConversationSummary, GenerateCommand, InboundCommand, OutboundEvent, parse_command,
};
pub use registry::{SessionRegistry, SessionState, SessionSummary};

pub const VISION_CHAT_TITLE: &str = "Vision Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    Text,
    Vision,
}

enum Flow {
    Continue,
    Disconnected,
}

pub struct ChatSession {
    state: AppState,
    session_id: Uuid,
    backend_id: String,
    mode: ChatMode,
}

impl ChatSession {
    pub fn new(
        state: AppState,
        session_id: Uuid,
        backend_id: impl Into<String>,
        mode: ChatMode,
    ) -> Self {
        Self {
            state,
            session_id,
            backend_id: backend_id.into(),
            mode,
        }
    }

    /// Drives the session until `inbound` closes or a fatal error occurs.
    /// The caller owns the registry entry and removes it afterwards.
    ///
    /// A vision socket bound to a text-only backend is closed right away. Any
    /// other backend failure is reported and the session keeps reading, since
    /// every `generate` retries the load.
    pub async fn run(self, mut inbound: mpsc::Receiver<String>) {
        self.send(OutboundEvent::connected(self.session_id));

        if let Err(e) = self.check_vision_support() {
            warn!(session_id = %self.session_id, error = %e, "vision chat refused");
            self.send(OutboundEvent::error(&e));
            return;
        }
        if let Err(e) = self.state.models.get_or_load(&self.backend_id).await {
            warn!(
                session_id = %self.session_id,
                backend_id = %self.backend_id,
                error = %e,
                "backend unavailable"
            );
            self.send(OutboundEvent::error(&e));
        }
        let user = match self.state.store.get_or_create_default_user().await {
            Ok(user) => user,
            Err(e) => {
                self.send(OutboundEvent::error(&e));
                return;
            }
        };

        while let Some(raw) = inbound.recv().await {
            let command = match parse_command(&raw) {
                Ok(command) => command,
                Err(e) => {
                    self.send(OutboundEvent::error(&e));
                    continue;
                }
            };
            match command {
                InboundCommand::Stop => {
                    debug!(session_id = %self.session_id, "stop received while idle");
                }
                InboundCommand::Generate(cmd) => {
                    match self.generate(&user, cmd, &mut inbound).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Disconnected) => break,
                        Err(e) => {
                            warn!(session_id = %self.session_id, error = %e, "generate rejected");
                            self.send(OutboundEvent::error(&e));
                            if e.is_fatal() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!(session_id = %self.session_id, "chat session closed");
    }

    fn check_vision_support(&self) -> Result<(), ServiceError> {
        let models = &self.state.models;
        if self.mode == ChatMode::Vision
            && models.is_configured(&self.backend_id)
            && !models.is_vision_capable(&self.backend_id)
        {
            return Err(ServiceError::validation(format!(
                "Model {} does not support vision capabilities",
                self.backend_id
            )));
        }
        Ok(())
    }

    async fn generate(
        &self,
        user: &User,
        cmd: GenerateCommand,
        inbound: &mut mpsc::Receiver<String>,
    ) -> Result<Flow, ServiceError> {
        let store = &self.state.store;
        let config = self.state.config.as_ref();

        let image = cmd
            .image_url
            .as_deref()
            .map(|url| resolve_image(&config.uploads_dir, url))
            .transpose()?;
        let backend = self.state.models.get_or_load(&self.backend_id).await?;

        let conversation = match cmd.chat_id {
            Some(id) => Some(
                store
                    .get_conversation(id)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("Conversation not found"))?,
            ),
            None => None,
        };
        let history: Vec<ChatTurn> = match (&conversation, self.mode) {
            (Some(conversation), ChatMode::Text) => store
                .get_conversation_messages(conversation.id)
                .await?
                .into_iter()
                .map(|m| ChatTurn::new(m.role, m.content))
                .collect(),
            _ => Vec::new(),
        };

        // Request value, then the backend's defaults, then the service's.
        let defaults = &backend.config().generation;
        let max_tokens = cmd
            .max_length
            .or(defaults.max_new_tokens)
            .unwrap_or(config.max_new_tokens);
        let sampling = SamplingParams {
            temperature: cmd
                .temperature
                .or(defaults.temperature)
                .unwrap_or(config.temperature),
            top_k: cmd.top_k.or(defaults.top_k).or(config.top_k),
            top_p: cmd.top_p.or(defaults.top_p).or(config.top_p),
            seed: cmd.seed,
        };

        // The character limit applies to what the client sent, not the transcript.
        let mut request = GenerationRequest::new(
            &self.backend_id,
            Prompt::Text(cmd.message.clone()),
            max_tokens,
        )
        .with_sampling(sampling);
        request.validate(config.max_prompt_chars)?;
        request = request.with_history(history);
        if let Some(path) = image {
            request = request.with_image(path);
        }
        let decode = backend.generate_stream(&request)?;

        let conversation = match conversation {
            Some(conversation) => conversation,
            None => self.open_conversation(user, &cmd.message).await?,
        };
        store
            .create_message(
                &cmd.message,
                Role::User,
                conversation.id,
                cmd.image_url.as_deref(),
            )
            .await?;

        let stop = self.state.sessions.begin_generation(self.session_id)?;
        let tokens = spawn_decode(decode.with_cancellation(stop.clone()));
        let outcome = CancellableSession::new(
            self.session_id,
            Arc::clone(&self.state.sessions),
            inbound,
            stop,
        )
        .consume(tokens)
        .await;
        self.state.sessions.finish_generation(self.session_id);

        if outcome.should_persist() {
            store
                .create_message(&outcome.text, Role::Assistant, conversation.id, None)
                .await?;
        }
        if outcome.disconnected {
            return Ok(Flow::Disconnected);
        }
        if outcome.disposition == Disposition::Failed {
            return Ok(Flow::Continue);
        }

        let finish_reason = match (outcome.disposition, outcome.finish_reason) {
            (Disposition::Completed, Some(reason)) => reason.as_str(),
            _ => "cancelled",
        };
        let latest = store
            .get_conversation(conversation.id)
            .await?
            .unwrap_or(conversation);
        self.send(OutboundEvent::complete(
            ConversationSummary::from(&latest),
            finish_reason,
        ));
        Ok(Flow::Continue)
    }

    async fn open_conversation(
        &self,
        user: &User,
        message: &str,
    ) -> Result<Conversation, ServiceError> {
        let title = match self.mode {
            ChatMode::Text => title_from_message(message),
            ChatMode::Vision => VISION_CHAT_TITLE.to_string(),
        };
        let conversation = self
            .state
            .store
            .create_conversation(user.id, &title)
            .await?;
        info!(
            session_id = %self.session_id,
            conversation_id = conversation.id,
            %title,
            "conversation created"
        );
        Ok(conversation)
    }

    fn send(&self, event: OutboundEvent) -> bool {
        self.state.sessions.send(self.session_id, event)
    }
}

/// Maps an upload reference to a file under `uploads_dir`.
///
/// The reference must be a relative path that stays inside the directory; the
/// file must exist.
pub fn resolve_image(uploads_dir: &Path, image_url: &str) -> Result<PathBuf, ServiceError> {
    let relative = Path::new(image_url);
    if image_url.trim().is_empty() {
        return Err(ServiceError::validation("image_url must not be empty"));
    }
    let contained = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.is_absolute() || !contained {
        return Err(ServiceError::validation(format!(
            "image_url must be a path inside the uploads directory: {image_url}"
        )));
    }

    let path = uploads_dir.join(relative);
    if !path.is_file() {
        return Err(ServiceError::not_found(format!("Image not found: {image_url}")));
    }
    Ok(path)
}
