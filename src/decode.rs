//! Autoregressive decoding against a loaded backend.
//!
//! [`DecodeLoop`] is a lazy, single-use iterator: a call to `next` runs forward
//! passes only until it has an element to yield, which is one pass unless the
//! sampled ids end inside a multi-byte character. Failures never escape as
//! `Err`; they surface as a terminal [`TokenEvent::Error`] element.

use std::{
    iter::FusedIterator,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use rand::rngs::StdRng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::ServiceError,
    model::{ImageFeatures, ModelRuntime},
    sampling::{SamplingParams, sample_next},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The end-of-sequence id was sampled.
    Stop,
    /// `max_tokens` steps were produced.
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    Token(String),
    Done(FinishReason),
    Error(String),
}

impl TokenEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TokenEvent::Token(_))
    }
}

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub max_tokens: usize,
    pub sampling: SamplingParams,
    pub add_special_tokens: bool,
    pub skip_special_tokens: bool,
}

enum State {
    Pending {
        prompt: String,
        image: Option<PathBuf>,
    },
    Running,
    Failed(String),
    Finished,
}

enum Step {
    Token(String),
    /// The pending ids do not yet decode to whole characters.
    Held,
    EndOfSequence,
}

/// Ids held back while they decode to an incomplete character. A UTF-8
/// sequence spans at most four bytes, so a longer run is emitted as is.
const MAX_PENDING_IDS: usize = 4;

pub struct DecodeLoop {
    runtime: Option<Arc<ModelRuntime>>,
    state: State,
    context: Vec<u32>,
    prompt_tokens: usize,
    image: Option<ImageFeatures>,
    options: DecodeOptions,
    rng: StdRng,
    steps: usize,
    pending: Vec<u32>,
    finishing: Option<FinishReason>,
    cancel: CancellationToken,
    started: Instant,
}

impl DecodeLoop {
    pub fn new(
        runtime: Arc<ModelRuntime>,
        prompt: String,
        image: Option<PathBuf>,
        options: DecodeOptions,
    ) -> Self {
        let rng = options.sampling.rng();
        Self {
            runtime: Some(runtime),
            state: State::Pending { prompt, image },
            context: Vec::new(),
            prompt_tokens: 0,
            image: None,
            options,
            rng,
            steps: 0,
            pending: Vec::new(),
            finishing: None,
            cancel: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    /// A loop that yields a single error element.
    pub fn failed(reason: impl Into<String>) -> Self {
        let options = DecodeOptions {
            max_tokens: 0,
            sampling: SamplingParams::greedy(),
            add_special_tokens: false,
            skip_special_tokens: false,
        };
        let rng = options.sampling.rng();
        Self {
            runtime: None,
            state: State::Failed(reason.into()),
            context: Vec::new(),
            prompt_tokens: 0,
            image: None,
            options,
            rng,
            steps: 0,
            pending: Vec::new(),
            finishing: None,
            cancel: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    /// Stops the loop before its next forward pass once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Ids generated so far, excluding the prompt.
    pub fn generated_ids(&self) -> &[u32] {
        &self.context[self.prompt_tokens.min(self.context.len())..]
    }

    fn runtime(&self) -> Result<&Arc<ModelRuntime>, ServiceError> {
        self.runtime
            .as_ref()
            .ok_or_else(|| ServiceError::Generation("backend is not loaded".into()))
    }

    fn start(&mut self, prompt: &str, image: Option<PathBuf>) -> Result<(), ServiceError> {
        let runtime = Arc::clone(self.runtime()?);
        let ids = runtime
            .vocab
            .encode(prompt, self.options.add_special_tokens)?;
        if ids.is_empty() {
            return Err(ServiceError::validation("prompt encoded to zero tokens"));
        }
        if ids.len() > runtime.context_window {
            return Err(ServiceError::validation(format!(
                "prompt is {} tokens, exceeding the context window of {}",
                ids.len(),
                runtime.context_window
            )));
        }
        if let Some(path) = image {
            let mut model = runtime.model.lock();
            self.image = Some(model.encode_image(&path)?);
        }

        self.prompt_tokens = ids.len();
        self.context = ids;
        self.started = Instant::now();
        info!(
            prompt_tokens = self.prompt_tokens,
            max_tokens = self.options.max_tokens,
            temperature = self.options.sampling.temperature,
            "starting generation"
        );
        Ok(())
    }

    fn advance(&mut self) -> Result<Step, ServiceError> {
        let runtime = Arc::clone(self.runtime()?);
        let window_start = self.context.len().saturating_sub(runtime.context_window);

        let logits = {
            let mut model = runtime.model.lock();
            model.next_token_logits(&self.context[window_start..], self.image.as_ref())?
        };
        let next = sample_next(&logits, &self.options.sampling, &mut self.rng)?;
        self.context.push(next);
        self.steps += 1;

        if runtime.eos_token_id == Some(next) {
            return Ok(Step::EndOfSequence);
        }
        self.pending.push(next);
        let text = runtime
            .vocab
            .decode(&self.pending, self.options.skip_special_tokens)?;
        if text.ends_with(char::REPLACEMENT_CHARACTER) && self.pending.len() < MAX_PENDING_IDS {
            return Ok(Step::Held);
        }
        self.pending.clear();
        Ok(Step::Token(text))
    }

    /// Decodes whatever is still held back, if anything.
    fn flush(&mut self) -> Result<Option<String>, ServiceError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let runtime = Arc::clone(self.runtime()?);
        let ids = std::mem::take(&mut self.pending);
        let text = runtime
            .vocab
            .decode(&ids, self.options.skip_special_tokens)?;
        Ok(Some(text).filter(|text| !text.is_empty()))
    }

    fn step(&mut self) -> Option<TokenEvent> {
        loop {
            if self.cancel.is_cancelled() {
                debug!(steps = self.steps, "generation cancelled");
                return None;
            }
            if let Some(reason) = self.finishing.take() {
                self.log_completion(reason);
                return Some(TokenEvent::Done(reason));
            }
            if self.steps >= self.options.max_tokens {
                return Some(self.finish(FinishReason::Length));
            }
            match self.advance() {
                Ok(Step::Token(text)) => {
                    self.state = State::Running;
                    return Some(TokenEvent::Token(text));
                }
                Ok(Step::Held) => continue,
                Ok(Step::EndOfSequence) => return Some(self.finish(FinishReason::Stop)),
                Err(e) => return Some(self.fail(e)),
            }
        }
    }

    /// Emits held-back text first, then the terminal element on the next call.
    fn finish(&mut self, reason: FinishReason) -> TokenEvent {
        match self.flush() {
            Ok(Some(text)) => {
                self.finishing = Some(reason);
                self.state = State::Running;
                TokenEvent::Token(text)
            }
            Ok(None) => {
                self.log_completion(reason);
                TokenEvent::Done(reason)
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: ServiceError) -> TokenEvent {
        warn!(error = %e, steps = self.steps, "generation failed");
        self.pending.clear();
        TokenEvent::Error(e.to_string())
    }

    fn log_completion(&self, reason: FinishReason) {
        let elapsed = self.started.elapsed();
        let tokens_per_second = if elapsed.as_secs_f64() > 0.0 {
            self.steps as f64 / elapsed.as_secs_f64()
        } else {
            self.steps as f64
        };
        info!(
            tokens = self.steps,
            elapsed_ms = elapsed.as_millis() as u64,
            tokens_per_second,
            reason = reason.as_str(),
            "generation completed"
        );
    }
}

impl Iterator for DecodeLoop {
    type Item = TokenEvent;

    fn next(&mut self) -> Option<TokenEvent> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Finished => None,
            State::Failed(reason) => Some(TokenEvent::Error(reason)),
            State::Pending { prompt, image } => {
                if self.cancel.is_cancelled() {
                    return None;
                }
                match self.start(&prompt, image) {
                    Ok(()) => self.step(),
                    Err(e) => {
                        warn!(error = %e, "generation could not start");
                        Some(TokenEvent::Error(e.to_string()))
                    }
                }
            }
            State::Running => self.step(),
        }
    }
}

impl FusedIterator for DecodeLoop {}

/// Runs `decode` on the blocking pool and hands its events over a channel.
///
/// The loop is abandoned as soon as the receiver is dropped: at most the
/// forward pass already in flight completes.
pub fn spawn_decode(decode: DecodeLoop) -> mpsc::Receiver<TokenEvent> {
    let (tx, rx) = mpsc::channel(1);
    tokio::task::spawn_blocking(move || {
        for event in decode {
            if tx.blocking_send(event).is_err() {
                debug!("token receiver dropped, abandoning generation");
                break;
            }
        }
    });
    rx
}
