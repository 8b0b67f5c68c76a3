use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    decode::{FinishReason, TokenEvent},
    session::{InboundCommand, OutboundEvent, SessionRegistry, parse_command},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    /// Concatenation of every forwarded token.
    pub text: String,
    pub disposition: Disposition,
    pub tokens: usize,
    /// Set when the loop finished on its own.
    pub finish_reason: Option<FinishReason>,
    /// The client went away mid-generation.
    pub disconnected: bool,
}

impl GenerationOutcome {
    fn new() -> Self {
        Self {
            text: String::new(),
            disposition: Disposition::Failed,
            tokens: 0,
            finish_reason: None,
            disconnected: false,
        }
    }

    /// Only a completed, non-empty reply may be stored.
    pub fn should_persist(&self) -> bool {
        self.disposition == Disposition::Completed && !self.text.is_empty()
    }
}

/// Consumes one generation's token stream for a session while watching the
/// session's inbound frames and its stop token.
///
/// Sources are polled in a fixed order: the stop token, then inbound frames,
/// then tokens. A stop that is already queued therefore always wins over a
/// token that is already produced.
pub struct CancellableSession<'a> {
    session_id: Uuid,
    sessions: Arc<SessionRegistry>,
    inbound: &'a mut mpsc::Receiver<String>,
    stop: CancellationToken,
}

impl<'a> CancellableSession<'a> {
    pub fn new(
        session_id: Uuid,
        sessions: Arc<SessionRegistry>,
        inbound: &'a mut mpsc::Receiver<String>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            sessions,
            inbound,
            stop,
        }
    }

    pub async fn consume(mut self, mut tokens: mpsc::Receiver<TokenEvent>) -> GenerationOutcome {
        let mut outcome = GenerationOutcome::new();

        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => {
                    debug!(session_id = %self.session_id, "stop signalled");
                    outcome.disposition = Disposition::Cancelled;
                    break;
                }
                frame = self.inbound.recv() => match frame {
                    None => {
                        outcome.disposition = Disposition::Cancelled;
                        outcome.disconnected = true;
                        break;
                    }
                    Some(raw) => match parse_command(&raw) {
                        Ok(InboundCommand::Stop) => {
                            outcome.disposition = Disposition::Cancelled;
                            break;
                        }
                        Ok(InboundCommand::Generate(_)) => {
                            self.reply(OutboundEvent::error("a generation is already in progress"));
                        }
                        Err(e) => {
                            self.reply(OutboundEvent::error(e));
                        }
                    },
                },
                event = tokens.recv() => match event {
                    Some(TokenEvent::Token(text)) => {
                        if !self.reply(OutboundEvent::token(text.as_str())) {
                            outcome.disposition = Disposition::Cancelled;
                            outcome.disconnected = true;
                            break;
                        }
                        outcome.text.push_str(&text);
                        outcome.tokens += 1;
                    }
                    Some(TokenEvent::Done(reason)) => {
                        outcome.disposition = Disposition::Completed;
                        outcome.finish_reason = Some(reason);
                        break;
                    }
                    Some(TokenEvent::Error(reason)) => {
                        self.reply(OutboundEvent::error(reason));
                        outcome.disposition = Disposition::Failed;
                        break;
                    }
                    None => {
                        self.reply(OutboundEvent::error("generation ended unexpectedly"));
                        outcome.disposition = Disposition::Failed;
                        break;
                    }
                },
            }
        }

        // Stops the decode loop before its next forward pass. Dropping `tokens`
        // also unblocks a producer waiting on a full channel.
        self.stop.cancel();
        drop(tokens);

        info!(
            session_id = %self.session_id,
            tokens = outcome.tokens,
            disposition = ?outcome.disposition,
            disconnected = outcome.disconnected,
            "generation finished"
        );
        outcome
    }

    fn reply(&self, event: OutboundEvent) -> bool {
        self.sessions.send(self.session_id, event)
    }
}
