use serde::{Deserialize, Serialize};

use crate::model::{ChatTurn, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    /// `role: content` lines, used by the direct-weights decoder.
    Plain,
    ChatMl,
    Gemma,
    SmolVlm,
}

pub const IMAGE_PLACEHOLDER: &str = "<image>";

impl ChatTemplate {
    /// Templates whose models reject two consecutive turns from the same role.
    pub fn requires_alternation(&self) -> bool {
        matches!(self, ChatTemplate::Gemma)
    }

    /// Renders the turns and the trailing assistant cue. `with_image` places
    /// the image placeholder at the start of the first user turn.
    pub fn render(&self, turns: &[ChatTurn], with_image: bool) -> String {
        let mut out = String::new();
        let mut image_pending = with_image;
        match self {
            ChatTemplate::Plain => {
                for turn in turns {
                    out.push_str(turn.role.as_str());
                    out.push_str(": ");
                    out.push_str(&turn.content);
                    out.push('\n');
                }
            }
            ChatTemplate::ChatMl => {
                for turn in turns {
                    out.push_str("<|im_start|>");
                    out.push_str(turn.role.as_str());
                    out.push('\n');
                    if image_pending && turn.role == Role::User {
                        out.push_str(IMAGE_PLACEHOLDER);
                        image_pending = false;
                    }
                    out.push_str(&turn.content);
                    out.push_str("<|im_end|>\n");
                }
                out.push_str("<|im_start|>assistant\n");
            }
            ChatTemplate::Gemma => {
                out.push_str("<bos>");
                for turn in turns {
                    let role = match turn.role {
                        Role::Assistant => "model",
                        Role::User | Role::System => "user",
                    };
                    out.push_str("<start_of_turn>");
                    out.push_str(role);
                    out.push('\n');
                    out.push_str(&turn.content);
                    out.push_str("<end_of_turn>\n");
                }
                out.push_str("<start_of_turn>model\n");
            }
            ChatTemplate::SmolVlm => {
                out.push_str("<|im_start|>");
                for turn in turns {
                    let role = match turn.role {
                        Role::System => "System",
                        Role::User => "User",
                        Role::Assistant => "Assistant",
                    };
                    out.push_str(role);
                    out.push(':');
                    if image_pending && turn.role == Role::User {
                        out.push_str(IMAGE_PLACEHOLDER);
                        image_pending = false;
                    } else {
                        out.push(' ');
                    }
                    out.push_str(&turn.content);
                    out.push_str("<end_of_utterance>\n");
                }
                out.push_str("Assistant:");
            }
        }
        out
    }
}

/// Collapses runs of same-role turns into one turn, joining contents with a
/// newline, so that roles strictly alternate.
pub fn merge_adjacent_turns(turns: Vec<ChatTurn>) -> Vec<ChatTurn> {
    let mut merged: Vec<ChatTurn> = Vec::with_capacity(turns.len());
    for turn in turns {
        match merged.last_mut() {
            Some(last) if last.role == turn.role => {
                last.content.push('\n');
                last.content.push_str(&turn.content);
            }
            _ => merged.push(turn),
        }
    }
    merged
}
