//! Chat history encoding
//!
//! A [`HistoryEncoder`] turns structured conversation turns into the exact
//! token sequence a model family was trained on. Each family ships its own
//! encoder; the four operations all append to a caller-provided id buffer so
//! a full prompt is assembled in one pass without intermediate strings.
//!
//! The invariant every encoder must keep: repeated rounds produce a token
//! sequence the model itself could have generated, byte for byte, under its
//! training format.

use serde::{Deserialize, Serialize};

use crate::tokenizer::Tokenizer;

/// One user/assistant exchange
///
/// The final round of a prompt typically has `ai: None`; the assistant
/// reply is what generation is about to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRound {
    /// User message text
    pub user: String,
    /// Assistant reply, when the round is already complete
    pub ai: Option<String>,
}

impl ChatRound {
    /// An open round awaiting the assistant reply
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            user: text.into(),
            ai: None,
        }
    }

    /// A completed round
    #[must_use]
    pub fn exchange(user: impl Into<String>, ai: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ai: Some(ai.into()),
        }
    }
}

/// Family-specific conversation-to-tokens contract
///
/// All operations append to `ids`. `round_idx` counts exchanges from zero;
/// some formats only emit their preamble on round zero.
pub trait HistoryEncoder {
    /// Emit the optional BOS and system-message framing
    fn append_sys_prompt(&self, tokenizer: &dyn Tokenizer, ids: &mut Vec<i32>);

    /// Emit one user turn with its delimiters
    fn append_user(
        &self,
        round_idx: usize,
        user: &str,
        tokenizer: &dyn Tokenizer,
        ids: &mut Vec<i32>,
    );

    /// Emit one completed assistant turn including its end-of-turn marker
    fn append_ai(&self, round_idx: usize, ai: &str, tokenizer: &dyn Tokenizer, ids: &mut Vec<i32>);

    /// Emit the prefix that cues the model to start generating
    ///
    /// Called as the last step of prompt assembly so the first sampled token
    /// is the assistant's first content token.
    fn append_ai_opening(&self, round_idx: usize, tokenizer: &dyn Tokenizer, ids: &mut Vec<i32>);
}

/// Assemble a full prompt from a conversation
///
/// System framing, then every round in order; a trailing open round (or an
/// empty history) ends with the assistant opening so generation starts in
/// reply position.
#[must_use]
pub fn encode_chat(
    encoder: &dyn HistoryEncoder,
    tokenizer: &dyn Tokenizer,
    rounds: &[ChatRound],
) -> Vec<i32> {
    let mut ids = Vec::new();
    encoder.append_sys_prompt(tokenizer, &mut ids);
    let mut opened = false;
    for (round_idx, round) in rounds.iter().enumerate() {
        encoder.append_user(round_idx, &round.user, tokenizer, &mut ids);
        match &round.ai {
            Some(ai) => encoder.append_ai(round_idx, ai, tokenizer, &mut ids),
            None => {
                encoder.append_ai_opening(round_idx, tokenizer, &mut ids);
                opened = true;
            },
        }
    }
    if !opened {
        encoder.append_ai_opening(rounds.len(), tokenizer, &mut ids);
    }
    ids
}
