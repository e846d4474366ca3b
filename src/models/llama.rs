//! Llama 2 family (and the CodeLlama derivative)
//!
//! Chat format: `<s>[INST] <<SYS>>\n{sys}\n<</SYS>>\n\n{user} [/INST]` with
//! the assistant reply following the closing instruction marker and ending
//! in EOS. The system block only appears inside the first instruction.

use std::sync::Arc;

use crate::chat::HistoryEncoder;
use crate::config::BaseConfig;
use crate::engine::{GenerationEngine, Model};
use crate::layers::{DecoderStack, Linear, OutputHead};
use crate::loader::{
    load_config, load_tokenizer, load_transformer, LoadResult, ModelLoader,
};
use crate::models::ModelType;
use crate::tokenizer::Tokenizer;

/// Llama 2 instruction-format chat encoder
#[derive(Default)]
pub struct ChatEncoder {
    /// System message woven into the first instruction; empty omits the
    /// `<<SYS>>` block
    pub sys_prompt: String,
}

impl HistoryEncoder for ChatEncoder {
    fn append_sys_prompt(&self, tokenizer: &dyn Tokenizer, ids: &mut Vec<i32>) {
        ids.push(tokenizer.bos_token_id());
    }

    fn append_user(
        &self,
        round_idx: usize,
        user: &str,
        tokenizer: &dyn Tokenizer,
        ids: &mut Vec<i32>,
    ) {
        let prompt = if round_idx == 0 && !self.sys_prompt.is_empty() {
            format!(
                "[INST] <<SYS>>\n{}\n<</SYS>>\n\n{} [/INST]",
                self.sys_prompt, user
            )
        } else {
            format!("[INST] {user} [/INST]")
        };
        tokenizer.encode(&prompt, ids);
    }

    fn append_ai(&self, round_idx: usize, ai: &str, tokenizer: &dyn Tokenizer, ids: &mut Vec<i32>) {
        self.append_ai_opening(round_idx, tokenizer, ids);
        tokenizer.encode(&format!(" {ai}"), ids);
        ids.push(tokenizer.eos_token_id());
    }

    fn append_ai_opening(&self, _round_idx: usize, _tokenizer: &dyn Tokenizer, _ids: &mut Vec<i32>) {
        // The closing " [/INST]" of the user turn is the generation cue.
    }
}

fn construct(
    loader: &mut ModelLoader,
    config: BaseConfig,
    tokenizer: Arc<dyn Tokenizer>,
    model_type: ModelType,
) -> crate::error::Result<Box<dyn Model>> {
    let head = OutputHead::Logits {
        lm_head: Some(Linear::new(
            config.hidden_size as usize,
            config.vocab_size as usize,
            false,
        )),
    };
    let mut stack = DecoderStack::new(&config, head);
    load_transformer(loader, &mut stack)?;
    let (mem_size, scratch_size) = stack.arena_sizes();
    let engine = GenerationEngine::new(model_type, config, stack, tokenizer, mem_size, scratch_size)
        .with_encoder(Box::new(ChatEncoder::default()));
    Ok(Box::new(engine))
}

fn build_as(
    loader: &mut ModelLoader,
    max_length: Option<usize>,
    model_type: ModelType,
) -> crate::error::Result<LoadResult> {
    // One config parse feeds tokenizer and transformer construction alike.
    let config = load_config(loader, max_length)?;
    let tokenizer = load_tokenizer(loader, &config)?;
    let model = construct(loader, config, tokenizer.clone(), model_type)?;
    Ok(LoadResult { tokenizer, model })
}

fn rebuild_as(
    loader: &mut ModelLoader,
    tokenizer: Arc<dyn Tokenizer>,
    max_length: Option<usize>,
    model_type: ModelType,
) -> crate::error::Result<Box<dyn Model>> {
    // Re-read the stored config record to apply the (possibly smaller) cap.
    let config = load_config(loader, max_length)?;
    construct(loader, config, tokenizer, model_type)
}

/// Registry constructor for Llama 2
pub(crate) fn build(
    loader: &mut ModelLoader,
    max_length: Option<usize>,
) -> crate::error::Result<LoadResult> {
    build_as(loader, max_length, ModelType::Llama2)
}

/// Registry reconstructor for Llama 2
pub(crate) fn rebuild(
    loader: &mut ModelLoader,
    tokenizer: Arc<dyn Tokenizer>,
    max_length: Option<usize>,
) -> crate::error::Result<Box<dyn Model>> {
    rebuild_as(loader, tokenizer, max_length, ModelType::Llama2)
}

/// Registry constructor for CodeLlama
pub(crate) fn build_code(
    loader: &mut ModelLoader,
    max_length: Option<usize>,
) -> crate::error::Result<LoadResult> {
    build_as(loader, max_length, ModelType::CodeLlama)
}

/// Registry reconstructor for CodeLlama
pub(crate) fn rebuild_code(
    loader: &mut ModelLoader,
    tokenizer: Arc<dyn Tokenizer>,
    max_length: Option<usize>,
) -> crate::error::Result<Box<dyn Model>> {
    rebuild_as(loader, tokenizer, max_length, ModelType::CodeLlama)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{encode_chat, ChatRound};
    use crate::config::BaseConfig;
    use crate::tokenizer::VocabTokenizer;

    fn fixture_tokenizer() -> VocabTokenizer {
        let config = BaseConfig {
            vocab_size: 0,
            hidden_size: 1,
            num_attention_heads: 1,
            num_hidden_layers: 0,
            intermediate_size: 1,
            max_length: 64,
            bos_token_id: 0,
            eos_token_id: 1,
            pad_token_id: 2,
            sep_token_id: -1,
        };
        let pieces: Vec<String> = [
            "<s>", "</s>", "<pad>", "[INST] ", " [/INST]", "<<SYS>>\n", "\n<</SYS>>\n\n", "hi",
            "be nice", " ", "ok",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        VocabTokenizer::from_pieces(pieces.clone(), vec![0.0; pieces.len()], &config)
    }

    #[test]
    fn sys_block_only_in_first_instruction() {
        let tok = fixture_tokenizer();
        let encoder = ChatEncoder {
            sys_prompt: "be nice".to_string(),
        };
        let ids = encode_chat(
            &encoder,
            &tok,
            &[ChatRound::exchange("hi", "ok"), ChatRound::user("hi")],
        );
        // bos, [INST] <<SYS>>\n be-nice \n<</SYS>>\n\n hi [/INST], " " ok,
        // eos, [INST] hi [/INST]
        assert_eq!(ids, vec![0, 3, 5, 8, 6, 7, 4, 9, 10, 1, 3, 7, 4]);
    }

    #[test]
    fn ai_opening_is_empty_for_this_format() {
        let tok = fixture_tokenizer();
        let encoder = ChatEncoder::default();
        let mut ids = Vec::new();
        encoder.append_ai_opening(0, &tok, &mut ids);
        assert!(ids.is_empty());
    }

    #[test]
    fn prompt_ends_at_generation_cue() {
        let tok = fixture_tokenizer();
        let encoder = ChatEncoder::default();
        let ids = encode_chat(&encoder, &tok, &[ChatRound::user("hi")]);
        assert_eq!(ids, vec![0, 3, 7, 4]);
        // The next sampled token is the assistant's first content token.
    }
}
