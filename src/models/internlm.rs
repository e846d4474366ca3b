//! InternLM family
//!
//! Chat format: `<|User|>:{user}<eoh>\n<|Bot|>:{ai}<eoa>\n`. Generation
//! terminates on the family's `<eoa>` token in addition to EOS.

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

/// End-of-human marker piece
const EOH: &str = "<eoh>";
/// End-of-assistant marker piece
const EOA: &str = "<eoa>";

/// InternLM chat encoder
#[derive(Default)]
pub struct ChatEncoder {
    /// Optional system message emitted ahead of the first round
    pub sys_prompt: String,
}

impl HistoryEncoder for ChatEncoder {
    fn append_sys_prompt(&self, tokenizer: &dyn Tokenizer, ids: &mut Vec<i32>) {
        ids.push(tokenizer.bos_token_id());
        if !self.sys_prompt.is_empty() {
            tokenizer.encode(&format!("<|System|>:{}\n", self.sys_prompt), ids);
        }
    }

    fn append_user(
        &self,
        _round_idx: usize,
        user: &str,
        tokenizer: &dyn Tokenizer,
        ids: &mut Vec<i32>,
    ) {
        tokenizer.encode(&format!("<|User|>:{user}{EOH}\n"), ids);
    }

    fn append_ai(&self, round_idx: usize, ai: &str, tokenizer: &dyn Tokenizer, ids: &mut Vec<i32>) {
        self.append_ai_opening(round_idx, tokenizer, ids);
        tokenizer.encode(&format!("{ai}{EOA}\n"), ids);
    }

    fn append_ai_opening(&self, _round_idx: usize, tokenizer: &dyn Tokenizer, ids: &mut Vec<i32>) {
        tokenizer.encode("<|Bot|>:", ids);
    }
}

fn construct(
    loader: &mut ModelLoader,
    config: BaseConfig,
    tokenizer: Arc<dyn Tokenizer>,
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

    let mut engine = GenerationEngine::new(
        ModelType::InternLM,
        config,
        stack,
        tokenizer.clone(),
        mem_size,
        scratch_size,
    )
    .with_encoder(Box::new(ChatEncoder::default()));
    if let Some(eoa) = tokenizer.piece_id(EOA) {
        engine = engine.with_terminate_token(eoa);
    }
    Ok(Box::new(engine))
}

/// Registry constructor
pub(crate) fn build(
    loader: &mut ModelLoader,
    max_length: Option<usize>,
) -> crate::error::Result<LoadResult> {
    // One config parse feeds tokenizer and transformer construction alike.
    let config = load_config(loader, max_length)?;
    let tokenizer = load_tokenizer(loader, &config)?;
    let model = construct(loader, config, tokenizer.clone())?;
    Ok(LoadResult { tokenizer, model })
}

/// Registry reconstructor
pub(crate) fn rebuild(
    loader: &mut ModelLoader,
    tokenizer: Arc<dyn Tokenizer>,
    max_length: Option<usize>,
) -> crate::error::Result<Box<dyn Model>> {
    // Re-read the stored config record to apply the (possibly smaller) cap.
    let config = load_config(loader, max_length)?;
    construct(loader, config, tokenizer)
}
