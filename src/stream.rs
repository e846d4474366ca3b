//! Token streaming
//!
//! The engine hands newly decodable tokens to a [`Streamer`] strictly in
//! sampling order. Prompt tokens are never streamed, and a terminal token is
//! popped before it could reach the streamer.

use std::io::Write;
use std::sync::Arc;

use crate::tokenizer::Tokenizer;

/// Consumer of generated tokens
pub trait Streamer {
    /// Deliver one or more newly decodable token ids
    fn put(&mut self, tokens: &[i32]);

    /// Generation finished; flush any buffered output
    fn end(&mut self) {}
}

/// Streamer that records every delivered id (tests, batch callers)
#[derive(Debug, Default)]
pub struct CollectorStreamer {
    /// Ids received so far, in delivery order
    pub tokens: Vec<i32>,
    /// Whether `end` has been observed
    pub ended: bool,
}

impl CollectorStreamer {
    /// Empty collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Streamer for CollectorStreamer {
    fn put(&mut self, tokens: &[i32]) {
        self.tokens.extend_from_slice(tokens);
    }

    fn end(&mut self) {
        self.ended = true;
    }
}

/// Streamer that decodes tokens incrementally into a writer
pub struct TextStreamer<W: Write> {
    tokenizer: Arc<dyn Tokenizer>,
    sink: W,
}

impl<W: Write> TextStreamer<W> {
    /// Decode through `tokenizer` into `sink`
    pub fn new(tokenizer: Arc<dyn Tokenizer>, sink: W) -> Self {
        Self { tokenizer, sink }
    }

    /// Give the sink back (typically after `end`)
    pub fn into_sink(self) -> W {
        self.sink
    }
}

impl<W: Write> Streamer for TextStreamer<W> {
    fn put(&mut self, tokens: &[i32]) {
        let text = self.tokenizer.decode(tokens);
        // A broken pipe mid-stream is the consumer's concern, not the
        // generation loop's.
        let _ = self.sink.write_all(text.as_bytes());
    }

    fn end(&mut self) {
        let _ = self.sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseConfig;
    use crate::tokenizer::VocabTokenizer;

    #[test]
    fn collector_preserves_order() {
        let mut streamer = CollectorStreamer::new();
        streamer.put(&[3]);
        streamer.put(&[1, 4]);
        streamer.end();
        assert_eq!(streamer.tokens, vec![3, 1, 4]);
        assert!(streamer.ended);
    }

    #[test]
    fn text_streamer_decodes_into_sink() {
        let config = BaseConfig {
            vocab_size: 0,
            hidden_size: 1,
            num_attention_heads: 1,
            num_hidden_layers: 0,
            intermediate_size: 1,
            max_length: 8,
            bos_token_id: 0,
            eos_token_id: 1,
            pad_token_id: 2,
            sep_token_id: -1,
        };
        let pieces: Vec<String> = ["<s>", "</s>", "<pad>", "ok"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let tok: Arc<dyn Tokenizer> = Arc::new(VocabTokenizer::from_pieces(
            pieces.clone(),
            vec![0.0; pieces.len()],
            &config,
        ));
        let mut streamer = TextStreamer::new(tok, Vec::new());
        streamer.put(&[3, 3]);
        streamer.end();
        assert_eq!(streamer.into_sink(), b"okok");
    }
}
