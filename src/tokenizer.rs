//! Text ↔ token-id mapping
//!
//! Production tokenizers (byte-pair, unigram) live outside this crate; the
//! generation core only depends on the [`Tokenizer`] capability surface. The
//! bundled [`VocabTokenizer`] is a score-carrying vocabulary with greedy
//! longest-match encoding and `<0xXX>` byte fallback, enough to drive every
//! model file this crate loads and every test fixture.

use std::collections::HashMap;

use crate::config::BaseConfig;
use crate::error::{CharlarError, Result};

/// Bidirectional text/token mapping plus the special ids the engine needs
///
/// Implementations are immutable after load and may be shared across
/// threads.
pub trait Tokenizer: Send + Sync {
    /// Append the encoding of `text` to `ids`
    fn encode(&self, text: &str, ids: &mut Vec<i32>);

    /// Decode a token sequence back to text
    fn decode(&self, ids: &[i32]) -> String;

    /// Number of known pieces
    fn vocab_size(&self) -> usize;

    /// Begin-of-sequence id
    fn bos_token_id(&self) -> i32;

    /// End-of-sequence id
    fn eos_token_id(&self) -> i32;

    /// Padding id
    fn pad_token_id(&self) -> i32;

    /// Piece text for an id, if the id is in range
    fn piece(&self, id: i32) -> Option<&str>;

    /// Id for an exact piece, if present
    fn piece_id(&self, piece: &str) -> Option<i32>;
}

/// Vocabulary-table tokenizer with greedy longest-match encoding
///
/// The serialized form is self-framing: a u32 piece count followed by
/// `u32 length + UTF-8 bytes + f32 score` per piece, all little-endian.
/// [`VocabTokenizer::load`] reports exactly how many bytes it consumed so
/// the loader can seek to the tensor blob.
pub struct VocabTokenizer {
    pieces: Vec<String>,
    scores: Vec<f32>,
    lookup: HashMap<String, i32>,
    max_piece_len: usize,
    bos_token_id: i32,
    eos_token_id: i32,
    pad_token_id: i32,
}

impl VocabTokenizer {
    /// Parse the vocabulary blob; returns the tokenizer and the byte count
    /// consumed
    ///
    /// # Errors
    ///
    /// Returns [`CharlarError::Malformed`] if the blob ends early or a piece
    /// is not valid UTF-8.
    pub fn load(blob: &[u8], config: &BaseConfig) -> Result<(Self, usize)> {
        let mut pos = 0usize;
        let read_u32 = |blob: &[u8], pos: &mut usize| -> Result<u32> {
            let end = *pos + 4;
            let bytes = blob.get(*pos..end).ok_or_else(|| CharlarError::Malformed {
                reason: "tokenizer blob truncated".to_string(),
            })?;
            *pos = end;
            Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
        };

        let count = read_u32(blob, &mut pos)? as usize;
        let mut pieces = Vec::with_capacity(count);
        let mut scores = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_u32(blob, &mut pos)? as usize;
            let end = pos + len;
            let bytes = blob.get(pos..end).ok_or_else(|| CharlarError::Malformed {
                reason: "tokenizer piece truncated".to_string(),
            })?;
            pos = end;
            let piece = String::from_utf8(bytes.to_vec()).map_err(|e| CharlarError::Malformed {
                reason: format!("tokenizer piece is not UTF-8: {e}"),
            })?;
            let score = f32::from_le_bytes(
                blob.get(pos..pos + 4)
                    .ok_or_else(|| CharlarError::Malformed {
                        reason: "tokenizer score truncated".to_string(),
                    })?
                    .try_into()
                    .expect("4-byte slice"),
            );
            pos += 4;
            pieces.push(piece);
            scores.push(score);
        }

        Ok((Self::from_pieces(pieces, scores, config), pos))
    }

    /// Build directly from pieces (test fixtures, converters)
    #[must_use]
    pub fn from_pieces(pieces: Vec<String>, scores: Vec<f32>, config: &BaseConfig) -> Self {
        let lookup: HashMap<String, i32> = pieces
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i as i32))
            .collect();
        let max_piece_len = pieces.iter().map(String::len).max().unwrap_or(1);
        Self {
            pieces,
            scores,
            lookup,
            max_piece_len,
            bos_token_id: config.bos_token_id,
            eos_token_id: config.eos_token_id,
            pad_token_id: config.pad_token_id,
        }
    }

    /// Score recorded for a piece
    #[must_use]
    pub fn score(&self, id: i32) -> Option<f32> {
        self.scores.get(id as usize).copied()
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str, ids: &mut Vec<i32>) {
        let bytes = text.as_bytes();
        let mut start = 0usize;
        while start < bytes.len() {
            // Greedy longest match on char boundaries.
            let mut matched = None;
            let limit = (start + self.max_piece_len).min(bytes.len());
            let mut end = limit;
            while end > start {
                if text.is_char_boundary(start) && text.is_char_boundary(end) {
                    if let Some(&id) = self.lookup.get(&text[start..end]) {
                        matched = Some((id, end));
                        break;
                    }
                }
                end -= 1;
            }

            if let Some((id, end)) = matched {
                ids.push(id);
                start = end;
            } else {
                // Byte fallback, then give up on the byte.
                let fallback = format!("<0x{:02X}>", bytes[start]);
                if let Some(&id) = self.lookup.get(&fallback) {
                    ids.push(id);
                }
                start += 1;
            }
        }
    }

    fn decode(&self, ids: &[i32]) -> String {
        let mut bytes: Vec<u8> = Vec::new();
        for &id in ids {
            let Some(piece) = self.piece(id) else { continue };
            if piece.len() == 6 && piece.starts_with("<0x") && piece.ends_with('>') {
                if let Ok(b) = u8::from_str_radix(&piece[3..5], 16) {
                    bytes.push(b);
                    continue;
                }
            }
            bytes.extend_from_slice(piece.as_bytes());
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    fn bos_token_id(&self) -> i32 {
        self.bos_token_id
    }

    fn eos_token_id(&self) -> i32 {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> i32 {
        self.pad_token_id
    }

    fn piece(&self, id: i32) -> Option<&str> {
        if id < 0 {
            return None;
        }
        self.pieces.get(id as usize).map(String::as_str)
    }

    fn piece_id(&self, piece: &str) -> Option<i32> {
        self.lookup.get(piece).copied()
    }
}
