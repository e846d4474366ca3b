//! Synthetic model fixtures
//!
//! Builders for tiny, fully deterministic model files and transformers used
//! across the unit tests, integration tests, and benches. Nothing here
//! touches the network or real checkpoints: weights come from a seeded
//! generator and files are a few kilobytes.

use std::sync::Arc;

use crate::config::BaseConfig;
use crate::context::ForwardContext;
use crate::engine::CausalTransformer;
use crate::error::Result;
use crate::loader::{ModelLoader, MODEL_MAGIC};
use crate::models::{ModelPurpose, ModelType};
use crate::tokenizer::{Tokenizer, VocabTokenizer};

/// Transformer that ignores its weights and replays scripted logits
///
/// Records every `forward` call so tests can assert on cache accounting,
/// prefill strategy, and absolute positions.
pub struct ScriptedTransformer {
    scripts: Vec<Vec<f32>>,
    cursor: usize,
    /// `(input_ids, n_past)` per forward call, in order
    pub calls: Vec<(Vec<i32>, usize)>,
    /// `(shift, total)` per cache shift, in order
    pub shifts: Vec<(usize, usize)>,
    /// Last prompt-length hint received
    pub last_ctx: usize,
}

impl ScriptedTransformer {
    /// Same logits on every call
    #[must_use]
    pub fn new(logits: Vec<f32>) -> Self {
        Self::cycling(vec![logits])
    }

    /// Rotate through `scripts`, one per forward call
    #[must_use]
    pub fn cycling(scripts: Vec<Vec<f32>>) -> Self {
        assert!(!scripts.is_empty(), "at least one script required");
        Self {
            scripts,
            cursor: 0,
            calls: Vec::new(),
            shifts: Vec::new(),
            last_ctx: 0,
        }
    }
}

impl CausalTransformer for ScriptedTransformer {
    fn forward(
        &mut self,
        _ctx: &mut ForwardContext,
        input_ids: &[i32],
        n_past: usize,
    ) -> Result<Vec<f32>> {
        self.calls.push((input_ids.to_vec(), n_past));
        let logits = self.scripts[self.cursor % self.scripts.len()].clone();
        self.cursor += 1;
        Ok(logits)
    }

    fn shift_cache(&mut self, shift: usize, total: usize) {
        self.shifts.push((shift, total));
    }

    fn set_ctx(&mut self, n_ctx: usize) {
        self.last_ctx = n_ctx;
    }

    fn param_num(&self, _effective_only: bool) -> u64 {
        0
    }

    fn load(&mut self, _loader: &mut ModelLoader) -> Result<()> {
        Ok(())
    }
}

/// A base config for toy models: `vocab_size` pieces, everything else tiny
#[must_use]
pub fn test_base_config(vocab_size: usize, max_length: usize) -> BaseConfig {
    BaseConfig {
        vocab_size: vocab_size as i32,
        hidden_size: 8,
        num_attention_heads: 2,
        num_hidden_layers: 2,
        intermediate_size: 16,
        max_length: max_length as i32,
        bos_token_id: 0,
        eos_token_id: vocab_size.saturating_sub(1) as i32,
        pad_token_id: 2,
        sep_token_id: -1,
    }
}

/// Vocabulary matching [`test_base_config`]: specials then single letters
#[must_use]
pub fn test_pieces(vocab_size: usize) -> Vec<String> {
    let mut pieces = vec!["<s>".to_string(), "</s>".to_string(), "<pad>".to_string()];
    let mut letter = b'a';
    while pieces.len() < vocab_size {
        pieces.push((letter as char).to_string());
        letter += 1;
    }
    pieces.truncate(vocab_size);
    pieces
}

/// Tokenizer over [`test_pieces`]
#[must_use]
pub fn test_tokenizer(config: &BaseConfig) -> Arc<dyn Tokenizer> {
    let pieces = test_pieces(config.vocab_size as usize);
    let scores = vec![0.0; pieces.len()];
    Arc::new(VocabTokenizer::from_pieces(pieces, scores, config))
}

/// Deterministic weight stream in roughly [-0.2, 0.2)
struct WeightStream {
    state: u64,
}

impl WeightStream {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> f32 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1);
        let unit = (self.state >> 33) as f32 / (1u64 << 31) as f32;
        (unit - 0.5) * 0.4
    }

    fn fill(&mut self, count: usize) -> Vec<f32> {
        (0..count).map(|_| self.next()).collect()
    }
}

fn push_tensor_f32(buf: &mut Vec<u8>, name: &str, shape: &[usize], data: &[f32]) {
    debug_assert_eq!(shape.iter().product::<usize>(), data.len());
    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&(shape.len() as i32).to_le_bytes());
    for &dim in shape {
        buf.extend_from_slice(&(dim as i64).to_le_bytes());
    }
    buf.extend_from_slice(&0i32.to_le_bytes());
    for &v in data {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn push_tensor_f16(buf: &mut Vec<u8>, name: &str, shape: &[usize], data: &[f32]) {
    debug_assert_eq!(shape.iter().product::<usize>(), data.len());
    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&(shape.len() as i32).to_le_bytes());
    for &dim in shape {
        buf.extend_from_slice(&(dim as i64).to_le_bytes());
    }
    buf.extend_from_slice(&1i32.to_le_bytes());
    for &v in data {
        buf.extend_from_slice(&half::f16::from_f32(v).to_le_bytes());
    }
}

/// Serialize a complete, loadable model file for the given family
///
/// Layout: magic, model type, version, config, tokenizer blob, tensors in
/// exactly the order the decoder stack reads them. Weights are seeded, so
/// the same `(model_type, config, seed)` always yields the same file.
#[must_use]
pub fn build_model_file(model_type: ModelType, config: &BaseConfig, seed: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MODEL_MAGIC);
    buf.extend_from_slice(&(model_type as i32).to_le_bytes());
    buf.extend_from_slice(&1i32.to_le_bytes());

    // Config record: ten little-endian i32s.
    for v in [
        config.vocab_size,
        config.hidden_size,
        config.num_attention_heads,
        config.num_hidden_layers,
        config.intermediate_size,
        config.max_length,
        config.bos_token_id,
        config.eos_token_id,
        config.pad_token_id,
        config.sep_token_id,
    ] {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    // Tokenizer blob.
    let pieces = test_pieces(config.vocab_size as usize);
    buf.extend_from_slice(&(pieces.len() as u32).to_le_bytes());
    for piece in &pieces {
        buf.extend_from_slice(&(piece.len() as u32).to_le_bytes());
        buf.extend_from_slice(piece.as_bytes());
        buf.extend_from_slice(&0.0f32.to_le_bytes());
    }

    // Tensor blob, decoder-stack order.
    let vocab = config.vocab_size as usize;
    let hidden = config.hidden_size as usize;
    let inter = config.intermediate_size as usize;
    let mut weights = WeightStream::new(seed);

    push_tensor_f32(
        &mut buf,
        "model.embed_tokens.weight",
        &[vocab, hidden],
        &weights.fill(vocab * hidden),
    );
    for i in 0..config.num_hidden_layers as usize {
        let p = format!("model.layers.{i}");
        push_tensor_f32(
            &mut buf,
            &format!("{p}.input_layernorm.weight"),
            &[hidden],
            &vec![1.0; hidden],
        );
        for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
            push_tensor_f32(
                &mut buf,
                &format!("{p}.self_attn.{proj}.weight"),
                &[hidden, hidden],
                &weights.fill(hidden * hidden),
            );
        }
        push_tensor_f32(
            &mut buf,
            &format!("{p}.post_attention_layernorm.weight"),
            &[hidden],
            &vec![1.0; hidden],
        );
        push_tensor_f32(
            &mut buf,
            &format!("{p}.mlp.gate_proj.weight"),
            &[inter, hidden],
            &weights.fill(inter * hidden),
        );
        push_tensor_f32(
            &mut buf,
            &format!("{p}.mlp.up_proj.weight"),
            &[inter, hidden],
            &weights.fill(inter * hidden),
        );
        push_tensor_f32(
            &mut buf,
            &format!("{p}.mlp.down_proj.weight"),
            &[hidden, inter],
            &weights.fill(hidden * inter),
        );
    }
    // The final norm rides the f16 path to keep dtype conversion exercised.
    push_tensor_f16(&mut buf, "model.norm.weight", &[hidden], &vec![1.0; hidden]);

    match model_type.purpose() {
        ModelPurpose::Chat => {
            push_tensor_f32(
                &mut buf,
                "lm_head.weight",
                &[vocab, hidden],
                &weights.fill(vocab * hidden),
            );
        },
        ModelPurpose::Ranker => {
            push_tensor_f32(&mut buf, "score.weight", &[1, hidden], &weights.fill(hidden));
        },
        ModelPurpose::TextEmbedding => {},
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_transformer_replays_and_records() {
        let mut t = ScriptedTransformer::cycling(vec![vec![1.0], vec![2.0]]);
        let mut ctx = ForwardContext::new(1 << 10, 1 << 10, 1);
        assert_eq!(t.forward(&mut ctx, &[5], 0).unwrap(), vec![1.0]);
        assert_eq!(t.forward(&mut ctx, &[6], 1).unwrap(), vec![2.0]);
        assert_eq!(t.forward(&mut ctx, &[7], 2).unwrap(), vec![1.0]);
        assert_eq!(t.calls.len(), 3);
        assert_eq!(t.calls[1], (vec![6], 1));
    }

    #[test]
    fn model_file_is_deterministic_per_seed() {
        let config = test_base_config(8, 16);
        let a = build_model_file(ModelType::Llama2, &config, 42);
        let b = build_model_file(ModelType::Llama2, &config, 42);
        let c = build_model_file(ModelType::Llama2, &config, 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn pieces_cover_vocab() {
        let pieces = test_pieces(8);
        assert_eq!(pieces.len(), 8);
        assert_eq!(pieces[0], "<s>");
        assert_eq!(pieces[3], "a");
    }
}
