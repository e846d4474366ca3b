//! Autoregressive generation engine
//!
//! [`GenerationEngine`] drives one conversation: it runs the transformer
//! forward over the pending input, samples the next token, folds the step
//! into the KV-cache accounting, streams newly decodable tokens, and stops
//! on a terminal token, a degenerate sampler, the length cap, or an external
//! abort. The same forward path serves the text-embedding and reranker
//! modes, which skip sampling entirely.
//!
//! Families interact with the engine through two surfaces: the
//! [`CausalTransformer`] capability trait they implement, and the
//! object-safe [`Model`] facade the loader hands to callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chat::HistoryEncoder;
use crate::config::{BaseConfig, GenerationConfig};
use crate::context::{resolve_thread_count, ForwardContext};
use crate::error::{CharlarError, Result};
use crate::loader::ModelLoader;
use crate::models::{ModelPurpose, ModelType};
use crate::sampler::build_sampler;
use crate::stream::Streamer;
use crate::tokenizer::Tokenizer;

/// Uniform capability surface every model family must provide
pub trait CausalTransformer {
    /// Run the block stack over `input_ids` whose first absolute position is
    /// `n_past`
    ///
    /// Chat models return logits for the **last** position only, shape
    /// `[vocab_size]`; embedding and ranker stacks return their own output
    /// shapes. Post-condition: the KV cache advances by exactly
    /// `input_ids.len()` entries.
    fn forward(
        &mut self,
        ctx: &mut ForwardContext,
        input_ids: &[i32],
        n_past: usize,
    ) -> Result<Vec<f32>>;

    /// Discard the oldest `shift` cached positions out of `total`,
    /// compacting the remainder
    fn shift_cache(&mut self, shift: usize, total: usize);

    /// Prompt-length hint for families using absolute positional indexing
    fn set_ctx(&mut self, n_ctx: usize);

    /// Parameter count; with `effective_only`, mixture models report only
    /// the experts active per token
    fn param_num(&self, effective_only: bool) -> u64;

    /// Populate parameter tensors from the file's tensor blob
    ///
    /// # Errors
    ///
    /// Returns an error on any tensor name, shape, or dtype mismatch.
    fn load(&mut self, loader: &mut ModelLoader) -> Result<()>;
}

/// Everything one `generate` call produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOutput {
    /// Prompt tokens followed by every kept sampled token
    pub output_ids: Vec<i32>,
    /// A terminal token or an abort ended the call; false when the length
    /// cap ran out first
    pub completed: bool,
    /// The call was cut short by the abort flag or a degenerate sampler
    pub aborted: bool,
}

/// Caller-facing model interface returned by the loader
pub trait Model {
    /// Model family tag
    fn model_type(&self) -> ModelType;

    /// What this model produces
    fn purpose(&self) -> ModelPurpose {
        self.model_type().purpose()
    }

    /// The context limit this instance was loaded with
    fn max_length(&self) -> usize;

    /// Parameter count
    fn param_num(&self, effective_only: bool) -> u64;

    /// Seed used for every subsequent `generate` call's sampler
    fn set_seed(&mut self, seed: u64);

    /// Flag another thread may set to stop generation between iterations
    fn abort_handle(&self) -> Arc<AtomicBool>;

    /// Tokens currently folded into the KV cache
    fn n_past(&self) -> usize;

    /// The family's chat encoder, for chat-purpose models
    fn history_encoder(&self) -> Option<&dyn HistoryEncoder>;

    /// Autoregressive decoding; see [`GenerationEngine::generate`]
    fn generate(
        &mut self,
        input_ids: &[i32],
        gen_config: &GenerationConfig,
        continuous: bool,
        streamer: Option<&mut dyn Streamer>,
    ) -> Result<GenerateOutput>;

    /// One forward pass returning a fixed-size embedding vector
    fn text_embedding(
        &mut self,
        gen_config: &GenerationConfig,
        input_ids: &[i32],
    ) -> Result<Vec<f32>>;

    /// One forward pass returning a scalar relevance score
    fn qa_rank(&mut self, gen_config: &GenerationConfig, input_ids: &[i32]) -> Result<f32>;

    /// Keep only the newest `keep` cached tokens; no-op when `keep ≥ n_past`
    fn shift_memory(&mut self, keep: usize);
}

/// True when `output_ids` ends with `pattern`
#[must_use]
pub fn match_output_sequence(output_ids: &[i32], pattern: &[i32]) -> bool {
    output_ids.len() >= pattern.len() && output_ids.ends_with(pattern)
}

/// Termination probe result
struct Termination {
    completed: bool,
    keep_idx: usize,
    pop_output: usize,
}

/// The generation loop bound to one transformer instance
///
/// Generic over the family's block stack; the loader erases the type behind
/// [`Model`].
pub struct GenerationEngine<T: CausalTransformer> {
    model_type: ModelType,
    config: BaseConfig,
    transformer: T,
    tokenizer: Arc<dyn Tokenizer>,
    encoder: Option<Box<dyn HistoryEncoder>>,
    n_past: usize,
    n_past_offset: usize,
    seed: u64,
    abort: Arc<AtomicBool>,
    /// Family-specific logit multiplier; non-positive means disabled
    logit_scale: f32,
    terminate_token_id: Option<i32>,
    stop_sequences: Vec<Vec<i32>>,
    mem_size: usize,
    scratch_size: usize,
}

impl<T: CausalTransformer> GenerationEngine<T> {
    /// Bind an engine to a loaded transformer and its tokenizer
    ///
    /// `mem_size` and `scratch_size` bound per-forward allocation; they must
    /// be adequate for `config.max_length` at batch one.
    #[must_use]
    pub fn new(
        model_type: ModelType,
        config: BaseConfig,
        transformer: T,
        tokenizer: Arc<dyn Tokenizer>,
        mem_size: usize,
        scratch_size: usize,
    ) -> Self {
        Self {
            model_type,
            config,
            transformer,
            tokenizer,
            encoder: None,
            n_past: 0,
            n_past_offset: 0,
            seed: 0,
            abort: Arc::new(AtomicBool::new(false)),
            logit_scale: -1.0,
            terminate_token_id: None,
            stop_sequences: Vec::new(),
            mem_size,
            scratch_size,
        }
    }

    /// Attach the family's chat encoder
    #[must_use]
    pub fn with_encoder(mut self, encoder: Box<dyn HistoryEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Scale logits before sampling (non-positive disables)
    #[must_use]
    pub fn with_logit_scale(mut self, logit_scale: f32) -> Self {
        self.logit_scale = logit_scale;
        self
    }

    /// Recognize a family-specific terminal token alongside EOS
    #[must_use]
    pub fn with_terminate_token(mut self, token_id: i32) -> Self {
        self.terminate_token_id = Some(token_id);
        self
    }

    /// Recognize a multi-token terminal pattern
    #[must_use]
    pub fn with_stop_sequence(mut self, pattern: Vec<i32>) -> Self {
        if !pattern.is_empty() {
            self.stop_sequences.push(pattern);
        }
        self
    }

    /// Borrow the underlying transformer (inspection, tests)
    #[must_use]
    pub fn transformer(&self) -> &T {
        &self.transformer
    }

    /// One forward pass with scoped arenas; releases scratch on every exit
    /// path
    fn run_model(
        &mut self,
        input_ids: &[i32],
        gen_config: &GenerationConfig,
        past: usize,
    ) -> Result<Vec<f32>> {
        let n_threads = resolve_thread_count(input_ids.len(), gen_config.num_threads);
        let mut ctx = ForwardContext::new(self.mem_size, self.scratch_size, n_threads);
        let mut output = self.transformer.forward(&mut ctx, input_ids, past)?;
        if self.logit_scale > 0.0 {
            for logit in &mut output {
                *logit *= self.logit_scale;
            }
        }
        Ok(output)
    }

    /// Forward the pending input and return logits for the next position
    fn generate_next_token(
        &mut self,
        curr_input_ids: &[i32],
        gen_config: &GenerationConfig,
    ) -> Result<Vec<f32>> {
        if gen_config.batch_prefill {
            self.run_model(curr_input_ids, gen_config, self.n_past + self.n_past_offset)
        } else {
            // One token at a time, for stacks that cannot take multi-token
            // batches during prefill.
            let mut past = self.n_past + self.n_past_offset;
            let mut logits = Vec::new();
            for &id in curr_input_ids {
                logits = self.run_model(&[id], gen_config, past)?;
                past += 1;
            }
            Ok(logits)
        }
    }

    /// Probe the tail of `output_ids` for a terminal condition
    fn is_output_terminated(&self, output_ids: &[i32]) -> Termination {
        let len = output_ids.len();
        let Some(&last) = output_ids.last() else {
            return Termination {
                completed: false,
                keep_idx: 0,
                pop_output: 0,
            };
        };

        if self.terminate_token_id == Some(last) || last == self.tokenizer.eos_token_id() {
            return Termination {
                completed: true,
                keep_idx: 0,
                pop_output: 1,
            };
        }

        for pattern in &self.stop_sequences {
            if match_output_sequence(output_ids, pattern) {
                return Termination {
                    completed: true,
                    keep_idx: 0,
                    pop_output: pattern.len(),
                };
            }
        }

        // Hold back a tail that could still grow into a stop pattern so a
        // terminal sequence is never partially streamed.
        let mut holdback = 0usize;
        for pattern in &self.stop_sequences {
            for prefix_len in (1..pattern.len()).rev() {
                if prefix_len <= len && output_ids[len - prefix_len..] == pattern[..prefix_len] {
                    holdback = holdback.max(prefix_len);
                    break;
                }
            }
        }
        Termination {
            completed: false,
            keep_idx: len - holdback,
            pop_output: 0,
        }
    }
}

impl<T: CausalTransformer> Model for GenerationEngine<T> {
    fn model_type(&self) -> ModelType {
        self.model_type
    }

    fn max_length(&self) -> usize {
        self.config.max_length as usize
    }

    fn param_num(&self, effective_only: bool) -> u64 {
        self.transformer.param_num(effective_only)
    }

    fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    fn n_past(&self) -> usize {
        self.n_past
    }

    fn history_encoder(&self) -> Option<&dyn HistoryEncoder> {
        self.encoder.as_deref()
    }

    /// Decode until a terminal state
    ///
    /// With `continuous` false the conversation starts fresh (`n_past = 0`);
    /// otherwise the KV cache from the previous call is reused and only the
    /// new tokens are forwarded. Returns the prompt plus every kept token;
    /// the streamer, when present, receives exactly the non-prompt,
    /// non-terminal tokens in sampling order followed by one `end` call.
    ///
    /// # Errors
    ///
    /// [`CharlarError::MaxLengthExceeded`] before any work when the request
    /// exceeds the model cap; arena errors propagate from the forward pass.
    fn generate(
        &mut self,
        input_ids: &[i32],
        gen_config: &GenerationConfig,
        continuous: bool,
        mut streamer: Option<&mut dyn Streamer>,
    ) -> Result<GenerateOutput> {
        if gen_config.max_length > self.config.max_length as usize {
            return Err(CharlarError::MaxLengthExceeded {
                requested: gen_config.max_length,
                model_max: self.config.max_length as usize,
            });
        }

        let mut sampler = build_sampler(gen_config, self.seed);
        sampler.reset();
        self.abort.store(false, Ordering::SeqCst);

        let mut curr_input_ids = input_ids.to_vec();
        let mut output_ids = Vec::with_capacity(gen_config.max_length);
        output_ids.extend_from_slice(input_ids);

        if !continuous {
            self.n_past = 0;
        }
        let mut completed = false;
        let mut aborted = false;

        self.transformer.set_ctx(input_ids.len());
        let mut next_output_idx = input_ids.len();

        while !aborted && !completed && self.n_past + curr_input_ids.len() < gen_config.max_length
        {
            if self.abort.load(Ordering::SeqCst) {
                aborted = true;
                break;
            }

            let mut logits = self.generate_next_token(&curr_input_ids, gen_config)?;
            let Some(next_token_id) = sampler.sample(&mut logits) else {
                aborted = true;
                break;
            };

            self.n_past += curr_input_ids.len();
            curr_input_ids.clear();
            curr_input_ids.push(next_token_id);

            output_ids.push(next_token_id);
            let term = self.is_output_terminated(&output_ids);
            let mut keep_idx = term.keep_idx;
            if term.completed {
                for _ in 0..term.pop_output {
                    output_ids.pop();
                }
                keep_idx = output_ids.len();
                completed = true;
            }

            if let Some(streamer) = streamer.as_mut() {
                let keep = keep_idx.min(output_ids.len());
                if next_output_idx < keep {
                    streamer.put(&output_ids[next_output_idx..keep]);
                    next_output_idx = keep;
                }
            }
        }

        // The caller observes a single terminal state.
        if aborted && !completed {
            completed = true;
        }
        if let Some(streamer) = streamer.as_mut() {
            streamer.end();
        }

        Ok(GenerateOutput {
            output_ids,
            completed,
            aborted,
        })
    }

    fn text_embedding(
        &mut self,
        gen_config: &GenerationConfig,
        input_ids: &[i32],
    ) -> Result<Vec<f32>> {
        self.run_model(input_ids, gen_config, 0)
    }

    fn qa_rank(&mut self, gen_config: &GenerationConfig, input_ids: &[i32]) -> Result<f32> {
        let output = self.run_model(input_ids, gen_config, 0)?;
        if output.len() != 1 {
            return Err(CharlarError::OutputShapeMismatch {
                expected: 1,
                actual: output.len(),
            });
        }
        Ok(output[0])
    }

    fn shift_memory(&mut self, keep: usize) {
        if keep >= self.n_past {
            return;
        }
        self.transformer.shift_cache(self.n_past - keep, self.n_past);
        // The cache now holds `keep` compacted rows; subsequent forwards
        // must land right after them, so the position clock rewinds with
        // n_past rather than being offset back up. This is what keeps the
        // window reusable: positions stay within the cache capacity no
        // matter how often the window slides.
        self.n_past = keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::CollectorStreamer;
    use crate::testing::{test_base_config, test_tokenizer, ScriptedTransformer};

    fn engine_with_logits(logits: Vec<f32>) -> GenerationEngine<ScriptedTransformer> {
        let config = test_base_config(logits.len(), 16);
        let tokenizer = test_tokenizer(&config);
        GenerationEngine::new(
            ModelType::Llama2,
            config,
            ScriptedTransformer::new(logits),
            tokenizer,
            1 << 20,
            1 << 20,
        )
    }

    #[test]
    fn greedy_eos_stop_pops_terminal_token() {
        // argmax is 4 == EOS: popped from the output, never streamed.
        let mut engine = engine_with_logits(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut streamer = CollectorStreamer::new();
        let out = engine
            .generate(&[0], &GenerationConfig::new(16), false, Some(&mut streamer))
            .unwrap();
        assert_eq!(out.output_ids, vec![0]);
        assert!(out.completed);
        assert!(!out.aborted);
        assert!(streamer.tokens.is_empty());
        assert!(streamer.ended);
    }

    #[test]
    fn max_length_caps_output() {
        // argmax is 1, never terminal; the cap bounds n_past + pending.
        let mut engine = engine_with_logits(vec![1.0, 5.0, 3.0, 2.0, 1.0]);
        let mut streamer = CollectorStreamer::new();
        let config = GenerationConfig::new(4);
        let out = engine
            .generate(&[1], &config, false, Some(&mut streamer))
            .unwrap();
        assert_eq!(out.output_ids, vec![1, 1, 1, 1]);
        assert_eq!(streamer.tokens, vec![1, 1, 1]);
        // The cap ran out; nothing terminal was seen.
        assert!(!out.completed);
        assert_eq!(engine.n_past(), 3);
    }

    #[test]
    fn precondition_rejects_oversized_request() {
        let mut engine = engine_with_logits(vec![0.0; 5]);
        let err = engine
            .generate(&[0], &GenerationConfig::new(64), false, None)
            .unwrap_err();
        assert!(matches!(err, CharlarError::MaxLengthExceeded { .. }));
    }

    #[test]
    fn prompt_prefix_is_preserved() {
        let mut engine = engine_with_logits(vec![1.0, 5.0, 3.0, 2.0, 1.0]);
        let prompt = vec![3, 2, 0];
        let out = engine
            .generate(&prompt, &GenerationConfig::new(8), false, None)
            .unwrap();
        assert!(out.output_ids.len() >= prompt.len());
        assert_eq!(&out.output_ids[..prompt.len()], &prompt[..]);
    }

    #[test]
    fn greedy_is_deterministic() {
        let mut a = engine_with_logits(vec![0.3, 0.1, 2.0, 0.7, 0.2]);
        let mut b = engine_with_logits(vec![0.3, 0.1, 2.0, 0.7, 0.2]);
        let config = GenerationConfig::new(8);
        let out_a = a.generate(&[0], &config, false, None).unwrap();
        let out_b = b.generate(&[0], &config, false, None).unwrap();
        assert_eq!(out_a.output_ids, out_b.output_ids);
    }

    #[test]
    fn terminate_token_stops_like_eos() {
        let mut engine = engine_with_logits(vec![1.0, 5.0, 3.0, 2.0, 1.0]).with_terminate_token(1);
        let out = engine
            .generate(&[0], &GenerationConfig::new(8), false, None)
            .unwrap();
        assert_eq!(out.output_ids, vec![0]);
        assert!(out.completed);
    }

    #[test]
    fn stop_sequence_is_popped_whole() {
        // Script: emit 3, 1, 3, 1, ... ; stop on [3, 1].
        let mut engine = GenerationEngine::new(
            ModelType::Llama2,
            test_base_config(5, 16),
            ScriptedTransformer::cycling(vec![
                vec![0.0, 0.0, 0.0, 9.0, 0.0],
                vec![0.0, 9.0, 0.0, 0.0, 0.0],
            ]),
            test_tokenizer(&test_base_config(5, 16)),
            1 << 20,
            1 << 20,
        )
        .with_stop_sequence(vec![3, 1]);
        let mut streamer = CollectorStreamer::new();
        let out = engine
            .generate(&[0], &GenerationConfig::new(16), false, Some(&mut streamer))
            .unwrap();
        assert_eq!(out.output_ids, vec![0]);
        assert!(out.completed);
        // The 3 was held back as a possible pattern prefix and never
        // streamed.
        assert!(streamer.tokens.is_empty());
    }

    #[test]
    fn abort_mid_stream_keeps_streamed_tokens() {
        struct AbortAfter {
            inner: CollectorStreamer,
            flag: Arc<AtomicBool>,
            after: usize,
        }
        impl Streamer for AbortAfter {
            fn put(&mut self, tokens: &[i32]) {
                self.inner.put(tokens);
                if self.inner.tokens.len() >= self.after {
                    self.flag.store(true, Ordering::SeqCst);
                }
            }
            fn end(&mut self) {
                self.inner.end();
            }
        }

        let mut engine = engine_with_logits(vec![1.0, 5.0, 3.0, 2.0, 1.0]);
        let mut streamer = AbortAfter {
            inner: CollectorStreamer::new(),
            flag: engine.abort_handle(),
            after: 3,
        };
        let out = engine
            .generate(&[0], &GenerationConfig::new(16), false, Some(&mut streamer))
            .unwrap();
        assert!(out.completed);
        assert!(out.aborted);
        assert_eq!(streamer.inner.tokens, vec![1, 1, 1]);
        assert_eq!(out.output_ids, vec![0, 1, 1, 1]);
    }

    #[test]
    fn continuous_forwards_only_new_tokens() {
        let mut engine = engine_with_logits(vec![1.0, 5.0, 3.0, 2.0, 1.0]);
        let config = GenerationConfig::new(6);
        let first = engine.generate(&[0, 2], &config, false, None).unwrap();
        let past_after_first = engine.n_past();
        assert_eq!(past_after_first, 5);
        assert_eq!(first.output_ids.len(), 6);

        engine
            .generate(&[4], &GenerationConfig::new(8), true, None)
            .unwrap();
        // The continuation forwarded only the new token: the first call of
        // the second generate starts at the retained n_past.
        let (cont_ids, cont_past) = engine
            .transformer()
            .calls
            .iter()
            .find(|(_, past)| *past == past_after_first)
            .expect("continuation call present");
        assert_eq!(cont_ids, &[4]);
        assert_eq!(*cont_past, 5);
    }

    #[test]
    fn fresh_call_resets_n_past() {
        let mut engine = engine_with_logits(vec![1.0, 5.0, 3.0, 2.0, 1.0]);
        let config = GenerationConfig::new(6);
        engine.generate(&[0, 2], &config, false, None).unwrap();
        assert!(engine.n_past() > 0);
        engine.generate(&[0], &config, false, None).unwrap();
        // The second call restarted from zero: its first forward is at past
        // 0 again.
        let restart = engine
            .transformer()
            .calls
            .iter()
            .filter(|(_, past)| *past == 0)
            .count();
        assert_eq!(restart, 2);
    }

    #[test]
    fn incremental_prefill_walks_one_token_at_a_time() {
        let mut engine = engine_with_logits(vec![1.0, 5.0, 3.0, 2.0, 1.0]);
        let config = GenerationConfig::new(5).with_batch_prefill(false);
        engine.generate(&[0, 2, 3], &config, false, None).unwrap();
        let calls = &engine.transformer().calls;
        assert_eq!(calls[0], (vec![0], 0));
        assert_eq!(calls[1], (vec![2], 1));
        assert_eq!(calls[2], (vec![3], 2));
        assert!(calls.iter().all(|(ids, _)| ids.len() == 1));
    }

    #[test]
    fn shift_memory_compacts_and_rewinds_positions() {
        let mut engine = engine_with_logits(vec![1.0, 5.0, 3.0, 2.0, 1.0]);
        let config = GenerationConfig::new(6);
        engine.generate(&[0, 2], &config, false, None).unwrap();
        let before = engine.n_past();
        engine.shift_memory(before + 1); // no-op
        assert_eq!(engine.n_past(), before);
        assert!(engine.transformer().shifts.is_empty());
        engine.shift_memory(2);
        assert_eq!(engine.n_past(), 2);
        assert_eq!(engine.transformer().shifts, vec![(before - 2, before)]);
        // The continuation lands directly after the compacted rows, not at
        // the pre-shift position.
        engine
            .generate(&[4], &GenerationConfig::new(6), true, None)
            .unwrap();
        let (_, past) = engine
            .transformer()
            .calls
            .iter()
            .rev()
            .find(|(ids, _)| ids == &[4])
            .unwrap();
        assert_eq!(*past, 2);
    }

    #[test]
    fn qa_rank_requires_scalar_output() {
        let mut engine = engine_with_logits(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let err = engine
            .qa_rank(&GenerationConfig::new(8), &[0, 1])
            .unwrap_err();
        assert!(matches!(err, CharlarError::OutputShapeMismatch { .. }));

        let mut engine = engine_with_logits(vec![0.75]);
        let score = engine.qa_rank(&GenerationConfig::new(8), &[0, 1]).unwrap();
        assert!((score - 0.75).abs() < 1e-6);
    }

    #[test]
    fn match_output_sequence_is_suffix_match() {
        assert!(match_output_sequence(&[5, 6, 7], &[6, 7]));
        assert!(!match_output_sequence(&[5, 6, 7], &[5, 6]));
        assert!(!match_output_sequence(&[7], &[6, 7]));
    }
}
