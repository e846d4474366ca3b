//! Model and generation configuration
//!
//! [`BaseConfig`] is the fixed record every model file carries right after
//! its header; [`GenerationConfig`] is the per-call knob set for
//! [`Model::generate`](crate::engine::Model::generate) and friends.

use serde::{Deserialize, Serialize};

use crate::error::{CharlarError, Result};
use crate::loader::ModelLoader;

/// Values within this distance of 1.0 disable the corresponding transform
pub const DISABLE_EPSILON: f32 = 1e-5;

/// Shared model hyperparameters stored in the file as ten little-endian i32s
///
/// Families may read additional fields after this record; the base record
/// layout never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Vocabulary size
    pub vocab_size: i32,
    /// Model (residual stream) width
    pub hidden_size: i32,
    /// Number of attention heads
    pub num_attention_heads: i32,
    /// Number of transformer layers
    pub num_hidden_layers: i32,
    /// Feed-forward inner width
    pub intermediate_size: i32,
    /// Maximum sequence length the KV cache is sized for
    pub max_length: i32,
    /// Begin-of-sequence token id
    pub bos_token_id: i32,
    /// End-of-sequence token id
    pub eos_token_id: i32,
    /// Padding token id
    pub pad_token_id: i32,
    /// Separator token id
    pub sep_token_id: i32,
}

impl BaseConfig {
    /// Read the record from the loader's current position
    ///
    /// When `max_length_override` is positive it replaces the file value.
    /// The override can only lower the limit; a larger value is clamped to
    /// the file value.
    ///
    /// # Errors
    ///
    /// Returns an error if the file ends inside the record.
    pub fn read(loader: &mut ModelLoader, max_length_override: Option<usize>) -> Result<Self> {
        let mut config = Self {
            vocab_size: loader.read_i32()?,
            hidden_size: loader.read_i32()?,
            num_attention_heads: loader.read_i32()?,
            num_hidden_layers: loader.read_i32()?,
            intermediate_size: loader.read_i32()?,
            max_length: loader.read_i32()?,
            bos_token_id: loader.read_i32()?,
            eos_token_id: loader.read_i32()?,
            pad_token_id: loader.read_i32()?,
            sep_token_id: loader.read_i32()?,
        };
        if let Some(cap) = max_length_override {
            if cap > 0 && (cap as i32) < config.max_length {
                config.max_length = cap as i32;
            }
        }
        if config.vocab_size <= 0 || config.hidden_size <= 0 || config.num_hidden_layers < 0 {
            return Err(CharlarError::Malformed {
                reason: format!(
                    "non-positive dimensions in config: vocab {}, hidden {}",
                    config.vocab_size, config.hidden_size
                ),
            });
        }
        Ok(config)
    }

    /// Head width in the attention blocks
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size as usize / self.num_attention_heads as usize
    }
}

/// Sampling algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingKind {
    /// Always take the arg-max token
    Greedy,
    /// Nucleus (top-p) sampling
    TopP,
    /// Tail-free sampling
    Tfs,
}

impl SamplingKind {
    /// Parse the on-the-wire name used in configuration files
    ///
    /// # Errors
    ///
    /// Returns [`CharlarError::UnknownSampling`] for unrecognized names.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "greedy" => Ok(Self::Greedy),
            "top_p" => Ok(Self::TopP),
            "tfs" => Ok(Self::Tfs),
            other => Err(CharlarError::UnknownSampling(other.to_string())),
        }
    }
}

/// Per-call generation options
///
/// # Example
///
/// ```
/// use charlar::config::{GenerationConfig, SamplingKind};
///
/// let config = GenerationConfig::new(512)
///     .with_sampling(SamplingKind::TopP)
///     .with_temperature(0.7)
///     .with_top_k(40)
///     .with_top_p(0.9);
/// assert!(config.do_sample);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Hard cap on `n_past + produced tokens`; must not exceed the model's
    /// own `max_length`
    pub max_length: usize,
    /// When false, sampling is forced to greedy regardless of `sampling`
    pub do_sample: bool,
    /// Sampler variant used when `do_sample` is true
    pub sampling: SamplingKind,
    /// Logit scaling; values within 1e-5 of 1.0 disable scaling
    pub temperature: f32,
    /// Multiplicative penalty on already-emitted ids; values within 1e-5 of
    /// 1.0 disable it
    pub presence_penalty: f32,
    /// Keep only the k best-scored candidates before the variant filter;
    /// 0 disables
    pub top_k: i32,
    /// Nucleus threshold; values outside (0, 1) disable it
    pub top_p: f32,
    /// Tail-free sampling cumulative threshold
    pub tfs_z: f32,
    /// Compute thread hint for the forward pass
    pub num_threads: usize,
    /// Prefill the whole pending input in one forward (true) or one token at
    /// a time (false)
    pub batch_prefill: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self::new(2048)
    }
}

impl GenerationConfig {
    /// Create a config with the given length cap and greedy sampling
    #[must_use]
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            do_sample: false,
            sampling: SamplingKind::Greedy,
            temperature: 1.0,
            presence_penalty: 1.0,
            top_k: 0,
            top_p: 0.7,
            tfs_z: 0.95,
            num_threads: 1,
            batch_prefill: true,
        }
    }

    /// Enable sampling with the given variant
    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingKind) -> Self {
        self.sampling = sampling;
        self.do_sample = sampling != SamplingKind::Greedy;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set presence penalty
    #[must_use]
    pub fn with_presence_penalty(mut self, presence_penalty: f32) -> Self {
        self.presence_penalty = presence_penalty;
        self
    }

    /// Set top-k pre-filter
    #[must_use]
    pub fn with_top_k(mut self, top_k: i32) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set nucleus threshold
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set tail-free threshold
    #[must_use]
    pub fn with_tfs_z(mut self, tfs_z: f32) -> Self {
        self.tfs_z = tfs_z;
        self
    }

    /// Set compute thread hint
    #[must_use]
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Select one-token-at-a-time prefill
    #[must_use]
    pub fn with_batch_prefill(mut self, batch_prefill: bool) -> Self {
        self.batch_prefill = batch_prefill;
        self
    }

    /// True when temperature scaling is active
    #[must_use]
    pub fn temperature_enabled(&self) -> bool {
        (self.temperature - 1.0).abs() > DISABLE_EPSILON
    }

    /// True when the presence penalty is active
    #[must_use]
    pub fn presence_penalty_enabled(&self) -> bool {
        (self.presence_penalty - 1.0).abs() > DISABLE_EPSILON
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_kind_parse() {
        assert_eq!(SamplingKind::parse("greedy").unwrap(), SamplingKind::Greedy);
        assert_eq!(SamplingKind::parse("top_p").unwrap(), SamplingKind::TopP);
        assert_eq!(SamplingKind::parse("tfs").unwrap(), SamplingKind::Tfs);
        assert!(matches!(
            SamplingKind::parse("mirostat"),
            Err(CharlarError::UnknownSampling(_))
        ));
    }

    #[test]
    fn test_builder_enables_sampling() {
        let config = GenerationConfig::new(64).with_sampling(SamplingKind::Tfs);
        assert!(config.do_sample);
        let config = GenerationConfig::new(64).with_sampling(SamplingKind::Greedy);
        assert!(!config.do_sample);
    }

    #[test]
    fn test_epsilon_disables() {
        let config = GenerationConfig::new(64).with_temperature(1.0 + 1e-6);
        assert!(!config.temperature_enabled());
        let config = config.with_temperature(0.7);
        assert!(config.temperature_enabled());
        let config = GenerationConfig::new(64).with_presence_penalty(1.0);
        assert!(!config.presence_penalty_enabled());
    }

    #[test]
    fn test_serde_round_trip() {
        let config = GenerationConfig::new(128)
            .with_sampling(SamplingKind::TopP)
            .with_top_p(0.9);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"top_p\""));
        let back: GenerationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
