//! Token sampling strategies
//!
//! Every sampler maps a logit vector to the next token id, or to `None` when
//! the candidate set degenerates to nothing after filtering. Three variants
//! are provided:
//!
//! - **Greedy**: arg-max, no state
//! - **Top-p (nucleus)**: top-k pre-filter, softmax, cumulative cutoff
//! - **Tail-free**: truncate where the second difference of the sorted
//!   distribution flattens out
//!
//! The non-greedy variants share temperature scaling, a presence penalty over
//! the ids emitted so far in the current generation, and a seeded PRNG, so
//! that a fixed `(seed, config, logits)` triple always reproduces the same
//! token.

use std::collections::HashSet;

use crate::config::{GenerationConfig, SamplingKind};

/// A candidate token and its running score
///
/// Scores start as (scaled, penalized) logits and become probabilities once
/// [`softmax_in_place`] has run over the candidate buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenIdScore {
    /// Vocabulary id
    pub id: i32,
    /// Current score
    pub score: f32,
}

/// Descending score order, ties broken by ascending id
fn by_score_desc(a: &TokenIdScore, b: &TokenIdScore) -> std::cmp::Ordering {
    b.score.total_cmp(&a.score).then(a.id.cmp(&b.id))
}

/// Numerically stable in-place softmax over a candidate buffer
///
/// Computes `exp(s - max(s))` normalized by the sum; never overflows for
/// finite inputs. After the call all scores are non-negative and sum to 1
/// (within rounding).
pub(crate) fn softmax_in_place(scores: &mut [TokenIdScore]) {
    let max_score = scores
        .iter()
        .map(|t| t.score)
        .fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for t in scores.iter_mut() {
        let s = (t.score - max_score).exp();
        t.score = s;
        sum += s;
    }
    let inv_sum = 1.0 / sum;
    for t in scores.iter_mut() {
        t.score *= inv_sum;
    }
}

/// 64-bit linear congruential generator
///
/// Deterministic and cheap; the high bits feed the weighted draw. Knuth's
/// MMIX multiplier.
#[derive(Debug, Clone)]
struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0, 1)
    fn next_f32(&mut self) -> f32 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1);
        (self.state >> 33) as f32 / (1u64 << 31) as f32
    }
}

/// Common sampler interface
///
/// A sampler lives for exactly one `generate` call; the engine seeds it once
/// and calls [`Sampler::sample`] per decoded token. `None` signals that no
/// candidate survived filtering and the engine should stop.
pub trait Sampler {
    /// Re-seed the PRNG
    fn seed(&mut self, seed: u64);

    /// Forget the emitted-token memory
    fn reset(&mut self);

    /// Pick the next token id from a logit vector
    ///
    /// The logits are modified in place (temperature, penalty) as a side
    /// effect.
    fn sample(&mut self, logits: &mut [f32]) -> Option<i32>;
}

/// Arg-max sampler; stateless
#[derive(Debug, Default)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn seed(&mut self, _seed: u64) {}

    fn reset(&mut self) {}

    fn sample(&mut self, logits: &mut [f32]) -> Option<i32> {
        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for (i, &score) in logits.iter().enumerate() {
            if score > best_score {
                best_score = score;
                best = i;
            }
        }
        if logits.is_empty() {
            None
        } else {
            Some(best as i32)
        }
    }
}

/// State shared by the non-greedy samplers
///
/// Carries the reusable candidate buffer, the emitted-id set backing the
/// presence penalty, and the PRNG.
#[derive(Debug)]
struct NucleusCore {
    temp_enabled: bool,
    inv_temp: f32,
    penalty_enabled: bool,
    presence_penalty: f32,
    inv_presence_penalty: f32,
    top_k: i32,
    scores: Vec<TokenIdScore>,
    emitted: HashSet<i32>,
    rng: Lcg64,
}

impl NucleusCore {
    fn from_config(config: &GenerationConfig) -> Self {
        let temp_enabled = config.temperature_enabled();
        let penalty_enabled = config.presence_penalty_enabled();
        Self {
            temp_enabled,
            inv_temp: if temp_enabled {
                1.0 / config.temperature
            } else {
                0.0
            },
            penalty_enabled,
            presence_penalty: config.presence_penalty,
            inv_presence_penalty: if penalty_enabled {
                1.0 / config.presence_penalty
            } else {
                0.0
            },
            top_k: config.top_k,
            scores: Vec::new(),
            emitted: HashSet::new(),
            rng: Lcg64::new(0),
        }
    }

    /// Scale, penalize, and pre-filter the logits into the candidate buffer
    fn prepare(&mut self, logits: &mut [f32]) {
        if self.temp_enabled {
            for logit in logits.iter_mut() {
                *logit *= self.inv_temp;
            }
        }

        if self.penalty_enabled {
            for (id, logit) in logits.iter_mut().enumerate() {
                if self.emitted.contains(&(id as i32)) {
                    // Push the score down whichever sign it has: divide
                    // positive logits, multiply non-positive ones.
                    *logit *= if *logit > 0.0 {
                        self.inv_presence_penalty
                    } else {
                        self.presence_penalty
                    };
                }
            }
        }

        self.scores.clear();
        self.scores.reserve(logits.len());
        self.scores.extend(
            logits
                .iter()
                .enumerate()
                .map(|(id, &score)| TokenIdScore {
                    id: id as i32,
                    score,
                }),
        );

        let k = self.top_k;
        if k > 0 && (k as usize) < self.scores.len() {
            let k = k as usize;
            // Partition-select: the first k entries hold the k best scores,
            // unordered within the prefix.
            self.scores.select_nth_unstable_by(k - 1, by_score_desc);
            self.scores.truncate(k);
        }
    }

    /// Weighted draw over the surviving candidates
    fn finish(&mut self) -> Option<i32> {
        if self.scores.is_empty() {
            return None;
        }
        let idx = self.draw();
        let id = self.scores[idx].id;
        self.emitted.insert(id);
        Some(id)
    }

    /// Discrete-distribution draw; weights need not be normalized
    fn draw(&mut self) -> usize {
        let total: f32 = self.scores.iter().map(|t| t.score).sum();
        if total <= 0.0 || !total.is_finite() {
            return 0;
        }
        let r = self.rng.next_f32() * total;
        let mut cumulative = 0.0f32;
        for (i, t) in self.scores.iter().enumerate() {
            cumulative += t.score;
            if r < cumulative {
                return i;
            }
        }
        self.scores.len() - 1
    }
}

/// Nucleus (top-p) sampler
pub struct TopPSampler {
    core: NucleusCore,
    top_p: f32,
}

impl TopPSampler {
    /// Build from a generation config
    #[must_use]
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            core: NucleusCore::from_config(config),
            top_p: config.top_p,
        }
    }
}

impl Sampler for TopPSampler {
    fn seed(&mut self, seed: u64) {
        self.core.rng = Lcg64::new(seed);
    }

    fn reset(&mut self) {
        self.core.emitted.clear();
    }

    fn sample(&mut self, logits: &mut [f32]) -> Option<i32> {
        self.core.prepare(logits);

        if 0.0 < self.top_p && self.top_p < 1.0 && !self.core.scores.is_empty() {
            self.core.scores.sort_unstable_by(by_score_desc);
            softmax_in_place(&mut self.core.scores);

            let mut cumsum = 0.0f32;
            for i in 0..self.core.scores.len() {
                cumsum += self.core.scores[i].score;
                if cumsum >= self.top_p {
                    self.core.scores.truncate(i + 1);
                    break;
                }
            }
        }

        if !self.core.scores.is_empty() {
            softmax_in_place(&mut self.core.scores);
        }
        self.core.finish()
    }
}

/// Tail-free sampler
///
/// Truncates the sorted distribution where the absolute second difference,
/// normalized to a distribution, accumulates past `z`. With fewer than three
/// candidates the filter is a no-op.
///
/// Reference: <https://www.trentonbricken.com/Tail-Free-Sampling/>
pub struct TailFreeSampler {
    core: NucleusCore,
    z: f32,
    second_diff: Vec<f32>,
}

impl TailFreeSampler {
    /// Build from a generation config
    #[must_use]
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            core: NucleusCore::from_config(config),
            z: config.tfs_z,
            second_diff: Vec::new(),
        }
    }
}

impl Sampler for TailFreeSampler {
    fn seed(&mut self, seed: u64) {
        self.core.rng = Lcg64::new(seed);
    }

    fn reset(&mut self) {
        self.core.emitted.clear();
    }

    fn sample(&mut self, logits: &mut [f32]) -> Option<i32> {
        self.core.prepare(logits);

        if self.core.scores.len() >= 3 {
            softmax_in_place(&mut self.core.scores);
            self.core.scores.sort_unstable_by(by_score_desc);

            let scores = &self.core.scores;
            self.second_diff.clear();
            self.second_diff.extend(
                (0..scores.len() - 2)
                    .map(|i| scores[i].score + scores[i + 2].score - 2.0 * scores[i + 1].score),
            );

            // abs, then normalize; the 1e-6 floor keeps flat distributions
            // from dividing by zero
            let mut sum = 1e-6f32;
            for d in &mut self.second_diff {
                *d = d.abs();
                sum += *d;
            }
            for d in &mut self.second_diff {
                *d /= sum;
            }

            let mut cdf = 0.0f32;
            for (i, &d) in self.second_diff.iter().enumerate() {
                cdf += d;
                if cdf > self.z {
                    self.core.scores.truncate(i + 1);
                    break;
                }
            }
        }

        self.core.finish()
    }
}

/// Build the sampler a generation call asked for
///
/// `do_sample == false` forces greedy regardless of the variant field. The
/// returned sampler is already seeded.
#[must_use]
pub fn build_sampler(config: &GenerationConfig, seed: u64) -> Box<dyn Sampler> {
    let mut sampler: Box<dyn Sampler> = if config.do_sample {
        match config.sampling {
            SamplingKind::Greedy => Box::new(GreedySampler),
            SamplingKind::TopP => Box::new(TopPSampler::new(config)),
            SamplingKind::Tfs => Box::new(TailFreeSampler::new(config)),
        }
    } else {
        Box::new(GreedySampler)
    };
    sampler.seed(seed);
    sampler
}
