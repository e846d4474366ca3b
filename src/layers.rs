//! Reference CPU decoder blocks
//!
//! Plain f32 building blocks for the llama-style decoder the registry
//! constructs: embedding lookup, linear projection, RMS normalization,
//! rotary multi-head attention over a per-layer KV cache, and a SwiGLU
//! feed-forward. No SIMD, no quantized dtypes, no GPU; heavy kernels live
//! behind the tensor backend this crate treats as external.
//!
//! All activation buffers come out of the [`ForwardContext`] arenas so a
//! pass stays within the budgets fixed at model construction.

use crate::config::BaseConfig;
use crate::context::ForwardContext;
use crate::engine::CausalTransformer;
use crate::error::Result;
use crate::loader::ModelLoader;

/// Default rotary embedding base frequency
pub const ROPE_THETA: f32 = 10_000.0;

/// Dense row-major matrix-vector product: `out[r] = weight[r, :] · x`
///
/// With more than one worker thread the output rows are chunked across
/// scoped threads; the kernel itself stays scalar.
pub(crate) fn matvec(weight: &[f32], x: &[f32], out: &mut [f32], n_threads: usize) {
    let in_dim = x.len();
    debug_assert_eq!(weight.len(), out.len() * in_dim);

    let dot = |row: &[f32]| -> f32 { row.iter().zip(x.iter()).map(|(w, v)| w * v).sum() };

    if n_threads <= 1 || out.len() < n_threads * 4 {
        for (r, o) in out.iter_mut().enumerate() {
            *o = dot(&weight[r * in_dim..(r + 1) * in_dim]);
        }
        return;
    }

    let chunk = out.len().div_ceil(n_threads);
    std::thread::scope(|scope| {
        for (c, out_chunk) in out.chunks_mut(chunk).enumerate() {
            let weight = &weight[c * chunk * in_dim..];
            scope.spawn(move || {
                for (r, o) in out_chunk.iter_mut().enumerate() {
                    let row = &weight[r * in_dim..(r + 1) * in_dim];
                    *o = row.iter().zip(x.iter()).map(|(w, v)| w * v).sum();
                }
            });
        }
    });
}

/// Numerically stable softmax over a plain slice
pub(crate) fn softmax_rows(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in x.iter_mut() {
        *v *= inv;
    }
}

/// Rotate the query/key row of one token in place
///
/// Pairs `(2i, 2i+1)` within each head turn by `pos / theta^(2i/head_dim)`.
fn rope_in_place(row: &mut [f32], n_heads: usize, head_dim: usize, pos: usize, theta: f32) {
    for h in 0..n_heads {
        let head = &mut row[h * head_dim..(h + 1) * head_dim];
        for i in 0..head_dim / 2 {
            let freq = theta.powf(-((2 * i) as f32) / head_dim as f32);
            let angle = pos as f32 * freq;
            let (sin, cos) = angle.sin_cos();
            let (a, b) = (head[2 * i], head[2 * i + 1]);
            head[2 * i] = a * cos - b * sin;
            head[2 * i + 1] = a * sin + b * cos;
        }
    }
}

/// Token embedding table, also usable as a tied LM head
#[derive(Debug, Clone)]
pub struct Embedding {
    /// Row-major `[vocab_size, hidden_size]` table
    pub weight: Vec<f32>,
    vocab_size: usize,
    hidden_size: usize,
}

impl Embedding {
    /// Zero-initialized table
    #[must_use]
    pub fn new(vocab_size: usize, hidden_size: usize) -> Self {
        Self {
            weight: vec![0.0; vocab_size * hidden_size],
            vocab_size,
            hidden_size,
        }
    }

    /// Gather rows for a batch of token ids
    pub fn forward(&self, ctx: &mut ForwardContext, input_ids: &[i32]) -> Result<Vec<f32>> {
        let mut out = ctx.alloc(input_ids.len() * self.hidden_size)?;
        for (t, &id) in input_ids.iter().enumerate() {
            let id = id as usize % self.vocab_size;
            out[t * self.hidden_size..(t + 1) * self.hidden_size]
                .copy_from_slice(&self.weight[id * self.hidden_size..(id + 1) * self.hidden_size]);
        }
        Ok(out)
    }

    /// Tied-head projection of one hidden row onto the vocabulary
    pub fn project(&self, ctx: &mut ForwardContext, hidden: &[f32]) -> Result<Vec<f32>> {
        let mut logits = ctx.alloc(self.vocab_size)?;
        matvec(&self.weight, hidden, &mut logits, ctx.n_threads());
        Ok(logits)
    }

    fn param_num(&self) -> u64 {
        self.weight.len() as u64
    }
}

/// Dense projection with optional bias
#[derive(Debug, Clone)]
pub struct Linear {
    /// Row-major `[out_dim, in_dim]` weight
    pub weight: Vec<f32>,
    /// Optional `[out_dim]` bias
    pub bias: Option<Vec<f32>>,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    /// Zero-initialized projection
    #[must_use]
    pub fn new(in_dim: usize, out_dim: usize, bias: bool) -> Self {
        Self {
            weight: vec![0.0; in_dim * out_dim],
            bias: bias.then(|| vec![0.0; out_dim]),
            in_dim,
            out_dim,
        }
    }

    /// Project `rows` packed input rows
    pub fn forward(&self, ctx: &mut ForwardContext, x: &[f32], rows: usize) -> Result<Vec<f32>> {
        let mut out = ctx.alloc(rows * self.out_dim)?;
        for r in 0..rows {
            let x_row = &x[r * self.in_dim..(r + 1) * self.in_dim];
            let out_row = &mut out[r * self.out_dim..(r + 1) * self.out_dim];
            matvec(&self.weight, x_row, out_row, ctx.n_threads());
            if let Some(bias) = &self.bias {
                for (o, b) in out_row.iter_mut().zip(bias.iter()) {
                    *o += b;
                }
            }
        }
        Ok(out)
    }

    fn param_num(&self) -> u64 {
        self.weight.len() as u64 + self.bias.as_ref().map_or(0, |b| b.len() as u64)
    }
}

/// Root-mean-square layer normalization
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// `[hidden_size]` gain
    pub weight: Vec<f32>,
    eps: f32,
}

impl RmsNorm {
    /// Gain initialized to one
    #[must_use]
    pub fn new(hidden_size: usize, eps: f32) -> Self {
        Self {
            weight: vec![1.0; hidden_size],
            eps,
        }
    }

    /// Normalize `rows` packed rows
    pub fn forward(&self, ctx: &mut ForwardContext, x: &[f32], rows: usize) -> Result<Vec<f32>> {
        let hidden = self.weight.len();
        let mut out = ctx.alloc(rows * hidden)?;
        for r in 0..rows {
            let x_row = &x[r * hidden..(r + 1) * hidden];
            let mean_sq = x_row.iter().map(|v| v * v).sum::<f32>() / hidden as f32;
            let scale = 1.0 / (mean_sq + self.eps).sqrt();
            for (i, o) in out[r * hidden..(r + 1) * hidden].iter_mut().enumerate() {
                *o = x_row[i] * scale * self.weight[i];
            }
        }
        Ok(out)
    }

    fn param_num(&self) -> u64 {
        self.weight.len() as u64
    }
}

/// Per-layer key/value store for autoregressive decoding
///
/// Rows are indexed by absolute position so a fresh conversation simply
/// overwrites from position zero; attention never reads past the current
/// position, so stale tail entries are harmless.
#[derive(Debug, Clone)]
pub struct KvCache {
    k: Vec<f32>,
    v: Vec<f32>,
    kv_dim: usize,
    capacity: usize,
}

impl KvCache {
    /// Cache sized for `capacity` positions of `kv_dim` floats each
    #[must_use]
    pub fn new(kv_dim: usize, capacity: usize) -> Self {
        Self {
            k: vec![0.0; kv_dim * capacity],
            v: vec![0.0; kv_dim * capacity],
            kv_dim,
            capacity,
        }
    }

    /// Write the key/value rows for one position
    pub fn store(&mut self, pos: usize, k_row: &[f32], v_row: &[f32]) {
        debug_assert!(pos < self.capacity, "KV cache overflow at position {pos}");
        let start = pos * self.kv_dim;
        self.k[start..start + self.kv_dim].copy_from_slice(k_row);
        self.v[start..start + self.kv_dim].copy_from_slice(v_row);
    }

    /// Positions this cache can hold
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Key row at a position
    #[must_use]
    pub fn key(&self, pos: usize) -> &[f32] {
        &self.k[pos * self.kv_dim..(pos + 1) * self.kv_dim]
    }

    /// Value row at a position
    #[must_use]
    pub fn value(&self, pos: usize) -> &[f32] {
        &self.v[pos * self.kv_dim..(pos + 1) * self.kv_dim]
    }

    /// Drop the oldest `shift` positions out of `total`, compacting the rest
    pub fn shift(&mut self, shift: usize, total: usize) {
        if shift == 0 || shift > total {
            return;
        }
        self.k
            .copy_within(shift * self.kv_dim..total * self.kv_dim, 0);
        self.v
            .copy_within(shift * self.kv_dim..total * self.kv_dim, 0);
        // Stale rows past total - shift are never read before being
        // overwritten.
    }
}

/// Rotary multi-head self-attention with KV caching
#[derive(Debug, Clone)]
pub struct Attention {
    /// Query projection
    pub q_proj: Linear,
    /// Key projection
    pub k_proj: Linear,
    /// Value projection
    pub v_proj: Linear,
    /// Output projection
    pub o_proj: Linear,
    n_heads: usize,
    head_dim: usize,
    rope_theta: f32,
    cache: KvCache,
}

impl Attention {
    /// Build an attention block with a cache sized for `max_length`
    #[must_use]
    pub fn new(hidden_size: usize, n_heads: usize, max_length: usize) -> Self {
        Self {
            q_proj: Linear::new(hidden_size, hidden_size, false),
            k_proj: Linear::new(hidden_size, hidden_size, false),
            v_proj: Linear::new(hidden_size, hidden_size, false),
            o_proj: Linear::new(hidden_size, hidden_size, false),
            n_heads,
            head_dim: hidden_size / n_heads,
            rope_theta: ROPE_THETA,
            cache: KvCache::new(hidden_size, max_length),
        }
    }

    /// Attend `rows` new tokens whose first absolute position is `n_past`
    ///
    /// Folds exactly `rows` entries into the cache.
    pub fn forward(
        &mut self,
        ctx: &mut ForwardContext,
        x: &[f32],
        rows: usize,
        n_past: usize,
    ) -> Result<Vec<f32>> {
        let hidden = self.n_heads * self.head_dim;
        let mut q = self.q_proj.forward(ctx, x, rows)?;
        let mut k = self.k_proj.forward(ctx, x, rows)?;
        let v = self.v_proj.forward(ctx, x, rows)?;

        let mut attn_out = ctx.alloc(rows * hidden)?;
        let mut scores = ctx.alloc(n_past + rows)?;
        let inv_sqrt_d = 1.0 / (self.head_dim as f32).sqrt();

        for t in 0..rows {
            let pos = n_past + t;
            let q_row = &mut q[t * hidden..(t + 1) * hidden];
            let k_row = &mut k[t * hidden..(t + 1) * hidden];
            rope_in_place(q_row, self.n_heads, self.head_dim, pos, self.rope_theta);
            rope_in_place(k_row, self.n_heads, self.head_dim, pos, self.rope_theta);
            self.cache
                .store(pos, k_row, &v[t * hidden..(t + 1) * hidden]);

            let ctx_len = pos + 1;
            for h in 0..self.n_heads {
                let q_head = &q_row[h * self.head_dim..(h + 1) * self.head_dim];
                let scores = &mut scores[..ctx_len];
                for (j, score) in scores.iter_mut().enumerate() {
                    let k_head =
                        &self.cache.key(j)[h * self.head_dim..(h + 1) * self.head_dim];
                    *score = q_head
                        .iter()
                        .zip(k_head.iter())
                        .map(|(a, b)| a * b)
                        .sum::<f32>()
                        * inv_sqrt_d;
                }
                softmax_rows(scores);

                let out_head =
                    &mut attn_out[t * hidden + h * self.head_dim..t * hidden + (h + 1) * self.head_dim];
                out_head.fill(0.0);
                for (j, &w) in scores.iter().enumerate() {
                    let v_head =
                        &self.cache.value(j)[h * self.head_dim..(h + 1) * self.head_dim];
                    for (o, &vv) in out_head.iter_mut().zip(v_head.iter()) {
                        *o += w * vv;
                    }
                }
            }
        }

        self.o_proj.forward(ctx, &attn_out, rows)
    }

    /// Compact the cache after a context shift
    pub fn shift_cache(&mut self, shift: usize, total: usize) {
        self.cache.shift(shift, total);
    }

    fn param_num(&self) -> u64 {
        self.q_proj.param_num()
            + self.k_proj.param_num()
            + self.v_proj.param_num()
            + self.o_proj.param_num()
    }
}

/// SwiGLU feed-forward block
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// Gate projection
    pub gate_proj: Linear,
    /// Up projection
    pub up_proj: Linear,
    /// Down projection
    pub down_proj: Linear,
}

impl FeedForward {
    /// Build a block of the given widths
    #[must_use]
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            gate_proj: Linear::new(hidden_size, intermediate_size, false),
            up_proj: Linear::new(hidden_size, intermediate_size, false),
            down_proj: Linear::new(intermediate_size, hidden_size, false),
        }
    }

    /// `down(silu(gate(x)) * up(x))`
    pub fn forward(&self, ctx: &mut ForwardContext, x: &[f32], rows: usize) -> Result<Vec<f32>> {
        let mut gate = self.gate_proj.forward(ctx, x, rows)?;
        let up = self.up_proj.forward(ctx, x, rows)?;
        for (g, u) in gate.iter_mut().zip(up.iter()) {
            let silu = *g / (1.0 + (-*g).exp());
            *g = silu * u;
        }
        self.down_proj.forward(ctx, &gate, rows)
    }

    fn param_num(&self) -> u64 {
        self.gate_proj.param_num() + self.up_proj.param_num() + self.down_proj.param_num()
    }
}

/// One pre-norm decoder layer
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    /// Norm ahead of attention
    pub input_norm: RmsNorm,
    /// Self-attention block
    pub attn: Attention,
    /// Norm ahead of the feed-forward
    pub post_attn_norm: RmsNorm,
    /// Feed-forward block
    pub ffn: FeedForward,
}

impl DecoderLayer {
    fn new(config: &BaseConfig) -> Self {
        let hidden = config.hidden_size as usize;
        Self {
            input_norm: RmsNorm::new(hidden, 1e-5),
            attn: Attention::new(
                hidden,
                config.num_attention_heads as usize,
                config.max_length as usize,
            ),
            post_attn_norm: RmsNorm::new(hidden, 1e-5),
            ffn: FeedForward::new(hidden, config.intermediate_size as usize),
        }
    }

    fn forward(
        &mut self,
        ctx: &mut ForwardContext,
        x: &[f32],
        rows: usize,
        n_past: usize,
    ) -> Result<Vec<f32>> {
        let normed = self.input_norm.forward(ctx, x, rows)?;
        let attn = self.attn.forward(ctx, &normed, rows, n_past)?;
        let mut resid = ctx.alloc(x.len())?;
        for ((r, a), b) in resid.iter_mut().zip(x.iter()).zip(attn.iter()) {
            *r = a + b;
        }

        let normed = self.post_attn_norm.forward(ctx, &resid, rows)?;
        let ffn = self.ffn.forward(ctx, &normed, rows)?;
        for (r, f) in resid.iter_mut().zip(ffn.iter()) {
            *r += f;
        }
        Ok(resid)
    }

    fn param_num(&self) -> u64 {
        self.input_norm.param_num()
            + self.attn.param_num()
            + self.post_attn_norm.param_num()
            + self.ffn.param_num()
    }
}

/// Output head attached after the final norm
#[derive(Debug, Clone)]
pub enum OutputHead {
    /// Next-token logits from the last position; `None` ties the head to the
    /// embedding table
    Logits {
        /// Untied projection, when present
        lm_head: Option<Linear>,
    },
    /// Mean-pooled hidden state (text embedding models)
    Pooled,
    /// Mean-pooled hidden state reduced to one relevance score
    Rank {
        /// Scoring projection `[1, hidden]`
        score: Linear,
    },
}

/// The reference decoder: embedding, layer stack, final norm, output head
///
/// Implements the uniform transformer capability surface the engine drives.
/// `forward` folds exactly `input_ids.len()` positions into every layer's KV
/// cache.
#[derive(Debug, Clone)]
pub struct DecoderStack {
    config: BaseConfig,
    /// Token embedding table
    pub embedding: Embedding,
    /// Decoder layers
    pub layers: Vec<DecoderLayer>,
    /// Final normalization
    pub final_norm: RmsNorm,
    /// Output head
    pub head: OutputHead,
    n_ctx: usize,
}

impl DecoderStack {
    /// Build a zero-initialized stack; weights arrive via
    /// [`CausalTransformer::load`]
    #[must_use]
    pub fn new(config: &BaseConfig, head: OutputHead) -> Self {
        let hidden = config.hidden_size as usize;
        Self {
            embedding: Embedding::new(config.vocab_size as usize, hidden),
            layers: (0..config.num_hidden_layers)
                .map(|_| DecoderLayer::new(config))
                .collect(),
            final_norm: RmsNorm::new(hidden, 1e-5),
            head,
            config: config.clone(),
            n_ctx: 0,
        }
    }

    /// Arena budgets adequate for this stack at batch one
    ///
    /// Returns `(mem_size, scratch_size)` in bytes. Arena space is never
    /// recycled within a pass, so the budget covers the sum of every
    /// activation a full-prompt forward allocates, with headroom.
    #[must_use]
    pub fn arena_sizes(&self) -> (usize, usize) {
        let c = &self.config;
        let rows = c.max_length as usize;
        let hidden = c.hidden_size as usize;
        let inter = c.intermediate_size as usize;
        let layers = self.layers.len().max(1);
        let per_layer = rows * (hidden * 9 + inter * 2) + rows + c.max_length as usize;
        let scratch = (rows * hidden + layers * per_layer) * std::mem::size_of::<f32>() * 2;
        let mem = (c.vocab_size as usize + hidden * 4) * std::mem::size_of::<f32>() * 2;
        (mem.max(1 << 16), scratch.max(1 << 16))
    }

    fn mean_pool(ctx: &mut ForwardContext, hidden: &[f32], rows: usize, dim: usize) -> Result<Vec<f32>> {
        let mut pooled = ctx.alloc(dim)?;
        for r in 0..rows {
            for (p, &h) in pooled.iter_mut().zip(hidden[r * dim..(r + 1) * dim].iter()) {
                *p += h;
            }
        }
        let inv = 1.0 / rows as f32;
        for p in pooled.iter_mut() {
            *p *= inv;
        }
        Ok(pooled)
    }
}

impl CausalTransformer for DecoderStack {
    fn forward(
        &mut self,
        ctx: &mut ForwardContext,
        input_ids: &[i32],
        n_past: usize,
    ) -> Result<Vec<f32>> {
        let rows = input_ids.len();
        let dim = self.config.hidden_size as usize;
        let mut hidden = self.embedding.forward(ctx, input_ids)?;
        for layer in &mut self.layers {
            ctx.use_scratch(true);
            hidden = layer.forward(ctx, &hidden, rows, n_past)?;
        }

        // The outputs below must outlive scratch reuse; charge them to mem.
        ctx.use_scratch(false);
        match &self.head {
            OutputHead::Logits { lm_head } => {
                let last = &hidden[(rows - 1) * dim..rows * dim];
                let normed = self.final_norm.forward(ctx, last, 1)?;
                match lm_head {
                    Some(head) => head.forward(ctx, &normed, 1),
                    None => self.embedding.project(ctx, &normed),
                }
            },
            OutputHead::Pooled => {
                let pooled = Self::mean_pool(ctx, &hidden, rows, dim)?;
                self.final_norm.forward(ctx, &pooled, 1)
            },
            OutputHead::Rank { score } => {
                let pooled = Self::mean_pool(ctx, &hidden, rows, dim)?;
                let normed = self.final_norm.forward(ctx, &pooled, 1)?;
                score.forward(ctx, &normed, 1)
            },
        }
    }

    fn shift_cache(&mut self, shift: usize, total: usize) {
        for layer in &mut self.layers {
            layer.attn.shift_cache(shift, total);
        }
    }

    fn set_ctx(&mut self, n_ctx: usize) {
        self.n_ctx = n_ctx;
    }

    fn param_num(&self, _effective_only: bool) -> u64 {
        let mut total = self.embedding.param_num() + self.final_norm.param_num();
        total += self.layers.iter().map(DecoderLayer::param_num).sum::<u64>();
        match &self.head {
            OutputHead::Logits { lm_head: Some(h) } => total += h.param_num(),
            OutputHead::Rank { score } => total += score.param_num(),
            _ => {},
        }
        total
    }

    fn load(&mut self, loader: &mut ModelLoader) -> Result<()> {
        let c = &self.config;
        let hidden = c.hidden_size as usize;
        let vocab = c.vocab_size as usize;
        let inter = c.intermediate_size as usize;

        self.embedding.weight = loader.read_tensor("model.embed_tokens.weight", &[vocab, hidden])?;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let p = format!("model.layers.{i}");
            layer.input_norm.weight =
                loader.read_tensor(&format!("{p}.input_layernorm.weight"), &[hidden])?;
            layer.attn.q_proj.weight =
                loader.read_tensor(&format!("{p}.self_attn.q_proj.weight"), &[hidden, hidden])?;
            layer.attn.k_proj.weight =
                loader.read_tensor(&format!("{p}.self_attn.k_proj.weight"), &[hidden, hidden])?;
            layer.attn.v_proj.weight =
                loader.read_tensor(&format!("{p}.self_attn.v_proj.weight"), &[hidden, hidden])?;
            layer.attn.o_proj.weight =
                loader.read_tensor(&format!("{p}.self_attn.o_proj.weight"), &[hidden, hidden])?;
            layer.post_attn_norm.weight =
                loader.read_tensor(&format!("{p}.post_attention_layernorm.weight"), &[hidden])?;
            layer.ffn.gate_proj.weight =
                loader.read_tensor(&format!("{p}.mlp.gate_proj.weight"), &[inter, hidden])?;
            layer.ffn.up_proj.weight =
                loader.read_tensor(&format!("{p}.mlp.up_proj.weight"), &[inter, hidden])?;
            layer.ffn.down_proj.weight =
                loader.read_tensor(&format!("{p}.mlp.down_proj.weight"), &[hidden, inter])?;
        }
        self.final_norm.weight = loader.read_tensor("model.norm.weight", &[hidden])?;
        match &mut self.head {
            OutputHead::Logits { lm_head: Some(h) } => {
                h.weight = loader.read_tensor("lm_head.weight", &[vocab, hidden])?;
            },
            OutputHead::Rank { score } => {
                score.weight = loader.read_tensor("score.weight", &[1, hidden])?;
            },
            _ => {},
        }
        Ok(())
    }
}
