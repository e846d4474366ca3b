//! # Charlar
//!
//! Charlar (Spanish: "to chat") is the generation core of a
//! multi-architecture LLM runtime. Given a loaded transformer model and a
//! token sequence it drives autoregressive decoding: forward pass, sampling,
//! KV-cache accounting, streaming, and termination, plus fixed-size text
//! embedding and scalar reranking built on the same forward path.
//!
//! ## Example
//!
//! ```rust,ignore
//! use charlar::{load, ChatRound, GenerationConfig};
//! use charlar::chat::encode_chat;
//!
//! let result = load("model.bin", None)?;
//! let encoder = result.model.history_encoder().expect("chat model");
//! let prompt = encode_chat(encoder, result.tokenizer.as_ref(),
//!     &[ChatRound::user("Hello!")]);
//!
//! let mut model = result.model;
//! let out = model.generate(&prompt, &GenerationConfig::new(512), false, None)?;
//! println!("{}", result.tokenizer.decode(&out.output_ids[prompt.len()..]));
//! ```
//!
//! ## Architecture
//!
//! - [`loader`] maps a magic-tagged model file and dispatches construction
//!   through the static registry in [`models`]
//! - [`engine`] owns the decoding loop behind the uniform [`engine::Model`]
//!   interface
//! - [`sampler`] provides greedy, nucleus, and tail-free token selection
//! - [`chat`] turns structured conversation rounds into family-exact token
//!   sequences
//! - [`layers`] is the deliberately plain f32 reference stack; production
//!   kernels (BLAS, quantization, GPU) are external concerns
//!
//! The tokenizer and the per-family neural blocks sit behind capability
//! traits ([`tokenizer::Tokenizer`], [`engine::CausalTransformer`]); the
//! core never assumes a concrete implementation.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod chat;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod layers;
pub mod loader;
pub mod models;
pub mod sampler;
pub mod stream;
pub mod testing;
pub mod tokenizer;

// Re-exports for convenience
pub use chat::ChatRound;
pub use config::{GenerationConfig, SamplingKind};
pub use engine::{GenerateOutput, Model};
pub use error::{CharlarError, Result};
pub use loader::{load, LoadResult};
pub use models::{ModelPurpose, ModelType};
pub use stream::Streamer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
