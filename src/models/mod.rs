//! Model families and the dispatch registry
//!
//! Each family module exports the constructors the loader dispatches to:
//! how to parse its config, wire its tokenizer, stack its transformer, and
//! encode its chat format. The registry is a static table keyed by the i32
//! model-type tag from the file header.

use std::sync::Arc;

use crate::engine::Model;
use crate::error::{CharlarError, Result};
use crate::loader::{LoadResult, ModelLoader};
use crate::tokenizer::Tokenizer;

pub mod bce;
pub mod internlm;
pub mod llama;

/// What a model produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPurpose {
    /// Autoregressive token generation
    Chat,
    /// Fixed-size embedding vectors
    TextEmbedding,
    /// Scalar relevance scores
    Ranker,
}

/// Model family tags, partitioned by enum range
///
/// The i32 values are the on-disk tags; the space is dense within a family
/// range (0x100 InternLM, 0x150 Llama2 derivatives, 0x10000100+ embedding
/// and reranker variants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ModelType {
    /// InternLM chat models
    InternLM = 0x100,
    /// Llama 2 chat models
    Llama2 = 0x150,
    /// CodeLlama, a Llama 2 derivative
    CodeLlama = 0x151,
    /// BCE text-embedding models
    BceEmbedding = 0x1000_0100,
    /// BCE reranker models
    BceReRanker = 0x1000_0101,
}

impl ModelType {
    /// Map a raw header tag to a known family
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0x100 => Some(Self::InternLM),
            0x150 => Some(Self::Llama2),
            0x151 => Some(Self::CodeLlama),
            0x1000_0100 => Some(Self::BceEmbedding),
            0x1000_0101 => Some(Self::BceReRanker),
            _ => None,
        }
    }

    /// What this family produces; fixed per type
    #[must_use]
    pub fn purpose(self) -> ModelPurpose {
        match self {
            Self::BceEmbedding => ModelPurpose::TextEmbedding,
            Self::BceReRanker => ModelPurpose::Ranker,
            _ => ModelPurpose::Chat,
        }
    }

    /// Display name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::InternLM => "InternLM",
            Self::Llama2 => "LlaMa2",
            Self::CodeLlama => "CodeLlaMa",
            Self::BceEmbedding => "BCE-Embedding",
            Self::BceReRanker => "BCE-ReRanker",
        }
    }

    /// Native-script name, where the vendor has one
    #[must_use]
    pub fn native_name(self) -> Option<&'static str> {
        match self {
            Self::InternLM => Some("书生·浦语"),
            _ => None,
        }
    }
}

/// Constructor building the full `(tokenizer, model)` pair from a file
pub type BuildFn = fn(&mut ModelLoader, Option<usize>) -> Result<LoadResult>;

/// Constructor rebuilding only the model, reusing a loaded tokenizer
pub type RebuildFn = fn(&mut ModelLoader, Arc<dyn Tokenizer>, Option<usize>) -> Result<Box<dyn Model>>;

/// One registry row
pub struct ModelEntry {
    /// Family tag this entry serves
    pub model_type: ModelType,
    /// The only file version this entry accepts
    pub supported_version: i32,
    /// Full construction
    pub build: BuildFn,
    /// Tokenizer-reusing construction
    pub rebuild: RebuildFn,
}

/// The dispatch table
pub static MODEL_TABLE: &[ModelEntry] = &[
    ModelEntry {
        model_type: ModelType::InternLM,
        supported_version: 1,
        build: internlm::build,
        rebuild: internlm::rebuild,
    },
    ModelEntry {
        model_type: ModelType::Llama2,
        supported_version: 1,
        build: llama::build,
        rebuild: llama::rebuild,
    },
    ModelEntry {
        model_type: ModelType::CodeLlama,
        supported_version: 1,
        build: llama::build_code,
        rebuild: llama::rebuild_code,
    },
    ModelEntry {
        model_type: ModelType::BceEmbedding,
        supported_version: 1,
        build: bce::build_embedding,
        rebuild: bce::rebuild_embedding,
    },
    ModelEntry {
        model_type: ModelType::BceReRanker,
        supported_version: 1,
        build: bce::build_ranker,
        rebuild: bce::rebuild_ranker,
    },
];

/// Look up the registry entry for a raw header tag
///
/// # Errors
///
/// [`CharlarError::UnknownModelType`] when no entry serves the tag.
pub fn find_entry(raw: i32) -> Result<&'static ModelEntry> {
    let model_type = ModelType::from_raw(raw).ok_or(CharlarError::UnknownModelType(raw))?;
    MODEL_TABLE
        .iter()
        .find(|entry| entry.model_type == model_type)
        .ok_or(CharlarError::UnknownModelType(raw))
}
