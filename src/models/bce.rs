//! BCE embedding and reranker families
//!
//! Both reuse the shared decoder stack with non-logit heads: the embedding
//! model mean-pools the final hidden states into a fixed-size vector, the
//! reranker reduces that pool to one relevance score. Neither samples,
//! shifts, or streams; callers use [`Model::text_embedding`] and
//! [`Model::qa_rank`] only.

use std::sync::Arc;

use crate::config::BaseConfig;
use crate::engine::{GenerationEngine, Model};
use crate::layers::{DecoderStack, Linear, OutputHead};
use crate::loader::{
    load_config, load_tokenizer, load_transformer, LoadResult, ModelLoader,
};
use crate::models::ModelType;
use crate::tokenizer::Tokenizer;

fn construct(
    loader: &mut ModelLoader,
    config: BaseConfig,
    tokenizer: Arc<dyn Tokenizer>,
    model_type: ModelType,
) -> crate::error::Result<Box<dyn Model>> {
    let head = match model_type {
        ModelType::BceReRanker => OutputHead::Rank {
            score: Linear::new(config.hidden_size as usize, 1, false),
        },
        _ => OutputHead::Pooled,
    };
    let mut stack = DecoderStack::new(&config, head);
    load_transformer(loader, &mut stack)?;
    let (mem_size, scratch_size) = stack.arena_sizes();
    let engine = GenerationEngine::new(model_type, config, stack, tokenizer, mem_size, scratch_size);
    Ok(Box::new(engine))
}

fn build_as(
    loader: &mut ModelLoader,
    max_length: Option<usize>,
    model_type: ModelType,
) -> crate::error::Result<LoadResult> {
    // One config parse feeds tokenizer and transformer construction alike.
    let config = load_config(loader, max_length)?;
    let tokenizer = load_tokenizer(loader, &config)?;
    let model = construct(loader, config, tokenizer.clone(), model_type)?;
    Ok(LoadResult { tokenizer, model })
}

fn rebuild_as(
    loader: &mut ModelLoader,
    tokenizer: Arc<dyn Tokenizer>,
    max_length: Option<usize>,
    model_type: ModelType,
) -> crate::error::Result<Box<dyn Model>> {
    // Re-read the stored config record to apply the (possibly smaller) cap.
    let config = load_config(loader, max_length)?;
    construct(loader, config, tokenizer, model_type)
}

/// Registry constructor for the embedding family
pub(crate) fn build_embedding(
    loader: &mut ModelLoader,
    max_length: Option<usize>,
) -> crate::error::Result<LoadResult> {
    build_as(loader, max_length, ModelType::BceEmbedding)
}

/// Registry reconstructor for the embedding family
pub(crate) fn rebuild_embedding(
    loader: &mut ModelLoader,
    tokenizer: Arc<dyn Tokenizer>,
    max_length: Option<usize>,
) -> crate::error::Result<Box<dyn Model>> {
    rebuild_as(loader, tokenizer, max_length, ModelType::BceEmbedding)
}

/// Registry constructor for the reranker family
pub(crate) fn build_ranker(
    loader: &mut ModelLoader,
    max_length: Option<usize>,
) -> crate::error::Result<LoadResult> {
    build_as(loader, max_length, ModelType::BceReRanker)
}

/// Registry reconstructor for the reranker family
pub(crate) fn rebuild_ranker(
    loader: &mut ModelLoader,
    tokenizer: Arc<dyn Tokenizer>,
    max_length: Option<usize>,
) -> crate::error::Result<Box<dyn Model>> {
    rebuild_as(loader, tokenizer, max_length, ModelType::BceReRanker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::config::GenerationConfig;
    use crate::error::CharlarError;
    use crate::models::ModelPurpose;
    use crate::testing::{build_model_file, test_base_config};

    fn loader_for(model_type: ModelType) -> (tempfile::NamedTempFile, ModelLoader) {
        let bytes = build_model_file(model_type, &test_base_config(16, 32), 5);
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&bytes).expect("write fixture");
        file.flush().expect("flush fixture");
        let loader = ModelLoader::from_path(file.path()).expect("parse header");
        (file, loader)
    }

    #[test]
    fn reranker_type_selects_the_scalar_head() {
        let (_file, mut loader) = loader_for(ModelType::BceReRanker);
        let mut result = build_ranker(&mut loader, None).unwrap();
        assert_eq!(result.model.purpose(), ModelPurpose::Ranker);
        let score = result
            .model
            .qa_rank(&GenerationConfig::new(32), &[0, 3, 4])
            .unwrap();
        assert!(score.is_finite());
    }

    #[test]
    fn embedding_type_selects_the_pooled_head() {
        let (_file, mut loader) = loader_for(ModelType::BceEmbedding);
        let mut result = build_embedding(&mut loader, None).unwrap();
        assert_eq!(result.model.purpose(), ModelPurpose::TextEmbedding);
        let embedding = result
            .model
            .text_embedding(&GenerationConfig::new(32), &[0, 3, 4])
            .unwrap();
        assert_eq!(embedding.len(), 8);
        // The pooled head is not a scalar, so ranking it is a shape error.
        let err = result
            .model
            .qa_rank(&GenerationConfig::new(32), &[0, 3])
            .unwrap_err();
        assert!(matches!(err, CharlarError::OutputShapeMismatch { .. }));
    }

    #[test]
    fn neither_family_carries_a_chat_encoder() {
        let (_file, mut loader) = loader_for(ModelType::BceEmbedding);
        let result = build_embedding(&mut loader, None).unwrap();
        assert!(result.model.history_encoder().is_none());

        let (_file, mut loader) = loader_for(ModelType::BceReRanker);
        let result = build_ranker(&mut loader, None).unwrap();
        assert!(result.model.history_encoder().is_none());
    }

    #[test]
    fn rebuild_keeps_the_head_choice() {
        let (_file, mut loader) = loader_for(ModelType::BceReRanker);
        let first = build_ranker(&mut loader, None).unwrap();
        let mut again = rebuild_ranker(&mut loader, first.tokenizer.clone(), Some(8)).unwrap();
        assert_eq!(again.max_length(), 8);
        let score = again
            .qa_rank(&GenerationConfig::new(8), &[0, 3])
            .unwrap();
        assert!(score.is_finite());
    }
}
