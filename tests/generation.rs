//! End-to-end generation scenarios over synthetic model files

use std::io::Write;

use charlar::chat::encode_chat;
use charlar::engine::Model;
use charlar::loader::LoadResult;
use charlar::stream::CollectorStreamer;
use charlar::testing::{build_model_file, test_base_config};
use charlar::{load, CharlarError, GenerationConfig, ModelType, SamplingKind};

fn write_model(model_type: ModelType, vocab: usize, max_length: usize) -> tempfile::NamedTempFile {
    let config = test_base_config(vocab, max_length);
    let bytes = build_model_file(model_type, &config, 1234);
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(&bytes).expect("write model");
    file.flush().expect("flush model");
    file
}

fn load_tiny_llama() -> LoadResult {
    let file = write_model(ModelType::Llama2, 16, 32);
    load(file.path(), None).expect("load tiny model")
}

#[test]
fn greedy_generation_preserves_prompt_prefix() {
    let mut result = load_tiny_llama();
    let prompt = vec![0, 3, 4, 5];
    let out = result
        .model
        .generate(&prompt, &GenerationConfig::new(12), false, None)
        .unwrap();
    assert!(!out.aborted);
    assert!(out.output_ids.len() >= prompt.len());
    assert_eq!(&out.output_ids[..prompt.len()], &prompt[..]);
    assert!(result.model.n_past() <= result.model.max_length());
}

#[test]
fn greedy_generation_is_deterministic_across_loads() {
    let file = write_model(ModelType::Llama2, 16, 32);
    let config = GenerationConfig::new(12);
    let prompt = vec![0, 3, 4];

    let mut a = load(file.path(), None).unwrap();
    let mut b = load(file.path(), None).unwrap();
    let out_a = a.model.generate(&prompt, &config, false, None).unwrap();
    let out_b = b.model.generate(&prompt, &config, false, None).unwrap();
    assert_eq!(out_a.output_ids, out_b.output_ids);
}

#[test]
fn seeded_sampling_is_reproducible_across_loads() {
    let file = write_model(ModelType::Llama2, 16, 32);
    let config = GenerationConfig::new(12)
        .with_sampling(SamplingKind::TopP)
        .with_top_p(0.9)
        .with_temperature(0.8)
        .with_top_k(8);
    let prompt = vec![0, 3];

    let run = |seed: u64| {
        let mut result = load(file.path(), None).unwrap();
        result.model.set_seed(seed);
        result
            .model
            .generate(&prompt, &config, false, None)
            .unwrap()
            .output_ids
    };
    assert_eq!(run(7), run(7));
}

#[test]
fn streamer_receives_exactly_the_non_prompt_tokens() {
    let mut result = load_tiny_llama();
    let prompt = vec![0, 3, 4];
    let mut streamer = CollectorStreamer::new();
    let out = result
        .model
        .generate(
            &prompt,
            &GenerationConfig::new(10),
            false,
            Some(&mut streamer),
        )
        .unwrap();
    assert!(streamer.ended);
    assert_eq!(streamer.tokens, &out.output_ids[prompt.len()..]);
    // Terminal tokens are popped before streaming, so EOS never appears.
    assert!(streamer.tokens.iter().all(|&t| t != 15));
}

#[test]
fn continuous_mode_matches_fresh_generation() {
    let file = write_model(ModelType::Llama2, 16, 32);
    let prompt = vec![0, 3, 4];

    let mut full = load(file.path(), None).unwrap();
    let out_full = full
        .model
        .generate(&prompt, &GenerationConfig::new(prompt.len() + 4), false, None)
        .unwrap();

    let mut split = load(file.path(), None).unwrap();
    let out_first = split
        .model
        .generate(&prompt, &GenerationConfig::new(prompt.len() + 2), false, None)
        .unwrap();

    if out_first.output_ids.len() < prompt.len() + 2 {
        // Terminated before the cap; the full run must agree.
        assert_eq!(out_full.output_ids, out_first.output_ids);
        return;
    }

    // Continue from the last sampled token, which is not yet folded into
    // the cache; the continuation must replay the fresh run exactly.
    let last = *out_first.output_ids.last().unwrap();
    let out_rest = split
        .model
        .generate(
            &[last],
            &GenerationConfig::new(prompt.len() + 4),
            true,
            None,
        )
        .unwrap();

    let mut stitched = out_first.output_ids.clone();
    stitched.extend_from_slice(&out_rest.output_ids[1..]);
    assert_eq!(out_full.output_ids, stitched);
}

#[test]
fn sliding_window_keeps_positions_inside_the_cache() {
    let file = write_model(ModelType::Llama2, 16, 16);
    let mut result = load(file.path(), None).unwrap();

    // Prefill-plus-one-sample steps advance n_past by exactly the prompt
    // length regardless of which token gets sampled.
    let mut fill = |model: &mut Box<dyn charlar::Model>, ids: &[i32], continuous: bool| {
        let cap = model.n_past() + ids.len() + 1;
        model
            .generate(ids, &GenerationConfig::new(cap), continuous, None)
            .unwrap();
    };
    fill(&mut result.model, &[0, 3, 4, 5], false);
    fill(&mut result.model, &[6, 7, 8, 9], true);
    fill(&mut result.model, &[3, 4, 5, 6], true);
    assert_eq!(result.model.n_past(), 12);

    // Slide the window down to the newest four rows, then decode well past
    // the point where un-rewound positions would overrun the cache.
    result.model.shift_memory(4);
    assert_eq!(result.model.n_past(), 4);
    let out = result
        .model
        .generate(&[6], &GenerationConfig::new(12), true, None)
        .unwrap();
    assert!(!out.aborted);
    assert!(result.model.n_past() <= result.model.max_length());
    assert!(out.output_ids.iter().all(|&t| t >= 0 && t < 16));
}

#[test]
fn shift_memory_no_op_and_shrink() {
    let mut result = load_tiny_llama();
    let prompt = vec![0, 3, 4, 5];
    result
        .model
        .generate(&prompt, &GenerationConfig::new(10), false, None)
        .unwrap();
    let past = result.model.n_past();
    result.model.shift_memory(past + 4);
    assert_eq!(result.model.n_past(), past);
    if past >= 2 {
        result.model.shift_memory(2);
        assert_eq!(result.model.n_past(), 2);
    }
}

#[test]
fn chat_prompt_drives_generation_end_to_end() {
    let file = write_model(ModelType::InternLM, 16, 32);
    let mut result = load(file.path(), None).unwrap();
    let encoder = result.model.history_encoder().expect("chat model");
    let prompt = encode_chat(
        encoder,
        result.tokenizer.as_ref(),
        &[charlar::ChatRound::user("abc")],
    );
    assert!(!prompt.is_empty());
    let out = result
        .model
        .generate(&prompt, &GenerationConfig::new(24), false, None)
        .unwrap();
    assert!(!out.aborted);
    assert_eq!(&out.output_ids[..prompt.len()], &prompt[..]);
}

#[test]
fn embedding_model_produces_hidden_size_vector() {
    let file = write_model(ModelType::BceEmbedding, 16, 32);
    let mut result = load(file.path(), None).unwrap();
    assert_eq!(result.model.purpose(), charlar::ModelPurpose::TextEmbedding);
    let embedding = result
        .model
        .text_embedding(&GenerationConfig::new(32), &[0, 3, 4, 5])
        .unwrap();
    assert_eq!(embedding.len(), 8);
    assert!(embedding.iter().all(|v| v.is_finite()));
    assert!(result.model.history_encoder().is_none());
}

#[test]
fn ranker_model_produces_scalar_score() {
    let file = write_model(ModelType::BceReRanker, 16, 32);
    let mut result = load(file.path(), None).unwrap();
    assert_eq!(result.model.purpose(), charlar::ModelPurpose::Ranker);
    let score = result
        .model
        .qa_rank(&GenerationConfig::new(32), &[0, 3, 4])
        .unwrap();
    assert!(score.is_finite());
}

#[test]
fn qa_rank_on_an_embedding_model_is_a_shape_error() {
    let file = write_model(ModelType::BceEmbedding, 16, 32);
    let mut result = load(file.path(), None).unwrap();
    let err = result
        .model
        .qa_rank(&GenerationConfig::new(32), &[0, 3])
        .unwrap_err();
    assert!(matches!(err, CharlarError::OutputShapeMismatch { .. }));
}

#[test]
fn incremental_prefill_matches_batched() {
    let file = write_model(ModelType::Llama2, 16, 32);
    let prompt = vec![0, 3, 4, 5];

    let mut batched = load(file.path(), None).unwrap();
    let out_batched = batched
        .model
        .generate(&prompt, &GenerationConfig::new(10), false, None)
        .unwrap();

    let mut incremental = load(file.path(), None).unwrap();
    let out_incremental = incremental
        .model
        .generate(
            &prompt,
            &GenerationConfig::new(10).with_batch_prefill(false),
            false,
            None,
        )
        .unwrap();

    assert_eq!(out_batched.output_ids, out_incremental.output_ids);
}

#[test]
fn oversized_request_fails_before_any_work() {
    let mut result = load_tiny_llama();
    let err = result
        .model
        .generate(&[0], &GenerationConfig::new(1000), false, None)
        .unwrap_err();
    assert!(matches!(
        err,
        CharlarError::MaxLengthExceeded {
            requested: 1000,
            model_max: 32
        }
    ));
}
