//! Decode-loop throughput over a synthetic tiny model

use std::io::Write;

use criterion::{criterion_group, criterion_main, Criterion};

use charlar::engine::Model;
use charlar::testing::{build_model_file, test_base_config};
use charlar::{load, GenerationConfig, ModelType};

fn bench_greedy_decode(c: &mut Criterion) {
    let config = test_base_config(32, 64);
    let bytes = build_model_file(ModelType::Llama2, &config, 7);
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(&bytes).expect("write model");
    file.flush().expect("flush model");

    let mut result = load(file.path(), None).expect("load model");
    let prompt = vec![0, 3, 4, 5];
    let gen_config = GenerationConfig::new(prompt.len() + 8);

    c.bench_function("greedy_decode_8_tokens", |b| {
        b.iter(|| {
            let out = result
                .model
                .generate(&prompt, &gen_config, false, None)
                .expect("generate");
            std::hint::black_box(out.output_ids.len())
        });
    });
}

fn bench_prefill(c: &mut Criterion) {
    let config = test_base_config(32, 64);
    let bytes = build_model_file(ModelType::Llama2, &config, 7);
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(&bytes).expect("write model");
    file.flush().expect("flush model");

    let mut result = load(file.path(), None).expect("load model");
    let prompt: Vec<i32> = (0..24).map(|i| i % 16).collect();
    let gen_config = GenerationConfig::new(prompt.len() + 1);

    c.bench_function("prefill_24_tokens", |b| {
        b.iter(|| {
            let out = result
                .model
                .generate(&prompt, &gen_config, false, None)
                .expect("generate");
            std::hint::black_box(out.output_ids.len())
        });
    });
}

criterion_group!(benches, bench_greedy_decode, bench_prefill);
criterion_main!(benches);
