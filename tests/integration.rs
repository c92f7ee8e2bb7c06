//! Integration tests for sae-recon-rs
//!
//! Note: Tests marked with #[ignore] require model download.
//! Run them explicitly with: cargo test --ignored

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use sae_recon_rs::{
    csv_path, Corpus, EvalError, EvalModel, ExperimentConfig, FeatureCodec, HookPoint,
    LlamaConfig, LlamaModel, ReconstructionExperiment, ResultTable, RuntimeConfig, Sae,
    SaeArchitecture,
};
use tempfile::NamedTempFile;

const TINY_CONFIG: &str = r#"{
    "hidden_size": 16,
    "intermediate_size": 32,
    "num_attention_heads": 4,
    "num_key_value_heads": 2,
    "num_hidden_layers": 2,
    "vocab_size": 32,
    "max_position_embeddings": 64,
    "rope_theta": 10000.0,
    "tie_word_embeddings": true,
    "model_type": "llama"
}"#;

/// Whitespace word-level tokenizer: `<unk>`=0, `</s>`=1, `w0`..`w29`=2..31
fn tokenizer_json() -> String {
    let mut vocab = vec![r#""<unk>": 0"#.to_string(), r#""</s>": 1"#.to_string()];
    for i in 0..30 {
        vocab.push(format!(r#""w{i}": {}"#, i + 2));
    }
    format!(
        r#"{{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {{"type": "Whitespace"}},
            "post_processor": null,
            "decoder": null,
            "model": {{"type": "WordLevel", "vocab": {{{}}}, "unk_token": "<unk>"}}
        }}"#,
        vocab.join(", ")
    )
}

/// Write a randomly initialized tiny LLaMA checkpoint plus tokenizer to `dir`.
fn write_tiny_model(dir: &Path) {
    let config: LlamaConfig = serde_json::from_str(TINY_CONFIG).unwrap();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    LlamaModel::new(&config, vb, &RuntimeConfig::cpu()).unwrap();
    varmap.save(dir.join("model.safetensors")).unwrap();
    std::fs::write(dir.join("config.json"), TINY_CONFIG).unwrap();
    std::fs::write(dir.join("tokenizer.json"), tokenizer_json()).unwrap();
}

/// Write a gated SAE on `blocks.0.hook_mlp_out` with `d_in = 16`, `d_sae = 32`.
fn write_gated_sae(dir: &Path) {
    let device = Device::Cpu;
    let (d_in, d_sae) = (16, 32);
    let mut tensors = HashMap::new();
    tensors.insert(
        "W_enc".to_string(),
        Tensor::randn(0f32, 0.3, (d_in, d_sae), &device).unwrap(),
    );
    tensors.insert(
        "W_dec".to_string(),
        Tensor::randn(0f32, 0.3, (d_sae, d_in), &device).unwrap(),
    );
    tensors.insert("b_dec".to_string(), Tensor::zeros(d_in, DType::F32, &device).unwrap());
    tensors.insert("b_gate".to_string(), Tensor::zeros(d_sae, DType::F32, &device).unwrap());
    tensors.insert("b_mag".to_string(), Tensor::zeros(d_sae, DType::F32, &device).unwrap());
    tensors.insert("r_mag".to_string(), Tensor::zeros(d_sae, DType::F32, &device).unwrap());
    candle_core::safetensors::save(&tensors, dir.join("sae_weights.safetensors")).unwrap();

    let cfg = serde_json::json!({
        "d_in": d_in,
        "d_sae": d_sae,
        "hook_name": "blocks.0.hook_mlp_out",
        "hook_layer": 0,
        "architecture": "gated",
        "apply_b_dec_to_input": true,
        "normalize_activations": "none",
        "model_name": "tiny-llama",
        "dtype": "float32"
    });
    std::fs::write(dir.join("cfg.json"), cfg.to_string()).unwrap();
}

fn write_corpus(n: usize) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
    for i in 0..n {
        let words: Vec<String> = (0..(3 + i % 9))
            .map(|j| format!("w{}", (i * 5 + j) % 30))
            .collect();
        writeln!(file, "{}", serde_json::json!({ "text": words.join(" ") })).unwrap();
    }
    file
}

/// Test corpus loading from JSON
#[test]
fn test_corpus_loading() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
        "samples": [
            {{"text": "The quick brown fox"}},
            {{"text": "jumps over the lazy dog"}}
        ]
    }}"#
    )
    .unwrap();

    let corpus = Corpus::load(file.path()).unwrap();
    assert_eq!(corpus.len(), 2);
    assert_eq!(corpus.samples()[0].text, "The quick brown fox");
}

/// Test corpus loading from JSON lines
#[test]
fn test_corpus_loading_jsonl() {
    let file = write_corpus(5);
    let corpus = Corpus::load(file.path()).unwrap();
    assert_eq!(corpus.len(), 5);
}

/// A malformed corpus is a load error, not a panic
#[test]
fn test_corpus_loading_rejects_bad_json() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{{\"samples\": 3}}").unwrap();
    let err = Corpus::load(file.path()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EvalError>(),
        Some(EvalError::ProviderLoad { .. })
    ));
}

/// Test deterministic sampling with same seed
#[test]
fn test_sampling_deterministic() {
    let file = write_corpus(30);
    let corpus = Corpus::load(file.path()).unwrap();
    let a = corpus.sample(10, 42);
    let b = corpus.sample(10, 42);
    assert_eq!(a.samples(), b.samples());
}

/// Full pipeline on a checkpoint written to disk: load, run, write CSV
#[test]
fn test_end_to_end_local_checkpoint() {
    let model_dir = tempfile::tempdir().unwrap();
    let sae_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    write_tiny_model(model_dir.path());
    write_gated_sae(sae_dir.path());
    let corpus_file = write_corpus(20);

    let runtime = RuntimeConfig::cpu();
    let model = EvalModel::from_pretrained(model_dir.path().to_str().unwrap(), &runtime).unwrap();
    assert_eq!(model.n_layers(), 2);
    assert_eq!(model.eos_token_id(), Some(1));

    let sae = Sae::open(sae_dir.path().to_str().unwrap(), None, &runtime.device).unwrap();
    assert_eq!(sae.architecture(), SaeArchitecture::Gated);
    assert_eq!(sae.hook_point(), HookPoint::MlpOut(0));

    let config = ExperimentConfig {
        corpus_path: corpus_file.path().to_path_buf(),
        sample_size: 20,
        max_length: 12,
        batch_size: 8,
        ..Default::default()
    };
    let corpus = config.load_corpus(model.tokenizer(), 1).unwrap();
    assert_eq!(corpus.len(), 20);

    let experiment = ReconstructionExperiment::new(model.backend(), &sae, &runtime, config);
    let mut table = ResultTable::new();
    let results = experiment.run(&corpus, &mut table).unwrap();
    assert_eq!(results.n_batches, 3);
    assert!(results.peak_working_set_bytes > 0);

    let path = csv_path(out_dir.path(), "gated");
    table.write_csv(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "batch_index,orig_loss,reconstr_loss,zero_loss");
    for (i, line) in lines[1..].iter().enumerate() {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].parse::<usize>().unwrap(), i);
        for value in &fields[1..] {
            let loss: f64 = value.parse().unwrap();
            assert!(loss >= 0.0 && loss.is_finite());
        }
    }
}

/// An SAE trained on a hook the model lacks fails before any batch runs
#[test]
fn test_unknown_hook_rejected_at_startup() {
    let model_dir = tempfile::tempdir().unwrap();
    let sae_dir = tempfile::tempdir().unwrap();
    write_tiny_model(model_dir.path());
    write_gated_sae(sae_dir.path());

    // Re-point the SAE at a layer the 2-layer model does not have
    let cfg_path = sae_dir.path().join("cfg.json");
    let cfg = std::fs::read_to_string(&cfg_path)
        .unwrap()
        .replace("blocks.0.hook_mlp_out", "blocks.5.hook_mlp_out");
    std::fs::write(&cfg_path, cfg).unwrap();

    let runtime = RuntimeConfig::cpu();
    let model = EvalModel::from_pretrained(model_dir.path().to_str().unwrap(), &runtime).unwrap();
    let sae = Sae::load_dir(sae_dir.path(), &runtime.device).unwrap();

    let experiment =
        ReconstructionExperiment::new(model.backend(), &sae, &runtime, ExperimentConfig::default());
    let err = experiment.validate().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EvalError>(),
        Some(EvalError::ProviderLoad { .. })
    ));
}

/// Test model loading from the hub (requires network and model access)
#[test]
#[ignore = "requires model download"]
fn test_llama_3_2_1b_loads() {
    let runtime = RuntimeConfig::cpu();
    let model = EvalModel::from_pretrained("meta-llama/Llama-3.2-1B", &runtime).unwrap();
    assert_eq!(model.n_layers(), 16);
    assert_eq!(model.d_model(), 2048);
    assert!(model.eos_token_id().is_some());
    assert!(model
        .backend()
        .has_hook(&HookPoint::from("blocks.0.hook_mlp_out")));
}
