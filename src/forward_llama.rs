//! LLaMA forward pass with explicit hook points
//!
//! Runs layer-by-layer so every TransformerLens-style stage
//! (`hook_resid_pre`, `hook_attn_out`, `hook_resid_mid`, `hook_mlp_out`,
//! `hook_resid_post`) is visible to a [`HookState`]: a capture pass records
//! all of them, a substitution pass replaces exactly one.
//!
//! Covers the LLaMA 2 / Code-LLaMA / LLaMA 3.x family:
//! - grouped query attention (`num_key_value_heads`)
//! - optional bias on attention projections (`attention_bias`)
//! - tied or separate lm_head (`tie_word_embeddings`, true for LLaMA 3.2 1B/3B)
//! - `rope_scaling` of type `llama3`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_b, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Deserialize;
use tracing::{debug, info};

use crate::cache::ActivationCache;
use crate::error::EvalError;
use crate::hooks::{HookPoint, HookState, Substitution};
use crate::masks::MaskCache;
use crate::model::LossBackend;
use crate::runtime::RuntimeConfig;

/// Model configuration (matches HuggingFace config.json for LLaMA)
#[derive(Debug, Clone, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub model_type: Option<String>,
}

/// `rope_scaling` block of a LLaMA 3.x config
#[derive(Debug, Clone, Deserialize)]
pub struct RopeScaling {
    #[serde(alias = "type")]
    pub rope_type: String,
    #[serde(default = "default_rope_factor")]
    pub factor: f64,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_rope_factor() -> f64 {
    1.0
}

fn default_low_freq_factor() -> f64 {
    1.0
}

fn default_high_freq_factor() -> f64 {
    4.0
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

impl LlamaConfig {
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim.unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    fn validate(&self) -> Result<()> {
        if let Some(model_type) = &self.model_type {
            if model_type != "llama" {
                return Err(EvalError::provider_load(
                    "model",
                    format!("unsupported model_type '{model_type}' (expected 'llama')"),
                )
                .into());
            }
        }
        anyhow::ensure!(
            self.num_attention_heads % self.num_kv_heads() == 0,
            "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
            self.num_attention_heads,
            self.num_kv_heads()
        );
        Ok(())
    }
}

/// Rotary Position Embeddings (RoPE), non-interleaved (HF LLaMA layout)
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &LlamaConfig, device: &Device, dtype: DType) -> Result<Self> {
        let dim = config.head_dim();
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1.0 / config.rope_theta.powf(i as f64 / dim as f64))
            .map(|freq| scale_frequency(freq, config.rope_scaling.as_ref()))
            .collect::<Result<Vec<f64>>>()?
            .into_iter()
            .map(|f| f as f32)
            .collect();
        let n_freq = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, n_freq), device)?;

        let max_seq_len = config.max_position_embeddings;
        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;

        // [max_seq_len, dim/2], computed in f32 then cast once
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Apply `rope_scaling` to one inverse frequency.
fn scale_frequency(freq: f64, scaling: Option<&RopeScaling>) -> Result<f64> {
    let Some(scaling) = scaling else {
        return Ok(freq);
    };
    match scaling.rope_type.as_str() {
        "default" => Ok(freq),
        "llama3" => {
            let original = scaling.original_max_position_embeddings as f64;
            let low_freq_wavelen = original / scaling.low_freq_factor;
            let high_freq_wavelen = original / scaling.high_freq_factor;
            let wavelen = 2.0 * std::f64::consts::PI / freq;
            if wavelen < high_freq_wavelen {
                Ok(freq)
            } else if wavelen > low_freq_wavelen {
                Ok(freq / scaling.factor)
            } else {
                let smooth = (original / wavelen - scaling.low_freq_factor)
                    / (scaling.high_freq_factor - scaling.low_freq_factor);
                Ok((1.0 - smooth) * freq / scaling.factor + smooth * freq)
            }
        }
        other => anyhow::bail!("Unsupported rope_scaling type '{other}'"),
    }
}

/// Multi-head attention with grouped KV heads
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let bias = config.attention_bias;
        let q_proj = linear_b(
            config.hidden_size,
            config.num_attention_heads * head_dim,
            bias,
            vb.pp("q_proj"),
        )?;
        let k_proj = linear_b(
            config.hidden_size,
            config.num_kv_heads() * head_dim,
            bias,
            vb.pp("k_proj"),
        )?;
        let v_proj = linear_b(
            config.hidden_size,
            config.num_kv_heads() * head_dim,
            bias,
            vb.pp("v_proj"),
        )?;
        let o_proj = linear_b(
            config.num_attention_heads * head_dim,
            config.hidden_size,
            bias,
            vb.pp("o_proj"),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads(),
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?.contiguous()?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// MLP block (LLaMA style - SwiGLU, no bias)
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let gate_proj = linear_no_bias(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("gate_proj"),
        )?;
        let up_proj = linear_no_bias(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("up_proj"),
        )?;
        let down_proj = linear_no_bias(
            config.intermediate_size,
            config.hidden_size,
            vb.pp("down_proj"),
        )?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // SwiGLU: down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

/// Single decoder layer
struct DecoderLayer {
    index: usize,
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(index: usize, vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let self_attn = Attention::load(vb.pp("self_attn"), config)?;
        let mlp = MLP::load(vb.pp("mlp"), config)?;
        let input_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("input_layernorm"),
        )?;
        let post_attention_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            index,
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &self,
        x: Tensor,
        rotary: &RotaryEmbedding,
        mask: &Tensor,
        hooks: &mut HookState<'_, '_>,
    ) -> Result<Tensor> {
        let i = self.index;
        let resid_pre = hooks.apply(HookPoint::ResidPre(i), x)?;

        let attn_in = self.input_layernorm.forward(&resid_pre)?;
        let attn_out = self.self_attn.forward(&attn_in, rotary, mask)?;
        let attn_out = hooks.apply(HookPoint::AttnOut(i), attn_out)?;
        let resid_mid = hooks.apply(HookPoint::ResidMid(i), (resid_pre + attn_out)?)?;

        let mlp_in = self.post_attention_layernorm.forward(&resid_mid)?;
        let mlp_out = self.mlp.forward(&mlp_in)?;
        let mlp_out = hooks.apply(HookPoint::MlpOut(i), mlp_out)?;
        hooks.apply(HookPoint::ResidPost(i), (resid_mid + mlp_out)?)
    }
}

/// Safetensors index for sharded models
#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// LLaMA decoder whose forward pass exposes every hook point
pub struct LlamaModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    masks: MaskCache,
    config: LlamaConfig,
    runtime: RuntimeConfig,
}

impl LlamaModel {
    /// Build the model from a `VarBuilder` rooted at the checkpoint top level
    /// (tensors named `model.layers.{i}...`, `lm_head.weight`).
    pub fn new(config: &LlamaConfig, vb: VarBuilder, runtime: &RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                debug!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(
                i,
                vb_model.pp(format!("layers.{i}")),
                config,
            )?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        // Tied checkpoints (LLaMA 3.2 1B/3B) ship no lm_head tensor
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let rotary = RotaryEmbedding::new(config, &runtime.device, runtime.dtype)?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            masks: MaskCache::new(&runtime.device),
            config: config.clone(),
            runtime: runtime.clone(),
        })
    }

    /// Load from a HuggingFace model ID, or from a local directory holding
    /// `config.json` and safetensors weights.
    pub fn load(model_id: &str, runtime: &RuntimeConfig) -> Result<Self> {
        info!("Loading LLaMA from: {}", model_id);

        let (config_path, weights_paths) = if Path::new(model_id).is_dir() {
            local_checkpoint_files(Path::new(model_id))?
        } else {
            hub_checkpoint_files(model_id)?
        };

        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: LlamaConfig = serde_json::from_str(&config_str)
            .map_err(|e| EvalError::provider_load("model", format!("bad config.json: {e}")))?;

        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );
        info!("Loading weights from {} file(s)...", weights_paths.len());

        // SAFETY: the weight files are not modified while mapped
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&weights_paths, runtime.dtype, &runtime.device)?
        };
        let model = Self::new(&config, vb, runtime)
            .map_err(|e| EvalError::provider_load("model", format!("{e:#}")))?;

        info!(
            "Model loaded successfully with {} layers (vocab_size: {})",
            config.num_hidden_layers, config.vocab_size
        );
        Ok(model)
    }

    /// Layer-by-layer forward pass, returning logits `(batch, seq, vocab)`.
    fn run(&self, input_ids: &Tensor, hooks: &mut HookState<'_, '_>) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        anyhow::ensure!(
            seq_len <= self.config.max_position_embeddings,
            "Sequence length {seq_len} exceeds max_position_embeddings {}",
            self.config.max_position_embeddings
        );
        let mask = self.masks.causal(seq_len, self.runtime.dtype)?;

        let embedded = self.embed_tokens.forward(input_ids)?;
        let mut hidden = hooks.apply(HookPoint::Embed, embedded)?;

        for layer in &self.layers {
            hidden = layer.forward(hidden, &self.rotary, &mask, hooks)?;
        }

        let normed = self.norm.forward(&hidden)?;
        let normed = hooks.apply(HookPoint::FinalNorm, normed)?;
        Ok(self.lm_head.forward(&normed)?)
    }

}

impl LossBackend for LlamaModel {
    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn hook_points(&self) -> Vec<HookPoint> {
        HookPoint::all_for_decoder(self.config.num_hidden_layers)
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.run(input_ids, &mut HookState::plain())
    }

    fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)> {
        let mut cache = ActivationCache::new();
        let logits = self.run(input_ids, &mut HookState::capturing(&mut cache))?;
        Ok((logits, cache))
    }

    fn forward_with_substitution(
        &self,
        input_ids: &Tensor,
        substitution: &mut Substitution<'_>,
    ) -> Result<Tensor> {
        if !self.has_hook(substitution.hook()) {
            return Err(EvalError::HookNotFound(substitution.hook().to_string()).into());
        }
        let logits = self.run(input_ids, &mut HookState::substituting(substitution))?;
        substitution.finish()?;
        Ok(logits)
    }
}

/// `config.json` plus every `*.safetensors` file in a local directory
fn local_checkpoint_files(dir: &Path) -> Result<(PathBuf, Vec<PathBuf>)> {
    let config_path = dir.join("config.json");
    if !config_path.is_file() {
        return Err(EvalError::provider_load(
            "model",
            format!("no config.json in {}", dir.display()),
        )
        .into());
    }
    let mut weights: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    weights.sort();
    if weights.is_empty() {
        return Err(EvalError::provider_load(
            "model",
            format!("no safetensors weights in {}", dir.display()),
        )
        .into());
    }
    Ok((config_path, weights))
}

/// Download `config.json` and the (possibly sharded) safetensors weights
fn hub_checkpoint_files(model_id: &str) -> Result<(PathBuf, Vec<PathBuf>)> {
    let api = Api::new()?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

    let config_path = repo
        .get("config.json")
        .map_err(|e| EvalError::provider_load("model", format!("config.json: {e}")))?;

    let weights_paths = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        info!("Model is sharded, loading index...");
        let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

        let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
        shard_names.sort();
        shard_names.dedup();

        info!("Downloading {} shard files...", shard_names.len());
        let mut paths = Vec::new();
        for shard_name in &shard_names {
            let path = repo
                .get(shard_name)
                .with_context(|| format!("Failed to download {shard_name}"))?;
            paths.push(path);
        }
        paths
    } else {
        let path = repo
            .get("model.safetensors")
            .map_err(|e| EvalError::provider_load("model", format!("model.safetensors: {e}")))?;
        vec![path]
    };

    Ok((config_path, weights_paths))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hooks::SubstitutionPolicy;
    use candle_nn::VarMap;

    pub(crate) fn tiny_config() -> LlamaConfig {
        serde_json::from_str(
            r#"{
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
            }"#,
        )
        .unwrap()
    }

    /// Randomly initialized tiny model plus the `VarMap` that owns its weights
    pub(crate) fn tiny_model() -> (LlamaModel, VarMap) {
        let runtime = RuntimeConfig::cpu();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &runtime.device);
        let model = LlamaModel::new(&tiny_config(), vb, &runtime).unwrap();
        (model, varmap)
    }

    fn tokens() -> Tensor {
        Tensor::new(&[[1u32, 5, 9, 3, 7, 2], [4, 4, 8, 1, 0, 0]], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = tiny_config();
        assert_eq!(config.num_kv_heads(), 2);
        assert_eq!(config.head_dim(), 4);
        assert!(!config.attention_bias);
        assert!(config.rope_scaling.is_none());
    }

    #[test]
    fn test_rejects_other_model_types() {
        let mut config = tiny_config();
        config.model_type = Some("gpt2".into());
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::ProviderLoad { .. })
        ));
    }

    #[test]
    fn test_llama3_rope_scaling() {
        let scaling = RopeScaling {
            rope_type: "llama3".into(),
            factor: 32.0,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_max_position_embeddings: 8192,
        };
        // High frequency (short wavelength): untouched
        assert_eq!(scale_frequency(1.0, Some(&scaling)).unwrap(), 1.0);
        // Very low frequency (wavelength > 8192): divided by factor
        let low = 1e-5;
        assert!((scale_frequency(low, Some(&scaling)).unwrap() - low / 32.0).abs() < 1e-12);
        // Unknown type is an error
        let bad = RopeScaling {
            rope_type: "yarn".into(),
            ..scaling
        };
        assert!(scale_frequency(1.0, Some(&bad)).is_err());
    }

    #[test]
    fn test_forward_shapes() {
        let (model, _varmap) = tiny_model();
        let logits = model.forward(&tokens()).unwrap();
        assert_eq!(logits.dims(), &[2, 6, 32]);
    }

    #[test]
    fn test_capture_collects_every_hook() {
        let (model, _varmap) = tiny_model();
        let (logits, cache) = model.forward_with_cache(&tokens()).unwrap();
        assert_eq!(logits.dims(), &[2, 6, 32]);
        assert_eq!(cache.len(), model.hook_points().len());
        for hook in model.hook_points() {
            assert_eq!(cache.require(&hook).unwrap().dims(), &[2, 6, 16]);
        }
    }

    #[test]
    fn test_capture_matches_plain_forward() {
        let (model, _varmap) = tiny_model();
        let plain = model.forward(&tokens()).unwrap();
        let (captured, _) = model.forward_with_cache(&tokens()).unwrap();
        let diff: f32 = (plain - captured)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_identity_substitution_is_a_no_op() {
        let (model, _varmap) = tiny_model();
        let (plain, cache) = model.forward_with_cache(&tokens()).unwrap();
        let original = cache.require(&HookPoint::MlpOut(0)).unwrap().clone();

        let policy = SubstitutionPolicy::Reconstruction(original);
        let mut sub = Substitution::new(HookPoint::MlpOut(0), &policy);
        let substituted = model.forward_with_substitution(&tokens(), &mut sub).unwrap();
        assert_eq!(sub.times_applied(), 1);

        let diff: f32 = (plain - substituted)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_zero_substitution_changes_output() {
        let (model, _varmap) = tiny_model();
        let plain = model.forward(&tokens()).unwrap();

        let policy = SubstitutionPolicy::Zero;
        let mut sub = Substitution::new(HookPoint::MlpOut(0), &policy);
        let ablated = model.forward_with_substitution(&tokens(), &mut sub).unwrap();

        let diff: f32 = (plain - ablated)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_substitution_at_unknown_hook() {
        let (model, _varmap) = tiny_model();
        let policy = SubstitutionPolicy::Zero;
        let mut sub = Substitution::new(HookPoint::MlpOut(7), &policy);
        let err = model
            .forward_with_substitution(&tokens(), &mut sub)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::HookNotFound(_))
        ));
        assert_eq!(sub.times_applied(), 0);
    }

    #[test]
    fn test_wrong_shape_substitution_rejected() {
        let (model, _varmap) = tiny_model();
        let wrong = Tensor::zeros((2, 5, 16), DType::F32, &Device::Cpu).unwrap();
        let policy = SubstitutionPolicy::Reconstruction(wrong);
        let mut sub = Substitution::new(HookPoint::MlpOut(0), &policy);
        let err = model
            .forward_with_substitution(&tokens(), &mut sub)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::ShapeMismatch { .. })
        ));
    }
}
