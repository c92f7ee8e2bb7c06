//! Sparse autoencoder (SAE) feature codec
//!
//! Loads sae_lens-format checkpoints (`cfg.json` + `sae_weights.safetensors`)
//! from a local directory or a HuggingFace repository, and implements the
//! encode/decode pair used to reconstruct a hooked activation.
//!
//! # SAE Architectures
//!
//! With `sae_in = x - b_dec` (when `apply_b_dec_to_input`, else `x`):
//! ```text
//! standard:  f = ReLU(sae_in @ W_enc + b_enc)
//! gated:     f = [sae_in @ W_enc + b_gate > 0] * ReLU(sae_in @ (W_enc * exp(r_mag)) + b_mag)
//! jumprelu:  pre = sae_in @ W_enc + b_enc;  f = ReLU(pre) * [pre > threshold]
//! topk:      pre = sae_in @ W_enc + b_enc;  f = ReLU(pre) on the k largest entries per token, 0 elsewhere
//! decode:    x_hat = f @ W_dec + b_dec
//! ```
//!
//! # Weight File Layout
//!
//! - `W_enc`: `[d_in, d_sae]`, `W_dec`: `[d_sae, d_in]`, `b_dec`: `[d_in]`
//! - `b_enc`: `[d_sae]` (standard, jumprelu, topk)
//! - `b_gate`, `b_mag`, `r_mag`: `[d_sae]` (gated)
//! - `threshold`: `[d_sae]` (jumprelu)
//!
//! All weights are held in F32 on the evaluation device; activations are
//! promoted to F32 for the matmuls and cast back to their own dtype.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EvalError;
use crate::hooks::HookPoint;

/// Checkpoint file names inside an SAE directory
pub const SAE_CONFIG_FILE: &str = "cfg.json";
pub const SAE_WEIGHTS_FILE: &str = "sae_weights.safetensors";

// ---------------------------------------------------------------------------
// FeatureCodec
// ---------------------------------------------------------------------------

/// Encode/decode capability consumed by the evaluation loop.
///
/// `decode(encode(x))` has the same shape and dtype as `x`. Both operations
/// are deterministic and side-effect free.
pub trait FeatureCodec {
    /// Width of the activation's innermost dimension.
    fn input_width(&self) -> usize;
    /// Width of the feature (code) dimension.
    fn code_width(&self) -> usize;
    /// Hook point this codec was trained on.
    fn hook_name(&self) -> &str;

    /// `(..., input_width)` → `(..., code_width)`
    fn encode(&self, activation: &Tensor) -> Result<Tensor>;
    /// `(..., code_width)` → `(..., input_width)`
    fn decode(&self, features: &Tensor) -> Result<Tensor>;

    fn hook_point(&self) -> HookPoint {
        HookPoint::from(self.hook_name())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaeArchitecture {
    #[default]
    Standard,
    Gated,
    JumpRelu,
    TopK,
}

impl std::fmt::Display for SaeArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Standard => "standard",
            Self::Gated => "gated",
            Self::JumpRelu => "jumprelu",
            Self::TopK => "topk",
        };
        write!(f, "{name}")
    }
}

/// Subset of the sae_lens `cfg.json` this crate understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaeConfig {
    pub d_in: usize,
    pub d_sae: usize,
    pub hook_name: String,
    #[serde(default)]
    pub architecture: SaeArchitecture,
    /// `relu` or `topk`; older sae_lens checkpoints mark top-k SAEs here
    /// instead of in `architecture`
    #[serde(default)]
    pub activation_fn_str: Option<String>,
    /// Active features per token for `topk`; also read from `activation_fn_kwargs.k`
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default = "default_apply_b_dec_to_input")]
    pub apply_b_dec_to_input: bool,
    #[serde(default)]
    pub normalize_activations: Option<String>,
    #[serde(default)]
    pub finetuning_scaling_factor: bool,
    #[serde(default)]
    pub activation_fn_kwargs: Option<HashMap<String, serde_json::Value>>,
}

fn default_apply_b_dec_to_input() -> bool {
    true
}

impl SaeConfig {
    /// `k` for top-k SAEs, from either location sae_lens writes it to.
    pub fn top_k(&self) -> Option<usize> {
        self.k.or_else(|| {
            self.activation_fn_kwargs
                .as_ref()
                .and_then(|kw| kw.get("k"))
                .and_then(serde_json::Value::as_u64)
                .map(|k| k as usize)
        })
    }

    /// Encoder actually used, combining `architecture` and `activation_fn_str`.
    pub fn encoder_architecture(&self) -> Result<SaeArchitecture> {
        match (self.architecture, self.activation_fn_str.as_deref()) {
            (arch, None | Some("relu")) => Ok(arch),
            (SaeArchitecture::Standard | SaeArchitecture::TopK, Some("topk")) => {
                Ok(SaeArchitecture::TopK)
            }
            (arch, Some(other)) => Err(EvalError::provider_load(
                "sae",
                format!("activation_fn_str '{other}' is not supported for {arch} SAEs"),
            )
            .into()),
        }
    }

    fn validate(&self) -> Result<()> {
        match self.normalize_activations.as_deref() {
            None | Some("none") => {}
            Some(other) => {
                return Err(EvalError::provider_load(
                    "sae",
                    format!("normalize_activations '{other}' is not supported"),
                )
                .into())
            }
        }
        if self.finetuning_scaling_factor {
            return Err(EvalError::provider_load(
                "sae",
                "finetuning_scaling_factor is not supported".to_string(),
            )
            .into());
        }
        if self.encoder_architecture()? == SaeArchitecture::TopK {
            match self.top_k() {
                Some(k) if k > 0 && k <= self.d_sae => {}
                Some(k) => {
                    return Err(EvalError::provider_load(
                        "sae",
                        format!("topk k={k} out of range for d_sae={}", self.d_sae),
                    )
                    .into())
                }
                None => {
                    return Err(
                        EvalError::provider_load("sae", "topk SAE without k".to_string()).into(),
                    )
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sae
// ---------------------------------------------------------------------------

/// Architecture-specific encoder parameters.
enum EncoderParams {
    Standard { b_enc: Tensor },
    Gated { b_gate: Tensor, b_mag: Tensor, r_mag: Tensor },
    JumpRelu { b_enc: Tensor, threshold: Tensor },
    TopK { b_enc: Tensor, k: usize },
}

/// A loaded sparse autoencoder in evaluation mode.
pub struct Sae {
    config: SaeConfig,
    w_enc: Tensor, // [d_in, d_sae]
    w_dec: Tensor, // [d_sae, d_in]
    b_dec: Tensor, // [d_in]
    encoder: EncoderParams,
}

impl Sae {
    /// Load from a local checkpoint directory.
    pub fn load_dir(dir: &Path, device: &Device) -> Result<Self> {
        let config_path = dir.join(SAE_CONFIG_FILE);
        let weights_path = dir.join(SAE_WEIGHTS_FILE);
        for path in [&config_path, &weights_path] {
            if !path.is_file() {
                return Err(EvalError::provider_load(
                    "sae",
                    format!("missing {}", path.display()),
                )
                .into());
            }
        }
        Self::load_files(&config_path, &weights_path, device)
    }

    /// Download a checkpoint from a HuggingFace repository.
    ///
    /// `subfolder` selects one SAE in repositories that hold several
    /// (e.g. one per hook point).
    pub fn from_pretrained(
        repo_id: &str,
        subfolder: Option<&str>,
        device: &Device,
    ) -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));
        let remote = |name: &str| match subfolder {
            Some(dir) => format!("{}/{name}", dir.trim_end_matches('/')),
            None => name.to_string(),
        };

        info!("Downloading SAE from {repo_id}");
        let fetch = |name: &str| -> Result<PathBuf> {
            repo.get(&remote(name)).map_err(|e| {
                EvalError::provider_load("sae", format!("{}: {e}", remote(name))).into()
            })
        };
        let config_path = fetch(SAE_CONFIG_FILE)?;
        let weights_path = fetch(SAE_WEIGHTS_FILE)?;
        Self::load_files(&config_path, &weights_path, device)
    }

    /// Load from a local path when it exists, otherwise from the hub.
    pub fn open(location: &str, subfolder: Option<&str>, device: &Device) -> Result<Self> {
        let local = match subfolder {
            Some(dir) => Path::new(location).join(dir),
            None => PathBuf::from(location),
        };
        if local.is_dir() {
            Self::load_dir(&local, device)
        } else {
            Self::from_pretrained(location, subfolder, device)
        }
    }

    fn load_files(config_path: &Path, weights_path: &Path, device: &Device) -> Result<Self> {
        let text = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: SaeConfig = serde_json::from_str(&text)
            .map_err(|e| EvalError::provider_load("sae", format!("bad cfg.json: {e}")))?;

        let data = std::fs::read(weights_path)
            .with_context(|| format!("Failed to read {}", weights_path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .map_err(|e| EvalError::provider_load("sae", format!("bad safetensors: {e}")))?;
        let mut tensors = HashMap::new();
        for (name, view) in st.tensors() {
            tensors.insert(name, tensor_from_view(&view, device)?);
        }

        let sae = Self::from_tensors(config, tensors)?;
        info!(
            "SAE: {} d_in={}, d_sae={}, hook={}",
            sae.architecture(),
            sae.config.d_in,
            sae.config.d_sae,
            sae.config.hook_name
        );
        Ok(sae)
    }

    /// Build from named tensors, checking every shape against `config`.
    pub fn from_tensors(config: SaeConfig, mut tensors: HashMap<String, Tensor>) -> Result<Self> {
        config.validate()?;
        let (d_in, d_sae) = (config.d_in, config.d_sae);

        let mut take = |name: &str, shape: &[usize]| -> Result<Tensor> {
            let t = tensors.remove(name).ok_or_else(|| {
                EvalError::provider_load("sae", format!("tensor '{name}' missing"))
            })?;
            if t.dims() != shape {
                return Err(EvalError::provider_load(
                    "sae",
                    format!("tensor '{name}' has shape {:?}, expected {shape:?}", t.dims()),
                )
                .into());
            }
            Ok(t.to_dtype(DType::F32)?)
        };

        let w_enc = take("W_enc", &[d_in, d_sae])?;
        let w_dec = take("W_dec", &[d_sae, d_in])?;
        let b_dec = take("b_dec", &[d_in])?;
        let encoder = match config.encoder_architecture()? {
            SaeArchitecture::Standard => EncoderParams::Standard {
                b_enc: take("b_enc", &[d_sae])?,
            },
            SaeArchitecture::Gated => EncoderParams::Gated {
                b_gate: take("b_gate", &[d_sae])?,
                b_mag: take("b_mag", &[d_sae])?,
                r_mag: take("r_mag", &[d_sae])?,
            },
            SaeArchitecture::JumpRelu => EncoderParams::JumpRelu {
                b_enc: take("b_enc", &[d_sae])?,
                threshold: take("threshold", &[d_sae])?,
            },
            SaeArchitecture::TopK => EncoderParams::TopK {
                b_enc: take("b_enc", &[d_sae])?,
                k: config.top_k().unwrap_or(d_sae),
            },
        };

        Ok(Self {
            config,
            w_enc,
            w_dec,
            b_dec,
            encoder,
        })
    }

    pub fn config(&self) -> &SaeConfig {
        &self.config
    }

    /// Architecture of the loaded encoder.
    pub fn architecture(&self) -> SaeArchitecture {
        match self.encoder {
            EncoderParams::Standard { .. } => SaeArchitecture::Standard,
            EncoderParams::Gated { .. } => SaeArchitecture::Gated,
            EncoderParams::JumpRelu { .. } => SaeArchitecture::JumpRelu,
            EncoderParams::TopK { .. } => SaeArchitecture::TopK,
        }
    }

    /// Mean number of active features per token.
    pub fn l0(&self, features: &Tensor) -> Result<f64> {
        l0(features)
    }

    /// Flatten leading dims and promote to F32, checking the innermost width.
    fn flatten_input(&self, x: &Tensor, width: usize, context: &str) -> Result<Tensor> {
        let dims = x.dims();
        match dims.last() {
            Some(&last) if last == width => {}
            _ => {
                let mut expected = dims.to_vec();
                match expected.last_mut() {
                    Some(last) => *last = width,
                    None => expected.push(width),
                }
                return Err(EvalError::shape_mismatch(context, &expected, dims).into());
            }
        }
        let rows = x.elem_count() / width;
        Ok(x.to_dtype(DType::F32)?.reshape((rows, width))?)
    }

    fn encode_rows(&self, sae_in: &Tensor) -> Result<Tensor> {
        let pre = |bias: &Tensor| -> Result<Tensor> {
            Ok(sae_in.matmul(&self.w_enc)?.broadcast_add(bias)?)
        };
        let features = match &self.encoder {
            EncoderParams::Standard { b_enc } => pre(b_enc)?.relu()?,
            EncoderParams::Gated {
                b_gate,
                b_mag,
                r_mag,
            } => {
                let active = pre(b_gate)?.gt(0f32)?.to_dtype(DType::F32)?;
                let w_mag = self.w_enc.broadcast_mul(&r_mag.exp()?)?;
                let magnitude = sae_in.matmul(&w_mag)?.broadcast_add(b_mag)?.relu()?;
                (active * magnitude)?
            }
            EncoderParams::JumpRelu { b_enc, threshold } => {
                let pre = pre(b_enc)?;
                let open = pre.broadcast_gt(threshold)?.to_dtype(DType::F32)?;
                (pre.relu()? * open)?
            }
            EncoderParams::TopK { b_enc, k } => {
                let pre = pre(b_enc)?.contiguous()?;
                // k-th largest value per row; ties at the boundary stay active
                let (sorted, _) = pre.sort_last_dim(false)?;
                let kth = sorted.narrow(1, k - 1, 1)?;
                let keep = pre.broadcast_ge(&kth)?.to_dtype(DType::F32)?;
                (pre.relu()? * keep)?
            }
        };
        Ok(features)
    }
}

impl FeatureCodec for Sae {
    fn input_width(&self) -> usize {
        self.config.d_in
    }

    fn code_width(&self) -> usize {
        self.config.d_sae
    }

    fn hook_name(&self) -> &str {
        &self.config.hook_name
    }

    fn encode(&self, activation: &Tensor) -> Result<Tensor> {
        let rows = self.flatten_input(activation, self.config.d_in, "sae encode input")?;
        let sae_in = if self.config.apply_b_dec_to_input {
            rows.broadcast_sub(&self.b_dec)?
        } else {
            rows
        };
        let features = self.encode_rows(&sae_in)?;

        let mut shape = activation.dims().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = self.config.d_sae;
        }
        Ok(features.reshape(shape)?.to_dtype(activation.dtype())?)
    }

    fn decode(&self, features: &Tensor) -> Result<Tensor> {
        let rows = self.flatten_input(features, self.config.d_sae, "sae decode input")?;
        let out = rows.matmul(&self.w_dec)?.broadcast_add(&self.b_dec)?;

        let mut shape = features.dims().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = self.config.d_in;
        }
        Ok(out.reshape(shape)?.to_dtype(features.dtype())?)
    }
}

/// Mean number of non-zero entries along the last dimension.
pub fn l0(features: &Tensor) -> Result<f64> {
    let active = features
        .to_dtype(DType::F32)?
        .ne(0f32)?
        .to_dtype(DType::F32)?
        .sum(D::Minus1)?;
    Ok(f64::from(active.mean_all()?.to_scalar::<f32>()?))
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::F64 => DType::F64,
        other => anyhow::bail!("Unsupported SAE tensor dtype: {other:?}"),
    };
    Ok(Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
