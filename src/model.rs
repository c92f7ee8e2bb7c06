//! Model provider: backend trait and the tokenizer-carrying wrapper
//!
//! [`LossBackend`] is the forward-pass capability the evaluation loop
//! consumes. It has three modes: plain, capture (collect every hook point)
//! and substitution (replace exactly one hook point). [`EvalModel`] pairs a
//! backend with its tokenizer.

use anyhow::{Context, Result};
use candle_core::Tensor;
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::cache::ActivationCache;
use crate::error::EvalError;
use crate::forward_llama::LlamaModel;
use crate::hooks::{HookPoint, Substitution};
use crate::runtime::RuntimeConfig;

/// Forward-pass capability for loss evaluation.
///
/// All passes return logits of shape `(batch, seq_len, vocab)`; candle only
/// builds autograd graphs through `Var`s, so none of these track gradients
/// for loaded checkpoints.
pub trait LossBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;

    /// Every hook point this backend's forward pass visits, in order.
    fn hook_points(&self) -> Vec<HookPoint>;

    fn has_hook(&self, hook: &HookPoint) -> bool {
        self.hook_points().contains(hook)
    }

    // --- Forward passes ---
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Forward pass recording the activation at every hook point.
    fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)>;

    /// Forward pass with `substitution` injected at its hook point.
    ///
    /// Fails with [`EvalError::HookNotFound`] for a hook this backend lacks and
    /// with [`EvalError::SubstitutionNotApplied`] unless it fired exactly once.
    fn forward_with_substitution(
        &self,
        input_ids: &Tensor,
        substitution: &mut Substitution<'_>,
    ) -> Result<Tensor>;
}

/// A loaded backend with its tokenizer.
pub struct EvalModel {
    model: Box<dyn LossBackend>,
    tokenizer: Tokenizer,
    model_id: String,
}

impl EvalModel {
    /// Load a LLaMA-family model and its tokenizer from the hub or a local directory.
    pub fn from_pretrained(model_id: &str, runtime: &RuntimeConfig) -> Result<Self> {
        info!("Loading model: {}", model_id);
        let tokenizer = load_tokenizer(model_id)?;
        let model = LlamaModel::load(model_id, runtime)?;
        Ok(Self::new(Box::new(model), tokenizer, model_id))
    }

    /// Wrap an already-built backend.
    pub fn new(model: Box<dyn LossBackend>, tokenizer: Tokenizer, model_id: &str) -> Self {
        Self {
            model,
            tokenizer,
            model_id: model_id.to_string(),
        }
    }

    pub fn backend(&self) -> &dyn LossBackend {
        self.model.as_ref()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    /// Get the EOS token ID for this model
    ///
    /// Used as the padding token, matching `pad_token = eos_token`.
    pub fn eos_token_id(&self) -> Option<u32> {
        eos_token_id(&self.tokenizer)
    }
}

/// Look up the end-of-sequence token among the names LLaMA-family tokenizers use
pub fn eos_token_id(tokenizer: &Tokenizer) -> Option<u32> {
    ["<|end_of_text|>", "<|endoftext|>", "</s>", "<|eot_id|>", "<eos>"]
        .iter()
        .find_map(|name| tokenizer.token_to_id(name))
}

/// Load `tokenizer.json` from a local model directory or the hub
pub fn load_tokenizer(model_id: &str) -> Result<Tokenizer> {
    let local = std::path::Path::new(model_id).join("tokenizer.json");
    let tokenizer_path = if local.is_file() {
        local
    } else {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        repo.get("tokenizer.json")
            .context("Failed to download tokenizer.json")
            .map_err(|e| EvalError::provider_load("tokenizer", format!("{e:#}")))?
    };
    Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| EvalError::provider_load("tokenizer", format!("Tokenizer error: {e}")).into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::str::FromStr;

    /// Whitespace word-level tokenizer with `<unk>`, `</s>` and 30 words.
    pub(crate) fn tiny_tokenizer() -> Tokenizer {
        let mut vocab = vec![r#""<unk>": 0"#.to_string(), r#""</s>": 1"#.to_string()];
        for i in 0..30 {
            vocab.push(format!(r#""w{i}": {}"#, i + 2));
        }
        let json = format!(
            r#"{{
                "version": "1.0",
                "truncation": null,
                "padding": null,
                "added_tokens": [],
                "normalizer": null,
                "pre_tokenizer": {{"type": "Whitespace"}},
                "post_processor": null,
                "decoder": null,
                "model": {{
                    "type": "WordLevel",
                    "vocab": {{{}}},
                    "unk_token": "<unk>"
                }}
            }}"#,
            vocab.join(", ")
        );
        Tokenizer::from_str(&json).unwrap()
    }

    #[test]
    fn test_eos_lookup() {
        let tokenizer = tiny_tokenizer();
        assert_eq!(eos_token_id(&tokenizer), Some(1));
    }

    #[test]
    fn test_eval_model_wraps_backend() {
        let (llama, _varmap) = crate::forward_llama::tests::tiny_model();
        let model = EvalModel::new(Box::new(llama), tiny_tokenizer(), "tiny");
        assert_eq!(model.n_layers(), 2);
        assert_eq!(model.d_model(), 16);
        assert_eq!(model.model_id(), "tiny");
        assert!(model.backend().has_hook(&HookPoint::MlpOut(1)));
        assert!(!model.backend().has_hook(&HookPoint::MlpOut(2)));
        assert_eq!(model.eos_token_id(), Some(1));
    }
}
