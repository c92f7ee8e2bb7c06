//! Activation capture and activation substitution passes
//!
//! The evaluation of one batch needs three forward passes through the same
//! backend:
//!
//! - **Capture**: the unmodified pass. It yields the original loss and the
//!   activation at the target hook point.
//! - **Reconstruction**: the target activation is replaced by the codec's
//!   reconstruction of it.
//! - **Zero ablation**: the target activation is replaced by zeros.
//!
//! The substituted passes recompute everything from the input ids; nothing
//! captured by the first pass is reused except the replacement tensor
//! itself, and neither substituted pass can observe the other.
//!
//! ## Example
//!
//! ```ignore
//! use sae_recon_rs::{ActivationCapture, InterventionRunner, HookPoint, SubstitutionPolicy};
//!
//! let hook = HookPoint::MlpOut(0);
//! let captured = ActivationCapture::new(model.backend(), false).capture(&batch, &hook)?;
//! let runner = InterventionRunner::new(model.backend(), false);
//! let zero_loss = runner.run(&batch, &hook, &SubstitutionPolicy::Zero)?;
//! println!("orig {:.4} / zero {:.4}", captured.loss, zero_loss);
//! ```

use anyhow::Result;
use candle_core::Tensor;

use crate::corpus::Batch;
use crate::hooks::{HookPoint, Substitution, SubstitutionPolicy};
use crate::loss::next_token_loss;
use crate::model::LossBackend;

/// Output of a capture pass.
#[derive(Debug, Clone)]
pub struct CapturedActivation {
    /// Loss of the unmodified model on the batch
    pub loss: f64,
    /// `(batch, seq_len, d_model)` activation at the target hook point
    pub activation: Tensor,
}

/// Runs the unmodified forward pass and keeps one hooked activation.
pub struct ActivationCapture<'m> {
    backend: &'m dyn LossBackend,
    mask_padding: bool,
}

impl<'m> ActivationCapture<'m> {
    pub fn new(backend: &'m dyn LossBackend, mask_padding: bool) -> Self {
        Self {
            backend,
            mask_padding,
        }
    }

    /// Forward `batch`, returning its loss and the activation at `hook`.
    ///
    /// Every other captured activation is dropped before returning.
    pub fn capture(&self, batch: &Batch, hook: &HookPoint) -> Result<CapturedActivation> {
        let (logits, mut cache) = self.backend.forward_with_cache(&batch.input_ids)?;
        let activation = cache.take(hook)?;
        drop(cache);

        let loss = next_token_loss(&logits, &batch.input_ids, loss_mask(batch, self.mask_padding))?;
        Ok(CapturedActivation { loss, activation })
    }
}

/// Re-runs the forward pass with one substituted activation.
pub struct InterventionRunner<'m> {
    backend: &'m dyn LossBackend,
    mask_padding: bool,
}

impl<'m> InterventionRunner<'m> {
    pub fn new(backend: &'m dyn LossBackend, mask_padding: bool) -> Self {
        Self {
            backend,
            mask_padding,
        }
    }

    /// Loss of `batch` with the activation at `hook` replaced per `policy`.
    pub fn run(&self, batch: &Batch, hook: &HookPoint, policy: &SubstitutionPolicy) -> Result<f64> {
        let mut substitution = Substitution::new(hook.clone(), policy);
        let logits = self
            .backend
            .forward_with_substitution(&batch.input_ids, &mut substitution)?;
        next_token_loss(&logits, &batch.input_ids, loss_mask(batch, self.mask_padding))
    }
}

fn loss_mask(batch: &Batch, mask_padding: bool) -> Option<&Tensor> {
    mask_padding.then_some(&batch.attention_mask)
}
