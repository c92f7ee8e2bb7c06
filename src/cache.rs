//! Activation cache filled by a capture pass

use std::collections::HashMap;

use anyhow::Result;
use candle_core::Tensor;

use crate::error::EvalError;
use crate::hooks::HookPoint;

/// Full-position activations from one forward pass, keyed by hook point.
///
/// Each tensor has shape `(batch, seq_len, d_model)`. Stored tensors are
/// detached, so nothing captured here keeps an autograd graph alive.
#[derive(Debug, Default)]
pub struct ActivationCache {
    activations: HashMap<HookPoint, Tensor>,
}

impl ActivationCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the activation observed at `hook`
    pub fn store(&mut self, hook: HookPoint, tensor: &Tensor) {
        self.activations.insert(hook, tensor.detach());
    }

    /// Get the activation at a hook point
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.activations.get(hook)
    }

    /// Get the activation at a hook point, failing if it was never captured
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.activations
            .get(hook)
            .ok_or_else(|| EvalError::HookNotFound(hook.to_string()).into())
    }

    /// Move one activation out of the cache
    pub fn take(&mut self, hook: &HookPoint) -> Result<Tensor> {
        self.activations
            .remove(hook)
            .ok_or_else(|| EvalError::HookNotFound(hook.to_string()).into())
    }

    /// Number of captured hook points
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }
}
