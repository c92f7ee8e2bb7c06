//! Error taxonomy for reconstruction evaluation
//!
//! Library functions return `anyhow::Result`; the variants below are
//! wrapped inside `anyhow::Error` so callers can `downcast_ref::<EvalError>()`
//! to tell a fatal resource condition from a contract violation.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// Device memory exhausted during a forward pass. Never retried.
    #[error("out of memory evaluating batch {batch_index} ({batch_size}x{seq_len} tokens): {message}")]
    OutOfMemory {
        batch_index: usize,
        batch_size: usize,
        seq_len: usize,
        message: String,
    },

    /// A tensor did not have the exact shape its consumer requires.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Model, codec or corpus could not be loaded or is inconsistent.
    #[error("failed to load {provider}: {reason}")]
    ProviderLoad { provider: String, reason: String },

    /// The requested hook point does not exist in this model.
    #[error("hook point `{0}` is not available in this model")]
    HookNotFound(String),

    /// A substitution fired a number of times other than exactly once.
    #[error("substitution at `{hook}` was applied {times} times (expected exactly 1)")]
    SubstitutionNotApplied { hook: String, times: usize },
}

impl EvalError {
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: &[usize],
        actual: &[usize],
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub fn provider_load(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderLoad {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

/// Whether an error chain reports device memory exhaustion.
///
/// candle surfaces CUDA/Metal allocation failures as plain backend errors,
/// so this inspects the rendered chain for the driver's wording.
pub fn is_out_of_memory(err: &anyhow::Error) -> bool {
    if matches!(
        err.downcast_ref::<EvalError>(),
        Some(EvalError::OutOfMemory { .. })
    ) {
        return true;
    }
    err.chain().any(|cause| {
        let msg = cause.to_string().to_lowercase();
        msg.contains("out of memory") || msg.contains("out_of_memory")
    })
}
