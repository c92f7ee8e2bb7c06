//! Next-token cross-entropy from logits
//!
//! Position `t` of the logits predicts token `t + 1` of the input, so a
//! batch of length `seq_len` yields `seq_len - 1` predictions per row.
//! The loss is their mean negative log-likelihood, computed in F32.

use anyhow::Result;
use candle_core::{DType, Tensor, D};

/// Mean next-token loss over a batch.
///
/// - `logits`: `(batch, seq_len, vocab)`
/// - `input_ids`: `(batch, seq_len)`, `u32`
/// - `attention_mask`: optional `(batch, seq_len)`; when given, only
///   predictions whose *target* token is a real token (mask = 1) count.
pub fn next_token_loss(
    logits: &Tensor,
    input_ids: &Tensor,
    attention_mask: Option<&Tensor>,
) -> Result<f64> {
    let nll = per_token_nll(logits, input_ids)?;
    let (_, n_pred) = nll.dims2()?;

    let loss = match attention_mask {
        None => nll.mean_all()?.to_scalar::<f32>()?,
        Some(mask) => {
            let mask = mask.narrow(1, 1, n_pred)?.to_dtype(DType::F32)?;
            let count = mask.sum_all()?.to_scalar::<f32>()?;
            anyhow::ensure!(count > 0.0, "Attention mask leaves no predicted tokens");
            let total = (&nll * &mask)?.sum_all()?.to_scalar::<f32>()?;
            total / count
        }
    };
    Ok(f64::from(loss))
}

/// Per-position negative log-likelihood, shape `(batch, seq_len - 1)`.
pub fn per_token_nll(logits: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, _vocab) = logits.dims3()?;
    let (id_batch, id_len) = input_ids.dims2()?;
    anyhow::ensure!(
        batch == id_batch && seq_len == id_len,
        "Logits ({batch}, {seq_len}) do not match input ids ({id_batch}, {id_len})"
    );
    anyhow::ensure!(
        seq_len >= 2,
        "Need at least 2 tokens per sequence for a next-token loss, got {seq_len}"
    );

    // PROMOTE: log-softmax over a large vocab needs f32
    let logits = logits
        .narrow(1, 0, seq_len - 1)?
        .to_dtype(DType::F32)?
        .contiguous()?;
    let targets = input_ids
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::U32)?
        .contiguous()?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?.contiguous()?;
    let picked = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;
    Ok(picked.neg()?)
}
