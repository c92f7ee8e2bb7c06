//! Causal attention masks
//!
//! Masks are cached by `(seq_len, dtype)` inside a [`MaskCache`] owned by
//! each model instance, so repeated evaluation runs in one process never
//! share mask state. A fixed-length corpus only ever needs one entry.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Per-model cache of additive causal masks.
#[derive(Debug)]
pub struct MaskCache {
    device: Device,
    masks: Mutex<HashMap<(usize, DType), Tensor>>,
}

impl MaskCache {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            masks: Mutex::new(HashMap::new()),
        }
    }

    /// Create or retrieve a causal mask for the given sequence length
    ///
    /// # Returns
    ///
    /// A tensor of shape `[1, 1, seq_len, seq_len]` where:
    /// - `0.0` for positions that can attend (j <= i)
    /// - `-inf` for positions that cannot attend (j > i)
    ///
    /// For seq_len=3:
    /// ```text
    /// [[[[0, -inf, -inf],
    ///    [0,    0, -inf],
    ///    [0,    0,    0]]]]
    /// ```
    pub fn causal(&self, seq_len: usize, dtype: DType) -> Result<Tensor> {
        let key = (seq_len, dtype);
        let mut masks = self
            .masks
            .lock()
            .map_err(|_| anyhow::anyhow!("Mask cache lock poisoned"))?;
        if let Some(cached) = masks.get(&key) {
            return Ok(cached.clone()); // Shallow clone (Arc bump, no data copy)
        }

        let mask = create_causal_mask(seq_len, &self.device, dtype)?;
        masks.insert(key, mask.clone());
        Ok(mask)
    }

    /// Number of cached masks
    pub fn len(&self) -> usize {
        self.masks.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build an uncached causal mask of shape `[1, 1, seq_len, seq_len]`.
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?)
}
