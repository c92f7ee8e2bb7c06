//! Corpus loading, sampling and fixed-length tokenization
//!
//! Texts come from a JSON file (`{"samples": [{"text": ...}]}`) or a
//! JSON-lines file (one `{"text": ...}` object per line). They are shuffled
//! with a seeded RNG, downsampled, tokenized, truncated to `max_length` and
//! right-padded with the pad token so every sequence has the same length.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::EvalError;

/// A single text sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSample {
    pub text: String,
}

/// Raw JSON structure for loading
#[derive(Debug, Deserialize)]
struct CorpusFile {
    samples: Vec<TextSample>,
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
}

/// Collection of raw text samples
#[derive(Debug, Clone)]
pub struct Corpus {
    samples: Vec<TextSample>,
}

impl Corpus {
    /// Load a corpus from a `.json` document or a JSON-lines file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus {}", path.display()))?;

        let is_jsonl = path
            .extension()
            .is_some_and(|ext| ext == "jsonl" || ext == "ndjson");
        let samples = if is_jsonl {
            parse_jsonl(&content)?
        } else {
            let file: CorpusFile = serde_json::from_str(&content).map_err(|e| {
                EvalError::provider_load("corpus", format!("{}: {e}", path.display()))
            })?;
            file.samples
        };
        Ok(Self { samples })
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            samples: texts
                .into_iter()
                .map(|text| TextSample { text: text.into() })
                .collect(),
        }
    }

    /// Shuffle with `seed` and keep the first `sample_size` samples.
    ///
    /// Asking for more samples than the corpus holds keeps all of them.
    pub fn sample(&self, sample_size: usize, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut samples = self.samples.clone();
        samples.shuffle(&mut rng);
        samples.truncate(sample_size);
        Self { samples }
    }

    /// Total number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if corpus is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Get all samples
    pub fn samples(&self) -> &[TextSample] {
        &self.samples
    }
}

fn parse_jsonl(content: &str) -> Result<Vec<TextSample>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<TextSample>(line).map_err(|e| {
                anyhow::Error::from(EvalError::provider_load(
                    "corpus",
                    format!("line {}: {e}", i + 1),
                ))
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tokenized corpus
// ---------------------------------------------------------------------------

/// Fixed-length token sequences with their attention masks.
///
/// Stored row-major on the host; batches are materialized on demand.
#[derive(Debug, Clone)]
pub struct TokenizedCorpus {
    input_ids: Vec<u32>,
    attention_mask: Vec<u32>,
    n_sequences: usize,
    seq_len: usize,
}

impl TokenizedCorpus {
    /// Tokenize every sample (special tokens added), truncate to `max_length`
    /// and right-pad with `pad_id`.
    pub fn tokenize(
        corpus: &Corpus,
        tokenizer: &Tokenizer,
        max_length: usize,
        pad_id: u32,
    ) -> Result<Self> {
        let mut rows = Vec::with_capacity(corpus.len());
        for sample in corpus.samples() {
            let encoding = tokenizer
                .encode(sample.text.as_str(), true)
                .map_err(|e| anyhow::anyhow!("Tokenization failed: {e}"))?;
            rows.push(encoding.get_ids().to_vec());
        }
        Self::from_rows(&rows, max_length, pad_id)
    }

    /// Build from already-tokenized rows of any length.
    pub fn from_rows(rows: &[Vec<u32>], max_length: usize, pad_id: u32) -> Result<Self> {
        anyhow::ensure!(
            max_length >= 2,
            "max_length must be at least 2 for a next-token loss, got {max_length}"
        );
        let mut input_ids = Vec::with_capacity(rows.len() * max_length);
        let mut attention_mask = Vec::with_capacity(rows.len() * max_length);
        for row in rows {
            let kept = row.len().min(max_length);
            input_ids.extend_from_slice(&row[..kept]);
            input_ids.extend(std::iter::repeat(pad_id).take(max_length - kept));
            attention_mask.extend(std::iter::repeat(1u32).take(kept));
            attention_mask.extend(std::iter::repeat(0u32).take(max_length - kept));
        }
        Ok(Self {
            input_ids,
            attention_mask,
            n_sequences: rows.len(),
            seq_len: max_length,
        })
    }

    /// Number of sequences
    pub fn len(&self) -> usize {
        self.n_sequences
    }

    pub fn is_empty(&self) -> bool {
        self.n_sequences == 0
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// `ceil(len / batch_size)`
    pub fn n_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            return 0;
        }
        self.n_sequences.div_ceil(batch_size)
    }

    /// Slice batch `index` on the host. The last batch may be short.
    pub fn batch(&self, index: usize, batch_size: usize) -> Result<Batch> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        let offset = index * batch_size;
        anyhow::ensure!(
            offset < self.n_sequences,
            "Batch {index} starts at {offset}, past the {} sequences in the corpus",
            self.n_sequences
        );
        let size = batch_size.min(self.n_sequences - offset);
        let range = offset * self.seq_len..(offset + size) * self.seq_len;

        let input_ids = Tensor::from_slice(
            &self.input_ids[range.clone()],
            (size, self.seq_len),
            &Device::Cpu,
        )?;
        let attention_mask =
            Tensor::from_slice(&self.attention_mask[range], (size, self.seq_len), &Device::Cpu)?;
        Ok(Batch {
            index,
            offset,
            input_ids,
            attention_mask,
        })
    }
}

/// A contiguous slice of the tokenized corpus.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `offset / batch_size`
    pub index: usize,
    /// Index of the first sequence in the corpus
    pub offset: usize,
    /// `(size, seq_len)`, `u32`
    pub input_ids: Tensor,
    /// `(size, seq_len)`, `u32`, 1 = real token
    pub attention_mask: Tensor,
}

impl Batch {
    /// Number of sequences in this batch
    pub fn size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    /// Move both tensors to `device`.
    pub fn to_device(self, device: &Device) -> Result<Self> {
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            attention_mask: self.attention_mask.to_device(device)?,
            ..self
        })
    }
}
