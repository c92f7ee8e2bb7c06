//! Reconstruction-loss experiment runner
//!
//! Coordinates corpus batching, activation capture, SAE encode/decode and the
//! two substituted forward passes, one batch at a time. For each batch:
//!
//! 1. slice the batch from the tokenized corpus and move it to the device
//! 2. capture the original loss and the target activation
//! 3. encode then decode the activation with the SAE
//! 4. forward with the reconstruction substituted → `reconstr_loss`
//! 5. forward with zeros substituted → `zero_loss`
//! 6. append the [`LossRecord`]; the batch scope then releases every tensor
//!
//! Any failure aborts the run. Records appended before the failure stay in
//! the caller's [`ResultTable`].

use std::path::PathBuf;

use anyhow::Result;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::corpus::{Corpus, TokenizedCorpus};
use crate::error::{is_out_of_memory, EvalError};
use crate::hooks::{HookPoint, SubstitutionPolicy};
use crate::intervention::{ActivationCapture, InterventionRunner};
use crate::memory::{BatchScope, WorkingSet};
use crate::model::LossBackend;
use crate::results::{column_mean, LossRecord, ResultTable};
use crate::runtime::RuntimeConfig;
use crate::sae::{l0, FeatureCodec};

/// Configuration for a reconstruction-loss experiment
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Path to corpus JSON / JSON-lines file
    pub corpus_path: PathBuf,
    /// Number of texts kept after shuffling
    pub sample_size: usize,
    /// Random seed for the corpus shuffle
    pub seed: u64,
    /// Tokens per sequence (truncate / pad)
    pub max_length: usize,
    /// Sequences per forward pass
    pub batch_size: usize,
    /// Exclude padding targets from the loss average
    pub mask_padding: bool,
    /// Log progress every N batches (0 = only at the end)
    pub log_every: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            corpus_path: PathBuf::from("corpus/pile-10k.jsonl"),
            sample_size: 400,
            seed: 42,
            max_length: 128,
            batch_size: 8,
            mask_padding: false,
            log_every: 10,
        }
    }
}

impl ExperimentConfig {
    /// Load, shuffle, downsample and tokenize the configured corpus.
    pub fn load_corpus(&self, tokenizer: &Tokenizer, pad_id: u32) -> Result<TokenizedCorpus> {
        let corpus = Corpus::load(&self.corpus_path)?;
        info!(
            "Loaded corpus: {} samples from {}",
            corpus.len(),
            self.corpus_path.display()
        );
        let sampled = corpus.sample(self.sample_size, self.seed);
        let tokenized = TokenizedCorpus::tokenize(&sampled, tokenizer, self.max_length, pad_id)?;
        info!(
            "Tokenized {} sequences of {} tokens (seed {})",
            tokenized.len(),
            tokenized.seq_len(),
            self.seed
        );
        Ok(tokenized)
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentResults {
    pub n_batches: usize,
    pub mean_orig_loss: f64,
    pub mean_reconstr_loss: f64,
    pub mean_zero_loss: f64,
    /// Largest number of bytes held by one batch's scope
    pub peak_working_set_bytes: usize,
}

/// Main experiment runner
pub struct ReconstructionExperiment<'a> {
    backend: &'a dyn LossBackend,
    codec: &'a dyn FeatureCodec,
    runtime: RuntimeConfig,
    config: ExperimentConfig,
}

impl<'a> ReconstructionExperiment<'a> {
    pub fn new(
        backend: &'a dyn LossBackend,
        codec: &'a dyn FeatureCodec,
        runtime: &RuntimeConfig,
        config: ExperimentConfig,
    ) -> Self {
        Self {
            backend,
            codec,
            runtime: runtime.clone(),
            config,
        }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Check the codec fits the model before any batch runs.
    pub fn validate(&self) -> Result<()> {
        let hook = self.codec.hook_point();
        if !self.backend.has_hook(&hook) {
            return Err(EvalError::provider_load(
                "sae",
                format!("hook point `{hook}` is not available in this model"),
            )
            .into());
        }
        if self.codec.input_width() != self.backend.d_model() {
            return Err(EvalError::provider_load(
                "sae",
                format!(
                    "SAE input width {} does not match model width {}",
                    self.codec.input_width(),
                    self.backend.d_model()
                ),
            )
            .into());
        }
        anyhow::ensure!(self.config.batch_size > 0, "batch_size must be positive");
        Ok(())
    }

    /// Evaluate every batch of `corpus`, appending one record per batch to `table`.
    pub fn run(
        &self,
        corpus: &TokenizedCorpus,
        table: &mut ResultTable,
    ) -> Result<ExperimentResults> {
        self.validate()?;
        if corpus.is_empty() {
            return Err(EvalError::provider_load("corpus", "no sequences to evaluate").into());
        }

        let hook = self.codec.hook_point();
        let batch_size = self.config.batch_size;
        let n_batches = corpus.n_batches(batch_size);
        info!("Starting reconstruction experiment");
        info!(
            "Hook {hook}, {} sequences x {} tokens, {n_batches} batches of {batch_size}",
            corpus.len(),
            corpus.seq_len()
        );

        let capture = ActivationCapture::new(self.backend, self.config.mask_padding);
        let runner = InterventionRunner::new(self.backend, self.config.mask_padding);
        let working_set = WorkingSet::new();
        let start_len = table.len();

        for index in 0..n_batches {
            let record = self
                .evaluate_batch(corpus, index, &hook, &capture, &runner, &working_set)
                .map_err(|e| classify_failure(e, index, batch_size, corpus.seq_len()))?;
            debug!(
                "Batch {}: orig {:.4}, reconstr {:.4}, zero {:.4}",
                record.batch_index, record.orig_loss, record.reconstr_loss, record.zero_loss
            );
            table.append(record);

            if self.config.log_every > 0 && (index + 1) % self.config.log_every == 0 {
                info!("Evaluated {}/{} batches", index + 1, n_batches);
            }
        }

        let rows = &table.records()[start_len..];
        let results = ExperimentResults {
            n_batches,
            mean_orig_loss: column_mean(rows, |r| r.orig_loss).unwrap_or(f64::NAN),
            mean_reconstr_loss: column_mean(rows, |r| r.reconstr_loss).unwrap_or(f64::NAN),
            mean_zero_loss: column_mean(rows, |r| r.zero_loss).unwrap_or(f64::NAN),
            peak_working_set_bytes: working_set.peak_bytes(),
        };
        info!(
            "Done: {} batches, mean orig {:.4}, reconstr {:.4}, zero {:.4}",
            results.n_batches,
            results.mean_orig_loss,
            results.mean_reconstr_loss,
            results.mean_zero_loss
        );
        Ok(results)
    }

    fn evaluate_batch(
        &self,
        corpus: &TokenizedCorpus,
        index: usize,
        hook: &HookPoint,
        capture: &ActivationCapture<'_>,
        runner: &InterventionRunner<'_>,
        working_set: &WorkingSet,
    ) -> Result<LossRecord> {
        let mut scope = BatchScope::new(working_set);

        let batch = corpus
            .batch(index, self.config.batch_size)?
            .to_device(&self.runtime.device)?;
        scope.hold(&batch.input_ids);
        scope.hold(&batch.attention_mask);

        let captured = capture.capture(&batch, hook)?;
        scope.hold(&captured.activation);

        let features = self.codec.encode(&captured.activation)?;
        debug!("Batch {index}: L0 {:.1}", l0(&features)?);
        let reconstruction = self.codec.decode(&features)?;
        drop(features);
        scope.hold(&reconstruction);

        let reconstr_loss = runner.run(
            &batch,
            hook,
            &SubstitutionPolicy::Reconstruction(reconstruction),
        )?;
        let zero_loss = runner.run(&batch, hook, &SubstitutionPolicy::Zero)?;

        Ok(LossRecord {
            batch_index: batch.index,
            orig_loss: captured.loss,
            reconstr_loss,
            zero_loss,
        })
    }
}

/// Report device exhaustion as [`EvalError::OutOfMemory`]; pass anything else through.
fn classify_failure(
    err: anyhow::Error,
    batch_index: usize,
    batch_size: usize,
    seq_len: usize,
) -> anyhow::Error {
    if is_out_of_memory(&err) {
        EvalError::OutOfMemory {
            batch_index,
            batch_size,
            seq_len,
            message: format!("{err:#}"),
        }
        .into()
    } else {
        err.context(format!("batch {batch_index} failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use candle_core::Tensor;

    use crate::cache::ActivationCache;
    use crate::forward_llama::{tests::tiny_model, LlamaModel};
    use crate::hooks::Substitution;
    use crate::sae::tests::{identity_sae, zero_sae};

    /// Delegates to a real model but runs out of memory on the `fail_at`-th capture pass.
    struct ExhaustingBackend<'a> {
        inner: &'a LlamaModel,
        fail_at: usize,
        captures: Cell<usize>,
    }

    impl LossBackend for ExhaustingBackend<'_> {
        fn n_layers(&self) -> usize {
            self.inner.n_layers()
        }

        fn d_model(&self) -> usize {
            self.inner.d_model()
        }

        fn hook_points(&self) -> Vec<HookPoint> {
            self.inner.hook_points()
        }

        fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
            self.inner.forward(input_ids)
        }

        fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)> {
            let call = self.captures.get() + 1;
            self.captures.set(call);
            if call == self.fail_at {
                anyhow::bail!("CUDA_ERROR_OUT_OF_MEMORY: out of memory");
            }
            self.inner.forward_with_cache(input_ids)
        }

        fn forward_with_substitution(
            &self,
            input_ids: &Tensor,
            substitution: &mut Substitution<'_>,
        ) -> Result<Tensor> {
            self.inner.forward_with_substitution(input_ids, substitution)
        }
    }

    fn corpus(n: usize) -> TokenizedCorpus {
        let rows: Vec<Vec<u32>> = (0..n as u32)
            .map(|i| (0..8u32).map(|j| (i * 7 + j * 3 + 2) % 32).collect())
            .collect();
        TokenizedCorpus::from_rows(&rows, 8, 1).unwrap()
    }

    fn cpu() -> RuntimeConfig {
        RuntimeConfig::cpu()
    }

    fn config(batch_size: usize) -> ExperimentConfig {
        ExperimentConfig {
            batch_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_sixteen_sequences_make_two_rows() {
        let (model, _varmap) = tiny_model();
        let sae = identity_sae(16);
        let experiment = ReconstructionExperiment::new(&model, &sae, &cpu(), config(8));

        let mut table = ResultTable::new();
        let results = experiment.run(&corpus(16), &mut table).unwrap();
        assert_eq!(results.n_batches, 2);
        let indices: Vec<usize> = table.records().iter().map(|r| r.batch_index).collect();
        assert_eq!(indices, vec![0, 1]);
        for r in table.records() {
            assert!(r.orig_loss >= 0.0 && r.orig_loss.is_finite());
            assert!(r.reconstr_loss >= 0.0 && r.reconstr_loss.is_finite());
            assert!(r.zero_loss >= 0.0 && r.zero_loss.is_finite());
        }
    }

    #[test]
    fn test_identity_codec_recovers_original_loss() {
        let (model, _varmap) = tiny_model();
        let sae = identity_sae(16);
        let experiment = ReconstructionExperiment::new(&model, &sae, &cpu(), config(4));

        let mut table = ResultTable::new();
        experiment.run(&corpus(10), &mut table).unwrap();
        assert_eq!(table.len(), 3);
        for r in table.records() {
            assert!((r.reconstr_loss - r.orig_loss).abs() < 1e-4, "{r:?}");
        }
    }

    #[test]
    fn test_zero_codec_matches_zero_ablation() {
        let (model, _varmap) = tiny_model();
        let sae = zero_sae(16);
        let experiment = ReconstructionExperiment::new(&model, &sae, &cpu(), config(8));

        let mut table = ResultTable::new();
        experiment.run(&corpus(16), &mut table).unwrap();
        for r in table.records() {
            assert!((r.reconstr_loss - r.zero_loss).abs() < 1e-6, "{r:?}");
        }
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let (model, _varmap) = tiny_model();
        let sae = zero_sae(16);
        let experiment = ReconstructionExperiment::new(&model, &sae, &cpu(), config(8));

        let mut first = ResultTable::new();
        let mut second = ResultTable::new();
        experiment.run(&corpus(12), &mut first).unwrap();
        experiment.run(&corpus(12), &mut second).unwrap();
        assert_eq!(first.records(), second.records());
    }

    /// The working set only counts tensors a `BatchScope` holds: token ids,
    /// attention mask, captured activation and reconstruction. Intermediate
    /// tensors of the forward passes are not tracked, so this checks that
    /// held tensors are released per batch, not the device allocator.
    #[test]
    fn test_peak_working_set_is_one_batch() {
        let (model, _varmap) = tiny_model();
        let sae = identity_sae(16);
        let experiment = ReconstructionExperiment::new(&model, &sae, &cpu(), config(8));

        let one = experiment.run(&corpus(8), &mut ResultTable::new()).unwrap();
        let fifty = experiment.run(&corpus(400), &mut ResultTable::new()).unwrap();
        assert_eq!(fifty.n_batches, 50);
        // u32 ids and mask (8 x 8) plus F32 activation and reconstruction (8 x 8 x 16)
        let held = 2 * 8 * 8 * 4 + 2 * 8 * 8 * 16 * 4;
        assert_eq!(one.peak_working_set_bytes, held);
        assert_eq!(fifty.peak_working_set_bytes, one.peak_working_set_bytes);
    }

    #[test]
    fn test_codec_width_checked_before_first_batch() {
        let (model, _varmap) = tiny_model();
        let sae = identity_sae(8);
        let experiment = ReconstructionExperiment::new(&model, &sae, &cpu(), config(8));

        let mut table = ResultTable::new();
        let err = experiment.run(&corpus(16), &mut table).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::ProviderLoad { .. })
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_out_of_memory_keeps_completed_rows() {
        let (model, _varmap) = tiny_model();
        let backend = ExhaustingBackend {
            inner: &model,
            fail_at: 2,
            captures: Cell::new(0),
        };
        let sae = identity_sae(16);
        let experiment = ReconstructionExperiment::new(&backend, &sae, &cpu(), config(4));

        let mut table = ResultTable::new();
        let err = experiment.run(&corpus(8), &mut table).unwrap_err();
        assert_eq!(table.len(), 1);
        assert_eq!(table.records()[0].batch_index, 0);
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::OutOfMemory {
                batch_index: 1,
                batch_size: 4,
                seq_len: 8,
                ..
            })
        ));
    }

    #[test]
    fn test_out_of_memory_is_classified() {
        let err = anyhow::anyhow!("CUDA_ERROR_OUT_OF_MEMORY: out of memory");
        let classified = classify_failure(err, 3, 8, 128);
        assert!(matches!(
            classified.downcast_ref::<EvalError>(),
            Some(EvalError::OutOfMemory { batch_index: 3, .. })
        ));

        let other = classify_failure(anyhow::anyhow!("boom"), 0, 8, 128);
        assert!(other.downcast_ref::<EvalError>().is_none());
    }
}
