// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // SaeConfig in sae.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! sae-recon-rs: SAE reconstruction-loss evaluation
//!
//! Measures how much of a language model's next-token loss survives when an
//! internal activation is replaced by a sparse autoencoder's reconstruction,
//! against the unmodified model and a zero-ablation baseline.
//!
//! ## Architecture
//!
//! - `hooks`: Hook point names, substitution policies and the per-pass injection point
//! - `cache`: ActivationCache filled by a capture pass
//! - `masks`: Causal attention masks, cached per model instance
//! - `forward_llama`: LLaMA-family forward pass with hook points
//! - `model`: LossBackend trait and the EvalModel wrapper (backend + tokenizer)
//! - `loss`: Next-token cross-entropy from logits
//! - `sae`: Sparse autoencoder loading and encode/decode
//! - `corpus`: Text corpus loading, seeded sampling and fixed-length tokenization
//! - `intervention`: Capture pass and substituted passes
//! - `memory`: Batch-scoped tensor ownership and working-set accounting
//! - `experiment`: Batch loop coordinating the full pipeline
//! - `results`: Per-batch loss table, CSV and JSON output
//! - `runtime`: Explicit device and dtype selection
//! - `error`: Typed error taxonomy

pub mod cache;
pub mod corpus;
pub mod error;
pub mod experiment;
pub mod forward_llama;
pub mod hooks;
pub mod intervention;
pub mod loss;
pub mod masks;
pub mod memory;
pub mod model;
pub mod results;
pub mod runtime;
pub mod sae;

pub use cache::ActivationCache;
pub use corpus::{Batch, Corpus, TextSample, TokenizedCorpus};
pub use error::{is_out_of_memory, EvalError};
pub use experiment::{ExperimentConfig, ExperimentResults, ReconstructionExperiment};
pub use forward_llama::{LlamaConfig, LlamaModel};
pub use hooks::{HookPoint, HookState, Substitution, SubstitutionPolicy};
pub use intervention::{ActivationCapture, CapturedActivation, InterventionRunner};
pub use loss::{next_token_loss, per_token_nll};
pub use masks::{create_causal_mask, MaskCache};
pub use memory::{BatchScope, WorkingSet};
pub use model::{eos_token_id, load_tokenizer, EvalModel, LossBackend};
pub use results::{csv_path, json_path, LossRecord, ResultTable, CSV_HEADER};
pub use runtime::{parse_dtype, RuntimeConfig};
pub use sae::{FeatureCodec, Sae, SaeArchitecture, SaeConfig};
