//! Hook points and explicit activation substitution
//!
//! A [`HookPoint`] names a stage of the forward computation using the
//! TransformerLens convention (`blocks.0.hook_mlp_out`, ...). Instead of
//! registering callbacks on the model, a forward pass receives an optional
//! [`Substitution`]: the hook point plus the [`SubstitutionPolicy`] that
//! produces its replacement. The backend visits every stage through
//! [`HookState::apply`], which fires the substitution exactly once at its
//! stage and records captures when a cache is attached.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::Tensor;

use crate::cache::ActivationCache;
use crate::error::EvalError;

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a decoder forward pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Token embeddings (`hook_embed`).
    Embed,
    /// Residual stream entering layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Attention block output of layer `i` (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Residual stream between attention and MLP (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// MLP block output of layer `i` (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Residual stream leaving layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),
    /// Output of the final norm (`ln_final.hook_normalized`).
    FinalNorm,
    /// Anything else; no backend in this crate provides these.
    Custom(String),
}

impl HookPoint {
    /// Layer index for per-block hook points.
    pub fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i)
            | Self::AttnOut(i)
            | Self::ResidMid(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
            Self::Embed | Self::FinalNorm | Self::Custom(_) => None,
        }
    }

    /// Every hook point a decoder with `n_layers` blocks passes through, in order.
    pub fn all_for_decoder(n_layers: usize) -> Vec<HookPoint> {
        let mut hooks = Vec::with_capacity(n_layers * 5 + 2);
        hooks.push(Self::Embed);
        for i in 0..n_layers {
            hooks.push(Self::ResidPre(i));
            hooks.push(Self::AttnOut(i));
            hooks.push(Self::ResidMid(i));
            hooks.push(Self::MlpOut(i));
            hooks.push(Self::ResidPost(i));
        }
        hooks.push(Self::FinalNorm);
        hooks
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "ln_final.hook_normalized"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_name(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_name(s)
    }
}

fn parse_hook_name(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "ln_final.hook_normalized" => return HookPoint::FinalNorm,
        _ => {}
    }

    if let Some(rest) = s.strip_prefix("blocks.") {
        if let Some((layer, suffix)) = rest.split_once('.') {
            if let Ok(layer) = layer.parse::<usize>() {
                return match suffix {
                    "hook_resid_pre" => HookPoint::ResidPre(layer),
                    "hook_attn_out" => HookPoint::AttnOut(layer),
                    "hook_resid_mid" => HookPoint::ResidMid(layer),
                    "hook_mlp_out" => HookPoint::MlpOut(layer),
                    "hook_resid_post" => HookPoint::ResidPost(layer),
                    _ => HookPoint::Custom(s.to_string()),
                };
            }
        }
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// SubstitutionPolicy
// ---------------------------------------------------------------------------

/// What replaces the activation at the substituted hook point.
#[derive(Debug, Clone)]
pub enum SubstitutionPolicy {
    /// The codec's decoded output, computed once per batch from the capture pass.
    Reconstruction(Tensor),
    /// An all-zero tensor shaped like the observed activation.
    Zero,
}

impl SubstitutionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reconstruction(_) => "reconstruction",
            Self::Zero => "zero",
        }
    }

    /// Produce the replacement for `original`.
    ///
    /// The replacement must have exactly `original`'s shape; anything else is
    /// an [`EvalError::ShapeMismatch`]. The result is cast to the original's
    /// dtype and device so downstream layers see a consistent stream.
    pub fn replacement(&self, original: &Tensor) -> Result<Tensor> {
        let replacement = match self {
            Self::Reconstruction(reconstruction) => reconstruction.clone(),
            Self::Zero => original.zeros_like()?,
        };
        if replacement.dims() != original.dims() {
            return Err(EvalError::shape_mismatch(
                format!("{} substitution", self.name()),
                original.dims(),
                replacement.dims(),
            )
            .into());
        }
        Ok(replacement
            .to_device(original.device())?
            .to_dtype(original.dtype())?)
    }
}

// ---------------------------------------------------------------------------
// Substitution
// ---------------------------------------------------------------------------

/// A policy bound to one hook point for the duration of one forward pass.
#[derive(Debug)]
pub struct Substitution<'p> {
    hook: HookPoint,
    policy: &'p SubstitutionPolicy,
    applied: usize,
}

impl<'p> Substitution<'p> {
    pub fn new(hook: HookPoint, policy: &'p SubstitutionPolicy) -> Self {
        Self {
            hook,
            policy,
            applied: 0,
        }
    }

    pub fn hook(&self) -> &HookPoint {
        &self.hook
    }

    pub fn policy(&self) -> &SubstitutionPolicy {
        self.policy
    }

    /// How many times the replacement has been injected so far.
    pub fn times_applied(&self) -> usize {
        self.applied
    }

    /// Replace `x` if `point` is the bound hook; pass it through otherwise.
    fn visit(&mut self, point: &HookPoint, x: Tensor) -> Result<Tensor> {
        if *point != self.hook {
            return Ok(x);
        }
        if self.applied > 0 {
            return Err(EvalError::SubstitutionNotApplied {
                hook: self.hook.to_string(),
                times: self.applied + 1,
            }
            .into());
        }
        let replacement = self.policy.replacement(&x)?;
        self.applied += 1;
        Ok(replacement)
    }

    /// Check the substitution fired exactly once. Called after the pass.
    pub fn finish(&self) -> Result<()> {
        if self.applied != 1 {
            return Err(EvalError::SubstitutionNotApplied {
                hook: self.hook.to_string(),
                times: self.applied,
            }
            .into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HookState
// ---------------------------------------------------------------------------

/// Per-pass hook plumbing handed to a backend's forward loop.
///
/// Exactly one of the two modes is normally active: capture (collect every
/// stage into an [`ActivationCache`]) or substitution. A pass with neither
/// is a plain forward pass.
pub struct HookState<'a, 'p> {
    cache: Option<&'a mut ActivationCache>,
    substitution: Option<&'a mut Substitution<'p>>,
}

impl<'a, 'p> HookState<'a, 'p> {
    pub fn plain() -> Self {
        Self {
            cache: None,
            substitution: None,
        }
    }

    pub fn capturing(cache: &'a mut ActivationCache) -> Self {
        Self {
            cache: Some(cache),
            substitution: None,
        }
    }

    pub fn substituting(substitution: &'a mut Substitution<'p>) -> Self {
        Self {
            cache: None,
            substitution: Some(substitution),
        }
    }

    /// Run stage `point` over activation `x`, returning what flows onward.
    pub fn apply(&mut self, point: HookPoint, x: Tensor) -> Result<Tensor> {
        let x = match self.substitution.as_deref_mut() {
            Some(substitution) => substitution.visit(&point, x)?,
            None => x,
        };
        if let Some(cache) = self.cache.as_deref_mut() {
            cache.store(point, &x);
        }
        Ok(x)
    }
}
