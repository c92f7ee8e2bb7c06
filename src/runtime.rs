//! Explicit device and precision configuration
//!
//! Every component that allocates tensors receives a [`RuntimeConfig`]
//! at construction time. Nothing in the crate consults a process-wide
//! default device or autocast state.

use anyhow::Result;
use candle_core::{DType, Device};
use tracing::info;

/// Device plus the dtype model weights and activations are held in.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub device: Device,
    pub dtype: DType,
}

impl RuntimeConfig {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    /// CPU with F32, used by tests and `--cpu`.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }

    /// Pick a device (CUDA when available unless `force_cpu`) and a dtype.
    ///
    /// Without an explicit dtype, accelerators run in BF16 (LLaMA checkpoints
    /// are trained in bfloat16) and the CPU runs in F32.
    pub fn select(force_cpu: bool, dtype: Option<DType>) -> Result<Self> {
        let device = if force_cpu {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };
        let dtype = dtype.unwrap_or(if device.is_cpu() {
            DType::F32
        } else {
            DType::BF16
        });
        info!("Device: {:?}, dtype: {:?}", device, dtype);
        Ok(Self { device, dtype })
    }
}

/// Parse a dtype name as accepted on the command line.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.to_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => anyhow::bail!("Unsupported dtype '{other}' (expected f32, f16 or bf16)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_runtime() {
        let rt = RuntimeConfig::cpu();
        assert!(rt.device.is_cpu());
        assert_eq!(rt.dtype, DType::F32);
    }

    #[test]
    fn test_select_forced_cpu_defaults_to_f32() {
        let rt = RuntimeConfig::select(true, None).unwrap();
        assert!(rt.device.is_cpu());
        assert_eq!(rt.dtype, DType::F32);

        let rt = RuntimeConfig::select(true, Some(DType::BF16)).unwrap();
        assert_eq!(rt.dtype, DType::BF16);
    }

    #[test]
    fn test_parse_dtype() {
        assert_eq!(parse_dtype("bf16").unwrap(), DType::BF16);
        assert_eq!(parse_dtype("Float32").unwrap(), DType::F32);
        assert!(parse_dtype("int8").is_err());
    }
}
