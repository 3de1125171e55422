//! Device selection and run flags.

use std::str::FromStr;

use crate::{ComputeError, ComputeResult};

/// Which adapters a platform exposes for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    #[default]
    All,
    /// Discrete, integrated or virtual GPUs.
    Gpu,
    /// Software rasterisers.
    Cpu,
    /// Anything wgpu cannot classify.
    Other,
}

impl DeviceClass {
    pub fn matches(&self, device_type: wgpu::DeviceType) -> bool {
        use wgpu::DeviceType;
        match self {
            DeviceClass::All => true,
            DeviceClass::Gpu => matches!(
                device_type,
                DeviceType::DiscreteGpu | DeviceType::IntegratedGpu | DeviceType::VirtualGpu
            ),
            DeviceClass::Cpu => device_type == DeviceType::Cpu,
            DeviceClass::Other => device_type == DeviceType::Other,
        }
    }
}

impl FromStr for DeviceClass {
    type Err = ComputeError;

    fn from_str(s: &str) -> ComputeResult<Self> {
        match s.to_lowercase().as_str() {
            "all" | "any" => Ok(Self::All),
            "gpu" => Ok(Self::Gpu),
            "cpu" => Ok(Self::Cpu),
            "other" | "accelerator" => Ok(Self::Other),
            _ => Err(ComputeError::configuration(format!(
                "unknown device class '{s}' (expected all, gpu, cpu or other)"
            ))),
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceClass::All => "all",
            DeviceClass::Gpu => "gpu",
            DeviceClass::Cpu => "cpu",
            DeviceClass::Other => "other",
        };
        f.write_str(s)
    }
}

/// A `platform:device` index pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlatformDevice {
    pub platform: usize,
    pub device: usize,
}

impl FromStr for PlatformDevice {
    type Err = ComputeError;

    fn from_str(s: &str) -> ComputeResult<Self> {
        let invalid = || {
            ComputeError::configuration(format!(
                "invalid device '{s}' (expected PLATFORM:DEVICE, e.g. 0:1)"
            ))
        };
        let (p, d) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            platform: p.trim().parse().map_err(|_| invalid())?,
            device: d.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Configuration consumed by `setup`. Immutable once passed in.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub platform: usize,
    pub device: usize,
    pub class: DeviceClass,
    /// Exchange pixels through caller-owned textures instead of host buffers.
    /// `setup` rejects it; textures are handed over by `setup_with_textures`.
    pub interop: bool,
    /// Compare every buffer-mode run against the reference.
    pub verify: bool,
    /// Decode interop input from the defective half-float driver path.
    pub buggy_interop: bool,
    /// Overrides the compute-unit estimate used for launch geometry.
    pub compute_units: Option<u32>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            platform: 0,
            device: 0,
            class: DeviceClass::All,
            interop: false,
            verify: false,
            buggy_interop: false,
            compute_units: None,
        }
    }
}

impl Params {
    pub fn with_device(mut self, selection: PlatformDevice) -> Self {
        self.platform = selection.platform;
        self.device = selection.device;
        self
    }

    pub fn with_class(mut self, class: DeviceClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_platform_device() {
        let pd: PlatformDevice = "1:2".parse().unwrap();
        assert_eq!(pd, PlatformDevice { platform: 1, device: 2 });
        assert_eq!(" 0 : 3 ".parse::<PlatformDevice>().unwrap().device, 3);
        assert!("1".parse::<PlatformDevice>().is_err());
        assert!("a:b".parse::<PlatformDevice>().is_err());
        assert!("-1:0".parse::<PlatformDevice>().is_err());
    }

    #[test]
    fn test_device_class() {
        assert_eq!("GPU".parse::<DeviceClass>().unwrap(), DeviceClass::Gpu);
        assert!("fpga".parse::<DeviceClass>().is_err());
        assert!(DeviceClass::Gpu.matches(wgpu::DeviceType::IntegratedGpu));
        assert!(!DeviceClass::Gpu.matches(wgpu::DeviceType::Cpu));
        assert!(DeviceClass::All.matches(wgpu::DeviceType::Other));
    }

    #[test]
    fn test_params_builder() {
        let p = Params::default()
            .with_device(PlatformDevice { platform: 1, device: 0 })
            .with_verify(true);
        assert_eq!(p.platform, 1);
        assert!(p.verify);
        assert!(!p.interop);
    }
}
