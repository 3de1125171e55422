//! Adapter selection, program builds and buffer plumbing.
//!
//! Platforms are the wgpu backend groups that expose at least one adapter,
//! in a fixed order. Devices are that platform's adapters filtered by
//! [`DeviceClass`]. Every creation call is wrapped in wgpu error scopes so
//! failures surface as [`ComputeError`]s rather than uncaptured panics.

use std::sync::mpsc;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::{debug, trace};
use wgpu::util::DeviceExt;

use crate::geometry::{KernelLimits, LaunchGeometry};
use crate::params::{DeviceClass, Params};
use crate::status::Reporter;
use crate::{ComputeError, ComputeResult, ErrorCode};

// ============================================================================
// Platforms
// ============================================================================

/// Backend groups probed as platforms, in index order.
pub const PLATFORMS: [(wgpu::Backends, &str); 4] = [
    (wgpu::Backends::VULKAN, "Vulkan"),
    (wgpu::Backends::METAL, "Metal"),
    (wgpu::Backends::DX12, "DirectX 12"),
    (wgpu::Backends::GL, "OpenGL"),
];

struct Platform {
    name: &'static str,
    adapters: Vec<wgpu::Adapter>,
}

fn enumerate_platforms(instance: &wgpu::Instance) -> Vec<Platform> {
    PLATFORMS
        .iter()
        .filter_map(|&(backends, name)| {
            let adapters = instance.enumerate_adapters(backends);
            (!adapters.is_empty()).then_some(Platform { name, adapters })
        })
        .collect()
}

fn new_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

/// Summary of one selectable adapter, as listed by `hdr devices`.
#[derive(Debug, Clone)]
pub struct AdapterSummary {
    pub platform: usize,
    pub platform_name: &'static str,
    pub device: usize,
    pub info: wgpu::AdapterInfo,
    pub limits: wgpu::Limits,
}

/// Every adapter matching `class`, indexed the way `setup` selects them.
pub fn list_devices(class: DeviceClass) -> Vec<AdapterSummary> {
    let instance = new_instance();
    enumerate_platforms(&instance)
        .into_iter()
        .enumerate()
        .flat_map(|(p, platform)| {
            platform
                .adapters
                .iter()
                .map(|a| (a.get_info(), a.limits()))
                .filter(|(info, _)| class.matches(info.device_type))
                .enumerate()
                .map(|(d, (info, limits))| AdapterSummary {
                    platform: p,
                    platform_name: platform.name,
                    device: d,
                    info,
                    limits,
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

// ============================================================================
// Device info
// ============================================================================

/// Properties of the selected device reported at setup.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub backend: wgpu::Backend,
    pub device_type: wgpu::DeviceType,
    pub driver: String,
    pub max_buffer_size: u64,
    pub max_storage_binding: u32,
    pub max_workgroup_storage: u32,
    pub compute_units: u32,
    pub kernel_limits: KernelLimits,
}

impl DeviceInfo {
    fn new(info: &wgpu::AdapterInfo, limits: &wgpu::Limits, compute_units: Option<u32>) -> Self {
        Self {
            name: info.name.clone(),
            backend: info.backend,
            device_type: info.device_type,
            driver: if info.driver_info.is_empty() {
                info.driver.clone()
            } else {
                format!("{} {}", info.driver, info.driver_info)
            },
            max_buffer_size: limits.max_buffer_size,
            max_storage_binding: limits.max_storage_buffer_binding_size,
            max_workgroup_storage: limits.max_compute_workgroup_storage_size,
            compute_units: compute_units
                .filter(|&n| n > 0)
                .unwrap_or_else(|| estimate_compute_units(info.device_type)),
            kernel_limits: KernelLimits::from_limits(limits),
        }
    }

    fn report(&self, reporter: &Reporter) {
        reporter.info(format!("Using device: {} ({:?})", self.name, self.backend));
        reporter.debug(format!("Device type: {:?}", self.device_type));
        reporter.debug(format!("Driver: {}", self.driver));
        reporter.debug(format!("Global memory (max buffer): {} bytes", self.max_buffer_size));
        reporter.debug(format!("Max storage binding: {} bytes", self.max_storage_binding));
        reporter.debug(format!("Local memory: {} bytes", self.max_workgroup_storage));
        reporter.debug(format!("Compute units: {}", self.compute_units));
        reporter.debug(format!(
            "Kernel limits: max work-group size {}, preferred multiple {}",
            self.kernel_limits.max_work_group, self.kernel_limits.preferred_multiple
        ));
    }
}

/// wgpu does not expose a compute-unit count; guess by device type.
fn estimate_compute_units(device_type: wgpu::DeviceType) -> u32 {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => 32,
        wgpu::DeviceType::Cpu => std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4),
        _ => 8,
    }
}

// ============================================================================
// Program defines
// ============================================================================

/// Compile-time constants substituted into WGSL as `{{NAME}}` tokens.
#[derive(Debug, Clone, Default)]
pub struct Defines {
    entries: Vec<(String, String)>,
}

impl Defines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl std::fmt::Display) -> &mut Self {
        self.entries.retain(|(n, _)| n != name);
        self.entries.push((name.to_string(), value.to_string()));
        self
    }

    /// Float constant, always rendered as a WGSL float literal.
    pub fn set_f32(&mut self, name: &str, value: f32) -> &mut Self {
        self.set(name, format!("{value:?}"))
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> &mut Self {
        self.set(name, if value { "true" } else { "false" })
    }

    /// `<PREFIX>_WG_X`, `<PREFIX>_WG_Y` and `<PREFIX>_WG_SIZE` for a kernel.
    pub fn workgroup(&mut self, prefix: &str, geometry: &LaunchGeometry) -> &mut Self {
        self.set(&format!("{prefix}_WG_X"), geometry.local[0]);
        self.set(&format!("{prefix}_WG_Y"), geometry.local[1]);
        self.set(&format!("{prefix}_WG_SIZE"), geometry.invocations())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Substitutes every define. Fails if a `{{token}}` has no value.
    pub fn apply(&self, source: &str) -> Result<String, String> {
        let mut out = source.to_string();
        for (name, value) in &self.entries {
            out = out.replace(&format!("{{{{{name}}}}}"), value);
        }
        match out.find("{{") {
            Some(start) => {
                let rest = &out[start + 2..];
                let token = rest.split("}}").next().unwrap_or(rest);
                Err(format!("undefined constant '{token}'"))
            }
            None => Ok(out),
        }
    }
}

impl std::fmt::Display for Defines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "-D{name}={value}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Programs and kernels
// ============================================================================

pub struct Program {
    label: String,
    module: wgpu::ShaderModule,
}

/// One entry point with its pipeline and launch geometry.
pub struct Kernel {
    pub name: &'static str,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    pub geometry: LaunchGeometry,
}

impl Kernel {
    /// Records one dispatch of this kernel into `encoder`.
    pub fn dispatch(&self, encoder: &mut wgpu::CommandEncoder, bind_group: &wgpu::BindGroup) {
        let [x, y] = self.geometry.work_groups();
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(self.name),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
    }
}

// ============================================================================
// Context
// ============================================================================

/// The selected device with its queue.
pub struct DeviceContext {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    limits: wgpu::Limits,
    info: DeviceInfo,
}

impl DeviceContext {
    /// Selects platform `params.platform`, device `params.device` among the
    /// adapters matching `params.class`, and opens it.
    pub fn select(params: &Params, reporter: &Reporter) -> ComputeResult<Self> {
        trace!(platform = params.platform, device = params.device, class = %params.class, "DeviceContext::select");
        let instance = new_instance();
        let platforms = enumerate_platforms(&instance);
        if platforms.is_empty() {
            return Err(ComputeError::resource(
                "enumerating platforms",
                ErrorCode::DeviceNotFound,
                "no wgpu adapters found",
            ));
        }
        let platform = platforms.get(params.platform).ok_or_else(|| {
            ComputeError::configuration(format!(
                "Platform index {} out of range ({} platforms found)",
                params.platform,
                platforms.len()
            ))
        })?;
        reporter.debug(format!("Using platform: {}", platform.name));

        let candidates: Vec<&wgpu::Adapter> = platform
            .adapters
            .iter()
            .filter(|a| params.class.matches(a.get_info().device_type))
            .collect();
        let adapter = candidates.get(params.device).copied().ok_or_else(|| {
            ComputeError::configuration(format!(
                "Device index {} out of range ({} devices found)",
                params.device,
                candidates.len()
            ))
        })?;

        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("hdr_compute_device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| {
            ComputeError::resource("creating device", ErrorCode::DeviceNotAvailable, e.to_string())
        })?;
        device.on_uncaptured_error(Box::new(|e| {
            tracing::error!("uncaptured wgpu error: {e}");
        }));

        let info = DeviceInfo::new(&adapter_info, &limits, params.compute_units);
        info.report(reporter);
        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            limits,
            info,
        })
    }

    /// Wraps a device the caller already owns.
    pub fn shared(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        adapter_info: &wgpu::AdapterInfo,
        params: &Params,
        reporter: &Reporter,
    ) -> Self {
        let limits = device.limits();
        let info = DeviceInfo::new(adapter_info, &limits, params.compute_units);
        info.report(reporter);
        Self {
            device,
            queue,
            limits,
            info,
        }
    }

    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    #[inline]
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    #[inline]
    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    #[inline]
    pub fn kernel_limits(&self) -> KernelLimits {
        self.info.kernel_limits
    }

    #[inline]
    pub fn compute_units(&self) -> u32 {
        self.info.compute_units
    }

    /// Runs `f` inside out-of-memory and validation scopes.
    fn scoped<T>(
        &self,
        f: impl FnOnce() -> T,
    ) -> (T, Option<wgpu::Error>, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        (value, oom, validation)
    }

    fn checked<T>(&self, op: impl FnOnce() -> String, f: impl FnOnce() -> T) -> ComputeResult<T> {
        match self.scoped(f) {
            (value, None, None) => Ok(value),
            (_, Some(e), _) => Err(ComputeError::resource(op(), ErrorCode::OutOfMemory, e.to_string())),
            (_, None, Some(e)) => Err(ComputeError::resource(op(), ErrorCode::InvalidValue, e.to_string())),
        }
    }

    /// Compiles `source` after substituting `defines`. The compiler output
    /// goes to the reporter on failure.
    pub fn build_program(
        &self,
        label: &str,
        source: &str,
        defines: &Defines,
        reporter: &Reporter,
    ) -> ComputeResult<Program> {
        debug!(label, defines = %defines, "building program");
        let build_error = |log: String| {
            reporter.error(format!("Build log:\n{log}"));
            ComputeError::Build {
                label: label.to_string(),
                log,
            }
        };
        let wgsl = defines.apply(source).map_err(build_error)?;
        let (module, oom, validation) = self.scoped(|| {
            self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(wgsl.into()),
            })
        });
        if let Some(e) = oom.or(validation) {
            return Err(build_error(e.to_string()));
        }
        Ok(Program {
            label: label.to_string(),
            module,
        })
    }

    /// Creates the pipeline for entry point `name` of `program`.
    pub fn create_kernel(
        &self,
        program: &Program,
        name: &'static str,
        geometry: LaunchGeometry,
        reporter: &Reporter,
    ) -> ComputeResult<Kernel> {
        let pipeline = self
            .checked(
                || format!("creating {name} kernel"),
                || {
                    self.device
                        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                            label: Some(name),
                            layout: None,
                            module: &program.module,
                            entry_point: Some(name),
                            compilation_options: Default::default(),
                            cache: None,
                        })
                },
            )
            .map_err(|e| match e {
                ComputeError::ResourceCreation { detail, .. } => {
                    reporter.error(format!("Build log:\n{detail}"));
                    ComputeError::Build {
                        label: format!("{}::{name}", program.label),
                        log: detail,
                    }
                }
                other => other,
            })?;
        let layout = pipeline.get_bind_group_layout(0);
        reporter.debug(format!("Kernel sizes for {name}: {geometry}"));
        Ok(Kernel {
            name,
            pipeline,
            layout,
            geometry,
        })
    }

    /// Allocates a device buffer of `size` bytes (rounded up to 4).
    pub fn create_buffer(
        &self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> ComputeResult<wgpu::Buffer> {
        let size = size.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let op = || format!("creating buffer '{label}'");
        if size > self.limits.max_buffer_size
            || (usage.contains(wgpu::BufferUsages::STORAGE)
                && size > self.limits.max_storage_buffer_binding_size as u64)
        {
            return Err(ComputeError::resource(
                op(),
                ErrorCode::OutOfResources,
                format!("{size} bytes exceeds the device buffer limits"),
            ));
        }
        self.checked(op, || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        })
    }

    /// Storage buffer of `count` elements of `T`.
    pub fn storage<T: Pod>(&self, label: &str, count: usize, extra: wgpu::BufferUsages) -> ComputeResult<wgpu::Buffer> {
        self.create_buffer(
            label,
            (count * std::mem::size_of::<T>()) as u64,
            wgpu::BufferUsages::STORAGE | extra,
        )
    }

    /// Buffer initialised with `data`.
    pub fn buffer_init<T: Pod>(
        &self,
        label: &str,
        data: &[T],
        usage: wgpu::BufferUsages,
    ) -> ComputeResult<wgpu::Buffer> {
        self.checked(
            || format!("creating buffer '{label}'"),
            || {
                self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: bytemuck::cast_slice(data),
                    usage,
                })
            },
        )
    }

    /// Staging buffer for reading `size` bytes back to the host.
    pub fn readback_buffer(&self, label: &str, size: u64) -> ComputeResult<wgpu::Buffer> {
        self.create_buffer(
            label,
            size,
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        )
    }

    /// Binds `entries` as `(binding, buffer)` pairs for `kernel`.
    pub fn bind(
        &self,
        kernel: &Kernel,
        entries: &[(u32, &wgpu::Buffer)],
    ) -> ComputeResult<wgpu::BindGroup> {
        let entries: Vec<wgpu::BindGroupEntry> = entries
            .iter()
            .map(|&(binding, buffer)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.checked(
            || format!("setting {} arguments", kernel.name),
            || {
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(kernel.name),
                    layout: &kernel.layout,
                    entries: &entries,
                })
            },
        )
    }

    pub fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Submits `encoder` and reports validation failures as execution errors.
    pub fn submit(&self, encoder: wgpu::CommandEncoder, op: &str) -> ComputeResult<()> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.queue.submit(std::iter::once(encoder.finish()));
        match pollster::block_on(self.device.pop_error_scope()) {
            None => Ok(()),
            Some(e) => Err(ComputeError::execution(op, ErrorCode::InvalidValue, e.to_string())),
        }
    }

    /// Blocks until all submitted work has completed.
    pub fn wait(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    pub fn write<T: Pod>(&self, buffer: &wgpu::Buffer, data: &[T]) {
        self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
    }

    /// Maps `staging` and copies its first `out.len()` bytes into `out`.
    pub fn read(&self, staging: &wgpu::Buffer, out: &mut [u8], op: &str) -> ComputeResult<()> {
        let slice = staging.slice(..out.len() as u64);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| ComputeError::execution(op, ErrorCode::MapFailure, "map channel closed"))?
            .map_err(|e| ComputeError::execution(op, ErrorCode::MapFailure, e.to_string()))?;

        {
            let data = slice.get_mapped_range();
            out.copy_from_slice(&data);
        }
        staging.unmap();
        Ok(())
    }

    /// Reads typed values back through `staging`.
    pub fn read_values<T: Pod>(&self, staging: &wgpu::Buffer, out: &mut [T], op: &str) -> ComputeResult<()> {
        self.read(staging, bytemuck::cast_slice_mut(out), op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defines_substitute() {
        let mut d = Defines::new();
        d.set("WIDTH", 640).set_f32("KEY", 0.18).set_bool("BUGGY", false);
        let src = "const W: u32 = {{WIDTH}}u; const K: f32 = {{KEY}}; const B = {{BUGGY}};";
        assert_eq!(
            d.apply(src).unwrap(),
            "const W: u32 = 640u; const K: f32 = 0.18; const B = false;"
        );
    }

    #[test]
    fn test_defines_float_literal() {
        let mut d = Defines::new();
        d.set_f32("ONE", 1.0).set_f32("TINY", 0.000001);
        assert_eq!(d.get("ONE"), Some("1.0"));
        assert_eq!(d.get("TINY"), Some("1e-6"));
    }

    #[test]
    fn test_defines_missing_token() {
        let d = Defines::new();
        let err = d.apply("let x = {{MISSING}};").unwrap_err();
        assert!(err.contains("MISSING"));
    }

    #[test]
    fn test_defines_workgroup_and_override() {
        let mut d = Defines::new();
        let g = LaunchGeometry {
            dims: 2,
            local: [64, 4],
            global: [512, 32],
        };
        d.workgroup("APPLY", &g).set("WIDTH", 1).set("WIDTH", 2);
        assert_eq!(d.get("APPLY_WG_SIZE"), Some("256"));
        assert_eq!(d.get("WIDTH"), Some("2"));
        assert!(d.to_string().contains("-DAPPLY_WG_X=64"));
    }

    #[test]
    fn test_compute_unit_estimate() {
        assert_eq!(estimate_compute_units(wgpu::DeviceType::DiscreteGpu), 32);
        assert_eq!(estimate_compute_units(wgpu::DeviceType::IntegratedGpu), 8);
        assert!(estimate_compute_units(wgpu::DeviceType::Cpu) >= 1);
    }
}
