//! Tone-mapping operators and their GPU pipelines.
//!
//! [`ToneMapper`] owns one operator's device resources and drives its
//! lifecycle:
//!
//! ```text
//!   Unconfigured ──setup──► Ready ──process──► Executing ──► Ready
//!        ▲                    │                    │
//!        └── failed setup     └──cleanup──► Released ◄── execution error
//! ```
//!
//! `setup` is the only call that allocates. Runs reuse the buffers, bind
//! groups and pipelines created there, mutating them in place.

mod grad_dom;
mod histeq;
mod reinhard_global;
mod reinhard_local;

use std::str::FromStr;
use std::time::{Duration, Instant};

use hdr_core::tonemap::{
    GradDomParams, HIST_EQ_MAX_PIXELS, ReinhardGlobalParams, ReinhardLocalParams,
};
use hdr_core::{ImageSize, MipPyramid, NUM_CHANNELS};
use tracing::{debug, trace};

use crate::cache::{Fingerprint, ReferenceCache};
use crate::device::{DeviceContext, Defines};
use crate::interop::{InteropTextures, SharedDevice};
use crate::params::Params;
use crate::stages::{StageMask, MAX_STAGES};
use crate::status::Reporter;
use crate::verify::{VerificationReport, Verifier};
use crate::{ComputeError, ComputeResult};

use grad_dom::GradDomPipeline;
use histeq::HistEqPipeline;
use reinhard_global::ReinhardGlobalPipeline;
use reinhard_local::ReinhardLocalPipeline;

// ============================================================================
// Algorithm selection
// ============================================================================

/// The four tone-mapping algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    HistEq,
    ReinhardGlobal,
    ReinhardLocal,
    GradDom,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::HistEq,
        Algorithm::ReinhardGlobal,
        Algorithm::ReinhardLocal,
        Algorithm::GradDom,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::HistEq => "histEq",
            Algorithm::ReinhardGlobal => "reinhardGlobal",
            Algorithm::ReinhardLocal => "reinhardLocal",
            Algorithm::GradDom => "gradDom",
        }
    }

    /// Stage names in declared order; stage `i` of a [`StageMask`] is
    /// `stage_names()[i - 1]`.
    pub fn stage_names(self) -> Vec<&'static str> {
        match self {
            Algorithm::HistEq => names::<histeq::Stage>(),
            Algorithm::ReinhardGlobal => names::<reinhard_global::Stage>(),
            Algorithm::ReinhardLocal => names::<reinhard_local::Stage>(),
            Algorithm::GradDom => names::<grad_dom::Stage>(),
        }
    }

    pub fn stage_count(self) -> usize {
        match self {
            Algorithm::HistEq => histeq::Stage::ALL.len(),
            Algorithm::ReinhardGlobal => reinhard_global::Stage::ALL.len(),
            Algorithm::ReinhardLocal => reinhard_local::Stage::ALL.len(),
            Algorithm::GradDom => grad_dom::Stage::ALL.len(),
        }
    }
}

impl FromStr for Algorithm {
    type Err = ComputeError;

    fn from_str(s: &str) -> ComputeResult<Self> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                ComputeError::configuration(format!(
                    "unknown filter '{s}' (expected histEq, reinhardGlobal, reinhardLocal or gradDom)"
                ))
            })
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which path computes the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Reference,
    Gpu,
}

impl FromStr for Method {
    type Err = ComputeError;

    fn from_str(s: &str) -> ComputeResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reference" | "ref" | "cpu" => Ok(Method::Reference),
            "gpu" | "opencl" | "wgpu" => Ok(Method::Gpu),
            _ => Err(ComputeError::configuration(format!(
                "unknown method '{s}' (expected reference or gpu)"
            ))),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Reference => f.write_str("reference"),
            Method::Gpu => f.write_str("gpu"),
        }
    }
}

/// An algorithm together with its tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operator {
    HistEq,
    ReinhardGlobal(ReinhardGlobalParams),
    ReinhardLocal(ReinhardLocalParams),
    GradDom(GradDomParams),
}

impl Operator {
    /// The algorithm with its default tunables.
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::HistEq => Operator::HistEq,
            Algorithm::ReinhardGlobal => Operator::reinhard_global(),
            Algorithm::ReinhardLocal => Operator::reinhard_local(),
            Algorithm::GradDom => Operator::grad_dom(),
        }
    }

    pub fn hist_eq() -> Self {
        Operator::HistEq
    }

    pub fn reinhard_global() -> Self {
        Operator::ReinhardGlobal(ReinhardGlobalParams::default())
    }

    pub fn reinhard_local() -> Self {
        Operator::ReinhardLocal(ReinhardLocalParams::default())
    }

    pub fn grad_dom() -> Self {
        Operator::GradDom(GradDomParams::default())
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Operator::HistEq => Algorithm::HistEq,
            Operator::ReinhardGlobal(_) => Algorithm::ReinhardGlobal,
            Operator::ReinhardLocal(_) => Algorithm::ReinhardLocal,
            Operator::GradDom(_) => Algorithm::GradDom,
        }
    }

    /// Checks the tunables, and the image size where the algorithm bounds it.
    pub fn validate(&self, size: ImageSize) -> ComputeResult<()> {
        match self {
            Operator::HistEq => {
                let pixels = size.pixel_count() as u64;
                if pixels > HIST_EQ_MAX_PIXELS {
                    return Err(hdr_core::Error::ImageTooLarge {
                        operator: "histEq",
                        pixels,
                        limit: HIST_EQ_MAX_PIXELS,
                    }
                    .into());
                }
            }
            Operator::ReinhardGlobal(p) => p.validate()?,
            Operator::ReinhardLocal(p) => p.validate()?,
            Operator::GradDom(p) => p.validate()?,
        }
        Ok(())
    }

    /// Runs the CPU reference of this operator.
    pub fn reference(&self, input: &[u8], output: &mut [u8], size: ImageSize) -> ComputeResult<()> {
        use hdr_core::tonemap;
        match self {
            Operator::HistEq => tonemap::hist_eq(input, output, size)?,
            Operator::ReinhardGlobal(p) => tonemap::reinhard_global(input, output, size, p)?,
            Operator::ReinhardLocal(p) => tonemap::reinhard_local(input, output, size, p)?,
            Operator::GradDom(p) => tonemap::grad_dom(input, output, size, p)?,
        }
        Ok(())
    }
}

// ============================================================================
// Stages
// ============================================================================

/// One named stage of a pipeline.
///
/// Mapping stages compute image statistics (histograms, reductions,
/// pyramids, the Poisson solve); the rest apply them per pixel.
pub(crate) trait Stage: Copy + 'static {
    /// Every stage in declared order.
    const ALL: &'static [Self];

    fn name(self) -> &'static str;

    fn is_mapping(self) -> bool;
}

fn names<S: Stage>() -> Vec<&'static str> {
    debug_assert!(S::ALL.len() <= MAX_STAGES);
    S::ALL.iter().map(|s| s.name()).collect()
}

/// Stages that run under `mask`, in declared order. Mapping stages are
/// skipped unless `mapping` is set.
pub(crate) fn scheduled<S: Stage>(mask: StageMask, mapping: bool) -> impl Iterator<Item = S> {
    S::ALL
        .iter()
        .copied()
        .enumerate()
        .filter(move |&(i, s)| mask.is_enabled(i + 1) && (mapping || !s.is_mapping()))
        .map(|(_, s)| s)
}

/// Whether `mask` enables at least one mapping stage.
pub(crate) fn runs_mapping<S: Stage>(mask: StageMask) -> bool {
    scheduled::<S>(mask, true).any(|s| s.is_mapping())
}

// ============================================================================
// Run options and results
// ============================================================================

/// Lifecycle state of a [`ToneMapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Unconfigured,
    Ready,
    Executing,
    Released,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Unconfigured => "unconfigured",
            PipelineState::Ready => "ready",
            PipelineState::Executing => "executing",
            PipelineState::Released => "released",
        };
        f.write_str(s)
    }
}

/// Per-run switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub mask: StageMask,
    /// Recompute statistics instead of reusing the previous run's.
    pub recompute_mapping: bool,
    pub verify: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mask: StageMask::all(),
            recompute_mapping: true,
            verify: false,
        }
    }
}

impl RunOptions {
    /// All stages, fresh statistics, verified against the reference.
    pub fn verified() -> Self {
        Self {
            verify: true,
            ..Self::default()
        }
    }

    pub fn with_mask(mut self, mask: StageMask) -> Self {
        self.mask = mask;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    NotRun,
    Passed(VerificationReport),
    Failed(VerificationReport),
}

impl VerificationStatus {
    pub fn from_report(report: VerificationReport) -> Self {
        if report.passed() {
            VerificationStatus::Passed(report)
        } else {
            VerificationStatus::Failed(report)
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, VerificationStatus::Passed(_))
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationStatus::NotRun => f.write_str("Verification: NOT RUN"),
            VerificationStatus::Passed(_) => f.write_str("Verification: PASSED"),
            VerificationStatus::Failed(_) => f.write_str("Verification: FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Wall time from first dispatch to device idle.
    pub gpu_time: Duration,
    pub verification: VerificationStatus,
}

#[inline]
fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

// ============================================================================
// Shared device resources
// ============================================================================

/// `WIDTH`, `HEIGHT` and `PIXELS` for a program over an image of `size`.
pub(crate) fn image_defines(size: ImageSize) -> Defines {
    let mut defines = Defines::new();
    defines
        .set("WIDTH", size.width)
        .set("HEIGHT", size.height)
        .set("PIXELS", size.pixel_count());
    defines
}

/// Device copy of a pyramid's level table plus one uniform per level
/// selecting it.
pub(crate) struct LevelTable {
    pub pyramid: MipPyramid,
    pub levels: wgpu::Buffer,
    pub selectors: Vec<wgpu::Buffer>,
}

impl LevelTable {
    pub fn new(ctx: &DeviceContext, pyramid: MipPyramid) -> ComputeResult<Self> {
        let table: Vec<[u32; 4]> = pyramid
            .levels()
            .iter()
            .map(|l| [l.width, l.height, l.offset as u32, 0])
            .collect();
        let levels = ctx.buffer_init("levels", &table, wgpu::BufferUsages::STORAGE)?;
        let selectors = (0..pyramid.num_levels() as u32)
            .map(|k| {
                ctx.buffer_init(
                    &format!("level_param_{k}"),
                    &[[k, 0u32, 0, 0]],
                    wgpu::BufferUsages::UNIFORM,
                )
            })
            .collect::<ComputeResult<Vec<_>>>()?;
        Ok(Self {
            pyramid,
            levels,
            selectors,
        })
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.pyramid.num_levels()
    }
}

/// Input and output image buffers, and the caller's textures in interop mode.
pub(crate) struct ImageIo {
    pub input: wgpu::Buffer,
    pub output: wgpu::Buffer,
    staging: Option<wgpu::Buffer>,
    textures: Option<InteropTextures>,
}

impl ImageIo {
    fn new(ctx: &DeviceContext, size: ImageSize, textures: Option<InteropTextures>) -> ComputeResult<Self> {
        let pixels = size.pixel_count() as u64;
        let texel = textures
            .as_ref()
            .map_or(NUM_CHANNELS as u64, |t| t.input_texel_bytes() as u64);
        let input = ctx.create_buffer(
            "input",
            pixels * texel,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        )?;
        let output = ctx.create_buffer(
            "output",
            size.byte_len() as u64,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        )?;
        let staging = match textures {
            Some(_) => None,
            None => Some(ctx.readback_buffer("output_staging", size.byte_len() as u64)?),
        };
        Ok(Self {
            input,
            output,
            staging,
            textures,
        })
    }

    fn uses_textures(&self) -> bool {
        self.textures.is_some()
    }

    /// Copies the input texture into the input buffer.
    fn acquire(&self, ctx: &DeviceContext) -> ComputeResult<()> {
        if let Some(textures) = &self.textures {
            let mut encoder = ctx.encoder("acquire");
            textures.acquire(&mut encoder, &self.input);
            ctx.submit(encoder, "acquiring input texture")?;
        }
        Ok(())
    }

    /// Copies the output buffer into the output texture.
    fn release(&self, ctx: &DeviceContext) -> ComputeResult<()> {
        if let Some(textures) = &self.textures {
            let mut encoder = ctx.encoder("release");
            textures.release(&mut encoder, &self.output);
            ctx.submit(encoder, "releasing output texture")?;
        }
        Ok(())
    }

    fn download(&self, ctx: &DeviceContext, out: &mut [u8]) -> ComputeResult<()> {
        let staging = self.staging.as_ref().ok_or_else(|| {
            ComputeError::configuration("output is written to the interop texture, not host memory")
        })?;
        let mut encoder = ctx.encoder("download");
        encoder.copy_buffer_to_buffer(&self.output, 0, staging, 0, out.len() as u64);
        ctx.submit(encoder, "reading output buffer")?;
        ctx.read(staging, out, "reading output buffer")
    }
}

/// The per-algorithm pipelines.
enum GpuPipeline {
    HistEq(HistEqPipeline),
    ReinhardGlobal(ReinhardGlobalPipeline),
    ReinhardLocal(ReinhardLocalPipeline),
    GradDom(GradDomPipeline),
}

impl GpuPipeline {
    fn new(
        operator: &Operator,
        ctx: &DeviceContext,
        io: &ImageIo,
        size: ImageSize,
        params: &Params,
        reporter: &Reporter,
    ) -> ComputeResult<Self> {
        let half_float = half_float_input(operator, params, io.uses_textures(), reporter);
        Ok(match operator {
            Operator::HistEq => {
                GpuPipeline::HistEq(HistEqPipeline::new(ctx, io, size, half_float, reporter)?)
            }
            Operator::ReinhardGlobal(p) => {
                GpuPipeline::ReinhardGlobal(ReinhardGlobalPipeline::new(ctx, io, size, p, reporter)?)
            }
            Operator::ReinhardLocal(p) => {
                GpuPipeline::ReinhardLocal(ReinhardLocalPipeline::new(ctx, io, size, p, reporter)?)
            }
            Operator::GradDom(p) => {
                GpuPipeline::GradDom(GradDomPipeline::new(ctx, io, size, p, reporter)?)
            }
        })
    }

    fn run(&mut self, ctx: &DeviceContext, mask: StageMask, mapping: bool) -> ComputeResult<()> {
        match self {
            GpuPipeline::HistEq(p) => p.run(ctx, mask, mapping),
            GpuPipeline::ReinhardGlobal(p) => p.run(ctx, mask, mapping),
            GpuPipeline::ReinhardLocal(p) => p.run(ctx, mask, mapping),
            GpuPipeline::GradDom(p) => p.run(ctx, mask, mapping),
        }
    }

    fn runs_mapping(&self, mask: StageMask) -> bool {
        match self {
            GpuPipeline::HistEq(_) => runs_mapping::<histeq::Stage>(mask),
            GpuPipeline::ReinhardGlobal(_) => runs_mapping::<reinhard_global::Stage>(mask),
            GpuPipeline::ReinhardLocal(_) => runs_mapping::<reinhard_local::Stage>(mask),
            GpuPipeline::GradDom(_) => runs_mapping::<grad_dom::Stage>(mask),
        }
    }
}

/// Whether the input is read as raw half-float texels.
fn half_float_input(operator: &Operator, params: &Params, textures: bool, reporter: &Reporter) -> bool {
    if !params.buggy_interop {
        return false;
    }
    if !matches!(operator, Operator::HistEq) {
        reporter.warn(format!(
            "buggy interop flag only applies to histEq, ignored for {}",
            operator.algorithm()
        ));
        return false;
    }
    if !textures {
        reporter.warn("buggy interop flag only applies to interop textures, ignored");
        return false;
    }
    true
}

/// Everything `setup` allocates. Fields drop in declaration order, so the
/// pipeline goes before the buffers it binds and both before the device.
struct GpuState {
    pipeline: GpuPipeline,
    io: ImageIo,
    ctx: DeviceContext,
    size: ImageSize,
    /// Statistics from an earlier run are available.
    mapped: bool,
}

impl GpuState {
    fn new(
        ctx: DeviceContext,
        operator: &Operator,
        params: &Params,
        size: ImageSize,
        textures: Option<InteropTextures>,
        reporter: &Reporter,
    ) -> ComputeResult<Self> {
        let io = ImageIo::new(&ctx, size, textures)?;
        let pipeline = GpuPipeline::new(operator, &ctx, &io, size, params, reporter)?;
        Ok(Self {
            pipeline,
            io,
            ctx,
            size,
            mapped: false,
        })
    }

    /// Uploads `input` (buffer mode), brackets the stages with texture
    /// acquire and release, and returns the time spent in the stages.
    fn run(&mut self, input: Option<&[u8]>, options: &RunOptions) -> ComputeResult<Duration> {
        let mapping = options.recompute_mapping || !self.mapped;
        if let Some(input) = input {
            self.ctx.write(&self.io.input, input);
        }

        let start = Instant::now();
        let result = self.io.acquire(&self.ctx).and_then(|()| {
            self.pipeline.run(&self.ctx, options.mask, mapping)?;
            self.ctx.wait();
            Ok(start.elapsed())
        });
        let released = self.io.release(&self.ctx);
        let elapsed = result?;
        released?;

        if mapping && self.pipeline.runs_mapping(options.mask) {
            self.mapped = true;
        }
        Ok(elapsed)
    }
}

// ============================================================================
// ToneMapper
// ============================================================================

/// One operator bound to one device.
pub struct ToneMapper {
    operator: Operator,
    reporter: Reporter,
    state: PipelineState,
    cache: ReferenceCache,
    verifier: Verifier,
    verify_all: bool,
    gpu: Option<GpuState>,
}

impl ToneMapper {
    pub fn new(operator: Operator) -> Self {
        Self::with_reporter(operator, Reporter::default())
    }

    pub fn with_reporter(operator: Operator, reporter: Reporter) -> Self {
        Self {
            operator,
            reporter,
            state: PipelineState::Unconfigured,
            cache: ReferenceCache::new(),
            verifier: Verifier::default(),
            verify_all: false,
            gpu: None,
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Image size fixed at setup.
    pub fn size(&self) -> Option<ImageSize> {
        self.gpu.as_ref().map(|g| g.size)
    }

    pub fn set_verifier(&mut self, verifier: Verifier) {
        self.verifier = verifier;
    }

    /// Selects a device and builds every program, kernel and buffer for
    /// `width` x `height` images.
    pub fn setup(&mut self, params: &Params, width: u32, height: u32) -> ComputeResult<()> {
        trace!(algorithm = %self.operator.algorithm(), width, height, "ToneMapper::setup");
        self.begin_setup()?;
        let result = ImageSize::new(width, height)
            .map_err(ComputeError::from)
            .and_then(|size| {
                self.operator.validate(size)?;
                if params.interop {
                    return Err(ComputeError::configuration(
                        "interop needs caller textures; use setup_with_textures",
                    ));
                }
                let ctx = DeviceContext::select(params, &self.reporter)?;
                GpuState::new(ctx, &self.operator, params, size, None, &self.reporter)
            });
        self.finish_setup(params, result)
    }

    /// Like [`setup`](Self::setup), on a caller-owned device with pixels
    /// exchanged through `textures`.
    pub fn setup_with_textures(
        &mut self,
        params: &Params,
        shared: SharedDevice,
        textures: InteropTextures,
    ) -> ComputeResult<()> {
        trace!(algorithm = %self.operator.algorithm(), "ToneMapper::setup_with_textures");
        self.begin_setup()?;
        let result = ImageSize::new(textures.input.width(), textures.input.height())
            .map_err(ComputeError::from)
            .and_then(|size| {
                self.operator.validate(size)?;
                let half_float = params.buggy_interop && matches!(self.operator, Operator::HistEq);
                textures.validate(size, half_float)?;
                let ctx = DeviceContext::shared(
                    shared.device,
                    shared.queue,
                    &shared.adapter_info,
                    params,
                    &self.reporter,
                );
                GpuState::new(ctx, &self.operator, params, size, Some(textures), &self.reporter)
            });
        self.finish_setup(params, result)
    }

    fn begin_setup(&mut self) -> ComputeResult<()> {
        match self.state {
            PipelineState::Executing => Err(self.reporter.fail(ComputeError::InvalidState {
                op: "set up",
                state: self.state,
            })),
            PipelineState::Ready => {
                self.cleanup();
                Ok(())
            }
            PipelineState::Unconfigured | PipelineState::Released => Ok(()),
        }
    }

    fn finish_setup(&mut self, params: &Params, result: ComputeResult<GpuState>) -> ComputeResult<()> {
        match result {
            Ok(gpu) => {
                debug!(size = %gpu.size, "pipeline ready");
                self.gpu = Some(gpu);
                self.verify_all = params.verify;
                self.state = PipelineState::Ready;
                Ok(())
            }
            Err(e) => {
                self.gpu = None;
                self.state = PipelineState::Unconfigured;
                Err(self.reporter.fail(e))
            }
        }
    }

    /// Runs the enabled stages on `input` and reads the result into `output`.
    pub fn process(&mut self, input: &[u8], output: &mut [u8], options: &RunOptions) -> ComputeResult<RunReport> {
        let size = self.ready("process")?;
        size.check_buffers(input, output)?;
        if self.gpu.as_ref().is_some_and(|g| g.io.uses_textures()) {
            return Err(self.reporter.fail(ComputeError::configuration(
                "pipeline was set up with interop textures; use process_frame",
            )));
        }

        self.state = PipelineState::Executing;
        let outcome = match self.gpu.as_mut() {
            Some(gpu) => gpu
                .run(Some(input), options)
                .and_then(|elapsed| gpu.io.download(&gpu.ctx, output).map(|()| elapsed)),
            None => Err(ComputeError::InvalidState {
                op: "process",
                state: PipelineState::Unconfigured,
            }),
        };
        let elapsed = self.complete_run(outcome)?;

        let verification = if options.verify || self.verify_all {
            self.verify_output(input, output, size, options.mask)?
        } else {
            VerificationStatus::NotRun
        };
        Ok(RunReport {
            gpu_time: elapsed,
            verification,
        })
    }

    /// Runs the enabled stages from the input texture to the output texture.
    pub fn process_frame(&mut self, options: &RunOptions) -> ComputeResult<RunReport> {
        self.ready("process a frame")?;
        if !self.gpu.as_ref().is_some_and(|g| g.io.uses_textures()) {
            return Err(self.reporter.fail(ComputeError::configuration(
                "no interop textures configured; use process",
            )));
        }
        if options.verify {
            self.reporter.warn("verification needs host buffers; skipped for interop frames");
        }

        self.state = PipelineState::Executing;
        let outcome = match self.gpu.as_mut() {
            Some(gpu) => gpu.run(None, options),
            None => Err(ComputeError::InvalidState {
                op: "process a frame",
                state: PipelineState::Unconfigured,
            }),
        };
        let elapsed = self.complete_run(outcome)?;
        Ok(RunReport {
            gpu_time: elapsed,
            verification: VerificationStatus::NotRun,
        })
    }

    fn ready(&self, op: &'static str) -> ComputeResult<ImageSize> {
        match (&self.gpu, self.state) {
            (Some(gpu), PipelineState::Ready) => Ok(gpu.size),
            _ => Err(self.reporter.fail(ComputeError::InvalidState {
                op,
                state: self.state,
            })),
        }
    }

    /// Back to `Ready` on success; an execution failure releases everything.
    fn complete_run(&mut self, outcome: ComputeResult<Duration>) -> ComputeResult<Duration> {
        match outcome {
            Ok(elapsed) => {
                self.state = PipelineState::Ready;
                self.reporter
                    .info(format!("Finished running GPU kernels in {:.3} ms", millis(elapsed)));
                Ok(elapsed)
            }
            Err(e) => {
                let e = self.reporter.fail(e);
                self.cleanup();
                Err(e)
            }
        }
    }

    fn verify_output(
        &mut self,
        input: &[u8],
        output: &[u8],
        size: ImageSize,
        mask: StageMask,
    ) -> ComputeResult<VerificationStatus> {
        if !mask.runs_all(self.operator.algorithm().stage_count()) {
            self.reporter
                .warn("Verification skipped: it is only valid when every stage runs");
            let status = VerificationStatus::NotRun;
            self.reporter.info(status.to_string());
            return Ok(status);
        }
        let verifier = self.verifier;
        let reporter = self.reporter.clone();
        let reference = self.cached_reference(input, size)?;
        let status = VerificationStatus::from_report(verifier.compare(reference, output, size, &reporter));
        self.reporter.info(status.to_string());
        Ok(status)
    }

    /// Writes the CPU reference of `input` into `output`, reusing the cached
    /// result when the input has not changed.
    pub fn reference(&mut self, input: &[u8], output: &mut [u8], size: ImageSize) -> ComputeResult<()> {
        trace!(algorithm = %self.operator.algorithm(), size = %size, "ToneMapper::reference");
        size.check_buffers(input, output)?;
        let reference = self.cached_reference(input, size)?;
        output.copy_from_slice(reference);
        Ok(())
    }

    fn cached_reference(&mut self, input: &[u8], size: ImageSize) -> ComputeResult<&[u8]> {
        let fingerprint = Fingerprint::of(input, size);
        if self.cache.get(&fingerprint).is_some() {
            self.reporter.info("Finished reference (cached)");
        } else {
            let start = Instant::now();
            let mut computed = vec![0u8; size.byte_len()];
            self.operator
                .reference(input, &mut computed, size)
                .map_err(|e| self.reporter.fail(e))?;
            self.reporter
                .info(format!("Finished reference in {:.3} ms", millis(start.elapsed())));
            self.cache.store(fingerprint, &computed);
        }
        self.cache
            .get(&fingerprint)
            .ok_or_else(|| ComputeError::configuration("reference cache lost its entry"))
    }

    pub fn clear_reference_cache(&mut self) {
        self.cache.clear();
    }

    /// Releases every device resource. Safe to call in any state except
    /// `Unconfigured`, where it does nothing.
    pub fn cleanup(&mut self) {
        if let Some(gpu) = self.gpu.take() {
            gpu.ctx.wait();
            drop(gpu);
            debug!(algorithm = %self.operator.algorithm(), "pipeline released");
        }
        if self.state != PipelineState::Unconfigured {
            self.state = PipelineState::Released;
        }
    }
}

impl Drop for ToneMapper {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Severity;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Copy)]
    enum Fake {
        Load,
        Stats,
        Apply,
    }

    impl Stage for Fake {
        const ALL: &'static [Self] = &[Fake::Load, Fake::Stats, Fake::Apply];

        fn name(self) -> &'static str {
            match self {
                Fake::Load => "load",
                Fake::Stats => "stats",
                Fake::Apply => "apply",
            }
        }

        fn is_mapping(self) -> bool {
            matches!(self, Fake::Stats)
        }
    }

    fn run_names(mask: StageMask, mapping: bool) -> Vec<&'static str> {
        scheduled::<Fake>(mask, mapping).map(Fake::name).collect()
    }

    #[test]
    fn test_scheduled_follows_declared_order() {
        assert_eq!(run_names(StageMask::all(), true), ["load", "stats", "apply"]);
        let mask = StageMask::parse("3,1", 3).unwrap();
        assert_eq!(run_names(mask, true), ["load", "apply"]);
    }

    #[test]
    fn test_scheduled_skips_mapping() {
        assert_eq!(run_names(StageMask::all(), false), ["load", "apply"]);
    }

    #[test]
    fn test_algorithm_names_roundtrip() {
        for a in Algorithm::ALL {
            assert_eq!(a.name().parse::<Algorithm>().unwrap(), a);
            assert_eq!(a.stage_names().len(), a.stage_count());
        }
        assert_eq!("HISTEQ".parse::<Algorithm>().unwrap(), Algorithm::HistEq);
        assert!("sepia".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_stage_lists() {
        assert_eq!(
            Algorithm::HistEq.stage_names(),
            ["transfer_data", "partial_hist", "merge_hist", "hist_cdf", "histogram_equalisation"]
        );
        assert_eq!(
            Algorithm::ReinhardGlobal.stage_names(),
            ["compute_log_avg_lum", "final_reduc", "reinhard_global"]
        );
        assert_eq!(Algorithm::GradDom.stage_names().last(), Some(&"reconstruct"));
    }

    #[test]
    fn test_method_aliases() {
        assert_eq!("opencl".parse::<Method>().unwrap(), Method::Gpu);
        assert_eq!("reference".parse::<Method>().unwrap(), Method::Reference);
        assert!("cuda".parse::<Method>().is_err());
    }

    #[test]
    fn test_verification_status_display() {
        let ok = VerificationReport {
            mismatches: 0,
            max_difference: 0,
        };
        assert_eq!(VerificationStatus::from_report(ok).to_string(), "Verification: PASSED");
        let bad = VerificationReport {
            mismatches: 3,
            max_difference: 9,
        };
        assert_eq!(VerificationStatus::from_report(bad).to_string(), "Verification: FAILED");
        assert_eq!(VerificationStatus::NotRun.to_string(), "Verification: NOT RUN");
    }

    #[test]
    fn test_process_before_setup_is_rejected() {
        let mut mapper = ToneMapper::new(Operator::reinhard_global());
        let err = mapper
            .process(&[0; 4], &mut [0; 4], &RunOptions::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot process while pipeline is unconfigured");
        assert_eq!(mapper.state(), PipelineState::Unconfigured);
    }

    #[test]
    fn test_reference_is_cached() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let reporter = Reporter::new(Arc::new(move |_: Severity, msg: &str| {
            captured.lock().unwrap().push(msg.to_string());
        }));
        let mut mapper = ToneMapper::with_reporter(Operator::HistEq, reporter);
        let size = ImageSize::new(2, 1).unwrap();
        let input = [40, 40, 40, 7, 90, 90, 90, 8];
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        mapper.reference(&input, &mut first, size).unwrap();
        mapper.reference(&input, &mut second, size).unwrap();
        assert_eq!(first, second);
        let lines = lines.lock().unwrap();
        assert!(lines[0].starts_with("Finished reference in"));
        assert_eq!(lines[1], "Finished reference (cached)");
    }

    #[test]
    fn test_reference_cache_tracks_size() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let reporter = Reporter::new(Arc::new(move |_: Severity, msg: &str| {
            captured.lock().unwrap().push(msg.to_string());
        }));
        let mut mapper = ToneMapper::with_reporter(Operator::reinhard_global(), reporter);
        let input = [10u8, 200, 30, 255, 90, 10, 10, 255];
        let mut wide = [0u8; 8];
        let mut tall = [0u8; 8];
        let mut again = [0u8; 8];
        mapper.reference(&input, &mut wide, ImageSize::new(2, 1).unwrap()).unwrap();
        mapper.reference(&input, &mut tall, ImageSize::new(1, 2).unwrap()).unwrap();
        mapper.reference(&input, &mut again, ImageSize::new(1, 2).unwrap()).unwrap();
        assert_eq!(wide, tall);
        assert_eq!(tall, again);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Finished reference in"));
        assert!(lines[1].starts_with("Finished reference in"), "{}", lines[1]);
        assert!(!lines[1].contains("(cached)"));
        assert_eq!(lines[2], "Finished reference (cached)");
    }

    #[test]
    fn test_runs_mapping() {
        assert!(runs_mapping::<Fake>(StageMask::all()));
        assert!(runs_mapping::<Fake>(StageMask::parse("2", 3).unwrap()));
        assert!(!runs_mapping::<Fake>(StageMask::parse("1,3", 3).unwrap()));
        assert!(!runs_mapping::<reinhard_global::Stage>(StageMask::parse("3", 3).unwrap()));
        assert!(runs_mapping::<histeq::Stage>(StageMask::parse("1,4", 5).unwrap()));
        assert!(!runs_mapping::<histeq::Stage>(StageMask::parse("1,5", 5).unwrap()));
    }

    #[test]
    fn test_interop_params_need_textures() {
        let mut mapper = ToneMapper::new(Operator::hist_eq());
        let params = Params {
            interop: true,
            ..Params::default()
        };
        let err = mapper.setup(&params, 8, 8).unwrap_err();
        assert!(matches!(err, ComputeError::Configuration(_)), "{err}");
        assert!(err.to_string().contains("setup_with_textures"));
        assert_eq!(mapper.state(), PipelineState::Unconfigured);
    }

    #[test]
    fn test_histeq_size_limit() {
        let huge = ImageSize::new(65536, 65536).unwrap();
        assert!(Operator::HistEq.validate(huge).is_err());
        assert!(Operator::HistEq.validate(ImageSize::new(64, 64).unwrap()).is_ok());
    }

    #[test]
    fn test_invalid_params_rejected_before_device() {
        let mut mapper = ToneMapper::new(Operator::ReinhardGlobal(ReinhardGlobalParams {
            key: 0.0,
            ..Default::default()
        }));
        assert!(mapper.setup(&Params::default(), 4, 4).is_err());
        assert_eq!(mapper.state(), PipelineState::Unconfigured);
    }

    #[test]
    fn test_cleanup_without_setup() {
        let mut mapper = ToneMapper::new(Operator::grad_dom());
        mapper.cleanup();
        assert_eq!(mapper.state(), PipelineState::Unconfigured);
    }
}
