//! Global Reinhard operator on the GPU.

use hdr_core::tonemap::ReinhardGlobalParams;
use hdr_core::ImageSize;

use crate::device::{Defines, DeviceContext, Kernel, Program};
use crate::geometry::LaunchGeometry;
use crate::shaders;
use crate::stages::StageMask;
use crate::status::Reporter;
use crate::tonemap::{image_defines, scheduled, ImageIo};
use crate::ComputeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    LogAverage,
    FinalReduce,
    Apply,
}

impl super::Stage for Stage {
    const ALL: &'static [Self] = &[Stage::LogAverage, Stage::FinalReduce, Stage::Apply];

    fn name(self) -> &'static str {
        match self {
            Stage::LogAverage => "compute_log_avg_lum",
            Stage::FinalReduce => "final_reduc",
            Stage::Apply => "reinhard_global",
        }
    }

    fn is_mapping(self) -> bool {
        !matches!(self, Stage::Apply)
    }
}

/// Log-average and maximum luminance reduction shared by both Reinhard
/// pipelines: `stats[0]` is the log-average, `stats[1]` the maximum.
pub(crate) struct LuminanceReduction {
    pub log_average: Kernel,
    pub final_reduc: Kernel,
    pub partial_sum: wgpu::Buffer,
    pub partial_max: wgpu::Buffer,
    pub stats: wgpu::Buffer,
}

impl LuminanceReduction {
    /// Plans both kernels and sets their defines. Kernels are created once the
    /// program is built, through [`LuminanceReduction::new`].
    pub fn geometry(ctx: &DeviceContext, defines: &mut Defines) -> (LaunchGeometry, LaunchGeometry) {
        let limits = ctx.kernel_limits();
        let partial = LaunchGeometry::plan_2d(&limits, ctx.compute_units());
        let num_partials = partial.work_group_count();
        let last = LaunchGeometry::reduction(&limits, num_partials);
        defines
            .set("NUM_PARTIALS", num_partials)
            .workgroup("LOG_AVG", &partial)
            .workgroup("FINAL_REDUC", &last);
        (partial, last)
    }

    pub fn new(
        ctx: &DeviceContext,
        program: &Program,
        (partial, last): (LaunchGeometry, LaunchGeometry),
        reporter: &Reporter,
    ) -> ComputeResult<Self> {
        let log_average = ctx.create_kernel(program, "compute_log_avg_lum", partial, reporter)?;
        let final_reduc = ctx.create_kernel(program, "final_reduc", last, reporter)?;
        let partials = partial.work_group_count() as usize;
        let none = wgpu::BufferUsages::empty();
        Ok(Self {
            log_average,
            final_reduc,
            partial_sum: ctx.storage::<f32>("partial_sum", partials, none)?,
            partial_max: ctx.storage::<f32>("partial_max", partials, none)?,
            stats: ctx.storage::<f32>("stats", 2, none)?,
        })
    }

    pub fn bind_final(&self, ctx: &DeviceContext) -> ComputeResult<wgpu::BindGroup> {
        ctx.bind(
            &self.final_reduc,
            &[(2, &self.partial_sum), (3, &self.partial_max), (4, &self.stats)],
        )
    }
}

pub(crate) struct ReinhardGlobalPipeline {
    reduction: LuminanceReduction,
    apply: Kernel,
    log_average_group: wgpu::BindGroup,
    final_group: wgpu::BindGroup,
    apply_group: wgpu::BindGroup,
}

impl ReinhardGlobalPipeline {
    pub fn new(
        ctx: &DeviceContext,
        io: &ImageIo,
        size: ImageSize,
        params: &ReinhardGlobalParams,
        reporter: &Reporter,
    ) -> ComputeResult<Self> {
        let apply_geometry = LaunchGeometry::plan_2d(&ctx.kernel_limits(), ctx.compute_units());
        let mut defines = image_defines(size);
        defines
            .set_f32("KEY", params.key)
            .set_f32("SAT", params.saturation)
            .workgroup("APPLY", &apply_geometry);
        let reduction_geometry = LuminanceReduction::geometry(ctx, &mut defines);

        let source = shaders::program(&[shaders::COMMON, shaders::LOG_AVERAGE, shaders::REINHARD_GLOBAL]);
        let program = ctx.build_program("reinhardGlobal", &source, &defines, reporter)?;
        let reduction = LuminanceReduction::new(ctx, &program, reduction_geometry, reporter)?;
        let apply = ctx.create_kernel(&program, "reinhard_global", apply_geometry, reporter)?;

        let log_average_group = ctx.bind(
            &reduction.log_average,
            &[(0, &io.input), (2, &reduction.partial_sum), (3, &reduction.partial_max)],
        )?;
        let final_group = reduction.bind_final(ctx)?;
        let apply_group = ctx.bind(&apply, &[(0, &io.input), (1, &io.output), (4, &reduction.stats)])?;

        Ok(Self {
            reduction,
            apply,
            log_average_group,
            final_group,
            apply_group,
        })
    }

    pub fn run(&mut self, ctx: &DeviceContext, mask: StageMask, mapping: bool) -> ComputeResult<()> {
        let mut encoder = ctx.encoder("reinhardGlobal");
        for stage in scheduled::<Stage>(mask, mapping) {
            match stage {
                Stage::LogAverage => self.reduction.log_average.dispatch(&mut encoder, &self.log_average_group),
                Stage::FinalReduce => self.reduction.final_reduc.dispatch(&mut encoder, &self.final_group),
                Stage::Apply => self.apply.dispatch(&mut encoder, &self.apply_group),
            }
        }
        ctx.submit(encoder, "running reinhardGlobal kernels")
    }
}
