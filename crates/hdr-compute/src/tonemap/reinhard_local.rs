//! Local (dodging-and-burning) Reinhard operator on the GPU.
//!
//! The log-average reduction also writes plain luminance into level 0 of
//! the pyramid, which `channel_mipmap` then fills one level at a time.

use hdr_core::tonemap::{scale_constants, ReinhardLocalParams};
use hdr_core::ImageSize;
use tracing::debug;

use crate::device::{DeviceContext, Kernel};
use crate::geometry::LaunchGeometry;
use crate::shaders;
use crate::stages::StageMask;
use crate::status::Reporter;
use crate::tonemap::reinhard_global::LuminanceReduction;
use crate::tonemap::{image_defines, scheduled, ImageIo, LevelTable};
use crate::ComputeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    LogAverage,
    FinalReduce,
    Mipmap,
    Apply,
}

impl super::Stage for Stage {
    const ALL: &'static [Self] = &[Stage::LogAverage, Stage::FinalReduce, Stage::Mipmap, Stage::Apply];

    fn name(self) -> &'static str {
        match self {
            Stage::LogAverage => "compute_log_avg_lum",
            Stage::FinalReduce => "final_reduc",
            Stage::Mipmap => "channel_mipmap",
            Stage::Apply => "reinhard_local",
        }
    }

    fn is_mapping(self) -> bool {
        !matches!(self, Stage::Apply)
    }
}

pub(crate) struct ReinhardLocalPipeline {
    reduction: LuminanceReduction,
    mipmap: Kernel,
    apply: Kernel,
    _table: LevelTable,
    log_average_group: wgpu::BindGroup,
    final_group: wgpu::BindGroup,
    /// Indexed by destination level; level 0 has none.
    mipmap_groups: Vec<wgpu::BindGroup>,
    apply_group: wgpu::BindGroup,
    _buffers: [wgpu::Buffer; 2],
}

impl ReinhardLocalPipeline {
    pub fn new(
        ctx: &DeviceContext,
        io: &ImageIo,
        size: ImageSize,
        params: &ReinhardLocalParams,
        reporter: &Reporter,
    ) -> ComputeResult<Self> {
        let pyramid = params.pyramid(size);
        let num_levels = pyramid.num_levels();
        let limits = ctx.kernel_limits();
        let cu = ctx.compute_units();
        let mipmap_geometry = LaunchGeometry::plan_2d(&limits, cu);
        let apply_geometry = LaunchGeometry::plan_2d(&limits, cu);

        let mut defines = image_defines(size);
        defines
            .set_f32("KEY", params.key)
            .set_f32("SAT", params.saturation)
            .set_f32("EPSILON", params.epsilon)
            .set("NUM_LEVELS", num_levels)
            .workgroup("MIPMAP", &mipmap_geometry)
            .workgroup("APPLY", &apply_geometry);
        let reduction_geometry = LuminanceReduction::geometry(ctx, &mut defines);

        let source = shaders::program(&[
            shaders::COMMON,
            shaders::MIPMAP,
            shaders::LOG_AVERAGE,
            shaders::REINHARD_LOCAL,
        ]);
        let program = ctx.build_program("reinhardLocal", &source, &defines, reporter)?;
        let reduction = LuminanceReduction::new(ctx, &program, reduction_geometry, reporter)?;
        let mipmap = ctx.create_kernel(&program, "channel_mipmap", mipmap_geometry, reporter)?;
        let apply = ctx.create_kernel(&program, "reinhard_local", apply_geometry, reporter)?;

        let mips = ctx.storage::<f32>("luminance_mipmaps", pyramid.len(), wgpu::BufferUsages::empty())?;
        let mut scales = scale_constants(params, num_levels);
        if scales.is_empty() {
            // single-level pyramid: the walk never reads it
            scales.push(0.0);
        }
        let scales = ctx.buffer_init("scales", &scales, wgpu::BufferUsages::STORAGE)?;
        let table = LevelTable::new(ctx, pyramid)?;
        debug!(levels = table.num_levels(), "luminance pyramid");

        let log_average_group = ctx.bind(
            &reduction.log_average,
            &[
                (0, &io.input),
                (2, &reduction.partial_sum),
                (3, &reduction.partial_max),
                (5, &mips),
            ],
        )?;
        let final_group = reduction.bind_final(ctx)?;
        let mipmap_groups = table.selectors[1..]
            .iter()
            .map(|selector| ctx.bind(&mipmap, &[(5, &mips), (6, &table.levels), (8, selector)]))
            .collect::<ComputeResult<Vec<_>>>()?;
        let apply_group = ctx.bind(
            &apply,
            &[
                (0, &io.input),
                (1, &io.output),
                (4, &reduction.stats),
                (5, &mips),
                (6, &table.levels),
                (7, &scales),
            ],
        )?;

        Ok(Self {
            reduction,
            mipmap,
            apply,
            _table: table,
            log_average_group,
            final_group,
            mipmap_groups,
            apply_group,
            _buffers: [mips, scales],
        })
    }

    pub fn run(&mut self, ctx: &DeviceContext, mask: StageMask, mapping: bool) -> ComputeResult<()> {
        let mut encoder = ctx.encoder("reinhardLocal");
        for stage in scheduled::<Stage>(mask, mapping) {
            match stage {
                Stage::LogAverage => self.reduction.log_average.dispatch(&mut encoder, &self.log_average_group),
                Stage::FinalReduce => self.reduction.final_reduc.dispatch(&mut encoder, &self.final_group),
                Stage::Mipmap => {
                    for group in &self.mipmap_groups {
                        self.mipmap.dispatch(&mut encoder, group);
                    }
                }
                Stage::Apply => self.apply.dispatch(&mut encoder, &self.apply_group),
            }
        }
        ctx.submit(encoder, "running reinhardLocal kernels")
    }
}
