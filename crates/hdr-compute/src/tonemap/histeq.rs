//! Histogram equalisation on the GPU.
//!
//! Per-workgroup histograms are merged by one invocation per bin, then a
//! single invocation builds the cumulative distribution.

use hdr_core::{ImageSize, HIST_SIZE};

use crate::device::{DeviceContext, Kernel};
use crate::geometry::LaunchGeometry;
use crate::shaders;
use crate::stages::StageMask;
use crate::status::Reporter;
use crate::tonemap::{image_defines, scheduled, ImageIo};
use crate::ComputeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    TransferData,
    PartialHist,
    MergeHist,
    HistCdf,
    Equalise,
}

impl super::Stage for Stage {
    const ALL: &'static [Self] = &[
        Stage::TransferData,
        Stage::PartialHist,
        Stage::MergeHist,
        Stage::HistCdf,
        Stage::Equalise,
    ];

    fn name(self) -> &'static str {
        match self {
            Stage::TransferData => "transfer_data",
            Stage::PartialHist => "partial_hist",
            Stage::MergeHist => "merge_hist",
            Stage::HistCdf => "hist_cdf",
            Stage::Equalise => "histogram_equalisation",
        }
    }

    fn is_mapping(self) -> bool {
        matches!(self, Stage::PartialHist | Stage::MergeHist | Stage::HistCdf)
    }
}

struct Kernels {
    transfer_data: Kernel,
    partial_hist: Kernel,
    merge_hist: Kernel,
    hist_cdf: Kernel,
    equalise: Kernel,
}

struct BindGroups {
    transfer_data: wgpu::BindGroup,
    partial_hist: wgpu::BindGroup,
    merge_hist: wgpu::BindGroup,
    hist_cdf: wgpu::BindGroup,
    equalise: wgpu::BindGroup,
}

pub(crate) struct HistEqPipeline {
    kernels: Kernels,
    groups: BindGroups,
    _buffers: [wgpu::Buffer; 4],
}

impl HistEqPipeline {
    pub fn new(
        ctx: &DeviceContext,
        io: &ImageIo,
        size: ImageSize,
        half_float: bool,
        reporter: &Reporter,
    ) -> ComputeResult<Self> {
        let limits = ctx.kernel_limits();
        let cu = ctx.compute_units();
        let transfer = LaunchGeometry::plan_2d(&limits, cu);
        let partial = LaunchGeometry::plan_1d(&limits, cu);
        let merge = LaunchGeometry::covering(&limits, HIST_SIZE as u32);
        let apply = LaunchGeometry::plan_2d(&limits, cu);
        let num_partials = partial.work_group_count();

        let mut defines = image_defines(size);
        defines
            .set_bool("BUGGY_INTEROP", half_float)
            .set("NUM_PARTIALS", num_partials)
            .workgroup("TRANSFER", &transfer)
            .workgroup("PARTIAL_HIST", &partial)
            .workgroup("MERGE_HIST", &merge)
            .workgroup("APPLY", &apply);
        let source = shaders::program(&[shaders::COMMON, shaders::HIST_EQ]);
        let program = ctx.build_program("histEq", &source, &defines, reporter)?;

        let kernels = Kernels {
            transfer_data: ctx.create_kernel(&program, "transfer_data", transfer, reporter)?,
            partial_hist: ctx.create_kernel(&program, "partial_hist", partial, reporter)?,
            merge_hist: ctx.create_kernel(&program, "merge_hist", merge, reporter)?,
            hist_cdf: ctx.create_kernel(&program, "hist_cdf", LaunchGeometry::single_group(1), reporter)?,
            equalise: ctx.create_kernel(&program, "histogram_equalisation", apply, reporter)?,
        };

        let none = wgpu::BufferUsages::empty();
        let pixels = ctx.storage::<u32>("pixels", size.pixel_count(), none)?;
        let partial_hist = ctx.storage::<u32>("partial_hist", num_partials as usize * HIST_SIZE, none)?;
        let hist = ctx.storage::<u32>("hist", HIST_SIZE, none)?;
        let cdf = ctx.storage::<u32>("cdf", HIST_SIZE, none)?;

        let groups = BindGroups {
            transfer_data: ctx.bind(&kernels.transfer_data, &[(0, &io.input), (2, &pixels)])?,
            partial_hist: ctx.bind(&kernels.partial_hist, &[(2, &pixels), (3, &partial_hist)])?,
            merge_hist: ctx.bind(&kernels.merge_hist, &[(3, &partial_hist), (4, &hist)])?,
            hist_cdf: ctx.bind(&kernels.hist_cdf, &[(4, &hist), (5, &cdf)])?,
            equalise: ctx.bind(&kernels.equalise, &[(1, &io.output), (2, &pixels), (5, &cdf)])?,
        };

        Ok(Self {
            kernels,
            groups,
            _buffers: [pixels, partial_hist, hist, cdf],
        })
    }

    pub fn run(&mut self, ctx: &DeviceContext, mask: StageMask, mapping: bool) -> ComputeResult<()> {
        let mut encoder = ctx.encoder("histEq");
        for stage in scheduled::<Stage>(mask, mapping) {
            let (kernel, group) = match stage {
                Stage::TransferData => (&self.kernels.transfer_data, &self.groups.transfer_data),
                Stage::PartialHist => (&self.kernels.partial_hist, &self.groups.partial_hist),
                Stage::MergeHist => (&self.kernels.merge_hist, &self.groups.merge_hist),
                Stage::HistCdf => (&self.kernels.hist_cdf, &self.groups.hist_cdf),
                Stage::Equalise => (&self.kernels.equalise, &self.groups.equalise),
            };
            kernel.dispatch(&mut encoder, group);
        }
        ctx.submit(encoder, "running histEq kernels")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tonemap::Stage as _;

    #[test]
    fn test_mapping_stages() {
        let mapping: Vec<_> = Stage::ALL.iter().filter(|s| s.is_mapping()).map(|s| s.name()).collect();
        assert_eq!(mapping, ["partial_hist", "merge_hist", "hist_cdf"]);
    }
}
