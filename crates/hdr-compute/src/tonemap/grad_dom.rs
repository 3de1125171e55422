//! Gradient-domain compression on the GPU.
//!
//! ```text
//!   log Y ─► per level: mipmap, |∇|, partial + final reduction (α_k)
//!         ─► attenuation (coarsest, then L-2 .. 0) ─► attenuated ∇ ─► div
//!         ─► Jacobi sweeps A⇄B in batches until converged ─► reconstruct
//! ```
//!
//! The four per-level stages share one partial-sum buffer, so they run
//! level by level: every enabled per-level stage finishes level `k` before
//! any of them starts level `k + 1`.

use std::ops::Range;

use hdr_core::tonemap::GradDomParams;
use hdr_core::ImageSize;
use tracing::debug;

use crate::device::{DeviceContext, Kernel};
use crate::geometry::LaunchGeometry;
use crate::shaders;
use crate::stages::StageMask;
use crate::status::Reporter;
use crate::tonemap::{image_defines, scheduled, ImageIo, LevelTable};
use crate::ComputeResult;

/// Jacobi sweeps recorded between convergence readbacks.
const POISSON_BATCH: u32 = 64;

const SOLVER_CONVERGED: usize = 0;
const SOLVER_DONE: usize = 1;
const SOLVER_ITERATIONS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    LogLuminance,
    Mipmap,
    GradientMagnitude,
    PartialReduce,
    FinalReduce,
    CoarsestAttenuation,
    Attenuation,
    AttenuatedGradients,
    Divergence,
    PoissonSolve,
    Reconstruct,
}

impl Stage {
    fn is_per_level(self) -> bool {
        matches!(
            self,
            Stage::Mipmap | Stage::GradientMagnitude | Stage::PartialReduce | Stage::FinalReduce
        )
    }
}

impl super::Stage for Stage {
    const ALL: &'static [Self] = &[
        Stage::LogLuminance,
        Stage::Mipmap,
        Stage::GradientMagnitude,
        Stage::PartialReduce,
        Stage::FinalReduce,
        Stage::CoarsestAttenuation,
        Stage::Attenuation,
        Stage::AttenuatedGradients,
        Stage::Divergence,
        Stage::PoissonSolve,
        Stage::Reconstruct,
    ];

    fn name(self) -> &'static str {
        match self {
            Stage::LogLuminance => "compute_log_lum",
            Stage::Mipmap => "channel_mipmap",
            Stage::GradientMagnitude => "gradient_mag",
            Stage::PartialReduce => "partial_reduc",
            Stage::FinalReduce => "final_reduc",
            Stage::CoarsestAttenuation => "coarsest_level_attenfunc",
            Stage::Attenuation => "atten_func",
            Stage::AttenuatedGradients => "grad_atten",
            Stage::Divergence => "div_grad",
            Stage::PoissonSolve => "poisson_solve",
            Stage::Reconstruct => "reconstruct",
        }
    }

    fn is_mapping(self) -> bool {
        !matches!(self, Stage::Reconstruct)
    }
}

struct Kernels {
    log_lum: Kernel,
    mipmap: Kernel,
    gradient_mag: Kernel,
    partial_reduc: Kernel,
    final_reduc: Kernel,
    coarsest: Kernel,
    atten: Kernel,
    grad_atten: Kernel,
    div_grad: Kernel,
    jacobi: Kernel,
    check: Kernel,
    reconstruct: Kernel,
}

/// Per-level groups are indexed by level.
struct BindGroups {
    log_lum: wgpu::BindGroup,
    /// Level 0 has no mipmap pass; index 0 holds level 1.
    mipmap: Vec<wgpu::BindGroup>,
    gradient_mag: Vec<wgpu::BindGroup>,
    partial_reduc: Vec<wgpu::BindGroup>,
    final_reduc: Vec<wgpu::BindGroup>,
    coarsest: wgpu::BindGroup,
    /// Levels `0..L-1`.
    atten: Vec<wgpu::BindGroup>,
    grad_atten: wgpu::BindGroup,
    div_grad: wgpu::BindGroup,
    jacobi_a_to_b: wgpu::BindGroup,
    jacobi_b_to_a: wgpu::BindGroup,
    check: wgpu::BindGroup,
    reconstruct: wgpu::BindGroup,
}

struct Buffers {
    /// Log-luminance pyramid; level 0 seeds the solve.
    mips: wgpu::Buffer,
    iterate_a: wgpu::Buffer,
    flags: wgpu::Buffer,
    solver: wgpu::Buffer,
    solver_staging: wgpu::Buffer,
    _rest: Vec<wgpu::Buffer>,
}

pub(crate) struct GradDomPipeline {
    kernels: Kernels,
    groups: BindGroups,
    buffers: Buffers,
    table: LevelTable,
    pixels: usize,
    max_iterations: u32,
    reporter: Reporter,
}

impl GradDomPipeline {
    pub fn new(
        ctx: &DeviceContext,
        io: &ImageIo,
        size: ImageSize,
        params: &GradDomParams,
        reporter: &Reporter,
    ) -> ComputeResult<Self> {
        let pyramid = params.pyramid(size);
        let num_levels = pyramid.num_levels();
        let pixels = size.pixel_count();
        let limits = ctx.kernel_limits();
        let cu = ctx.compute_units();
        let grid = LaunchGeometry::plan_2d(&limits, cu);
        let line = LaunchGeometry::plan_1d(&limits, cu);
        let num_partials = line.work_group_count();
        let last = LaunchGeometry::reduction(&limits, num_partials);

        let mut defines = image_defines(size);
        defines
            .set_f32("ADJUST_ALPHA", params.adjust_alpha)
            .set_f32("BETA", params.beta)
            .set_f32("SAT", params.saturation)
            .set_f32("THRESHOLD", params.threshold)
            .set("CONVERGED_TARGET", params.converged_target(pixels))
            .set("MAX_ITERATIONS", params.max_iterations)
            .set("NUM_LEVELS", num_levels)
            .set("NUM_PARTIALS", num_partials)
            .workgroup("PARTIAL_REDUC", &line)
            .workgroup("FINAL_REDUC", &last)
            .workgroup("COARSEST", &line);
        for prefix in [
            "LOG_LUM",
            "MIPMAP",
            "GRAD_MAG",
            "ATTEN",
            "GRAD_ATTEN",
            "DIV_GRAD",
            "POISSON",
            "RECONSTRUCT",
        ] {
            defines.workgroup(prefix, &grid);
        }

        let source = shaders::program(&[shaders::COMMON, shaders::MIPMAP, shaders::GRAD_DOM]);
        let program = ctx.build_program("gradDom", &source, &defines, reporter)?;
        let kernel = |name: &'static str, geometry: LaunchGeometry| {
            ctx.create_kernel(&program, name, geometry, reporter)
        };
        let kernels = Kernels {
            log_lum: kernel("compute_log_lum", grid)?,
            mipmap: kernel("channel_mipmap", grid)?,
            gradient_mag: kernel("gradient_mag", grid)?,
            partial_reduc: kernel("partial_reduc", line)?,
            final_reduc: kernel("final_reduc", last)?,
            coarsest: kernel("coarsest_level_attenfunc", line)?,
            atten: kernel("atten_func", grid)?,
            grad_atten: kernel("grad_atten", grid)?,
            div_grad: kernel("div_grad", grid)?,
            jacobi: kernel("poisson_jacobi", grid)?,
            check: kernel("poisson_check", LaunchGeometry::single_group(1))?,
            reconstruct: kernel("reconstruct", grid)?,
        };

        let none = wgpu::BufferUsages::empty();
        let copy_dst = wgpu::BufferUsages::COPY_DST;
        let mips = ctx.storage::<f32>("log_lum_mipmaps", pyramid.len(), wgpu::BufferUsages::COPY_SRC)?;
        let grads = ctx.storage::<f32>("gradient_magnitudes", pyramid.len(), none)?;
        let atten = ctx.storage::<f32>("attenuation", pyramid.len(), none)?;
        let partial_sum = ctx.storage::<f32>("partial_sum", num_partials as usize, none)?;
        let alphas = ctx.storage::<f32>("alphas", num_levels, none)?;
        let grad_x = ctx.storage::<f32>("attenuated_grad_x", pixels, none)?;
        let grad_y = ctx.storage::<f32>("attenuated_grad_y", pixels, none)?;
        let divergence = ctx.storage::<f32>("divergence", pixels, none)?;
        let iterate_a = ctx.storage::<f32>("poisson_a", pixels, copy_dst)?;
        let iterate_b = ctx.storage::<f32>("poisson_b", pixels, none)?;
        let flags = ctx.storage::<u32>("converged_flags", pixels, copy_dst)?;
        let solver = ctx.storage::<u32>("solver_state", 4, copy_dst | wgpu::BufferUsages::COPY_SRC)?;
        let solver_staging = ctx.readback_buffer("solver_staging", 16)?;
        let table = LevelTable::new(ctx, pyramid)?;

        let per_level = |kernel: &Kernel, range: Range<usize>, entries: &[(u32, &wgpu::Buffer)]| {
            bind_levels(ctx, kernel, &table, range, entries)
        };
        let groups = BindGroups {
            log_lum: ctx.bind(&kernels.log_lum, &[(0, &io.input), (2, &mips)])?,
            mipmap: per_level(&kernels.mipmap, 1..num_levels, &[(2, &mips)])?,
            gradient_mag: per_level(&kernels.gradient_mag, 0..num_levels, &[(2, &mips), (3, &grads)])?,
            partial_reduc: per_level(&kernels.partial_reduc, 0..num_levels, &[(3, &grads), (5, &partial_sum)])?,
            final_reduc: per_level(&kernels.final_reduc, 0..num_levels, &[(5, &partial_sum), (6, &alphas)])?,
            coarsest: ctx.bind(
                &kernels.coarsest,
                &[(3, &grads), (4, &atten), (6, &alphas), (14, &table.levels)],
            )?,
            atten: per_level(
                &kernels.atten,
                0..num_levels - 1,
                &[(3, &grads), (4, &atten), (6, &alphas)],
            )?,
            grad_atten: ctx.bind(
                &kernels.grad_atten,
                &[(2, &mips), (4, &atten), (7, &grad_x), (8, &grad_y)],
            )?,
            div_grad: ctx.bind(&kernels.div_grad, &[(7, &grad_x), (8, &grad_y), (9, &divergence)])?,
            jacobi_a_to_b: ctx.bind(
                &kernels.jacobi,
                &[(9, &divergence), (10, &iterate_a), (11, &iterate_b), (12, &flags), (13, &solver)],
            )?,
            jacobi_b_to_a: ctx.bind(
                &kernels.jacobi,
                &[(9, &divergence), (10, &iterate_b), (11, &iterate_a), (12, &flags), (13, &solver)],
            )?,
            check: ctx.bind(&kernels.check, &[(13, &solver)])?,
            reconstruct: ctx.bind(
                &kernels.reconstruct,
                &[
                    (0, &io.input),
                    (1, &io.output),
                    (2, &mips),
                    (13, &solver),
                    (16, &iterate_a),
                    (17, &iterate_b),
                ],
            )?,
        };
        debug!(levels = num_levels, partials = num_partials, "gradient-domain pipeline ready");

        Ok(Self {
            kernels,
            groups,
            buffers: Buffers {
                mips,
                iterate_a,
                flags,
                solver,
                solver_staging,
                _rest: vec![
                    grads,
                    atten,
                    partial_sum,
                    alphas,
                    grad_x,
                    grad_y,
                    divergence,
                    iterate_b,
                ],
            },
            table,
            pixels,
            max_iterations: params.max_iterations,
            reporter: reporter.clone(),
        })
    }

    pub fn run(&mut self, ctx: &DeviceContext, mask: StageMask, mapping: bool) -> ComputeResult<()> {
        let mut encoder = ctx.encoder("gradDom");
        let mut levels_encoded = false;
        for stage in scheduled::<Stage>(mask, mapping) {
            match stage {
                s if s.is_per_level() => {
                    if !levels_encoded {
                        self.encode_levels(&mut encoder, mask, mapping);
                        levels_encoded = true;
                    }
                }
                Stage::LogLuminance => self.kernels.log_lum.dispatch(&mut encoder, &self.groups.log_lum),
                Stage::CoarsestAttenuation => {
                    self.kernels.coarsest.dispatch(&mut encoder, &self.groups.coarsest)
                }
                Stage::Attenuation => {
                    for group in self.groups.atten.iter().rev() {
                        self.kernels.atten.dispatch(&mut encoder, group);
                    }
                }
                Stage::AttenuatedGradients => {
                    self.kernels.grad_atten.dispatch(&mut encoder, &self.groups.grad_atten)
                }
                Stage::Divergence => self.kernels.div_grad.dispatch(&mut encoder, &self.groups.div_grad),
                Stage::PoissonSolve => {
                    ctx.submit(encoder, "running gradDom kernels")?;
                    let iterations = self.solve(ctx)?;
                    self.reporter
                        .debug(format!("Poisson solve finished after {iterations} iterations"));
                    encoder = ctx.encoder("gradDom");
                }
                Stage::Reconstruct => {
                    self.kernels.reconstruct.dispatch(&mut encoder, &self.groups.reconstruct)
                }
                _ => {}
            }
        }
        ctx.submit(encoder, "running gradDom kernels")
    }

    /// Records every enabled per-level stage, level by level.
    fn encode_levels(&self, encoder: &mut wgpu::CommandEncoder, mask: StageMask, mapping: bool) {
        let enabled = |stage: Stage| scheduled::<Stage>(mask, mapping).any(|s| s == stage);
        let mipmap = enabled(Stage::Mipmap);
        let gradient = enabled(Stage::GradientMagnitude);
        let partial = enabled(Stage::PartialReduce);
        let last = enabled(Stage::FinalReduce);
        let g = &self.groups;
        for k in 0..self.table.num_levels() {
            if mipmap && k > 0 {
                self.kernels.mipmap.dispatch(encoder, &g.mipmap[k - 1]);
            }
            if gradient {
                self.kernels.gradient_mag.dispatch(encoder, &g.gradient_mag[k]);
            }
            if partial {
                self.kernels.partial_reduc.dispatch(encoder, &g.partial_reduc[k]);
            }
            if last {
                self.kernels.final_reduc.dispatch(encoder, &g.final_reduc[k]);
            }
        }
    }

    /// Seeds the solve with level-0 log luminance and sweeps until the
    /// device marks it done. Returns the sweeps performed.
    fn solve(&self, ctx: &DeviceContext) -> ComputeResult<u32> {
        let b = &self.buffers;
        let mut encoder = ctx.encoder("poisson_init");
        encoder.copy_buffer_to_buffer(&b.mips, 0, &b.iterate_a, 0, (self.pixels * 4) as u64);
        encoder.clear_buffer(&b.flags, 0, None);
        encoder.clear_buffer(&b.solver, 0, None);
        ctx.submit(encoder, "initialising poisson solve")?;

        let mut state = [0u32; 4];
        let mut issued = 0u32;
        while issued < self.max_iterations {
            let batch = POISSON_BATCH.min(self.max_iterations - issued);
            let mut encoder = ctx.encoder("poisson_solve");
            for i in issued..issued + batch {
                let group = if i % 2 == 0 {
                    &self.groups.jacobi_a_to_b
                } else {
                    &self.groups.jacobi_b_to_a
                };
                self.kernels.jacobi.dispatch(&mut encoder, group);
                self.kernels.check.dispatch(&mut encoder, &self.groups.check);
            }
            issued += batch;
            encoder.copy_buffer_to_buffer(&b.solver, 0, &b.solver_staging, 0, 16);
            ctx.submit(encoder, "running poisson_solve")?;
            ctx.read_values(&b.solver_staging, &mut state, "reading solver state")?;
            if state[SOLVER_DONE] != 0 {
                break;
            }
        }
        debug!(
            iterations = state[SOLVER_ITERATIONS],
            converged = state[SOLVER_CONVERGED],
            "poisson solve finished"
        );
        Ok(state[SOLVER_ITERATIONS])
    }
}

/// One bind group per level in `range`, each with `entries` plus the level
/// table (binding 14) and that level's selector (binding 15).
fn bind_levels<'a>(
    ctx: &DeviceContext,
    kernel: &Kernel,
    table: &'a LevelTable,
    range: Range<usize>,
    entries: &[(u32, &'a wgpu::Buffer)],
) -> ComputeResult<Vec<wgpu::BindGroup>> {
    table.selectors[range]
        .iter()
        .map(|selector| {
            let mut all = entries.to_vec();
            all.push((14, &table.levels));
            all.push((15, selector));
            ctx.bind(kernel, &all)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tonemap::Stage as _;

    #[test]
    fn test_only_reconstruct_applies() {
        let apply: Vec<_> = Stage::ALL.iter().filter(|s| !s.is_mapping()).collect();
        assert_eq!(apply, [&Stage::Reconstruct]);
    }

    #[test]
    fn test_per_level_stages_are_contiguous() {
        let positions: Vec<usize> = Stage::ALL
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_per_level())
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(positions, [2, 3, 4, 5]);
    }
}
