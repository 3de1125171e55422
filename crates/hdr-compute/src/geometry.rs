//! Launch geometry planning.
//!
//! Every kernel loops over its domain with a grid stride, so global sizes
//! only need to saturate the device, not cover the image. Sizes derive from
//! the device limits and a compute-unit estimate:
//!
//! ```text
//! 1-D   local = preferred multiple
//!       global = local * compute units
//!
//! 2-D   local starts at (preferred, 1); the smaller side doubles
//!       (x on ties, then alternating) while x * y <= max
//!       global[d] = round_up(local[d] * compute units, local[d])
//! ```

/// Per-kernel limits the planner works within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLimits {
    /// Largest invocation count of one workgroup.
    pub max_work_group: u32,
    /// Workgroup sizes should be multiples of this.
    pub preferred_multiple: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl KernelLimits {
    /// Upper bound applied to every planned workgroup.
    pub const WORK_GROUP_CAP: u32 = 256;

    pub fn from_limits(limits: &wgpu::Limits) -> Self {
        let max_work_group = limits
            .max_compute_invocations_per_workgroup
            .min(Self::WORK_GROUP_CAP)
            .max(1);
        let preferred = match limits.max_subgroup_size {
            0 => 32,
            n => n,
        };
        Self {
            max_work_group,
            preferred_multiple: preferred.min(max_work_group),
            max_x: limits.max_compute_workgroup_size_x.max(1),
            max_y: limits.max_compute_workgroup_size_y.max(1),
        }
    }
}

/// Local and global sizes of one kernel. Unused dimensions are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub dims: u32,
    pub local: [u32; 2],
    pub global: [u32; 2],
}

impl LaunchGeometry {
    pub fn plan_1d(limits: &KernelLimits, compute_units: u32) -> Self {
        let local = limits
            .preferred_multiple
            .min(limits.max_work_group)
            .min(limits.max_x)
            .max(1);
        Self {
            dims: 1,
            local: [local, 1],
            global: [local * compute_units.max(1), 1],
        }
    }

    pub fn plan_2d(limits: &KernelLimits, compute_units: u32) -> Self {
        let max = limits.max_work_group.max(1);
        let caps = [limits.max_x.min(max), limits.max_y.min(max)];

        let mut local = [limits.preferred_multiple.max(1), 1];
        while local[0] > caps[0] && local[0] > 1 {
            local[0] /= 2;
        }

        let mut ties = 0u32;
        loop {
            let d = if local[0] < local[1] {
                0
            } else if local[1] < local[0] {
                1
            } else {
                ties += 1;
                ((ties - 1) % 2) as usize
            };
            let grown = local[d] * 2;
            if grown > caps[d] || grown * local[1 - d] > max {
                break;
            }
            local[d] = grown;
        }

        let cu = compute_units.max(1);
        Self {
            dims: 2,
            local,
            global: [
                round_up(local[0] * cu, local[0]),
                round_up(local[1] * cu, local[1]),
            ],
        }
    }

    /// A single workgroup of exactly `size` invocations.
    pub fn single_group(size: u32) -> Self {
        let size = size.max(1);
        Self {
            dims: 1,
            local: [size, 1],
            global: [size, 1],
        }
    }

    /// One workgroup of at most `limits.max_work_group` invocations, sized to
    /// `items` when fewer are needed.
    pub fn reduction(limits: &KernelLimits, items: u32) -> Self {
        Self::single_group(items.clamp(1, limits.max_work_group))
    }

    /// One invocation per item: workgroups of up to `limits.max_work_group`
    /// covering `items`.
    pub fn covering(limits: &KernelLimits, items: u32) -> Self {
        let local = items.clamp(1, limits.max_work_group.min(limits.max_x));
        Self {
            dims: 1,
            local: [local, 1],
            global: [round_up(items.max(1), local), 1],
        }
    }

    /// Workgroups dispatched per dimension.
    #[inline]
    pub fn work_groups(&self) -> [u32; 2] {
        [self.global[0] / self.local[0], self.global[1] / self.local[1]]
    }

    #[inline]
    pub fn work_group_count(&self) -> u32 {
        let [x, y] = self.work_groups();
        x * y
    }

    #[inline]
    pub fn invocations(&self) -> u32 {
        self.local[0] * self.local[1]
    }
}

impl std::fmt::Display for LaunchGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dims == 1 {
            write!(f, "Local={} Global={}", self.local[0], self.global[0])
        } else {
            write!(
                f,
                "Local=({}, {}) Global=({}, {})",
                self.local[0], self.local[1], self.global[0], self.global[1]
            )
        }
    }
}

#[inline]
fn round_up(value: u32, multiple: u32) -> u32 {
    value.div_ceil(multiple) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: u32, preferred: u32) -> KernelLimits {
        KernelLimits {
            max_work_group: max,
            preferred_multiple: preferred,
            max_x: 256,
            max_y: 256,
        }
    }

    #[test]
    fn test_plan_2d_grows_smaller_side() {
        let g = LaunchGeometry::plan_2d(&limits(256, 64), 8);
        assert_eq!(g.local, [64, 4]);
        assert_eq!(g.global, [512, 32]);
        assert_eq!(g.work_groups(), [8, 8]);

        let g = LaunchGeometry::plan_2d(&limits(256, 32), 1);
        assert_eq!(g.local, [32, 8]);

        let g = LaunchGeometry::plan_2d(&limits(256, 8), 1);
        assert_eq!(g.local, [16, 16]);
    }

    #[test]
    fn test_plan_2d_halves_oversized_preference() {
        let g = LaunchGeometry::plan_2d(&limits(128, 512), 2);
        assert_eq!(g.local, [128, 1]);
        assert!(g.invocations() <= 128);
    }

    #[test]
    fn test_plan_2d_respects_dimension_caps() {
        let l = KernelLimits {
            max_work_group: 256,
            preferred_multiple: 32,
            max_x: 256,
            max_y: 4,
        };
        let g = LaunchGeometry::plan_2d(&l, 1);
        assert_eq!(g.local, [32, 4]);
    }

    #[test]
    fn test_plan_1d() {
        let g = LaunchGeometry::plan_1d(&limits(256, 32), 16);
        assert_eq!(g.local, [32, 1]);
        assert_eq!(g.global, [512, 1]);
        assert_eq!(g.work_group_count(), 16);
        assert_eq!(g.to_string(), "Local=32 Global=512");
    }

    #[test]
    fn test_reduction_group() {
        let l = limits(256, 32);
        assert_eq!(LaunchGeometry::reduction(&l, 40).local, [40, 1]);
        assert_eq!(LaunchGeometry::reduction(&l, 4096).local, [256, 1]);
        assert_eq!(LaunchGeometry::reduction(&l, 0).work_group_count(), 1);
    }

    #[test]
    fn test_covering() {
        let g = LaunchGeometry::covering(&limits(256, 32), 256);
        assert_eq!(g.local, [256, 1]);
        assert_eq!(g.work_group_count(), 1);
        let g = LaunchGeometry::covering(&limits(64, 32), 256);
        assert_eq!(g.local, [64, 1]);
        assert_eq!(g.global, [256, 1]);
    }

    #[test]
    fn test_limits_from_wgpu() {
        let wl = wgpu::Limits {
            max_compute_invocations_per_workgroup: 1024,
            max_subgroup_size: 64,
            ..wgpu::Limits::default()
        };
        let kl = KernelLimits::from_limits(&wl);
        assert_eq!(kl.max_work_group, 256);
        assert_eq!(kl.preferred_multiple, 64);

        let wl = wgpu::Limits {
            max_subgroup_size: 0,
            ..wgpu::Limits::downlevel_defaults()
        };
        let kl = KernelLimits::from_limits(&wl);
        assert_eq!(kl.preferred_multiple, 32);
    }
}
