//! WGSL sources for the tone-mapping pipelines.
//!
//! Each program is assembled from [`COMMON`], optional shared snippets and
//! the operator's own kernels, then specialised through `{{NAME}}` defines.
//! Pixels travel as packed `u32` RGBA8 with red in the low byte.
//!
//! Kernels that synchronise a workgroup walk their domain in workgroup-sized
//! blocks, keeping every barrier in uniform control flow.

/// Assembles a program from its parts.
pub fn program(parts: &[&str]) -> String {
    parts.concat()
}

/// Image constants and pixel helpers.
pub const COMMON: &str = r#"
const WIDTH: u32 = {{WIDTH}}u;
const HEIGHT: u32 = {{HEIGHT}}u;
const PIXELS: u32 = {{PIXELS}}u;
const PIXEL_RANGE: f32 = 255.0;
const LOG_EPSILON: f32 = 0.000001;

fn unpack_rgba(p: u32) -> vec4<f32> {
    return vec4<f32>(
        f32(p & 0xffu),
        f32((p >> 8u) & 0xffu),
        f32((p >> 16u) & 0xffu),
        f32(p >> 24u),
    );
}

// Clamp to 0..255, then truncate.
fn pack_rgba(c: vec4<f32>) -> u32 {
    let v = vec4<u32>(clamp(c, vec4<f32>(0.0), vec4<f32>(PIXEL_RANGE)));
    return v.x | (v.y << 8u) | (v.z << 16u) | (v.w << 24u);
}

fn luminance(c: vec3<f32>) -> f32 {
    return 0.2126 * c.r + 0.7152 * c.g + 0.0722 * c.b;
}

// (c / lum)^sat per channel, 0 where the ratio is not positive.
fn chroma_ratio(c: vec3<f32>, lum: f32, sat: f32) -> vec3<f32> {
    let r = c / lum;
    let p = pow(max(r, vec3<f32>(1e-30)), vec3<f32>(sat));
    return select(vec3<f32>(0.0), p, r > vec3<f32>(0.0));
}
"#;

/// Pyramid level table and the 2x2 box downsample.
///
/// Expects `mips`, `levels` and `level_param` bindings in the including program.
pub const MIPMAP: &str = r#"
struct LevelParam {
    level: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

// Edge-replicating read of pyramid level `level`.
fn mip_value(level: u32, x: i32, y: i32) -> f32 {
    let l = levels[level];
    let cx = clamp(x, 0, i32(l.x) - 1);
    let cy = clamp(y, 0, i32(l.y) - 1);
    return mips[l.z + u32(cy) * l.x + u32(cx)];
}

@compute @workgroup_size({{MIPMAP_WG_X}}, {{MIPMAP_WG_Y}})
fn channel_mipmap(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{MIPMAP_WG_X}}u, {{MIPMAP_WG_Y}}u);
    let dst = levels[level_param.level];
    let src = levels[level_param.level - 1u];
    for (var y = gid.y; y < dst.y; y += stride.y) {
        for (var x = gid.x; x < dst.x; x += stride.x) {
            let top = src.z + 2u * y * src.x + 2u * x;
            let bottom = top + src.x;
            let sum = mips[top] + mips[top + 1u] + mips[bottom] + mips[bottom + 1u];
            mips[dst.z + y * dst.x + x] = sum / 4.0;
        }
    }
}
"#;

/// Two-stage log-average / maximum luminance reduction.
///
/// Expects `src_image`, `partial_sum`, `partial_max`, `stats` bindings and a
/// `store_luminance(i, lum)` hook in the including program.
pub const LOG_AVERAGE: &str = r#"
const NUM_PARTIALS: u32 = {{NUM_PARTIALS}}u;

var<workgroup> wg_log_sum: array<f32, {{LOG_AVG_WG_SIZE}}>;
var<workgroup> wg_lum_max: array<f32, {{LOG_AVG_WG_SIZE}}>;

@compute @workgroup_size({{LOG_AVG_WG_X}}, {{LOG_AVG_WG_Y}})
fn compute_log_avg_lum(
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(local_invocation_index) li: u32,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let wg = vec2<u32>({{LOG_AVG_WG_X}}u, {{LOG_AVG_WG_Y}}u);
    let stride = nwg.xy * wg;
    var sum = 0.0;
    var lum_max = 0.0;
    for (var by = wid.y * wg.y; by < HEIGHT; by += stride.y) {
        for (var bx = wid.x * wg.x; bx < WIDTH; bx += stride.x) {
            let x = bx + lid.x;
            let y = by + lid.y;
            if x < WIDTH && y < HEIGHT {
                let i = y * WIDTH + x;
                let lum = luminance(unpack_rgba(src_image[i]).rgb);
                store_luminance(i, lum);
                sum += log(lum + LOG_EPSILON);
                lum_max = max(lum_max, lum);
            }
        }
    }
    wg_log_sum[li] = sum;
    wg_lum_max[li] = lum_max;
    workgroupBarrier();

    for (var span = {{LOG_AVG_WG_SIZE}}u; span > 1u; span = (span + 1u) / 2u) {
        let mid = (span + 1u) / 2u;
        if li < span - mid {
            wg_log_sum[li] += wg_log_sum[li + mid];
            wg_lum_max[li] = max(wg_lum_max[li], wg_lum_max[li + mid]);
        }
        workgroupBarrier();
    }

    if li == 0u {
        let g = wid.y * nwg.x + wid.x;
        partial_sum[g] = wg_log_sum[0];
        partial_max[g] = wg_lum_max[0];
    }
}

var<workgroup> fr_sum: array<f32, {{FINAL_REDUC_WG_X}}>;
var<workgroup> fr_max: array<f32, {{FINAL_REDUC_WG_X}}>;

// stats[0] = exp(mean log luminance), stats[1] = max luminance
@compute @workgroup_size({{FINAL_REDUC_WG_X}})
fn final_reduc(@builtin(local_invocation_index) li: u32) {
    var sum = 0.0;
    var lum_max = 0.0;
    for (var base = 0u; base < NUM_PARTIALS; base += {{FINAL_REDUC_WG_X}}u) {
        let i = base + li;
        if i < NUM_PARTIALS {
            sum += partial_sum[i];
            lum_max = max(lum_max, partial_max[i]);
        }
    }
    fr_sum[li] = sum;
    fr_max[li] = lum_max;
    workgroupBarrier();

    for (var span = {{FINAL_REDUC_WG_X}}u; span > 1u; span = (span + 1u) / 2u) {
        let mid = (span + 1u) / 2u;
        if li < span - mid {
            fr_sum[li] += fr_sum[li + mid];
            fr_max[li] = max(fr_max[li], fr_max[li + mid]);
        }
        workgroupBarrier();
    }

    if li == 0u {
        stats[0] = exp(fr_sum[0] / f32(PIXELS));
        stats[1] = fr_max[0];
    }
}
"#;

// ============================================================================
// Histogram equalisation
// ============================================================================

pub const HIST_EQ: &str = r#"
const BUGGY_INTEROP: bool = {{BUGGY_INTEROP}};
const HIST_SIZE: u32 = 256u;
const NUM_PARTIALS: u32 = {{NUM_PARTIALS}}u;

@group(0) @binding(0) var<storage, read> src_image: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst_image: array<u32>;
@group(0) @binding(2) var<storage, read_write> pixels: array<u32>;
@group(0) @binding(3) var<storage, read_write> partial_hist: array<u32>;
@group(0) @binding(4) var<storage, read_write> hist: array<u32>;
@group(0) @binding(5) var<storage, read_write> cdf: array<u32>;

// Fitted decode of half-float bit patterns from the defective driver path.
fn half_bits_to_channel(v: u32) -> f32 {
    let x = f32(v);
    if v >= 14340u {
        return round(0.1245790 * x - 1658.44);
    }
    if v >= 13316u {
        return 0.0622869 * x - 765.408;
    }
    if v >= 12292u {
        return 0.0311424 * x - 350.800;
    }
    if v >= 11268u {
        return 0.0155702 * x - 159.443;
    }
    return round(1.25922e-14 * x * x * x * x - 2.6729e-10 * x * x * x
        + 1.98135e-6 * x * x - 0.00496681 * x - 0.0000808829);
}

fn rgb_to_hsv(c: vec3<f32>) -> vec3<f32> {
    let mx = max(max(c.r, c.g), c.b);
    let mn = min(min(c.r, c.g), c.b);
    let delta = mx - mn;
    if mx == 0.0 {
        return vec3<f32>(-1.0, 0.0, mx);
    }
    let s = delta / mx;
    if delta == 0.0 {
        return vec3<f32>(0.0, 0.0, mx);
    }
    var h: f32;
    if c.r == mx {
        h = (c.g - c.b) / delta;
    } else if c.g == mx {
        h = (c.b - c.r) / delta + 2.0;
    } else {
        h = (c.r - c.g) / delta + 4.0;
    }
    h *= 60.0;
    if h < 0.0 {
        h += 360.0;
    }
    return vec3<f32>(h, s, mx);
}

fn hsv_to_rgb(hsv: vec3<f32>) -> vec3<f32> {
    let v = hsv.z;
    let s = hsv.y;
    if s == 0.0 {
        return vec3<f32>(v);
    }
    let h = hsv.x / 60.0;
    let sector = floor(h);
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    var rgb: vec3<f32>;
    switch i32(sector) {
        case 0: { rgb = vec3<f32>(v, t, p); }
        case 1: { rgb = vec3<f32>(q, v, p); }
        case 2: { rgb = vec3<f32>(p, v, t); }
        case 3: { rgb = vec3<f32>(p, q, v); }
        case 4: { rgb = vec3<f32>(t, p, v); }
        default: { rgb = vec3<f32>(v, p, q); }
    }
    return rgb;
}

@compute @workgroup_size({{TRANSFER_WG_X}}, {{TRANSFER_WG_Y}})
fn transfer_data(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{TRANSFER_WG_X}}u, {{TRANSFER_WG_Y}}u);
    for (var y = gid.y; y < HEIGHT; y += stride.y) {
        for (var x = gid.x; x < WIDTH; x += stride.x) {
            let i = y * WIDTH + x;
            if BUGGY_INTEROP {
                let lo = src_image[2u * i];
                let hi = src_image[2u * i + 1u];
                pixels[i] = pack_rgba(vec4<f32>(
                    half_bits_to_channel(lo & 0xffffu),
                    half_bits_to_channel(lo >> 16u),
                    half_bits_to_channel(hi & 0xffffu),
                    half_bits_to_channel(hi >> 16u),
                ));
            } else {
                pixels[i] = src_image[i];
            }
        }
    }
}

var<workgroup> local_hist: array<atomic<u32>, 256>;

@compute @workgroup_size({{PARTIAL_HIST_WG_X}})
fn partial_hist(
    @builtin(local_invocation_index) li: u32,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let wg = {{PARTIAL_HIST_WG_X}}u;
    for (var b = 0u; b < HIST_SIZE; b += wg) {
        if b + li < HIST_SIZE {
            atomicStore(&local_hist[b + li], 0u);
        }
    }
    workgroupBarrier();

    for (var base = wid.x * wg; base < PIXELS; base += nwg.x * wg) {
        let i = base + li;
        if i < PIXELS {
            let p = pixels[i];
            let v = max(max(p & 0xffu, (p >> 8u) & 0xffu), (p >> 16u) & 0xffu);
            atomicAdd(&local_hist[v], 1u);
        }
    }
    workgroupBarrier();

    for (var b = 0u; b < HIST_SIZE; b += wg) {
        if b + li < HIST_SIZE {
            partial_hist[wid.x * HIST_SIZE + b + li] = atomicLoad(&local_hist[b + li]);
        }
    }
}

@compute @workgroup_size({{MERGE_HIST_WG_X}})
fn merge_hist(@builtin(global_invocation_id) gid: vec3<u32>) {
    let b = gid.x;
    if b >= HIST_SIZE {
        return;
    }
    var sum = 0u;
    for (var p = 0u; p < NUM_PARTIALS; p++) {
        sum += partial_hist[p * HIST_SIZE + b];
    }
    hist[b] = sum;
}

@compute @workgroup_size(1)
fn hist_cdf() {
    var acc = 0u;
    for (var b = 0u; b < HIST_SIZE; b++) {
        acc += hist[b];
        cdf[b] = acc;
    }
}

@compute @workgroup_size({{APPLY_WG_X}}, {{APPLY_WG_Y}})
fn histogram_equalisation(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{APPLY_WG_X}}u, {{APPLY_WG_Y}}u);
    let cdf_min = cdf[0];
    let denom = PIXELS - cdf_min;
    for (var y = gid.y; y < HEIGHT; y += stride.y) {
        for (var x = gid.x; x < WIDTH; x += stride.x) {
            let i = y * WIDTH + x;
            let c = unpack_rgba(pixels[i]);
            var hsv = rgb_to_hsv(c.rgb);
            let v = u32(hsv.z);
            var equalised = 0u;
            if denom != 0u {
                equalised = (255u * (cdf[v] - cdf_min)) / denom;
            }
            hsv.z = f32(equalised);
            dst_image[i] = pack_rgba(vec4<f32>(hsv_to_rgb(hsv), c.a));
        }
    }
}
"#;

// ============================================================================
// Reinhard
// ============================================================================

pub const REINHARD_GLOBAL: &str = r#"
const KEY: f32 = {{KEY}};
const SAT: f32 = {{SAT}};

@group(0) @binding(0) var<storage, read> src_image: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst_image: array<u32>;
@group(0) @binding(2) var<storage, read_write> partial_sum: array<f32>;
@group(0) @binding(3) var<storage, read_write> partial_max: array<f32>;
@group(0) @binding(4) var<storage, read_write> stats: array<f32>;

fn store_luminance(i: u32, lum: f32) {}

@compute @workgroup_size({{APPLY_WG_X}}, {{APPLY_WG_Y}})
fn reinhard_global(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{APPLY_WG_X}}u, {{APPLY_WG_Y}}u);
    let scale = KEY / stats[0];
    let l_white = stats[1];
    for (var y = gid.y; y < HEIGHT; y += stride.y) {
        for (var x = gid.x; x < WIDTH; x += stride.x) {
            let i = y * WIDTH + x;
            let c = unpack_rgba(src_image[i]);
            let lum = luminance(c.rgb);
            var rgb = vec3<f32>(0.0);
            if lum > 0.0 {
                let l = scale * lum;
                let ld = l * (1.0 + l / (l_white * l_white)) / (1.0 + l);
                rgb = chroma_ratio(c.rgb, lum, SAT) * ld * PIXEL_RANGE;
            }
            dst_image[i] = pack_rgba(vec4<f32>(rgb, c.a));
        }
    }
}
"#;

pub const REINHARD_LOCAL: &str = r#"
const KEY: f32 = {{KEY}};
const SAT: f32 = {{SAT}};
const EPSILON: f32 = {{EPSILON}};
const NUM_LEVELS: u32 = {{NUM_LEVELS}}u;

@group(0) @binding(0) var<storage, read> src_image: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst_image: array<u32>;
@group(0) @binding(2) var<storage, read_write> partial_sum: array<f32>;
@group(0) @binding(3) var<storage, read_write> partial_max: array<f32>;
@group(0) @binding(4) var<storage, read_write> stats: array<f32>;
@group(0) @binding(5) var<storage, read_write> mips: array<f32>;
@group(0) @binding(6) var<storage, read> levels: array<vec4<u32>>;
@group(0) @binding(7) var<storage, read> scales: array<f32>;
@group(0) @binding(8) var<uniform> level_param: LevelParam;

fn store_luminance(i: u32, lum: f32) {
    mips[i] = lum;
}

// Scaled luminance of the largest neighbourhood without a strong edge.
fn local_adaptation(x: i32, y: i32, factor: f32) -> f32 {
    var adapted = mip_value(0u, x, y) * factor;
    for (var k = 0u; k + 1u < NUM_LEVELS; k++) {
        let centre = mip_value(k, x >> k, y >> k) * factor;
        let surround = mip_value(k + 1u, x >> (k + 1u), y >> (k + 1u)) * factor;
        let contrast = abs(centre - surround) / (scales[k] + centre);
        if contrast > EPSILON {
            adapted = centre;
            break;
        }
        adapted = surround;
    }
    return adapted;
}

@compute @workgroup_size({{APPLY_WG_X}}, {{APPLY_WG_Y}})
fn reinhard_local(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{APPLY_WG_X}}u, {{APPLY_WG_Y}}u);
    let factor = KEY / stats[0];
    for (var y = gid.y; y < HEIGHT; y += stride.y) {
        for (var x = gid.x; x < WIDTH; x += stride.x) {
            let i = y * WIDTH + x;
            let c = unpack_rgba(src_image[i]);
            let lum = luminance(c.rgb);
            var rgb = vec3<f32>(0.0);
            if lum > 0.0 {
                let adapted = local_adaptation(i32(x), i32(y), factor);
                let ld = lum * factor / (1.0 + adapted);
                rgb = chroma_ratio(c.rgb, lum, SAT) * ld * PIXEL_RANGE;
            }
            dst_image[i] = pack_rgba(vec4<f32>(rgb, c.a));
        }
    }
}
"#;

// ============================================================================
// Gradient domain
// ============================================================================

pub const GRAD_DOM: &str = r#"
const ADJUST_ALPHA: f32 = {{ADJUST_ALPHA}};
const BETA: f32 = {{BETA}};
const SAT: f32 = {{SAT}};
const THRESHOLD: f32 = {{THRESHOLD}};
const CONVERGED_TARGET: u32 = {{CONVERGED_TARGET}}u;
const MAX_ITERATIONS: u32 = {{MAX_ITERATIONS}}u;
const NUM_LEVELS: u32 = {{NUM_LEVELS}}u;
const NUM_PARTIALS: u32 = {{NUM_PARTIALS}}u;

@group(0) @binding(0) var<storage, read> src_image: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst_image: array<u32>;
@group(0) @binding(2) var<storage, read_write> mips: array<f32>;
@group(0) @binding(3) var<storage, read_write> grads: array<f32>;
@group(0) @binding(4) var<storage, read_write> atten: array<f32>;
@group(0) @binding(5) var<storage, read_write> partial_sum: array<f32>;
@group(0) @binding(6) var<storage, read_write> alphas: array<f32>;
@group(0) @binding(7) var<storage, read_write> grad_x: array<f32>;
@group(0) @binding(8) var<storage, read_write> grad_y: array<f32>;
@group(0) @binding(9) var<storage, read_write> divergence: array<f32>;
@group(0) @binding(10) var<storage, read> prev: array<f32>;
@group(0) @binding(11) var<storage, read_write> next: array<f32>;
@group(0) @binding(12) var<storage, read_write> flags: array<u32>;
// [converged count, done, iterations, unused]
@group(0) @binding(13) var<storage, read_write> solver: array<atomic<u32>, 4>;
@group(0) @binding(14) var<storage, read> levels: array<vec4<u32>>;
@group(0) @binding(15) var<uniform> level_param: LevelParam;
@group(0) @binding(16) var<storage, read> solved_a: array<f32>;
@group(0) @binding(17) var<storage, read> solved_b: array<f32>;

fn attenuation_scale(g: f32, alpha: f32) -> f32 {
    if g == 0.0 {
        return 0.0;
    }
    return (alpha / g) * pow(g / alpha, BETA);
}

@compute @workgroup_size({{LOG_LUM_WG_X}}, {{LOG_LUM_WG_Y}})
fn compute_log_lum(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{LOG_LUM_WG_X}}u, {{LOG_LUM_WG_Y}}u);
    for (var y = gid.y; y < HEIGHT; y += stride.y) {
        for (var x = gid.x; x < WIDTH; x += stride.x) {
            let i = y * WIDTH + x;
            mips[i] = log(luminance(unpack_rgba(src_image[i]).rgb) + LOG_EPSILON);
        }
    }
}

@compute @workgroup_size({{GRAD_MAG_WG_X}}, {{GRAD_MAG_WG_Y}})
fn gradient_mag(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{GRAD_MAG_WG_X}}u, {{GRAD_MAG_WG_Y}}u);
    let k = level_param.level;
    let l = levels[k];
    let divider = f32(1u << (k + 1u));
    for (var y = gid.y; y < l.y; y += stride.y) {
        for (var x = gid.x; x < l.x; x += stride.x) {
            let xi = i32(x);
            let yi = i32(y);
            let gx = (mip_value(k, xi - 1, yi) - mip_value(k, xi + 1, yi)) / divider;
            let gy = (mip_value(k, xi, yi + 1) - mip_value(k, xi, yi - 1)) / divider;
            grads[l.z + y * l.x + x] = sqrt(gx * gx + gy * gy);
        }
    }
}

var<workgroup> pr_sum: array<f32, {{PARTIAL_REDUC_WG_X}}>;

@compute @workgroup_size({{PARTIAL_REDUC_WG_X}})
fn partial_reduc(
    @builtin(local_invocation_index) li: u32,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let wg = {{PARTIAL_REDUC_WG_X}}u;
    let l = levels[level_param.level];
    let n = l.x * l.y;
    var sum = 0.0;
    for (var base = wid.x * wg; base < n; base += nwg.x * wg) {
        let i = base + li;
        if i < n {
            sum += grads[l.z + i];
        }
    }
    pr_sum[li] = sum;
    workgroupBarrier();

    for (var span = wg; span > 1u; span = (span + 1u) / 2u) {
        let mid = (span + 1u) / 2u;
        if li < span - mid {
            pr_sum[li] += pr_sum[li + mid];
        }
        workgroupBarrier();
    }

    if li == 0u {
        partial_sum[wid.x] = pr_sum[0];
    }
}

var<workgroup> fr_sum: array<f32, {{FINAL_REDUC_WG_X}}>;

// alphas[k] = ADJUST_ALPHA * exp(mean gradient of level k)
@compute @workgroup_size({{FINAL_REDUC_WG_X}})
fn final_reduc(@builtin(local_invocation_index) li: u32) {
    let wg = {{FINAL_REDUC_WG_X}}u;
    var sum = 0.0;
    for (var base = 0u; base < NUM_PARTIALS; base += wg) {
        let i = base + li;
        if i < NUM_PARTIALS {
            sum += partial_sum[i];
        }
    }
    fr_sum[li] = sum;
    workgroupBarrier();

    for (var span = wg; span > 1u; span = (span + 1u) / 2u) {
        let mid = (span + 1u) / 2u;
        if li < span - mid {
            fr_sum[li] += fr_sum[li + mid];
        }
        workgroupBarrier();
    }

    if li == 0u {
        let k = level_param.level;
        let l = levels[k];
        alphas[k] = ADJUST_ALPHA * exp(fr_sum[0] / f32(l.x * l.y));
    }
}

@compute @workgroup_size({{COARSEST_WG_X}})
fn coarsest_level_attenfunc(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let k = NUM_LEVELS - 1u;
    let l = levels[k];
    let n = l.x * l.y;
    let alpha = alphas[k];
    for (var i = gid.x; i < n; i += nwg.x * {{COARSEST_WG_X}}u) {
        atten[l.z + i] = attenuation_scale(grads[l.z + i], alpha);
    }
}

fn coarse_at(coarse: vec4<u32>, x: i32, y: i32) -> f32 {
    let cx = clamp(x, 0, i32(coarse.x) - 1);
    let cy = clamp(y, 0, i32(coarse.y) - 1);
    return atten[coarse.z + u32(cy) * coarse.x + u32(cx)];
}

// 9/3/3/1 sample of the coarser map, leaning towards the fine pixel's side.
fn upsample_weighted(coarse: vec4<u32>, x: i32, y: i32) -> f32 {
    let cw = i32(coarse.x);
    let ch = i32(coarse.y);
    var cx = x / 2;
    var cy = y / 2;
    var nx = select(-1, 1, (x & 1) == 1);
    var ny = select(-1, 1, (y & 1) == 1);
    if cx + nx < 0 || cx + nx >= cw {
        nx = 0;
    }
    if cy + ny < 0 || cy + ny >= ch {
        ny = 0;
    }
    if cx == cw {
        cx -= 1;
    }
    if cy == ch {
        cy -= 1;
    }
    return 9.0 * coarse_at(coarse, cx, cy)
        + 3.0 * coarse_at(coarse, cx + nx, cy)
        + 3.0 * coarse_at(coarse, cx, cy + ny)
        + 1.0 * coarse_at(coarse, cx + nx, cy + ny);
}

@compute @workgroup_size({{ATTEN_WG_X}}, {{ATTEN_WG_Y}})
fn atten_func(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{ATTEN_WG_X}}u, {{ATTEN_WG_Y}}u);
    let k = level_param.level;
    let fine = levels[k];
    let coarse = levels[k + 1u];
    let alpha = alphas[k];
    for (var y = gid.y; y < fine.y; y += stride.y) {
        for (var x = gid.x; x < fine.x; x += stride.x) {
            let j = fine.z + y * fine.x + x;
            let g = grads[j];
            if g == 0.0 {
                atten[j] = 0.0;
            } else {
                let up = upsample_weighted(coarse, i32(x), i32(y));
                atten[j] = (1.0 / 16.0) * up * attenuation_scale(g, alpha);
            }
        }
    }
}

@compute @workgroup_size({{GRAD_ATTEN_WG_X}}, {{GRAD_ATTEN_WG_Y}})
fn grad_atten(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{GRAD_ATTEN_WG_X}}u, {{GRAD_ATTEN_WG_Y}}u);
    for (var y = gid.y; y < HEIGHT; y += stride.y) {
        for (var x = gid.x; x < WIDTH; x += stride.x) {
            let i = y * WIDTH + x;
            var dx = 0.0;
            if x + 1u < WIDTH {
                dx = mips[i + 1u] - mips[i];
            }
            var dy = 0.0;
            if y + 1u < HEIGHT {
                dy = mips[i + WIDTH] - mips[i];
            }
            grad_x[i] = dx * atten[i];
            grad_y[i] = dy * atten[i];
        }
    }
}

@compute @workgroup_size({{DIV_GRAD_WG_X}}, {{DIV_GRAD_WG_Y}})
fn div_grad(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{DIV_GRAD_WG_X}}u, {{DIV_GRAD_WG_Y}}u);
    for (var y = gid.y; y < HEIGHT; y += stride.y) {
        for (var x = gid.x; x < WIDTH; x += stride.x) {
            let i = y * WIDTH + x;
            var ddx = 0.0;
            if x > 0u {
                ddx = grad_x[i] - grad_x[i - 1u];
            }
            var ddy = 0.0;
            if y > 0u {
                ddy = grad_y[i] - grad_y[i - WIDTH];
            }
            divergence[i] = ddx + ddy;
        }
    }
}

// One Jacobi sweep prev -> next. Converged pixels carry their value forward.
@compute @workgroup_size({{POISSON_WG_X}}, {{POISSON_WG_Y}})
fn poisson_jacobi(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    if atomicLoad(&solver[1]) != 0u {
        return;
    }
    let stride = nwg.xy * vec2<u32>({{POISSON_WG_X}}u, {{POISSON_WG_Y}}u);
    for (var y = gid.y; y < HEIGHT; y += stride.y) {
        for (var x = gid.x; x < WIDTH; x += stride.x) {
            let i = y * WIDTH + x;
            let old = prev[i];
            if flags[i] != 0u {
                next[i] = old;
            } else {
                var west = 0.0;
                if x > 0u {
                    west = prev[i - 1u];
                }
                var east = 0.0;
                if x + 1u < WIDTH {
                    east = prev[i + 1u];
                }
                var north = 0.0;
                if y > 0u {
                    north = prev[i - WIDTH];
                }
                var south = 0.0;
                if y + 1u < HEIGHT {
                    south = prev[i + WIDTH];
                }
                let v = 0.25 * (west + east + north + south - divergence[i]);
                next[i] = v;
                if abs(v - old) < THRESHOLD {
                    flags[i] = 1u;
                    atomicAdd(&solver[0], 1u);
                }
            }
        }
    }
}

@compute @workgroup_size(1)
fn poisson_check() {
    if atomicLoad(&solver[1]) == 0u {
        let iterations = atomicAdd(&solver[2], 1u) + 1u;
        if atomicLoad(&solver[0]) >= CONVERGED_TARGET || iterations >= MAX_ITERATIONS {
            atomicStore(&solver[1], 1u);
        }
    }
}

@compute @workgroup_size({{RECONSTRUCT_WG_X}}, {{RECONSTRUCT_WG_Y}})
fn reconstruct(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.xy * vec2<u32>({{RECONSTRUCT_WG_X}}u, {{RECONSTRUCT_WG_Y}}u);
    let odd = (atomicLoad(&solver[2]) & 1u) == 1u;
    for (var y = gid.y; y < HEIGHT; y += stride.y) {
        for (var x = gid.x; x < WIDTH; x += stride.x) {
            let i = y * WIDTH + x;
            let c = unpack_rgba(src_image[i]);
            let solved = select(solved_a[i], solved_b[i], odd);
            let ratio = chroma_ratio(c.rgb, exp(mips[i]), SAT);
            dst_image[i] = pack_rgba(vec4<f32>(ratio * exp(solved), c.a));
        }
    }
}
"#;
