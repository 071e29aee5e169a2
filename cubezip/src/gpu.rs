use std::borrow::Cow;
use std::sync::{mpsc, OnceLock};
use std::time::Instant;

use crate::frame::{self, FileLayout};
use crate::{
    elapsed_ms, side_length, timing_profile_enabled, CubezipError, Slice, SliceMut,
    HYPERCUBE_ELEMENTS,
};

const WORD_BITS: usize = 32;
const WORD_BYTES: usize = 4;
const CHUNKS_PER_HC: usize = HYPERCUBE_ELEMENTS / WORD_BITS;
// One fixed-stride staging slot per chunk: header word plus one word per
// possible bit plane. 128 * 33 = 4224 words per hypercube.
const CHUNK_SLOT_WORDS: usize = WORD_BITS + 1;
const HC_SLOT_WORDS: usize = CHUNKS_PER_HC * CHUNK_SLOT_WORDS;
const SCAN_BLOCK: usize = 256;
const MAX_DISPATCH_PER_DIM: u32 = 65_535;
// 4096-word cube + 2x32 transpose scan scratch + 32-word header reduction.
const REQUIRED_WORKGROUP_STORAGE: u32 = 17_408;

// One 32-thread work group per hypercube: coalesced load, separable
// transform with barriers between axis passes, per-chunk bit transpose,
// header reduction and Hillis-Steele compaction. Compacted chunks land at a
// fixed stride in `chunk_words`; per-chunk word counts go to
// `chunk_lengths[1 + global_chunk]` for the inclusive scan that follows.
const BLOCK_COMPRESS_SHADER: &str = r#"
const DIMS: u32 = __DIMS__u;
const SIDE: u32 = __SIDE__u;
const HC_SIZE: u32 = 4096u;
const WORD_BITS: u32 = 32u;
const CHUNKS_PER_HC: u32 = 128u;
const CHUNK_SLOT_WORDS: u32 = 33u;
const HC_SLOT_WORDS: u32 = 4224u;
const WG_SIZE: u32 = 32u;

struct Params {
    size0: u32,
    size1: u32,
    size2: u32,
    grid0: u32,
    grid1: u32,
    grid2: u32,
    num_hc: u32,
    _pad0: u32,
}

@group(0) @binding(0)
var<storage, read> input_words: array<u32>;

@group(0) @binding(1)
var<storage, read_write> chunk_words: array<u32>;

@group(0) @binding(2)
var<storage, read_write> chunk_lengths: array<u32>;

@group(0) @binding(3)
var<uniform> params: Params;

var<workgroup> cube: array<u32, 4096>;
var<workgroup> scan_buf: array<u32, 64>;
var<workgroup> header_buf: array<u32, 32>;

fn rotate_left_1(x: u32) -> u32 {
    return (x << 1u) | (x >> 31u);
}

fn complement_negative(x: u32) -> u32 {
    if ((x >> 31u) == 1u) {
        return x ^ 0x7fffffffu;
    }
    return x;
}

fn hc_origin(hc: u32) -> vec3<u32> {
    var o = vec3<u32>(0u, 0u, 0u);
    var rem = hc;
    if (DIMS == 1u) {
        o.x = rem * SIDE;
    } else if (DIMS == 2u) {
        o.y = (rem % params.grid1) * SIDE;
        rem = rem / params.grid1;
        o.x = rem * SIDE;
    } else {
        o.z = (rem % params.grid2) * SIDE;
        rem = rem / params.grid2;
        o.y = (rem % params.grid1) * SIDE;
        rem = rem / params.grid1;
        o.x = rem * SIDE;
    }
    return o;
}

fn global_index(origin: vec3<u32>, local: u32) -> u32 {
    if (DIMS == 1u) {
        return origin.x + local;
    } else if (DIMS == 2u) {
        let c1 = local % SIDE;
        let c0 = local / SIDE;
        return (origin.x + c0) * params.size1 + origin.y + c1;
    }
    let c2 = local % SIDE;
    var rem = local / SIDE;
    let c1 = rem % SIDE;
    let c0 = rem / SIDE;
    return ((origin.x + c0) * params.size1 + origin.y + c1) * params.size2 + origin.z + c2;
}

fn diff_line(base: u32, stride: u32) {
    var prev = cube[base];
    for (var i = 1u; i < SIDE; i = i + 1u) {
        let idx = base + i * stride;
        let cur = cube[idx];
        cube[idx] = cur - prev;
        prev = cur;
    }
}

@compute @workgroup_size(32, 1, 1)
fn block_compress(
    @builtin(local_invocation_id) local_id: vec3<u32>,
    @builtin(workgroup_id) wg_id: vec3<u32>,
) {
    let tid = local_id.x;
    let hc = wg_id.x + (wg_id.y * 65535u);
    let is_active = hc < params.num_hc;
    let origin = hc_origin(select(0u, hc, is_active));

    for (var l = tid; l < HC_SIZE; l = l + WG_SIZE) {
        var w = 0u;
        if (is_active) {
            w = input_words[global_index(origin, l)];
        }
        cube[l] = rotate_left_1(w);
    }
    workgroupBarrier();

    if (DIMS == 1u) {
        if (tid == 0u) {
            diff_line(0u, 1u);
        }
    } else if (DIMS == 2u) {
        for (var i = tid; i < SIDE; i = i + WG_SIZE) {
            diff_line(SIDE * i, 1u);
        }
        workgroupBarrier();
        for (var i = tid; i < SIDE; i = i + WG_SIZE) {
            diff_line(i, SIDE);
        }
    } else {
        for (var i = tid; i < SIDE; i = i + WG_SIZE) {
            for (var j = 0u; j < SIDE; j = j + 1u) {
                diff_line(SIDE * SIDE * i + j, SIDE);
            }
        }
        workgroupBarrier();
        for (var i = tid; i < SIDE * SIDE; i = i + WG_SIZE) {
            diff_line(SIDE * i, 1u);
        }
        workgroupBarrier();
        for (var i = tid; i < SIDE * SIDE; i = i + WG_SIZE) {
            diff_line(i, SIDE * SIDE);
        }
    }
    workgroupBarrier();

    for (var l = tid; l < HC_SIZE; l = l + WG_SIZE) {
        cube[l] = complement_negative(cube[l]);
    }
    workgroupBarrier();

    let hc_slot = hc * HC_SLOT_WORDS;
    for (var c = 0u; c < CHUNKS_PER_HC; c = c + 1u) {
        let base = c * WORD_BITS;
        var col = 0u;
        for (var k = 0u; k < WORD_BITS; k = k + 1u) {
            col = col | (((cube[base + k] >> (31u - tid)) & 1u) << (31u - k));
        }
        let flag = select(0u, 1u, col != 0u);

        header_buf[tid] = flag << tid;
        scan_buf[tid] = flag;
        workgroupBarrier();

        for (var off = 16u; off > 0u; off = off >> 1u) {
            if (tid < off) {
                header_buf[tid] = header_buf[tid] | header_buf[tid + off];
            }
            workgroupBarrier();
        }
        let header = header_buf[0];

        var pout = 0u;
        for (var off = 1u; off < WG_SIZE; off = off << 1u) {
            pout = 1u - pout;
            let pin = 1u - pout;
            if (tid >= off) {
                scan_buf[pout * WG_SIZE + tid] =
                    scan_buf[pin * WG_SIZE + tid] + scan_buf[pin * WG_SIZE + tid - off];
            } else {
                scan_buf[pout * WG_SIZE + tid] = scan_buf[pin * WG_SIZE + tid];
            }
            workgroupBarrier();
        }
        let rank = scan_buf[pout * WG_SIZE + tid] - flag;

        let slot = hc_slot + c * CHUNK_SLOT_WORDS;
        if (is_active && tid == 0u) {
            chunk_words[slot] = header;
            chunk_lengths[1u + hc * CHUNKS_PER_HC + c] = 1u + countOneBits(header);
        }
        if (is_active && flag == 1u) {
            chunk_words[slot + 1u + rank] = col;
        }
        workgroupBarrier();
    }
}
"#;

// Inverse of block_compress: walk the chunk headers (every thread sees the
// same header word, so the cursor stays uniform), scatter the stored planes,
// transpose back, inverse transform, store.
const BLOCK_DECOMPRESS_SHADER: &str = r#"
const DIMS: u32 = __DIMS__u;
const SIDE: u32 = __SIDE__u;
const HC_SIZE: u32 = 4096u;
const WORD_BITS: u32 = 32u;
const CHUNKS_PER_HC: u32 = 128u;
const WG_SIZE: u32 = 32u;

struct Params {
    size0: u32,
    size1: u32,
    size2: u32,
    grid0: u32,
    grid1: u32,
    grid2: u32,
    num_hc: u32,
    _pad0: u32,
}

@group(0) @binding(0)
var<storage, read> payload_words: array<u32>;

@group(0) @binding(1)
var<storage, read> span_starts: array<u32>;

@group(0) @binding(2)
var<storage, read_write> output_words: array<u32>;

@group(0) @binding(3)
var<uniform> params: Params;

var<workgroup> cube: array<u32, 4096>;

fn rotate_right_1(x: u32) -> u32 {
    return (x >> 1u) | (x << 31u);
}

fn complement_negative(x: u32) -> u32 {
    if ((x >> 31u) == 1u) {
        return x ^ 0x7fffffffu;
    }
    return x;
}

fn hc_origin(hc: u32) -> vec3<u32> {
    var o = vec3<u32>(0u, 0u, 0u);
    var rem = hc;
    if (DIMS == 1u) {
        o.x = rem * SIDE;
    } else if (DIMS == 2u) {
        o.y = (rem % params.grid1) * SIDE;
        rem = rem / params.grid1;
        o.x = rem * SIDE;
    } else {
        o.z = (rem % params.grid2) * SIDE;
        rem = rem / params.grid2;
        o.y = (rem % params.grid1) * SIDE;
        rem = rem / params.grid1;
        o.x = rem * SIDE;
    }
    return o;
}

fn global_index(origin: vec3<u32>, local: u32) -> u32 {
    if (DIMS == 1u) {
        return origin.x + local;
    } else if (DIMS == 2u) {
        let c1 = local % SIDE;
        let c0 = local / SIDE;
        return (origin.x + c0) * params.size1 + origin.y + c1;
    }
    let c2 = local % SIDE;
    var rem = local / SIDE;
    let c1 = rem % SIDE;
    let c0 = rem / SIDE;
    return ((origin.x + c0) * params.size1 + origin.y + c1) * params.size2 + origin.z + c2;
}

fn prefix_line(base: u32, stride: u32) {
    for (var i = 1u; i < SIDE; i = i + 1u) {
        cube[base + i * stride] = cube[base + i * stride] + cube[base + (i - 1u) * stride];
    }
}

@compute @workgroup_size(32, 1, 1)
fn block_decompress(
    @builtin(local_invocation_id) local_id: vec3<u32>,
    @builtin(workgroup_id) wg_id: vec3<u32>,
) {
    let tid = local_id.x;
    let hc = wg_id.x + (wg_id.y * 65535u);
    let is_active = hc < params.num_hc;
    let origin = hc_origin(select(0u, hc, is_active));

    var cur = 0u;
    if (is_active) {
        cur = span_starts[hc];
    }
    for (var c = 0u; c < CHUNKS_PER_HC; c = c + 1u) {
        var header = 0u;
        if (is_active) {
            header = payload_words[cur];
        }
        let bit = (header >> tid) & 1u;
        var w = 0u;
        if (bit == 1u) {
            let rank = countOneBits(header & ((1u << tid) - 1u));
            w = payload_words[cur + 1u + rank];
        }
        cube[c * WORD_BITS + tid] = w;
        cur = cur + 1u + countOneBits(header);
    }
    workgroupBarrier();

    for (var c = 0u; c < CHUNKS_PER_HC; c = c + 1u) {
        let base = c * WORD_BITS;
        var col = 0u;
        for (var k = 0u; k < WORD_BITS; k = k + 1u) {
            col = col | (((cube[base + k] >> (31u - tid)) & 1u) << (31u - k));
        }
        workgroupBarrier();
        cube[base + tid] = col;
        workgroupBarrier();
    }

    for (var l = tid; l < HC_SIZE; l = l + WG_SIZE) {
        cube[l] = complement_negative(cube[l]);
    }
    workgroupBarrier();

    if (DIMS == 1u) {
        if (tid == 0u) {
            prefix_line(0u, 1u);
        }
    } else if (DIMS == 2u) {
        for (var i = tid; i < SIDE; i = i + WG_SIZE) {
            prefix_line(i, SIDE);
        }
        workgroupBarrier();
        for (var i = tid; i < SIDE; i = i + WG_SIZE) {
            prefix_line(SIDE * i, 1u);
        }
    } else {
        for (var i = tid; i < SIDE * SIDE; i = i + WG_SIZE) {
            prefix_line(i, SIDE * SIDE);
        }
        workgroupBarrier();
        for (var i = tid; i < SIDE * SIDE; i = i + WG_SIZE) {
            prefix_line(SIDE * i, 1u);
        }
        workgroupBarrier();
        for (var i = tid; i < SIDE; i = i + WG_SIZE) {
            for (var j = 0u; j < SIDE; j = j + 1u) {
                prefix_line(SIDE * SIDE * i + j, SIDE);
            }
        }
    }
    workgroupBarrier();

    if (is_active) {
        for (var l = tid; l < HC_SIZE; l = l + WG_SIZE) {
            output_words[global_index(origin, l)] = rotate_right_1(cube[l]);
        }
    }
}
"#;

// In-place inclusive Hillis-Steele scan over 256-element blocks; block
// totals spill to `block_sums` for the next level of the hierarchy.
const SCAN_BLOCKS_SHADER: &str = r#"
struct Params {
    len: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

@group(0) @binding(0)
var<storage, read_write> data: array<u32>;

@group(0) @binding(1)
var<storage, read_write> block_sums: array<u32>;

@group(0) @binding(2)
var<uniform> params: Params;

var<workgroup> scratch: array<u32, 256>;

@compute @workgroup_size(256, 1, 1)
fn scan_blocks(
    @builtin(local_invocation_id) local_id: vec3<u32>,
    @builtin(workgroup_id) wg_id: vec3<u32>,
) {
    let lid = local_id.x;
    let gid = wg_id.x + (wg_id.y * 65535u);
    let idx = gid * 256u + lid;
    var value = 0u;
    if (idx < params.len) {
        value = data[idx];
    }
    scratch[lid] = value;
    workgroupBarrier();

    var offset = 1u;
    loop {
        if (offset >= 256u) {
            break;
        }
        var addend = 0u;
        if (lid >= offset) {
            addend = scratch[lid - offset];
        }
        workgroupBarrier();
        scratch[lid] = scratch[lid] + addend;
        workgroupBarrier();
        offset = offset << 1u;
    }

    if (idx < params.len) {
        data[idx] = scratch[lid];
    }
    if (lid == 255u && (gid * 256u) < params.len) {
        block_sums[gid] = scratch[255u];
    }
}
"#;

const SCAN_ADD_SHADER: &str = r#"
struct Params {
    len: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

@group(0) @binding(0)
var<storage, read_write> data: array<u32>;

@group(0) @binding(1)
var<storage, read_write> block_sums: array<u32>;

@group(0) @binding(2)
var<uniform> params: Params;

@compute @workgroup_size(256, 1, 1)
fn scan_add(
    @builtin(local_invocation_id) local_id: vec3<u32>,
    @builtin(workgroup_id) wg_id: vec3<u32>,
) {
    let gid = wg_id.x + (wg_id.y * 65535u);
    let idx = gid * 256u + local_id.x;
    if (gid == 0u || idx >= params.len) {
        return;
    }
    data[idx] = data[idx] + block_sums[gid - 1u];
}
"#;

// Moves each chunk from its fixed staging slot to its final stream offset
// and emits the u64 offset-table entry (end of the hypercube's payload) as
// a little-endian pair of u32 words.
const COMPACT_SHADER: &str = r#"
const CHUNKS_PER_HC: u32 = 128u;
const CHUNK_SLOT_WORDS: u32 = 33u;
const HC_SLOT_WORDS: u32 = 4224u;
const WG_SIZE: u32 = 32u;

struct Params {
    num_hc: u32,
    table_words: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0)
var<storage, read> chunk_words: array<u32>;

@group(0) @binding(1)
var<storage, read> chunk_offsets: array<u32>;

@group(0) @binding(2)
var<storage, read_write> stream_words: array<u32>;

@group(0) @binding(3)
var<uniform> params: Params;

@compute @workgroup_size(32, 1, 1)
fn compact_chunks(
    @builtin(local_invocation_id) local_id: vec3<u32>,
    @builtin(workgroup_id) wg_id: vec3<u32>,
) {
    let tid = local_id.x;
    let hc = wg_id.x + (wg_id.y * 65535u);
    if (hc >= params.num_hc) {
        return;
    }
    for (var c = 0u; c < CHUNKS_PER_HC; c = c + 1u) {
        let g = hc * CHUNKS_PER_HC + c;
        let slot = hc * HC_SLOT_WORDS + c * CHUNK_SLOT_WORDS;
        let header = chunk_words[slot];
        let len = 1u + countOneBits(header);
        let dst = params.table_words + chunk_offsets[g];
        for (var l = tid; l < len; l = l + WG_SIZE) {
            stream_words[dst + l] = chunk_words[slot + l];
        }
    }
    if (tid == 0u) {
        let end_words = chunk_offsets[(hc + 1u) * CHUNKS_PER_HC];
        stream_words[2u * hc] = (params.table_words + end_words) * 4u;
        stream_words[2u * hc + 1u] = 0u;
    }
}
"#;

struct GpuRuntime {
    device: wgpu::Device,
    queue: wgpu::Queue,
    compress_pipelines: [wgpu::ComputePipeline; 3],
    decompress_pipelines: [wgpu::ComputePipeline; 3],
    scan_blocks_pipeline: wgpu::ComputePipeline,
    scan_add_pipeline: wgpu::ComputePipeline,
    compact_pipeline: wgpu::ComputePipeline,
    compress_bgl: wgpu::BindGroupLayout,
    decompress_bgl: wgpu::BindGroupLayout,
    scan_bgl: wgpu::BindGroupLayout,
    compact_bgl: wgpu::BindGroupLayout,
}

fn storage_layout_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_layout_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuRuntime {
    fn init() -> Result<Self, CubezipError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| CubezipError::Gpu("no suitable GPU adapter".to_string()))?;

        if timing_profile_enabled() {
            let info = adapter.get_info();
            eprintln!(
                "[cubezip][timing] gpu_adapter name=\"{}\" backend={:?} type={:?}",
                info.name, info.backend, info.device_type
            );
        }

        let mut required_limits = wgpu::Limits::default();
        required_limits.max_compute_workgroup_storage_size = required_limits
            .max_compute_workgroup_storage_size
            .max(REQUIRED_WORKGROUP_STORAGE);
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("cubezip-device"),
                required_features: wgpu::Features::empty(),
                required_limits,
            },
            None,
        ))
        .map_err(|e| CubezipError::Gpu(format!("request_device failed: {e}")))?;

        let compress_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("cubezip-compress-bgl"),
            entries: &[
                storage_layout_entry(0, true),
                storage_layout_entry(1, false),
                storage_layout_entry(2, false),
                uniform_layout_entry(3),
            ],
        });
        let decompress_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("cubezip-decompress-bgl"),
            entries: &[
                storage_layout_entry(0, true),
                storage_layout_entry(1, true),
                storage_layout_entry(2, false),
                uniform_layout_entry(3),
            ],
        });
        let scan_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("cubezip-scan-bgl"),
            entries: &[
                storage_layout_entry(0, false),
                storage_layout_entry(1, false),
                uniform_layout_entry(2),
            ],
        });
        let compact_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("cubezip-compact-bgl"),
            entries: &[
                storage_layout_entry(0, true),
                storage_layout_entry(1, true),
                storage_layout_entry(2, false),
                uniform_layout_entry(3),
            ],
        });

        let compress_pl = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("cubezip-compress-pl"),
            bind_group_layouts: &[&compress_bgl],
            push_constant_ranges: &[],
        });
        let decompress_pl = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("cubezip-decompress-pl"),
            bind_group_layouts: &[&decompress_bgl],
            push_constant_ranges: &[],
        });
        let scan_pl = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("cubezip-scan-pl"),
            bind_group_layouts: &[&scan_bgl],
            push_constant_ranges: &[],
        });
        let compact_pl = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("cubezip-compact-pl"),
            bind_group_layouts: &[&compact_bgl],
            push_constant_ranges: &[],
        });

        let mut compress_pipelines = Vec::with_capacity(3);
        let mut decompress_pipelines = Vec::with_capacity(3);
        for dims in 1..=3_usize {
            let side = side_length(dims).to_string();
            let compress_source = BLOCK_COMPRESS_SHADER
                .replace("__DIMS__", &dims.to_string())
                .replace("__SIDE__", &side);
            let compress_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("cubezip-block-compress"),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(compress_source)),
            });
            compress_pipelines.push(device.create_compute_pipeline(
                &wgpu::ComputePipelineDescriptor {
                    label: Some("cubezip-block-compress-cp"),
                    layout: Some(&compress_pl),
                    module: &compress_module,
                    entry_point: "block_compress",
                },
            ));

            let decompress_source = BLOCK_DECOMPRESS_SHADER
                .replace("__DIMS__", &dims.to_string())
                .replace("__SIDE__", &side);
            let decompress_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("cubezip-block-decompress"),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(decompress_source)),
            });
            decompress_pipelines.push(device.create_compute_pipeline(
                &wgpu::ComputePipelineDescriptor {
                    label: Some("cubezip-block-decompress-cp"),
                    layout: Some(&decompress_pl),
                    module: &decompress_module,
                    entry_point: "block_decompress",
                },
            ));
        }
        let compress_pipelines: [wgpu::ComputePipeline; 3] = compress_pipelines
            .try_into()
            .map_err(|_| CubezipError::Internal("compress pipeline set construction"))?;
        let decompress_pipelines: [wgpu::ComputePipeline; 3] = decompress_pipelines
            .try_into()
            .map_err(|_| CubezipError::Internal("decompress pipeline set construction"))?;

        let scan_blocks_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("cubezip-scan-blocks"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(SCAN_BLOCKS_SHADER)),
        });
        let scan_blocks_pipeline =
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("cubezip-scan-blocks-cp"),
                layout: Some(&scan_pl),
                module: &scan_blocks_module,
                entry_point: "scan_blocks",
            });

        let scan_add_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("cubezip-scan-add"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(SCAN_ADD_SHADER)),
        });
        let scan_add_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("cubezip-scan-add-cp"),
            layout: Some(&scan_pl),
            module: &scan_add_module,
            entry_point: "scan_add",
        });

        let compact_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("cubezip-compact"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(COMPACT_SHADER)),
        });
        let compact_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("cubezip-compact-cp"),
            layout: Some(&compact_pl),
            module: &compact_module,
            entry_point: "compact_chunks",
        });

        Ok(Self {
            device,
            queue,
            compress_pipelines,
            decompress_pipelines,
            scan_blocks_pipeline,
            scan_add_pipeline,
            compact_pipeline,
            compress_bgl,
            decompress_bgl,
            scan_bgl,
            compact_bgl,
        })
    }
}

fn runtime() -> Result<&'static GpuRuntime, CubezipError> {
    static RUNTIME: OnceLock<Result<GpuRuntime, CubezipError>> = OnceLock::new();
    match RUNTIME.get_or_init(GpuRuntime::init) {
        Ok(rt) => Ok(rt),
        Err(e) => Err(CubezipError::Gpu(format!("{e}"))),
    }
}

pub(crate) fn runtime_available() -> bool {
    runtime().is_ok()
}

fn dispatch_grid(groups: u32) -> (u32, u32) {
    (
        groups.min(MAX_DISPATCH_PER_DIM),
        groups.div_ceil(MAX_DISPATCH_PER_DIM),
    )
}

fn pad_words(words: usize) -> usize {
    words.div_ceil(SCAN_BLOCK) * SCAN_BLOCK
}

fn ensure_buffer_fits(rt: &GpuRuntime, bytes: u64) -> Result<(), CubezipError> {
    let limits = rt.device.limits();
    if bytes > u64::from(limits.max_storage_buffer_binding_size) || bytes > limits.max_buffer_size {
        return Err(CubezipError::Gpu(
            "array exceeds gpu buffer limits, use a cpu backend".to_string(),
        ));
    }
    Ok(())
}

fn create_storage_buffer(
    rt: &GpuRuntime,
    label: &str,
    bytes: u64,
    usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    rt.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: bytes,
        usage,
        mapped_at_creation: false,
    })
}

fn create_uniform_buffer(rt: &GpuRuntime, label: &str, words: &[u32]) -> wgpu::Buffer {
    let buffer = rt.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: (words.len() * 4) as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for &w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    rt.queue.write_buffer(&buffer, 0, &bytes);
    buffer
}

fn read_back(rt: &GpuRuntime, buffer: &wgpu::Buffer, bytes: u64) -> Result<Vec<u8>, CubezipError> {
    let slice = buffer.slice(0..bytes);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    rt.device.poll(wgpu::Maintain::Wait);
    let map_result = rx
        .recv()
        .map_err(|_| CubezipError::Gpu("map_async completion channel closed".to_string()))?;
    map_result.map_err(|e| CubezipError::Gpu(format!("map_async failed: {e}")))?;
    let data = slice.get_mapped_range().to_vec();
    buffer.unmap();
    Ok(data)
}

fn kernel_params<const D: usize>(layout: &FileLayout<D>) -> Result<[u32; 8], CubezipError> {
    let num_hc =
        u32::try_from(layout.num_hypercubes()).map_err(|_| CubezipError::DataTooLarge)?;
    let mut params = [1_u32, 1, 1, 1, 1, 1, num_hc, 0];
    for k in 0..D {
        params[k] = u32::try_from(layout.size().0[k]).map_err(|_| CubezipError::DataTooLarge)?;
        params[3 + k] = u32::try_from(layout.grid()[k]).map_err(|_| CubezipError::DataTooLarge)?;
    }
    Ok(params)
}

struct ScanLevel {
    bind_group: wgpu::BindGroup,
    blocks: u32,
}

// Builds the buffers and bind groups for a hierarchical inclusive scan over
// `entries` u32 values held in `data_buf`. Level i's block sums become level
// i+1's data; the final level fits a single block.
fn build_scan_levels(
    rt: &GpuRuntime,
    data_buf: &wgpu::Buffer,
    entries: usize,
) -> Result<Vec<ScanLevel>, CubezipError> {
    let mut lens = vec![entries];
    loop {
        let blocks = lens.last().copied().unwrap_or(1).div_ceil(SCAN_BLOCK);
        if blocks <= 1 {
            break;
        }
        lens.push(blocks);
    }
    let level_count = lens.len();

    let mut aux_bufs = Vec::with_capacity(level_count.saturating_sub(1));
    for len in lens.iter().skip(1) {
        aux_bufs.push(create_storage_buffer(
            rt,
            "cubezip-scan-aux",
            (pad_words(*len) * 4) as u64,
            wgpu::BufferUsages::STORAGE,
        ));
    }
    let dummy_sums = create_storage_buffer(
        rt,
        "cubezip-scan-dummy-sums",
        (SCAN_BLOCK * 4) as u64,
        wgpu::BufferUsages::STORAGE,
    );

    let mut levels = Vec::with_capacity(level_count);
    for i in 0..level_count {
        let data: &wgpu::Buffer = if i == 0 { data_buf } else { &aux_bufs[i - 1] };
        let sums: &wgpu::Buffer = if i + 1 < level_count {
            &aux_bufs[i]
        } else {
            &dummy_sums
        };
        let len = u32::try_from(lens[i]).map_err(|_| CubezipError::DataTooLarge)?;
        let params_buf = create_uniform_buffer(rt, "cubezip-scan-params", &[len, 0, 0, 0]);
        let bind_group = rt.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("cubezip-scan-bg"),
            layout: &rt.scan_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: data.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: sums.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });
        levels.push(ScanLevel {
            bind_group,
            blocks: u32::try_from(lens[i].div_ceil(SCAN_BLOCK))
                .map_err(|_| CubezipError::DataTooLarge)?,
        });
    }
    Ok(levels)
}

pub(crate) fn compress_f32<const D: usize>(
    input: &Slice<'_, f32, D>,
) -> Result<Vec<u8>, CubezipError> {
    let layout = FileLayout::new(input.size())?;
    let num_hc = layout.num_hypercubes();
    if num_hc == 0 {
        let mut out = Vec::with_capacity(layout.num_border_elements() * WORD_BYTES);
        frame::write_border(&layout, input, &mut out);
        return Ok(out);
    }

    let rt = runtime()?;
    let total_start = Instant::now();

    let elements = layout.num_elements();
    if elements > u32::MAX as usize || num_hc > u32::MAX as usize / HC_SLOT_WORDS {
        return Err(CubezipError::Gpu(
            "array too large for the gpu backend".to_string(),
        ));
    }
    let table_bytes = layout.table_bytes();
    let table_words = num_hc * 2;
    let chunk_buf_bytes = (num_hc * HC_SLOT_WORDS * 4) as u64;
    let lengths_entries = num_hc * CHUNKS_PER_HC + 1;
    let lengths_buf_bytes = (pad_words(lengths_entries) * 4) as u64;
    let stream_buf_bytes = ((table_words + num_hc * HC_SLOT_WORDS) * 4) as u64;
    let input_buf_bytes = (elements * WORD_BYTES) as u64;
    for bytes in [
        chunk_buf_bytes,
        lengths_buf_bytes,
        stream_buf_bytes,
        input_buf_bytes,
    ] {
        ensure_buffer_fits(rt, bytes)?;
    }

    let upload_start = Instant::now();
    let mut input_bytes = Vec::with_capacity(elements * WORD_BYTES);
    for &value in &input.data()[..elements] {
        input_bytes.extend_from_slice(&value.to_bits().to_le_bytes());
    }
    let input_buf = create_storage_buffer(
        rt,
        "cubezip-compress-input",
        input_buf_bytes,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
    );
    rt.queue.write_buffer(&input_buf, 0, &input_bytes);
    let upload_ms = elapsed_ms(upload_start);

    let chunk_buf = create_storage_buffer(
        rt,
        "cubezip-compress-chunks",
        chunk_buf_bytes,
        wgpu::BufferUsages::STORAGE,
    );
    let lengths_buf = create_storage_buffer(
        rt,
        "cubezip-compress-lengths",
        lengths_buf_bytes,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
    );
    let stream_buf = create_storage_buffer(
        rt,
        "cubezip-compress-stream",
        stream_buf_bytes,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
    );
    let params_buf = create_uniform_buffer(rt, "cubezip-compress-params", &kernel_params(&layout)?);
    let compact_params_buf = create_uniform_buffer(
        rt,
        "cubezip-compact-params",
        &[
            u32::try_from(num_hc).map_err(|_| CubezipError::DataTooLarge)?,
            u32::try_from(table_words).map_err(|_| CubezipError::DataTooLarge)?,
            0,
            0,
        ],
    );

    let compress_bg = rt.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("cubezip-compress-bg"),
        layout: &rt.compress_bgl,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: input_buf.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: chunk_buf.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: lengths_buf.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: params_buf.as_entire_binding(),
            },
        ],
    });
    let compact_bg = rt.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("cubezip-compact-bg"),
        layout: &rt.compact_bgl,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: chunk_buf.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: lengths_buf.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: stream_buf.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: compact_params_buf.as_entire_binding(),
            },
        ],
    });
    let scan_levels = build_scan_levels(rt, &lengths_buf, lengths_entries)?;

    let total_readback = create_storage_buffer(
        rt,
        "cubezip-compress-total-readback",
        4,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
    );

    let num_hc_u32 = u32::try_from(num_hc).map_err(|_| CubezipError::DataTooLarge)?;
    let mut encoder = rt
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("cubezip-compress-encoder"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("cubezip-compress-pass"),
            timestamp_writes: None,
        });
        let pipeline = rt
            .compress_pipelines
            .get(D.wrapping_sub(1))
            .ok_or(CubezipError::Internal("unsupported dimensionality"))?;
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &compress_bg, &[]);
        let (gx, gy) = dispatch_grid(num_hc_u32);
        pass.dispatch_workgroups(gx, gy, 1);

        for level in &scan_levels {
            pass.set_pipeline(&rt.scan_blocks_pipeline);
            pass.set_bind_group(0, &level.bind_group, &[]);
            let (bx, by) = dispatch_grid(level.blocks);
            pass.dispatch_workgroups(bx, by, 1);
        }
        for level in scan_levels.iter().rev().skip(1) {
            pass.set_pipeline(&rt.scan_add_pipeline);
            pass.set_bind_group(0, &level.bind_group, &[]);
            let (bx, by) = dispatch_grid(level.blocks);
            pass.dispatch_workgroups(bx, by, 1);
        }

        pass.set_pipeline(&rt.compact_pipeline);
        pass.set_bind_group(0, &compact_bg, &[]);
        let (gx, gy) = dispatch_grid(num_hc_u32);
        pass.dispatch_workgroups(gx, gy, 1);
    }
    encoder.copy_buffer_to_buffer(
        &lengths_buf,
        (num_hc * CHUNKS_PER_HC * 4) as u64,
        &total_readback,
        0,
        4,
    );
    let submit_start = Instant::now();
    rt.queue.submit(Some(encoder.finish()));

    let total_bytes_raw = read_back(rt, &total_readback, 4)?;
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&total_bytes_raw[..4]);
    let total_payload_words = u32::from_le_bytes(raw) as usize;
    let submit_wait_ms = elapsed_ms(submit_start);

    let stream_bytes = table_bytes + total_payload_words * 4;
    let stream_readback = create_storage_buffer(
        rt,
        "cubezip-compress-stream-readback",
        stream_bytes as u64,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
    );
    let mut copy_encoder = rt
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("cubezip-compress-copy-encoder"),
        });
    copy_encoder.copy_buffer_to_buffer(&stream_buf, 0, &stream_readback, 0, stream_bytes as u64);
    rt.queue.submit(Some(copy_encoder.finish()));

    let map_start = Instant::now();
    let mut out = read_back(rt, &stream_readback, stream_bytes as u64)?;
    let map_copy_ms = elapsed_ms(map_start);

    out.reserve(layout.num_border_elements() * WORD_BYTES);
    frame::write_border(&layout, input, &mut out);

    if timing_profile_enabled() {
        eprintln!(
            "[cubezip][timing] gpu_compress hypercubes={} upload_ms={:.3} submit_wait_ms={:.3} map_copy_ms={:.3} total_ms={:.3}",
            num_hc,
            upload_ms,
            submit_wait_ms,
            map_copy_ms,
            elapsed_ms(total_start),
        );
    }
    Ok(out)
}

pub(crate) fn decompress_f32<const D: usize>(
    stream: &[u8],
    output: &mut SliceMut<'_, f32, D>,
) -> Result<usize, CubezipError> {
    let layout = FileLayout::new(output.size())?;
    let offsets = frame::parse_offsets(stream, &layout, WORD_BYTES)?;
    let num_hc = layout.num_hypercubes();
    if num_hc == 0 {
        frame::read_border(&layout, stream, offsets[0] as usize, output)?;
        return Ok(stream.len());
    }

    let rt = runtime()?;
    let total_start = Instant::now();

    let elements = layout.num_elements();
    if elements > u32::MAX as usize {
        return Err(CubezipError::Gpu(
            "array too large for the gpu backend".to_string(),
        ));
    }
    let table_bytes = layout.table_bytes();
    let border_start = offsets[num_hc] as usize;
    let payload_bytes = border_start - table_bytes;
    let output_buf_bytes = (elements * WORD_BYTES) as u64;
    ensure_buffer_fits(rt, payload_bytes as u64)?;
    ensure_buffer_fits(rt, output_buf_bytes)?;

    let upload_start = Instant::now();
    let payload_buf = create_storage_buffer(
        rt,
        "cubezip-decompress-payload",
        payload_bytes as u64,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
    );
    rt.queue
        .write_buffer(&payload_buf, 0, &stream[table_bytes..border_start]);

    let mut span_words = Vec::with_capacity(num_hc * 4);
    for offset in &offsets[..num_hc] {
        let relative = (offset - table_bytes as u64) / 4;
        let word = u32::try_from(relative).map_err(|_| CubezipError::DataTooLarge)?;
        span_words.extend_from_slice(&word.to_le_bytes());
    }
    let spans_buf = create_storage_buffer(
        rt,
        "cubezip-decompress-spans",
        span_words.len() as u64,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
    );
    rt.queue.write_buffer(&spans_buf, 0, &span_words);
    let upload_ms = elapsed_ms(upload_start);

    let output_buf = create_storage_buffer(
        rt,
        "cubezip-decompress-output",
        output_buf_bytes,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
    );
    let params_buf =
        create_uniform_buffer(rt, "cubezip-decompress-params", &kernel_params(&layout)?);

    let decompress_bg = rt.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("cubezip-decompress-bg"),
        layout: &rt.decompress_bgl,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: payload_buf.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: spans_buf.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: output_buf.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: params_buf.as_entire_binding(),
            },
        ],
    });

    let output_readback = create_storage_buffer(
        rt,
        "cubezip-decompress-readback",
        output_buf_bytes,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
    );

    let num_hc_u32 = u32::try_from(num_hc).map_err(|_| CubezipError::DataTooLarge)?;
    let mut encoder = rt
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("cubezip-decompress-encoder"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("cubezip-decompress-pass"),
            timestamp_writes: None,
        });
        let pipeline = rt
            .decompress_pipelines
            .get(D.wrapping_sub(1))
            .ok_or(CubezipError::Internal("unsupported dimensionality"))?;
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &decompress_bg, &[]);
        let (gx, gy) = dispatch_grid(num_hc_u32);
        pass.dispatch_workgroups(gx, gy, 1);
    }
    encoder.copy_buffer_to_buffer(&output_buf, 0, &output_readback, 0, output_buf_bytes);
    let submit_start = Instant::now();
    rt.queue.submit(Some(encoder.finish()));

    let decoded = read_back(rt, &output_readback, output_buf_bytes)?;
    let submit_wait_ms = elapsed_ms(submit_start);

    let data = output.data_mut();
    for (i, chunk) in decoded.chunks_exact(4).enumerate() {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(chunk);
        data[i] = f32::from_bits(u32::from_le_bytes(raw));
    }
    frame::read_border(&layout, stream, border_start, output)?;

    if timing_profile_enabled() {
        eprintln!(
            "[cubezip][timing] gpu_decompress hypercubes={} upload_ms={:.3} submit_wait_ms={:.3} total_ms={:.3}",
            num_hc,
            upload_ms,
            submit_wait_ms,
            elapsed_ms(total_start),
        );
    }
    Ok(stream.len())
}
