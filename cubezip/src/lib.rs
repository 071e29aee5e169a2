use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Instant;

use num_traits::{PrimInt, Unsigned, WrappingAdd, WrappingSub, Zero};
use thiserror::Error;

mod cube;
mod frame;
mod gpu;

#[cfg(test)]
mod tests;

/// Every hypercube holds 4096 elements regardless of dimensionality, so one
/// GPU work group always processes the same amount of local data.
pub const HYPERCUBE_ELEMENTS: usize = 4096;

pub(crate) const fn side_length(dims: usize) -> usize {
    match dims {
        1 => 4096,
        2 => 64,
        3 => 16,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CubezipBackend {
    /// Single thread, hypercubes processed in index order.
    Serial,
    /// Worker pool over a shared hypercube index queue.
    Threaded,
    /// wgpu compute backend. f32 profiles run on the device; f64 profiles
    /// are routed to the threaded CPU path because WGSL has no 64-bit
    /// integer type. Output bytes are identical either way.
    Gpu,
}

#[derive(Debug, Clone)]
pub struct CubezipOptions {
    pub backend: CubezipBackend,
    // 0 => auto (available_parallelism()).
    pub cpu_worker_count: usize,
}

impl Default for CubezipOptions {
    fn default() -> Self {
        Self {
            backend: CubezipBackend::Threaded,
            cpu_worker_count: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum CubezipError {
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    #[error("invalid extent: {0}")]
    InvalidExtent(&'static str),
    #[error("invalid stream: {0}")]
    InvalidStream(&'static str),
    #[error("data too large")]
    DataTooLarge,
    #[error("gpu error: {0}")]
    Gpu(String),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

pub(crate) fn timing_profile_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        let Ok(raw) = std::env::var("CUBEZIP_PROFILE_TIMING") else {
            return false;
        };
        let v = raw.trim().to_ascii_lowercase();
        matches!(v.as_str(), "1" | "true" | "yes" | "on")
    })
}

pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

mod private {
    pub trait Sealed {}

    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// Unsigned machine word backing one float sample on the wire.
pub trait CubeBits:
    private::Sealed + PrimInt + Unsigned + WrappingAdd + WrappingSub + Send + Sync + 'static
{
    const BITS: usize;
    const WORD_BYTES: usize;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

impl CubeBits for u32 {
    const BITS: usize = 32;
    const WORD_BYTES: usize = 4;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        u32::from_le_bytes(raw)
    }
}

impl CubeBits for u64 {
    const BITS: usize = 64;
    const WORD_BYTES: usize = 8;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        u64::from_le_bytes(raw)
    }
}

/// IEEE-754 sample type accepted by the compressor. Sealed: exactly `f32`
/// and `f64` qualify, each bound to the unsigned integer of its width.
pub trait CubeFloat: private::Sealed + Copy + Send + Sync + 'static {
    type Bits: CubeBits;

    fn to_bits(self) -> Self::Bits;
    fn from_bits(bits: Self::Bits) -> Self;

    // Device dispatch hooks. f64 reports unsupported (WGSL has no integer
    // type of its width) and the GPU backend falls back to the threaded path.
    fn gpu_compress<const D: usize>(
        input: &Slice<'_, Self, D>,
    ) -> Option<Result<Vec<u8>, CubezipError>>;
    fn gpu_decompress<const D: usize>(
        stream: &[u8],
        output: &mut SliceMut<'_, Self, D>,
    ) -> Option<Result<usize, CubezipError>>;
}

impl CubeFloat for f32 {
    type Bits = u32;

    fn to_bits(self) -> u32 {
        f32::to_bits(self)
    }

    fn from_bits(bits: u32) -> Self {
        f32::from_bits(bits)
    }

    fn gpu_compress<const D: usize>(
        input: &Slice<'_, Self, D>,
    ) -> Option<Result<Vec<u8>, CubezipError>> {
        Some(gpu::compress_f32(input))
    }

    fn gpu_decompress<const D: usize>(
        stream: &[u8],
        output: &mut SliceMut<'_, Self, D>,
    ) -> Option<Result<usize, CubezipError>> {
        Some(gpu::decompress_f32(stream, output))
    }
}

impl CubeFloat for f64 {
    type Bits = u64;

    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }

    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }

    fn gpu_compress<const D: usize>(
        _input: &Slice<'_, Self, D>,
    ) -> Option<Result<Vec<u8>, CubezipError>> {
        None
    }

    fn gpu_decompress<const D: usize>(
        _stream: &[u8],
        _output: &mut SliceMut<'_, Self, D>,
    ) -> Option<Result<usize, CubezipError>> {
        None
    }
}

/// First-major array sizes: element (i0, .., i_{D-1}) of extent (s0, .., s_{D-1})
/// lives at linear offset ((i0 * s1 + i1) * s2 + i2) ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent<const D: usize>(pub [usize; D]);

impl<const D: usize> Extent<D> {
    pub fn num_elements(&self) -> usize {
        self.0.iter().product()
    }

    pub fn linear_offset(&self, coords: [usize; D]) -> usize {
        let mut lin = 0_usize;
        for k in 0..D {
            lin = lin * self.0[k] + coords[k];
        }
        lin
    }
}

fn validate_extent<const D: usize>(size: &Extent<D>) -> Result<usize, CubezipError> {
    if D < 1 || D > 3 {
        return Err(CubezipError::InvalidExtent("dimensionality must be 1, 2 or 3"));
    }
    let mut elements = 1_usize;
    for k in 0..D {
        if size.0[k] == 0 {
            return Err(CubezipError::InvalidExtent("extent axes must be non-zero"));
        }
        elements = elements
            .checked_mul(size.0[k])
            .ok_or(CubezipError::DataTooLarge)?;
    }
    Ok(elements)
}

/// Non-owning view of a dense first-major array.
#[derive(Clone, Copy)]
pub struct Slice<'a, T: CubeFloat, const D: usize> {
    data: &'a [T],
    size: Extent<D>,
}

impl<'a, T: CubeFloat, const D: usize> Slice<'a, T, D> {
    pub fn new(data: &'a [T], size: Extent<D>) -> Result<Self, CubezipError> {
        let elements = validate_extent(&size)?;
        if data.len() < elements {
            return Err(CubezipError::InvalidExtent(
                "backing slice is shorter than its extent",
            ));
        }
        Ok(Self { data, size })
    }

    pub fn data(&self) -> &'a [T] {
        self.data
    }

    pub fn size(&self) -> Extent<D> {
        self.size
    }
}

/// Mutable counterpart of [`Slice`], used as the decompression target.
pub struct SliceMut<'a, T: CubeFloat, const D: usize> {
    data: &'a mut [T],
    size: Extent<D>,
}

impl<'a, T: CubeFloat, const D: usize> SliceMut<'a, T, D> {
    pub fn new(data: &'a mut [T], size: Extent<D>) -> Result<Self, CubezipError> {
        let elements = validate_extent(&size)?;
        if data.len() < elements {
            return Err(CubezipError::InvalidExtent(
                "backing slice is shorter than its extent",
            ));
        }
        Ok(Self { data, size })
    }

    pub fn data(&self) -> &[T] {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        self.data
    }

    pub fn size(&self) -> Extent<D> {
        self.size
    }
}

/// Worst-case payload bytes for one hypercube: every bit plane present plus
/// one header word per chunk.
pub fn compressed_block_size_bound<T: CubeFloat>() -> usize {
    (HYPERCUBE_ELEMENTS + HYPERCUBE_ELEMENTS / T::Bits::BITS) * T::Bits::WORD_BYTES
}

/// Upper bound on the compressed stream size for an array of the given
/// extent: offset table, worst-case hypercube payloads, verbatim border.
pub fn compressed_size_bound<T: CubeFloat, const D: usize>(size: Extent<D>) -> usize {
    if D < 1 || D > 3 {
        return 0;
    }
    let side = side_length(D);
    let mut num_hc = 1_usize;
    let mut elements = 1_usize;
    for k in 0..D {
        num_hc = num_hc.saturating_mul(size.0[k] / side);
        elements = elements.saturating_mul(size.0[k]);
    }
    let border_bytes = elements
        .saturating_sub(num_hc.saturating_mul(HYPERCUBE_ELEMENTS))
        .saturating_mul(T::Bits::WORD_BYTES);
    num_hc
        .saturating_mul(compressed_block_size_bound::<T>())
        .saturating_add(num_hc.saturating_mul(frame::OFFSET_ENTRY_BYTES))
        .saturating_add(frame::OFFSET_ENTRY_BYTES)
        .saturating_add(border_bytes)
}

fn validate_options(options: &CubezipOptions) -> Result<(), CubezipError> {
    if options.cpu_worker_count > 4096 {
        return Err(CubezipError::InvalidOptions(
            "cpu_worker_count must be 0 (auto) or at most 4096",
        ));
    }
    Ok(())
}

fn compute_cpu_worker_count(configured: usize, task_count: usize) -> usize {
    if task_count == 0 {
        return 1;
    }
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let base = if configured == 0 { available } else { configured };
    base.max(1).min(task_count)
}

/// Compresses a dense float array into a self-contained stream. The three
/// backends produce byte-identical output for the same input.
pub fn compress<T: CubeFloat, const D: usize>(
    input: Slice<'_, T, D>,
    options: &CubezipOptions,
) -> Result<Vec<u8>, CubezipError> {
    validate_options(options)?;
    let layout = frame::FileLayout::new(input.size())?;
    let total_start = Instant::now();

    let stream = match options.backend {
        CubezipBackend::Serial => compress_serial(&input, &layout)?,
        CubezipBackend::Threaded => {
            let workers =
                compute_cpu_worker_count(options.cpu_worker_count, layout.num_hypercubes());
            compress_threaded(&input, &layout, workers)?
        }
        CubezipBackend::Gpu => match T::gpu_compress(&input) {
            Some(result) => result?,
            None => {
                let workers =
                    compute_cpu_worker_count(options.cpu_worker_count, layout.num_hypercubes());
                compress_threaded(&input, &layout, workers)?
            }
        },
    };

    if timing_profile_enabled() {
        eprintln!(
            "[cubezip][timing] compress backend={:?} hypercubes={} out_bytes={} t_total_ms={:.3}",
            options.backend,
            layout.num_hypercubes(),
            stream.len(),
            elapsed_ms(total_start),
        );
    }
    Ok(stream)
}

/// Decompresses a stream produced by [`compress`] into the caller's array.
/// Returns the bytes consumed, which equals `stream.len()` for a well-formed
/// stream; a malformed stream fails with [`CubezipError::InvalidStream`] and
/// leaves the output contents unspecified.
pub fn decompress<T: CubeFloat, const D: usize>(
    stream: &[u8],
    output: &mut SliceMut<'_, T, D>,
    options: &CubezipOptions,
) -> Result<usize, CubezipError> {
    validate_options(options)?;
    let layout = frame::FileLayout::new(output.size())?;
    let total_start = Instant::now();

    let consumed = match options.backend {
        CubezipBackend::Serial => decompress_serial(stream, output, &layout)?,
        CubezipBackend::Threaded => {
            let workers =
                compute_cpu_worker_count(options.cpu_worker_count, layout.num_hypercubes());
            decompress_threaded(stream, output, &layout, workers)?
        }
        CubezipBackend::Gpu => match T::gpu_decompress(stream, output) {
            Some(result) => result?,
            None => {
                let workers =
                    compute_cpu_worker_count(options.cpu_worker_count, layout.num_hypercubes());
                decompress_threaded(stream, output, &layout, workers)?
            }
        },
    };

    if timing_profile_enabled() {
        eprintln!(
            "[cubezip][timing] decompress backend={:?} hypercubes={} in_bytes={} t_total_ms={:.3}",
            options.backend,
            layout.num_hypercubes(),
            stream.len(),
            elapsed_ms(total_start),
        );
    }
    Ok(consumed)
}

/// Parses the offset table of a stream for an array of the given extent.
/// Entry 0 is the implicit start of the first payload (`num_hc * 8`); entry
/// `i + 1` is the end of hypercube `i`'s payload, so the last entry is the
/// border start. Validates monotonicity, bounds and the border length.
pub fn parse_stream_offsets<T: CubeFloat, const D: usize>(
    stream: &[u8],
    size: Extent<D>,
) -> Result<Vec<u64>, CubezipError> {
    let layout = frame::FileLayout::new(size)?;
    frame::parse_offsets(stream, &layout, T::Bits::WORD_BYTES)
}

/// True when the process can reach a usable GPU adapter. The result is
/// cached for the lifetime of the process.
pub fn gpu_available() -> bool {
    gpu::runtime_available()
}

fn compress_serial<T: CubeFloat, const D: usize>(
    input: &Slice<'_, T, D>,
    layout: &frame::FileLayout<D>,
) -> Result<Vec<u8>, CubezipError> {
    let num_hc = layout.num_hypercubes();
    let table_bytes = layout.table_bytes();
    let mut out = Vec::with_capacity(compressed_size_bound::<T, D>(layout.size()));
    out.resize(table_bytes, 0);

    let mut cube_buf = vec![T::Bits::zero(); HYPERCUBE_ELEMENTS];
    for hc_index in 0..num_hc {
        cube::load_hypercube(layout, hc_index, input, &mut cube_buf);
        cube::block_transform(&mut cube_buf, D, layout.side());
        cube::zero_bit_encode(&mut cube_buf, &mut out);
        let end = out.len() as u64;
        out[hc_index * frame::OFFSET_ENTRY_BYTES..(hc_index + 1) * frame::OFFSET_ENTRY_BYTES]
            .copy_from_slice(&end.to_le_bytes());
    }

    frame::write_border(layout, input, &mut out);
    Ok(out)
}

#[derive(Default)]
struct TaskQueueState {
    queue: VecDeque<usize>,
    closed: bool,
}

fn pop_global_task(
    queue_state: &Arc<(Mutex<TaskQueueState>, Condvar)>,
) -> Result<Option<usize>, CubezipError> {
    let (queue_lock, queue_cv) = &**queue_state;
    let mut state = queue_lock
        .lock()
        .map_err(|_| CubezipError::Internal("task queue lock poisoned"))?;
    loop {
        if let Some(task) = state.queue.pop_front() {
            return Ok(Some(task));
        }
        if state.closed {
            return Ok(None);
        }
        state = queue_cv
            .wait(state)
            .map_err(|_| CubezipError::Internal("task queue wait poisoned"))?;
    }
}

fn fill_task_queue(
    queue_state: &Arc<(Mutex<TaskQueueState>, Condvar)>,
    task_count: usize,
) -> Result<(), CubezipError> {
    let (queue_lock, _) = &**queue_state;
    let mut state = queue_lock
        .lock()
        .map_err(|_| CubezipError::Internal("task queue lock poisoned"))?;
    state.queue.reserve(task_count);
    for index in 0..task_count {
        state.queue.push_back(index);
    }
    state.closed = true;
    Ok(())
}

fn compress_threaded<T: CubeFloat, const D: usize>(
    input: &Slice<'_, T, D>,
    layout: &frame::FileLayout<D>,
    worker_count: usize,
) -> Result<Vec<u8>, CubezipError> {
    let num_hc = layout.num_hypercubes();
    if num_hc == 0 || worker_count <= 1 {
        return compress_serial(input, layout);
    }

    let queue_state = Arc::new((Mutex::new(TaskQueueState::default()), Condvar::new()));
    fill_task_queue(&queue_state, num_hc)?;

    let results: Arc<Vec<Mutex<Option<Result<Vec<u8>, CubezipError>>>>> =
        Arc::new((0..num_hc).map(|_| Mutex::new(None)).collect());

    std::thread::scope(|scope| -> Result<(), CubezipError> {
        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let queue_ref = Arc::clone(&queue_state);
            let results_ref = Arc::clone(&results);
            handles.push(scope.spawn(move || -> Result<(), CubezipError> {
                let mut cube_buf = vec![T::Bits::zero(); HYPERCUBE_ELEMENTS];
                loop {
                    let Some(task_index) = pop_global_task(&queue_ref)? else {
                        break;
                    };
                    cube::load_hypercube(layout, task_index, input, &mut cube_buf);
                    cube::block_transform(&mut cube_buf, D, layout.side());
                    let mut payload = Vec::with_capacity(compressed_block_size_bound::<T>());
                    cube::zero_bit_encode(&mut cube_buf, &mut payload);
                    let mut slot = results_ref[task_index]
                        .lock()
                        .map_err(|_| CubezipError::Internal("result slot lock poisoned"))?;
                    *slot = Some(Ok(payload));
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| CubezipError::Internal("worker thread panicked"))??;
        }
        Ok(())
    })?;

    let mut payloads = Vec::with_capacity(num_hc);
    for slot in results.iter() {
        let taken = slot
            .lock()
            .map_err(|_| CubezipError::Internal("result slot lock poisoned"))?
            .take()
            .ok_or(CubezipError::Internal("missing hypercube payload"))?;
        payloads.push(taken?);
    }
    frame::build_stream(layout, &payloads, input)
}

fn decompress_serial<T: CubeFloat, const D: usize>(
    stream: &[u8],
    output: &mut SliceMut<'_, T, D>,
    layout: &frame::FileLayout<D>,
) -> Result<usize, CubezipError> {
    let offsets = frame::parse_offsets(stream, layout, T::Bits::WORD_BYTES)?;
    let num_hc = layout.num_hypercubes();

    let mut cube_buf = vec![T::Bits::zero(); HYPERCUBE_ELEMENTS];
    for hc_index in 0..num_hc {
        let start = offsets[hc_index] as usize;
        let end = offsets[hc_index + 1] as usize;
        let span = &stream[start..end];
        let consumed = cube::zero_bit_decode(span, &mut cube_buf)?;
        if consumed != span.len() {
            return Err(CubezipError::InvalidStream(
                "hypercube payload length mismatch",
            ));
        }
        cube::inverse_block_transform(&mut cube_buf, D, layout.side());
        cube::store_hypercube(layout, hc_index, &cube_buf, output);
    }

    frame::read_border(layout, stream, offsets[num_hc] as usize, output)?;
    Ok(stream.len())
}

fn decompress_threaded<T: CubeFloat, const D: usize>(
    stream: &[u8],
    output: &mut SliceMut<'_, T, D>,
    layout: &frame::FileLayout<D>,
    worker_count: usize,
) -> Result<usize, CubezipError> {
    let num_hc = layout.num_hypercubes();
    if num_hc == 0 || worker_count <= 1 {
        return decompress_serial(stream, output, layout);
    }

    let offsets = frame::parse_offsets(stream, layout, T::Bits::WORD_BYTES)?;

    let queue_state = Arc::new((Mutex::new(TaskQueueState::default()), Condvar::new()));
    fill_task_queue(&queue_state, num_hc)?;

    let results: Arc<Vec<Mutex<Option<Result<Vec<T::Bits>, CubezipError>>>>> =
        Arc::new((0..num_hc).map(|_| Mutex::new(None)).collect());

    std::thread::scope(|scope| -> Result<(), CubezipError> {
        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let queue_ref = Arc::clone(&queue_state);
            let results_ref = Arc::clone(&results);
            let offsets_ref = &offsets;
            handles.push(scope.spawn(move || -> Result<(), CubezipError> {
                loop {
                    let Some(task_index) = pop_global_task(&queue_ref)? else {
                        break;
                    };
                    let start = offsets_ref[task_index] as usize;
                    let end = offsets_ref[task_index + 1] as usize;
                    let span = &stream[start..end];
                    let mut cube_buf = vec![T::Bits::zero(); HYPERCUBE_ELEMENTS];
                    let decoded = cube::zero_bit_decode(span, &mut cube_buf).and_then(|consumed| {
                        if consumed != span.len() {
                            return Err(CubezipError::InvalidStream(
                                "hypercube payload length mismatch",
                            ));
                        }
                        cube::inverse_block_transform(&mut cube_buf, D, layout.side());
                        Ok(())
                    });
                    let mut slot = results_ref[task_index]
                        .lock()
                        .map_err(|_| CubezipError::Internal("result slot lock poisoned"))?;
                    *slot = Some(decoded.map(|_| std::mem::take(&mut cube_buf)));
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| CubezipError::Internal("worker thread panicked"))??;
        }
        Ok(())
    })?;

    for (hc_index, slot) in results.iter().enumerate() {
        let taken = slot
            .lock()
            .map_err(|_| CubezipError::Internal("result slot lock poisoned"))?
            .take()
            .ok_or(CubezipError::Internal("missing decoded hypercube"))?;
        let cube_buf = taken?;
        cube::store_hypercube(layout, hc_index, &cube_buf, output);
    }

    frame::read_border(layout, stream, offsets[num_hc] as usize, output)?;
    Ok(stream.len())
}
