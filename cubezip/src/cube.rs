use super::*;

pub(crate) const fn ipow(base: usize, exp: u32) -> usize {
    let mut result = 1_usize;
    let mut remaining = exp;
    while remaining > 0 {
        result *= base;
        remaining -= 1;
    }
    result
}

pub(crate) fn rotate_left_1<B: CubeBits>(x: B) -> B {
    x.rotate_left(1)
}

pub(crate) fn rotate_right_1<B: CubeBits>(x: B) -> B {
    x.rotate_right(1)
}

// Involution: flips the non-sign bits of negative words so that small signed
// deltas land near zero after the rotate.
pub(crate) fn complement_negative<B: CubeBits>(x: B) -> B {
    if x >> (B::BITS - 1) == B::one() {
        x ^ (B::max_value() >> 1)
    } else {
        x
    }
}

// In-place backward difference along one line of `n` elements spaced `stride`
// apart. The predecessor is carried in a register so every subtraction reads
// the un-modified value.
fn difference_line<B: CubeBits>(x: &mut [B], base: usize, n: usize, stride: usize) {
    let mut prev = x[base];
    for i in 1..n {
        let idx = base + i * stride;
        let cur = x[idx];
        x[idx] = cur.wrapping_sub(&prev);
        prev = cur;
    }
}

fn prefix_sum_line<B: CubeBits>(x: &mut [B], base: usize, n: usize, stride: usize) {
    for i in 1..n {
        let idx = base + i * stride;
        x[idx] = x[idx].wrapping_add(&x[idx - stride]);
    }
}

// Forward transform over one hypercube: rotate, separable per-axis
// differencing, sign complement. The pass order and strides must match the
// GPU kernels exactly; the difference passes commute, so the order only
// matters for in-place parallel safety, not for the output bytes.
pub(crate) fn block_transform<B: CubeBits>(x: &mut [B], dims: usize, side: usize) {
    for word in x.iter_mut() {
        *word = rotate_left_1(*word);
    }

    let n = side;
    match dims {
        1 => {
            difference_line(x, 0, n, 1);
        }
        2 => {
            for i in 0..n {
                difference_line(x, n * i, n, 1);
            }
            for i in 0..n {
                difference_line(x, i, n, n);
            }
        }
        _ => {
            for i in 0..n {
                for j in 0..n {
                    difference_line(x, n * n * i + j, n, n);
                }
            }
            for i in 0..n * n {
                difference_line(x, n * i, n, 1);
            }
            for i in 0..n * n {
                difference_line(x, i, n, n * n);
            }
        }
    }

    for word in x.iter_mut() {
        *word = complement_negative(*word);
    }
}

pub(crate) fn inverse_block_transform<B: CubeBits>(x: &mut [B], dims: usize, side: usize) {
    for word in x.iter_mut() {
        *word = complement_negative(*word);
    }

    let n = side;
    match dims {
        1 => {
            prefix_sum_line(x, 0, n, 1);
        }
        2 => {
            for i in 0..n {
                prefix_sum_line(x, i, n, n);
            }
            for i in 0..n {
                prefix_sum_line(x, n * i, n, 1);
            }
        }
        _ => {
            for i in 0..n * n {
                prefix_sum_line(x, i, n, n * n);
            }
            for i in 0..n * n {
                prefix_sum_line(x, n * i, n, 1);
            }
            for i in 0..n {
                for j in 0..n {
                    prefix_sum_line(x, n * n * i + j, n, n);
                }
            }
        }
    }

    for word in x.iter_mut() {
        *word = rotate_right_1(*word);
    }
}

// Transposes a BxB bit matrix held in B words, MSB-first: after the call,
// bit (B-1-i) of word j equals bit (B-1-j) of input word i. Involution.
// Word-parallel halving network, log2(B) rounds instead of B*B single-bit
// moves.
pub(crate) fn transpose_bits<B: CubeBits>(chunk: &mut [B]) {
    let bits = B::BITS;
    let mut mask = B::max_value() >> (bits / 2);
    let mut j = bits / 2;
    while j != 0 {
        let mut k = 0_usize;
        while k < bits {
            let t = (chunk[k] ^ (chunk[k + j] >> j)) & mask;
            chunk[k] = chunk[k] ^ t;
            chunk[k + j] = chunk[k + j] ^ (t << j);
            k = (k + j + 1) & !j;
        }
        j >>= 1;
        mask = mask ^ (mask << j);
    }
}

// Encodes one transformed hypercube: per chunk of B words, transpose into
// bit planes, emit a header whose bit j marks plane j as non-zero, then the
// non-zero planes in ascending bit index. Appends to `out`.
pub(crate) fn zero_bit_encode<B: CubeBits>(cube: &mut [B], out: &mut Vec<u8>) {
    for chunk in cube.chunks_mut(B::BITS) {
        transpose_bits(chunk);
        let mut header = B::zero();
        for (j, word) in chunk.iter().enumerate() {
            if *word != B::zero() {
                header = header | (B::one() << j);
            }
        }
        header.write_le(out);
        for word in chunk.iter() {
            if *word != B::zero() {
                word.write_le(out);
            }
        }
    }
}

// Inverse of `zero_bit_encode`. Returns the bytes consumed from `stream`.
pub(crate) fn zero_bit_decode<B: CubeBits>(
    stream: &[u8],
    cube: &mut [B],
) -> Result<usize, CubezipError> {
    let word_bytes = B::WORD_BYTES;
    let mut pos = 0_usize;
    for chunk in cube.chunks_mut(B::BITS) {
        if stream.len() - pos < word_bytes {
            return Err(CubezipError::InvalidStream("hypercube payload truncated"));
        }
        let header = B::read_le(&stream[pos..]);
        pos += word_bytes;
        for (j, word) in chunk.iter_mut().enumerate() {
            if header >> j & B::one() == B::one() {
                if stream.len() - pos < word_bytes {
                    return Err(CubezipError::InvalidStream("hypercube payload truncated"));
                }
                *word = B::read_le(&stream[pos..]);
                pos += word_bytes;
            } else {
                *word = B::zero();
            }
        }
        transpose_bits(chunk);
    }
    Ok(pos)
}

// Gathers one hypercube from the strided N-D slice into a linear cube of
// bit-cast words. Local indices decompose into base-`side` digits with the
// least significant digit on the innermost (last) axis, so rows of `side`
// elements are contiguous in both the cube and the source.
pub(crate) fn load_hypercube<T: CubeFloat, const D: usize>(
    layout: &frame::FileLayout<D>,
    hc_index: usize,
    input: &Slice<'_, T, D>,
    cube: &mut [T::Bits],
) {
    let side = layout.side();
    let origin = layout.hypercube_origin(hc_index);
    let size = input.size().0;
    let data = input.data();
    let rows = cube.len() / side;
    for row in 0..rows {
        let row_base = hypercube_row_base(&origin, &size, side, row);
        let dst = row * side;
        for i in 0..side {
            cube[dst + i] = data[row_base + i].to_bits();
        }
    }
}

pub(crate) fn store_hypercube<T: CubeFloat, const D: usize>(
    layout: &frame::FileLayout<D>,
    hc_index: usize,
    cube: &[T::Bits],
    output: &mut SliceMut<'_, T, D>,
) {
    let side = layout.side();
    let origin = layout.hypercube_origin(hc_index);
    let size = output.size().0;
    let data = output.data_mut();
    let rows = cube.len() / side;
    for row in 0..rows {
        let row_base = hypercube_row_base(&origin, &size, side, row);
        let src = row * side;
        for i in 0..side {
            data[row_base + i] = T::from_bits(cube[src + i]);
        }
    }
}

// Linear offset of the first element of local row `row` (a run of `side`
// innermost-axis elements) inside the global array.
fn hypercube_row_base<const D: usize>(
    origin: &[usize; D],
    size: &[usize; D],
    side: usize,
    row: usize,
) -> usize {
    let outer_dims = D.saturating_sub(1);
    let mut coords = [0_usize; D];
    let mut rem = row;
    for k in (0..outer_dims).rev() {
        coords[k] = rem % side;
        rem /= side;
    }
    let mut lin = 0_usize;
    for k in 0..D {
        let c = if k < outer_dims {
            origin[k] + coords[k]
        } else {
            origin[k]
        };
        lin = lin * size[k] + c;
    }
    lin
}
