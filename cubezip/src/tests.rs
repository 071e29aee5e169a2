use super::*;

use crate::cube::{
    block_transform, complement_negative, inverse_block_transform, ipow, rotate_left_1,
    rotate_right_1, transpose_bits, zero_bit_decode, zero_bit_encode,
};
use crate::frame::FileLayout;

fn lcg_words_u32(n: usize, mut state: u32) -> Vec<u32> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        out.push(state);
    }
    out
}

fn lcg_words_u64(n: usize, mut state: u64) -> Vec<u64> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        out.push(state);
    }
    out
}

fn lcg_f32_field(n: usize, mut state: u32) -> Vec<f32> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        out.push((state >> 8) as f32 / 16_777_216.0 - 0.5);
    }
    out
}

#[test]
fn rotations_are_inverses() {
    for &word in &[0_u32, 1, 0x8000_0000, 0xdead_beef, u32::MAX] {
        assert_eq!(rotate_right_1(rotate_left_1(word)), word);
    }
    for &word in &[0_u64, 1, 0x8000_0000_0000_0000, 0xdead_beef_0bad_f00d, u64::MAX] {
        assert_eq!(rotate_right_1(rotate_left_1(word)), word);
    }
    assert_eq!(rotate_left_1(0x8000_0001_u32), 0x0000_0003);
}

#[test]
fn complement_negative_is_an_involution() {
    for word in lcg_words_u32(256, 7) {
        assert_eq!(complement_negative(complement_negative(word)), word);
    }
    for word in lcg_words_u64(256, 7) {
        assert_eq!(complement_negative(complement_negative(word)), word);
    }
    // Sign bit set: the remaining bits flip. Sign bit clear: identity.
    assert_eq!(complement_negative(0x8000_00ff_u32), 0xffff_ff00);
    assert_eq!(complement_negative(0x1234_5678_u32), 0x1234_5678);
}

#[test]
fn ipow_matches_expected_profiles() {
    assert_eq!(ipow(4096, 1), HYPERCUBE_ELEMENTS);
    assert_eq!(ipow(64, 2), HYPERCUBE_ELEMENTS);
    assert_eq!(ipow(16, 3), HYPERCUBE_ELEMENTS);
    assert_eq!(ipow(5, 0), 1);
}

fn reference_transpose_u32(input: &[u32]) -> Vec<u32> {
    let b = 32;
    let mut out = vec![0_u32; b];
    for j in 0..b {
        for i in 0..b {
            let bit = (input[i] >> (b - 1 - j)) & 1;
            out[j] |= bit << (b - 1 - i);
        }
    }
    out
}

fn reference_transpose_u64(input: &[u64]) -> Vec<u64> {
    let b = 64;
    let mut out = vec![0_u64; b];
    for j in 0..b {
        for i in 0..b {
            let bit = (input[i] >> (b - 1 - j)) & 1;
            out[j] |= bit << (b - 1 - i);
        }
    }
    out
}

#[test]
fn transpose_matches_the_naive_reference() {
    let mut chunk = lcg_words_u32(32, 99);
    let expected = reference_transpose_u32(&chunk);
    transpose_bits(&mut chunk);
    assert_eq!(chunk, expected);

    let mut chunk = lcg_words_u64(64, 99);
    let expected = reference_transpose_u64(&chunk);
    transpose_bits(&mut chunk);
    assert_eq!(chunk, expected);
}

#[test]
fn transpose_is_an_involution() {
    let original = lcg_words_u32(32, 3);
    let mut chunk = original.clone();
    transpose_bits(&mut chunk);
    transpose_bits(&mut chunk);
    assert_eq!(chunk, original);

    let original = lcg_words_u64(64, 3);
    let mut chunk = original.clone();
    transpose_bits(&mut chunk);
    transpose_bits(&mut chunk);
    assert_eq!(chunk, original);
}

#[test]
fn transpose_moves_single_bits_where_expected() {
    // Bit 0 of word 0 is matrix element (row 0, col 31); transposed it lands
    // at (row 31, col 0), i.e. the MSB of word 31.
    let mut chunk = vec![0_u32; 32];
    chunk[0] = 1;
    transpose_bits(&mut chunk);
    assert_eq!(chunk[31], 0x8000_0000);
    for word in &chunk[..31] {
        assert_eq!(*word, 0);
    }
}

#[test]
fn block_transform_is_reversible_for_all_profiles() {
    for dims in 1..=3_usize {
        let side = side_length(dims);
        let original = lcg_words_u32(HYPERCUBE_ELEMENTS, 0x1234_5678 + dims as u32);
        let mut cube = original.clone();
        block_transform(&mut cube, dims, side);
        assert_ne!(cube, original);
        inverse_block_transform(&mut cube, dims, side);
        assert_eq!(cube, original);

        let original = lcg_words_u64(HYPERCUBE_ELEMENTS, 0x1234_5678 + dims as u64);
        let mut cube = original.clone();
        block_transform(&mut cube, dims, side);
        inverse_block_transform(&mut cube, dims, side);
        assert_eq!(cube, original);
    }
}

#[test]
fn block_transform_differences_along_the_innermost_axis() {
    // 1D profile: after the rotate pass, consecutive words subtract.
    let mut cube = vec![0_u32; HYPERCUBE_ELEMENTS];
    for (i, word) in cube.iter_mut().enumerate() {
        *word = (i as u32) * 3 + 5;
    }
    let expected_first = rotate_left_1(5_u32);
    let expected_delta =
        rotate_left_1(8_u32).wrapping_sub(rotate_left_1(5_u32));
    block_transform(&mut cube, 1, 4096);
    assert_eq!(cube[0], complement_negative(expected_first));
    assert_eq!(cube[1], complement_negative(expected_delta));
}

// Sparsified word pattern in the shape of the original decoder regression:
// some bit planes cleared in every chunk, some words forced to zero.
fn sparse_cube_u32() -> Vec<u32> {
    let mut cube = lcg_words_u32(HYPERCUBE_ELEMENTS, 0xabcd);
    for i in 0..HYPERCUBE_ELEMENTS {
        for idx in [0_usize, 12, 13, 29, 30] {
            cube[i] &= !(1_u32 << ((idx * (i / 32)) % 32));
            cube[(i / 32) * 32 + idx] = 0;
        }
    }
    cube
}

#[test]
fn zero_bit_coder_roundtrips_and_counts_lengths() {
    let original = sparse_cube_u32();
    let mut cube = original.clone();
    let mut stream = Vec::new();
    zero_bit_encode(&mut cube, &mut stream);

    // Payload length law: sum over chunks of (1 + popcount(header)) words.
    let mut expected_bytes = 0_usize;
    let mut pos = 0_usize;
    while pos < stream.len() {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(&stream[pos..pos + 4]);
        let header = u32::from_le_bytes(raw);
        let words = 1 + header.count_ones() as usize;
        expected_bytes += words * 4;
        pos += words * 4;
    }
    assert_eq!(stream.len(), expected_bytes);
    assert_eq!(stream.len() % 4, 0);

    let mut decoded = vec![0_u32; HYPERCUBE_ELEMENTS];
    let consumed = zero_bit_decode(&stream, &mut decoded).expect("decode should succeed");
    assert_eq!(consumed, stream.len());
    assert_eq!(decoded, original);
}

#[test]
fn zero_bit_coder_emits_bare_headers_for_zero_chunks() {
    let mut cube = vec![0_u64; HYPERCUBE_ELEMENTS];
    let mut stream = Vec::new();
    zero_bit_encode(&mut cube, &mut stream);
    assert_eq!(stream.len(), HYPERCUBE_ELEMENTS / 64 * 8);
    assert!(stream.iter().all(|&b| b == 0));

    let mut decoded = vec![1_u64; HYPERCUBE_ELEMENTS];
    let consumed = zero_bit_decode(&stream, &mut decoded).expect("decode should succeed");
    assert_eq!(consumed, stream.len());
    assert!(decoded.iter().all(|&w| w == 0));
}

#[test]
fn zero_bit_decode_rejects_truncated_payloads() {
    let mut cube = sparse_cube_u32();
    let mut stream = Vec::new();
    zero_bit_encode(&mut cube, &mut stream);
    stream.truncate(stream.len() - 4);

    let mut decoded = vec![0_u32; HYPERCUBE_ELEMENTS];
    let result = zero_bit_decode(&stream, &mut decoded);
    assert!(matches!(result, Err(CubezipError::InvalidStream(_))));
}

#[test]
fn file_layout_grids_and_origins() {
    let layout = FileLayout::new(Extent([48_usize, 48, 48])).expect("layout should build");
    assert_eq!(*layout.grid(), [3, 3, 3]);
    assert_eq!(layout.num_hypercubes(), 27);
    assert_eq!(layout.num_border_elements(), 0);
    assert_eq!(layout.hypercube_origin(0), [0, 0, 0]);
    assert_eq!(layout.hypercube_origin(1), [0, 0, 16]);
    assert_eq!(layout.hypercube_origin(3), [0, 16, 0]);
    assert_eq!(layout.hypercube_origin(9), [16, 0, 0]);
    assert_eq!(layout.hypercube_origin(26), [32, 32, 32]);

    let layout = FileLayout::new(Extent([8192_usize + 100])).expect("layout should build");
    assert_eq!(*layout.grid(), [2]);
    assert_eq!(layout.hypercube_origin(1), [4096]);
    assert_eq!(layout.num_border_elements(), 100);
}

#[test]
fn border_runs_cover_the_uncovered_remainder_in_order() {
    let layout = FileLayout::new(Extent([65_usize, 65])).expect("layout should build");
    let mut runs = Vec::new();
    layout.for_each_border_run(|start, len| runs.push((start, len)));
    assert_eq!(runs.len(), 65);
    for (r, run) in runs[..64].iter().enumerate() {
        assert_eq!(*run, (r * 65 + 64, 1));
    }
    assert_eq!(runs[64], (64 * 65, 65));
    let total: usize = runs.iter().map(|&(_, len)| len).sum();
    assert_eq!(total, 65 * 65 - HYPERCUBE_ELEMENTS);

    let layout = FileLayout::new(Extent([4097_usize])).expect("layout should build");
    let mut runs = Vec::new();
    layout.for_each_border_run(|start, len| runs.push((start, len)));
    assert_eq!(runs, vec![(4096, 1)]);
}

#[test]
fn hypercube_load_and_store_are_inverses() {
    let size = Extent([130_usize, 70]);
    let layout = FileLayout::new(size).expect("layout should build");
    assert_eq!(layout.num_hypercubes(), 2);

    let data = lcg_f32_field(130 * 70, 42);
    let input = Slice::new(&data, size).expect("slice should build");

    let mut restored = vec![-1.0_f32; 130 * 70];
    {
        let mut output = SliceMut::new(&mut restored, size).expect("slice should build");
        let mut cube = vec![0_u32; HYPERCUBE_ELEMENTS];
        for hc_index in 0..layout.num_hypercubes() {
            cube::load_hypercube(&layout, hc_index, &input, &mut cube);
            cube::store_hypercube(&layout, hc_index, &cube, &mut output);
        }
    }

    // Covered cells round-trip; border cells keep the sentinel.
    let origin1 = layout.hypercube_origin(1);
    assert_eq!(origin1, [64, 0]);
    for r in 0..130 {
        for c in 0..70 {
            let idx = r * 70 + c;
            if r < 128 && c < 64 {
                assert_eq!(restored[idx].to_bits(), data[idx].to_bits());
            } else {
                assert_eq!(restored[idx], -1.0);
            }
        }
    }
}

#[test]
fn parse_offsets_validates_the_table() {
    let size = Extent([4096_usize]);
    let data = vec![0.0_f32; 4096];
    let input = Slice::new(&data, size).expect("slice should build");
    let stream = compress(
        input,
        &CubezipOptions {
            backend: CubezipBackend::Serial,
            cpu_worker_count: 0,
        },
    )
    .expect("compress should succeed");
    // All-zero input: 8-byte table + 128 bare header words.
    assert_eq!(stream.len(), 8 + 128 * 4);

    let offsets =
        parse_stream_offsets::<f32, 1>(&stream, size).expect("offsets should parse");
    assert_eq!(offsets, vec![8, 520]);

    let mut bad = stream.clone();
    bad[0..8].copy_from_slice(&4_u64.to_le_bytes());
    assert!(matches!(
        parse_stream_offsets::<f32, 1>(&bad, size),
        Err(CubezipError::InvalidStream(_))
    ));

    let mut bad = stream.clone();
    bad[0..8].copy_from_slice(&10_000_u64.to_le_bytes());
    assert!(matches!(
        parse_stream_offsets::<f32, 1>(&bad, size),
        Err(CubezipError::InvalidStream(_))
    ));

    let mut truncated = stream.clone();
    truncated.truncate(6);
    assert!(matches!(
        parse_stream_offsets::<f32, 1>(&truncated, size),
        Err(CubezipError::InvalidStream(_))
    ));

    let mut trailing = stream;
    trailing.push(0);
    assert!(matches!(
        parse_stream_offsets::<f32, 1>(&trailing, size),
        Err(CubezipError::InvalidStream(_))
    ));
}

#[test]
fn extent_and_slice_validation() {
    assert!(Slice::<f32, 2>::new(&[0.0; 16], Extent([4, 4])).is_ok());
    assert!(matches!(
        Slice::<f32, 2>::new(&[0.0; 16], Extent([0, 4])),
        Err(CubezipError::InvalidExtent(_))
    ));
    assert!(matches!(
        Slice::<f32, 2>::new(&[0.0; 15], Extent([4, 4])),
        Err(CubezipError::InvalidExtent(_))
    ));
    assert!(matches!(
        Slice::<f32, 4>::new(&[0.0; 16], Extent([2, 2, 2, 2])),
        Err(CubezipError::InvalidExtent(_))
    ));

    let extent = Extent([3_usize, 5, 7]);
    assert_eq!(extent.num_elements(), 105);
    assert_eq!(extent.linear_offset([1, 2, 3]), 1 * 35 + 2 * 7 + 3);
}

#[test]
fn options_validation_rejects_absurd_worker_counts() {
    let options = CubezipOptions {
        backend: CubezipBackend::Serial,
        cpu_worker_count: 5000,
    };
    let data = vec![0.0_f32; 16];
    let input = Slice::new(&data, Extent([16_usize])).expect("slice should build");
    assert!(matches!(
        compress(input, &options),
        Err(CubezipError::InvalidOptions(_))
    ));
}

#[test]
fn size_bounds_match_the_profile_constants() {
    assert_eq!(compressed_block_size_bound::<f32>(), (4096 + 128) * 4);
    assert_eq!(compressed_block_size_bound::<f64>(), (4096 + 64) * 8);

    // One full f64 cube, no border: table + sentinel slack + one block bound.
    let bound = compressed_size_bound::<f64, 3>(Extent([16, 16, 16]));
    assert_eq!(bound, (4096 + 64) * 8 + 8 + 8);

    // Border-only array: the bound is exactly the verbatim payload.
    let bound = compressed_size_bound::<f32, 1>(Extent([255]));
    assert_eq!(bound, 8 + 255 * 4);
}

#[test]
fn bitwise_payloads_survive_roundtrip_including_nan() {
    // Raw bit patterns, including NaNs and infinities: the coder treats
    // samples as opaque words.
    let words = lcg_words_u32(4096 + 17, 0xfeed);
    let data: Vec<f32> = words.iter().map(|&w| f32::from_bits(w)).collect();
    let size = Extent([data.len()]);
    let input = Slice::new(&data, size).expect("slice should build");
    let options = CubezipOptions {
        backend: CubezipBackend::Serial,
        cpu_worker_count: 0,
    };
    let stream = compress(input, &options).expect("compress should succeed");

    let mut restored = vec![0.0_f32; data.len()];
    let mut output = SliceMut::new(&mut restored, size).expect("slice should build");
    let consumed = decompress(&stream, &mut output, &options).expect("decompress should succeed");
    assert_eq!(consumed, stream.len());
    for (a, b) in data.iter().zip(restored.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
