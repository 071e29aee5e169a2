use cubezip::{
    compress, compressed_size_bound, decompress, parse_stream_offsets, CubezipBackend,
    CubezipError, CubezipOptions, Extent, Slice, SliceMut,
};

fn serial_options() -> CubezipOptions {
    CubezipOptions {
        backend: CubezipBackend::Serial,
        cpu_worker_count: 0,
    }
}

fn threaded_options() -> CubezipOptions {
    CubezipOptions {
        backend: CubezipBackend::Threaded,
        cpu_worker_count: 0,
    }
}

fn field_f32(n: usize, mut state: u32) -> Vec<f32> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        out.push((state >> 8) as f32 / 16_777_216.0 - 0.5);
    }
    out
}

fn field_f64(n: usize, mut state: u64) -> Vec<f64> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        out.push((state >> 11) as f64 / 9_007_199_254_740_992.0 - 0.5);
    }
    out
}

fn roundtrip_f32<const D: usize>(data: &[f32], size: Extent<D>, options: &CubezipOptions) -> Vec<u8> {
    let input = Slice::new(data, size).expect("input slice should build");
    let stream = compress(input, options).expect("compress should succeed");
    assert!(stream.len() <= compressed_size_bound::<f32, D>(size));

    let mut restored = vec![0.0_f32; data.len()];
    let mut output = SliceMut::new(&mut restored, size).expect("output slice should build");
    let consumed = decompress(&stream, &mut output, options).expect("decompress should succeed");
    assert_eq!(consumed, stream.len());
    for (a, b) in data.iter().zip(restored.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
    stream
}

fn roundtrip_f64<const D: usize>(data: &[f64], size: Extent<D>, options: &CubezipOptions) -> Vec<u8> {
    let input = Slice::new(data, size).expect("input slice should build");
    let stream = compress(input, options).expect("compress should succeed");
    assert!(stream.len() <= compressed_size_bound::<f64, D>(size));

    let mut restored = vec![0.0_f64; data.len()];
    let mut output = SliceMut::new(&mut restored, size).expect("output slice should build");
    let consumed = decompress(&stream, &mut output, options).expect("decompress should succeed");
    assert_eq!(consumed, stream.len());
    for (a, b) in data.iter().zip(restored.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
    stream
}

// All six profiles at extent 4 * side - 1 per axis, the shape the original
// regression suite exercises: a 3x3x3 hypercube grid plus border on every
// axis. The first word-width samples are zeroed so the first transposed
// chunk starts with a cleared header bit.
#[test]
fn roundtrip_all_profiles_with_border() {
    for dims in 1..=3_usize {
        let side = match dims {
            1 => 4096,
            2 => 64,
            _ => 16,
        };
        let n: usize = side * 4 - 1;
        let elements = n.pow(dims as u32);

        let mut data = field_f32(elements, 0x5eed + dims as u32);
        for value in data.iter_mut().take(32) {
            *value = 0.0;
        }
        let mut data64 = field_f64(elements, 0x5eed + dims as u64);
        for value in data64.iter_mut().take(64) {
            *value = 0.0;
        }

        match dims {
            1 => {
                let size = Extent([n]);
                let serial = roundtrip_f32(&data, size, &serial_options());
                let threaded = roundtrip_f32(&data, size, &threaded_options());
                assert_eq!(serial, threaded);
                let serial = roundtrip_f64(&data64, size, &serial_options());
                let threaded = roundtrip_f64(&data64, size, &threaded_options());
                assert_eq!(serial, threaded);
            }
            2 => {
                let size = Extent([n, n]);
                let serial = roundtrip_f32(&data, size, &serial_options());
                let threaded = roundtrip_f32(&data, size, &threaded_options());
                assert_eq!(serial, threaded);
                let serial = roundtrip_f64(&data64, size, &serial_options());
                let threaded = roundtrip_f64(&data64, size, &threaded_options());
                assert_eq!(serial, threaded);
            }
            _ => {
                let size = Extent([n, n, n]);
                let serial = roundtrip_f32(&data, size, &serial_options());
                let threaded = roundtrip_f32(&data, size, &threaded_options());
                assert_eq!(serial, threaded);
                let serial = roundtrip_f64(&data64, size, &serial_options());
                let threaded = roundtrip_f64(&data64, size, &threaded_options());
                assert_eq!(serial, threaded);
            }
        }
    }
}

// 1D float, 4097 elements: one full hypercube plus a single border element.
#[test]
fn one_hypercube_plus_one_border_element() {
    let data = field_f32(4097, 11);
    let size = Extent([4097_usize]);
    let stream = roundtrip_f32(&data, size, &serial_options());

    let offsets = parse_stream_offsets::<f32, 1>(&stream, size).expect("offsets should parse");
    assert_eq!(offsets.len(), 2);
    assert_eq!(offsets[0], 8);
    assert_eq!(offsets[1] as usize + 4, stream.len());
    // The border element sits verbatim at the end of the stream.
    assert_eq!(
        &stream[stream.len() - 4..],
        &data[4096].to_bits().to_le_bytes()[..]
    );
}

// 2D float, 65x65: one hypercube covering rows and columns 0..63, with the
// border holding column 64 of rows 0..63 followed by all of row 64.
#[test]
fn border_region_is_stored_verbatim_in_first_major_order() {
    let data = field_f32(65 * 65, 22);
    let size = Extent([65_usize, 65]);
    let stream = roundtrip_f32(&data, size, &serial_options());

    let offsets = parse_stream_offsets::<f32, 2>(&stream, size).expect("offsets should parse");
    let border_start = offsets[1] as usize;

    let mut expected = Vec::new();
    for r in 0..64 {
        expected.extend_from_slice(&data[r * 65 + 64].to_bits().to_le_bytes());
    }
    for c in 0..65 {
        expected.extend_from_slice(&data[64 * 65 + c].to_bits().to_le_bytes());
    }
    assert_eq!(&stream[border_start..], &expected[..]);
}

// 3D double, 48^3: exactly 27 hypercubes and no border.
#[test]
fn offset_table_for_a_borderless_grid() {
    let data = field_f64(48 * 48 * 48, 33);
    let size = Extent([48_usize, 48, 48]);
    let stream = roundtrip_f64(&data, size, &serial_options());

    let offsets = parse_stream_offsets::<f64, 3>(&stream, size).expect("offsets should parse");
    assert_eq!(offsets.len(), 28);
    assert_eq!(offsets[0], 27 * 8);
    for pair in offsets.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    assert_eq!(offsets[27] as usize, stream.len());
}

// All-zero 3D double input: every chunk is a bare zero header.
#[test]
fn all_zero_input_compresses_to_bare_headers() {
    let data = vec![0.0_f64; 16 * 16 * 16];
    let size = Extent([16_usize, 16, 16]);
    let stream = roundtrip_f64(&data, size, &serial_options());
    // One table entry + 64 chunk headers of 8 bytes each.
    assert_eq!(stream.len(), 8 + (4096 / 64) * 8);
    assert!(stream[8..].iter().all(|&b| b == 0));
}

// 255 elements never fill a hypercube: the stream is offset-table-free and
// holds the input verbatim.
#[test]
fn sub_hypercube_input_is_all_border() {
    let mut data = field_f32(255, 44);
    for value in data.iter_mut().take(32) {
        *value = 0.0;
    }
    let size = Extent([255_usize]);
    let stream = roundtrip_f32(&data, size, &serial_options());
    assert_eq!(stream.len(), 255 * 4);
    let mut expected = Vec::new();
    for value in &data {
        expected.extend_from_slice(&value.to_bits().to_le_bytes());
    }
    assert_eq!(stream, expected);

    let offsets = parse_stream_offsets::<f32, 1>(&stream, size).expect("offsets should parse");
    assert_eq!(offsets, vec![0]);
}

#[test]
fn offset_table_consistency_across_a_grid_with_border() {
    let data = field_f32(130 * 129, 55);
    let size = Extent([130_usize, 129]);
    let stream = roundtrip_f32(&data, size, &serial_options());

    let offsets = parse_stream_offsets::<f32, 2>(&stream, size).expect("offsets should parse");
    assert_eq!(offsets.len(), 5);
    assert_eq!(offsets[0], 4 * 8);
    for pair in offsets.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    let border_bytes = (130 * 129 - 4 * 4096) * 4;
    assert_eq!(offsets[4] as usize + border_bytes, stream.len());
}

#[test]
fn threaded_decompress_matches_serial() {
    let data = field_f64(130 * 129, 66);
    let size = Extent([130_usize, 129]);
    let input = Slice::new(&data, size).expect("input slice should build");
    let stream = compress(input, &serial_options()).expect("compress should succeed");

    let mut serial = vec![0.0_f64; data.len()];
    let mut output = SliceMut::new(&mut serial, size).expect("output slice should build");
    decompress(&stream, &mut output, &serial_options()).expect("serial decompress should succeed");

    let mut threaded = vec![0.0_f64; data.len()];
    let mut output = SliceMut::new(&mut threaded, size).expect("output slice should build");
    decompress(&stream, &mut output, &threaded_options())
        .expect("threaded decompress should succeed");

    for (a, b) in serial.iter().zip(threaded.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn malformed_streams_are_rejected() {
    let data = field_f32(130 * 129, 77);
    let size = Extent([130_usize, 129]);
    let input = Slice::new(&data, size).expect("input slice should build");
    let stream = compress(input, &serial_options()).expect("compress should succeed");

    let decode = |bytes: &[u8]| {
        let mut restored = vec![0.0_f32; data.len()];
        let mut output = SliceMut::new(&mut restored, size).expect("output slice should build");
        decompress(bytes, &mut output, &serial_options())
    };

    // Truncations: inside the table, inside a payload, inside the border.
    assert!(matches!(
        decode(&stream[..16]),
        Err(CubezipError::InvalidStream(_))
    ));
    assert!(matches!(
        decode(&stream[..stream.len() - 2]),
        Err(CubezipError::InvalidStream(_))
    ));

    // Non-monotonic table.
    let mut bad = stream.clone();
    bad[8..16].copy_from_slice(&1_u64.to_le_bytes());
    assert!(matches!(decode(&bad), Err(CubezipError::InvalidStream(_))));

    // Offset past the end of the stream.
    let mut bad = stream.clone();
    bad[0..8].copy_from_slice(&(stream.len() as u64 + 4096).to_le_bytes());
    assert!(matches!(decode(&bad), Err(CubezipError::InvalidStream(_))));

    // Trailing garbage after the border.
    let mut bad = stream.clone();
    bad.extend_from_slice(&[0, 1, 2, 3]);
    assert!(matches!(decode(&bad), Err(CubezipError::InvalidStream(_))));

    // Stream decoded against the wrong extent.
    let mut restored = vec![0.0_f32; 64 * 64];
    let mut output =
        SliceMut::new(&mut restored, Extent([64_usize, 64])).expect("output slice should build");
    assert!(matches!(
        decompress(&stream, &mut output, &serial_options()),
        Err(CubezipError::InvalidStream(_))
    ));
}

#[test]
fn compress_bound_holds_for_incompressible_bits() {
    // Adversarial input: raw LCG words reinterpreted as floats.
    let mut state = 0x9e37_79b9_u32;
    let data: Vec<f32> = (0..130 * 129)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            f32::from_bits(state)
        })
        .collect();
    let size = Extent([130_usize, 129]);
    roundtrip_f32(&data, size, &serial_options());
    roundtrip_f32(&data, size, &threaded_options());
}
