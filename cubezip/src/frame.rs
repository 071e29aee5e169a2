use super::*;

pub(crate) const OFFSET_ENTRY_BYTES: usize = 8;

// Grid arithmetic for one array: which hypercubes exist, where they start,
// and which elements are left over as the border region. A hypercube is only
// emitted for a fully covered region; the border holds the remainder
// verbatim.
pub(crate) struct FileLayout<const D: usize> {
    size: Extent<D>,
    grid: [usize; D],
    num_hypercubes: usize,
    num_elements: usize,
    table_bytes: usize,
    side: usize,
}

impl<const D: usize> FileLayout<D> {
    pub(crate) fn new(size: Extent<D>) -> Result<Self, CubezipError> {
        let num_elements = validate_extent(&size)?;
        let side = side_length(D);
        debug_assert_eq!(cube::ipow(side, D as u32), HYPERCUBE_ELEMENTS);
        let mut grid = [0_usize; D];
        let mut num_hypercubes = 1_usize;
        for k in 0..D {
            grid[k] = size.0[k] / side;
            num_hypercubes *= grid[k];
        }
        let table_bytes = num_hypercubes
            .checked_mul(OFFSET_ENTRY_BYTES)
            .ok_or(CubezipError::DataTooLarge)?;
        Ok(Self {
            size,
            grid,
            num_hypercubes,
            num_elements,
            table_bytes,
            side,
        })
    }

    pub(crate) fn size(&self) -> Extent<D> {
        self.size
    }

    pub(crate) fn grid(&self) -> &[usize; D] {
        &self.grid
    }

    pub(crate) fn side(&self) -> usize {
        self.side
    }

    pub(crate) fn num_hypercubes(&self) -> usize {
        self.num_hypercubes
    }

    pub(crate) fn num_elements(&self) -> usize {
        self.num_elements
    }

    pub(crate) fn table_bytes(&self) -> usize {
        self.table_bytes
    }

    pub(crate) fn num_border_elements(&self) -> usize {
        self.num_elements - self.num_hypercubes * HYPERCUBE_ELEMENTS
    }

    // First-major decomposition of the hypercube index over the grid, scaled
    // to element coordinates.
    pub(crate) fn hypercube_origin(&self, hc_index: usize) -> [usize; D] {
        let mut origin = [0_usize; D];
        let mut rem = hc_index;
        for k in (0..D).rev() {
            origin[k] = (rem % self.grid[k]) * self.side;
            rem /= self.grid[k];
        }
        origin
    }

    // Visits the border as (linear_start, len) runs of innermost-axis
    // elements, in first-major order. A row whose outer coordinates fall
    // outside the covered grid is border in full; a covered row contributes
    // its tail beyond the last whole hypercube.
    pub(crate) fn for_each_border_run(&self, mut f: impl FnMut(usize, usize)) {
        let size = self.size.0;
        let outer_dims = D.saturating_sub(1);
        let covered_last = self.grid[D - 1] * self.side;
        let last = size[D - 1];
        let rows: usize = size[..outer_dims].iter().product();
        let mut coords = [0_usize; D];
        for _ in 0..rows {
            let mut outer_covered = true;
            for k in 0..outer_dims {
                if coords[k] >= self.grid[k] * self.side {
                    outer_covered = false;
                    break;
                }
            }
            let mut row_base = 0_usize;
            for k in 0..D {
                let c = if k < outer_dims { coords[k] } else { 0 };
                row_base = row_base * size[k] + c;
            }
            if outer_covered {
                if covered_last < last {
                    f(row_base + covered_last, last - covered_last);
                }
            } else {
                f(row_base, last);
            }
            for k in (0..outer_dims).rev() {
                coords[k] += 1;
                if coords[k] < size[k] {
                    break;
                }
                coords[k] = 0;
            }
        }
    }
}

// Appends the uncovered remainder of the array to the stream, bit-cast to
// little-endian words in first-major order.
pub(crate) fn write_border<T: CubeFloat, const D: usize>(
    layout: &FileLayout<D>,
    input: &Slice<'_, T, D>,
    out: &mut Vec<u8>,
) {
    let data = input.data();
    layout.for_each_border_run(|start, len| {
        for idx in start..start + len {
            data[idx].to_bits().write_le(out);
        }
    });
}

// Reads the border region starting at `border_start` back into the output
// slice. The caller has already validated the region length against the
// layout (see `parse_offsets`).
pub(crate) fn read_border<T: CubeFloat, const D: usize>(
    layout: &FileLayout<D>,
    stream: &[u8],
    border_start: usize,
    output: &mut SliceMut<'_, T, D>,
) -> Result<(), CubezipError> {
    let word_bytes = T::Bits::WORD_BYTES;
    let expected = layout.num_border_elements() * word_bytes;
    if stream.len() < border_start || stream.len() - border_start != expected {
        return Err(CubezipError::InvalidStream("border length mismatch"));
    }
    let data = output.data_mut();
    let mut pos = border_start;
    layout.for_each_border_run(|start, len| {
        for idx in start..start + len {
            data[idx] = T::from_bits(T::Bits::read_le(&stream[pos..]));
            pos += word_bytes;
        }
    });
    Ok(())
}

// Recovers the logical offsets array from the stored table. The stored table
// holds one u64 per hypercube: the end of that hypercube's payload, measured
// from the start of the stream. The first payload implicitly begins right
// after the table, so the returned vector has num_hc + 1 entries and the
// last one is the border start.
pub(crate) fn parse_offsets<const D: usize>(
    stream: &[u8],
    layout: &FileLayout<D>,
    word_bytes: usize,
) -> Result<Vec<u64>, CubezipError> {
    let num_hc = layout.num_hypercubes();
    let table_bytes = layout.table_bytes();
    if stream.len() < table_bytes {
        return Err(CubezipError::InvalidStream(
            "stream shorter than its offset table",
        ));
    }
    let min_payload = (HYPERCUBE_ELEMENTS / (word_bytes * 8)) * word_bytes;

    let mut offsets = Vec::with_capacity(num_hc + 1);
    offsets.push(table_bytes as u64);
    let mut prev = table_bytes as u64;
    for i in 0..num_hc {
        let at = i * OFFSET_ENTRY_BYTES;
        let mut raw = [0_u8; OFFSET_ENTRY_BYTES];
        raw.copy_from_slice(&stream[at..at + OFFSET_ENTRY_BYTES]);
        let end = u64::from_le_bytes(raw);
        if end <= prev {
            return Err(CubezipError::InvalidStream("offset table is not monotonic"));
        }
        if end > stream.len() as u64 {
            return Err(CubezipError::InvalidStream(
                "offset table entry points past the stream",
            ));
        }
        let payload_len = end - prev;
        if payload_len % word_bytes as u64 != 0 {
            return Err(CubezipError::InvalidStream(
                "hypercube payload is not word aligned",
            ));
        }
        if payload_len < min_payload as u64 {
            return Err(CubezipError::InvalidStream(
                "hypercube payload shorter than its chunk headers",
            ));
        }
        offsets.push(end);
        prev = end;
    }

    let border_bytes = layout.num_border_elements() as u64 * word_bytes as u64;
    if stream.len() as u64 - prev != border_bytes {
        return Err(CubezipError::InvalidStream("border length mismatch"));
    }
    Ok(offsets)
}

// Assembles the final stream from per-hypercube payloads: offset table,
// payload concatenation, border. Byte-identical to the serial encoder's
// in-place construction.
pub(crate) fn build_stream<T: CubeFloat, const D: usize>(
    layout: &FileLayout<D>,
    payloads: &[Vec<u8>],
    input: &Slice<'_, T, D>,
) -> Result<Vec<u8>, CubezipError> {
    let table_bytes = layout.table_bytes();
    let mut payload_bytes = 0_usize;
    for payload in payloads {
        payload_bytes = payload_bytes
            .checked_add(payload.len())
            .ok_or(CubezipError::DataTooLarge)?;
    }
    let border_bytes = layout
        .num_border_elements()
        .checked_mul(T::Bits::WORD_BYTES)
        .ok_or(CubezipError::DataTooLarge)?;
    let total = table_bytes
        .checked_add(payload_bytes)
        .and_then(|v| v.checked_add(border_bytes))
        .ok_or(CubezipError::DataTooLarge)?;

    let mut out = Vec::with_capacity(total);
    let mut end = table_bytes as u64;
    for payload in payloads {
        end += payload.len() as u64;
        out.extend_from_slice(&end.to_le_bytes());
    }
    for payload in payloads {
        out.extend_from_slice(payload);
    }
    write_border(layout, input, &mut out);
    Ok(out)
}
