//! Regions: the sub-tensor descriptors copies are expressed in.
//!
//! A region is either a per-axis list of half-open unit-stride intervals
//! (`Span`, trailing axes taken whole) or a row gather along axis 0 where
//! every column of axis 1 picks its own source row (`Gather`). Both flatten
//! into a list of contiguous byte runs over a row-major buffer, which is how
//! every tier moves bytes.

use std::ops::Range;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::{Result, Shape, StratumError};

/// Full-rank per-axis ranges.
pub type Ranges = SmallVec<[Range<usize>; 4]>;

/// Row indices for a gather: `out[r, c, ..] = src[indices[r * cols + c], c, ..]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherIndex {
    indices: Arc<[usize]>,
    rows: usize,
    cols: usize,
}

impl GatherIndex {
    pub fn new(indices: Vec<usize>, rows: usize, cols: usize) -> Result<Self> {
        if indices.len() != rows * cols {
            return Err(StratumError::ShapeMismatch(format!(
                "gather index holds {} entries, expected {rows}x{cols}",
                indices.len()
            )));
        }
        Ok(Self {
            indices: indices.into(),
            rows,
            cols,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Source row selected for output position `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> usize {
        self.indices[row * self.cols + col]
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn validate(&self, shape: &Shape) -> Result<()> {
        if shape.ndim() < 2 {
            return Err(StratumError::ShapeMismatch(format!(
                "gather needs a source of rank >= 2, got {shape}"
            )));
        }
        if self.cols > shape.dims()[1] {
            return Err(StratumError::ShapeMismatch(format!(
                "gather spans {} columns but source {shape} has {}",
                self.cols,
                shape.dims()[1]
            )));
        }
        if let Some(&bad) = self.indices.iter().find(|&&i| i >= shape.dims()[0]) {
            return Err(StratumError::ShapeMismatch(format!(
                "gather row {bad} out of bounds for source {shape}"
            )));
        }
        Ok(())
    }
}

/// A sub-tensor selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    /// Per-axis intervals over the leading axes; remaining axes are whole.
    Span(Ranges),
    /// Row gather along axis 0, one index per (row, column of axis 1).
    Gather(GatherIndex),
}

impl Region {
    pub fn span<I: IntoIterator<Item = Range<usize>>>(ranges: I) -> Self {
        Region::Span(ranges.into_iter().collect())
    }

    pub fn gather(index: GatherIndex) -> Self {
        Region::Gather(index)
    }

    pub fn is_gather(&self) -> bool {
        matches!(self, Region::Gather(_))
    }
}

/// Full-rank ranges selected by `region` over `shape`; `None` selects everything.
///
/// Gather regions have no range form and are rejected.
pub fn full_ranges(region: Option<&Region>, shape: &Shape) -> Result<Ranges> {
    let dims = shape.dims();
    match region {
        None => Ok(dims.iter().map(|&d| 0..d).collect()),
        Some(Region::Span(ranges)) => {
            if ranges.len() > dims.len() {
                return Err(StratumError::ShapeMismatch(format!(
                    "region of rank {} over tensor {shape}",
                    ranges.len()
                )));
            }
            let mut out = Ranges::with_capacity(dims.len());
            for (axis, &dim) in dims.iter().enumerate() {
                let r = ranges.get(axis).cloned().unwrap_or(0..dim);
                if r.start > r.end || r.end > dim {
                    return Err(StratumError::ShapeMismatch(format!(
                        "range {r:?} out of bounds on axis {axis} of {shape}"
                    )));
                }
                out.push(r);
            }
            Ok(out)
        }
        Some(Region::Gather(_)) => Err(StratumError::UnsupportedTierCombination(
            "gather region has no interval form".into(),
        )),
    }
}

/// Shape of the sub-tensor `region` selects from `shape`.
pub fn extent(region: Option<&Region>, shape: &Shape) -> Result<Shape> {
    match region {
        Some(Region::Gather(g)) => {
            g.validate(shape)?;
            let mut dims: Vec<usize> = vec![g.rows(), g.cols()];
            dims.extend_from_slice(&shape.dims()[2..]);
            Ok(Shape::from(dims))
        }
        _ => {
            let ranges = full_ranges(region, shape)?;
            Ok(Shape::from(ranges.iter().map(|r| r.len()).collect::<Vec<_>>()))
        }
    }
}

/// Whether two extents describe the same element layout (size-1 axes ignored).
pub fn check_extents(dst: &Shape, src: &Shape) -> Result<()> {
    if dst.numel() == src.numel() && dst.squeezed() == src.squeezed() {
        Ok(())
    } else {
        Err(StratumError::ShapeMismatch(format!(
            "destination extent {dst} does not match source extent {src}"
        )))
    }
}

/// Intersect `ranges[axis]` with `[start, stop)` and shift it down by `base`.
///
/// Returns `None` when the intersection is empty. Pass `base = 0` to keep
/// the original coordinates.
pub fn cut_indices(
    ranges: &[Range<usize>],
    axis: usize,
    start: usize,
    stop: usize,
    base: usize,
) -> Option<Ranges> {
    let r = &ranges[axis];
    let lo = r.start.max(start);
    let hi = r.end.min(stop);
    if lo >= hi {
        return None;
    }
    debug_assert!(base <= lo);
    let mut out: Ranges = ranges.iter().cloned().collect();
    out[axis] = (lo - base)..(hi - base);
    Some(out)
}

/// Contiguous `(byte_offset, byte_len)` runs covering `region`, in row-major
/// order of the region's extent.
pub fn byte_runs(
    region: Option<&Region>,
    shape: &Shape,
    elem_size: usize,
) -> Result<Vec<(usize, usize)>> {
    let strides = shape.contiguous_strides();
    match region {
        Some(Region::Gather(g)) => {
            g.validate(shape)?;
            let row_bytes = strides[0] * elem_size;
            let col_bytes = strides[1] * elem_size;
            let mut runs = Vec::with_capacity(g.rows() * g.cols());
            for r in 0..g.rows() {
                for c in 0..g.cols() {
                    runs.push((g.get(r, c) * row_bytes + c * col_bytes, col_bytes));
                }
            }
            Ok(runs)
        }
        _ => {
            let ranges = full_ranges(region, shape)?;
            Ok(span_runs(&ranges, shape.dims(), &strides, elem_size))
        }
    }
}

fn span_runs(
    ranges: &[Range<usize>],
    dims: &[usize],
    strides: &[usize],
    elem_size: usize,
) -> Vec<(usize, usize)> {
    let ndim = dims.len();
    if ndim == 0 {
        return vec![(0, elem_size)];
    }
    if ranges.iter().any(|r| r.is_empty()) {
        return Vec::new();
    }

    // Axes after `inner` are whole, so everything from `inner` on is one block.
    let mut inner = ndim - 1;
    while inner > 0 && ranges[inner] == (0..dims[inner]) {
        inner -= 1;
    }
    let block = ranges[inner].len() * strides[inner] * elem_size;
    let outer = &ranges[..inner];
    let mut idx: SmallVec<[usize; 4]> = outer.iter().map(|r| r.start).collect();

    let mut runs: Vec<(usize, usize)> = Vec::new();
    loop {
        let elem_off: usize = idx
            .iter()
            .zip(strides)
            .map(|(i, s)| i * s)
            .sum::<usize>()
            + ranges[inner].start * strides[inner];
        let off = elem_off * elem_size;
        match runs.last_mut() {
            Some(last) if last.0 + last.1 == off => last.1 += block,
            _ => runs.push((off, block)),
        }

        let mut axis = inner;
        loop {
            if axis == 0 {
                return runs;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < outer[axis].end {
                break;
            }
            idx[axis] = outer[axis].start;
        }
    }
}

/// Total number of bytes covered by `runs`.
pub fn run_bytes(runs: &[(usize, usize)]) -> usize {
    runs.iter().map(|r| r.1).sum()
}

fn check_bounds(runs: &[(usize, usize)], len: usize, side: &str) -> Result<()> {
    match runs.iter().map(|r| r.0 + r.1).max() {
        Some(end) if end > len => Err(StratumError::Format(format!(
            "{side} run ends at byte {end} past buffer of {len} bytes"
        ))),
        _ => Ok(()),
    }
}

/// Stream bytes from `src` runs into `dst` runs.
pub fn copy_runs(
    dst: &mut [u8],
    dst_runs: &[(usize, usize)],
    src: &[u8],
    src_runs: &[(usize, usize)],
) -> Result<()> {
    let total = run_bytes(src_runs);
    if total != run_bytes(dst_runs) {
        return Err(StratumError::ShapeMismatch(format!(
            "copy moves {total} bytes into {} bytes",
            run_bytes(dst_runs)
        )));
    }
    check_bounds(src_runs, src.len(), "source")?;
    check_bounds(dst_runs, dst.len(), "destination")?;

    let mut di = 0;
    let mut dpos = 0;
    for &(soff, slen) in src_runs {
        let mut done = 0;
        while done < slen {
            while dst_runs[di].1 == dpos {
                di += 1;
                dpos = 0;
            }
            let (doff, dlen) = dst_runs[di];
            let n = (dlen - dpos).min(slen - done);
            dst[doff + dpos..doff + dpos + n].copy_from_slice(&src[soff + done..soff + done + n]);
            done += n;
            dpos += n;
        }
    }
    Ok(())
}

/// Gather `runs` of `src` into the front of `out`; returns bytes written.
pub fn pack_runs(src: &[u8], runs: &[(usize, usize)], out: &mut [u8]) -> Result<usize> {
    check_bounds(runs, src.len(), "source")?;
    let total = run_bytes(runs);
    if total > out.len() {
        return Err(StratumError::Allocation(format!(
            "staging {total} bytes exceeds buffer of {} bytes",
            out.len()
        )));
    }
    let mut pos = 0;
    for &(off, len) in runs {
        out[pos..pos + len].copy_from_slice(&src[off..off + len]);
        pos += len;
    }
    Ok(pos)
}

/// Scatter the packed bytes of `packed` into `runs` of `dst`.
pub fn unpack_runs(dst: &mut [u8], runs: &[(usize, usize)], packed: &[u8]) -> Result<()> {
    if run_bytes(runs) != packed.len() {
        return Err(StratumError::ShapeMismatch(format!(
            "scatter of {} bytes into {} bytes",
            packed.len(),
            run_bytes(runs)
        )));
    }
    check_bounds(runs, dst.len(), "destination")?;
    let mut pos = 0;
    for &(off, len) in runs {
        dst[off..off + len].copy_from_slice(&packed[pos..pos + len]);
        pos += len;
    }
    Ok(())
}
