//! Per-slice resampling matrices mapping the reconstruction grid onto one acquired slice.
//!
//! Row i = y * nx + x of the matrix for slice z is the slice voxel (x, y). For every through-slice
//! offset s of the slice profile, the point (x, y, z + s) is mapped into reconstruction voxel
//! space and spread over the interpolation kernel's neighbourhood. Neighbours that fall outside
//! the reconstruction grid are dropped, so slices near the volume edges lose some weight.

use crate::array_utils::checked_index_col_maj3;
use crate::psf::{InterpKernel, SliceProfile};
use crate::transform::{GridHeader, SliceTransform};
use nalgebra::Vector3;
use std::ops::Range;

/// Sparse row-major (CSR) slice matrix with nxy rows and nxyz columns.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceMatrix {
    n_cols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f32>,
}

impl SliceMatrix {
    pub fn n_rows(&self) -> usize {
        self.row_ptr.len() - 1
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn row(&self, i: usize) -> (&[usize], &[f32]) {
        let r = self.row_ptr[i]..self.row_ptr[i + 1];
        (&self.col_idx[r.clone()], &self.values[r])
    }

    /// range of columns holding at least one entry
    pub fn col_span(&self) -> Range<usize> {
        match (self.col_idx.iter().min(), self.col_idx.iter().max()) {
            (Some(&lo), Some(&hi)) => lo..(hi + 1),
            _ => 0..0,
        }
    }

    /// M^T * y, restricted to `col_span()`. Returns the span and the compact result.
    pub fn transpose_mul(&self, y: &[f32]) -> (Range<usize>, Vec<f32>) {
        assert_eq!(y.len(), self.n_rows(), "unexpected source length");
        let span = self.col_span();
        let mut out = vec![0f32; span.len()];
        y.iter().enumerate().filter(|(_, &yi)| yi != 0.).for_each(|(i, &yi)| {
            let (cols, vals) = self.row(i);
            cols.iter().zip(vals).for_each(|(&c, &v)| out[c - span.start] += v * yi);
        });
        (span, out)
    }

    #[cfg(test)]
    pub fn to_dense(&self) -> ndarray::Array2<f32> {
        let mut d = ndarray::Array2::zeros((self.n_rows(), self.n_cols));
        for i in 0..self.n_rows() {
            let (cols, vals) = self.row(i);
            cols.iter().zip(vals).for_each(|(&c, &v)| d[[i, c]] += v);
        }
        d
    }
}

/// Builds slice matrices from the grid geometry, slice profile and interpolation kernel.
#[derive(Debug, Clone)]
pub struct SliceResampler {
    header: GridHeader,
    ssp: SliceProfile,
    kernel: InterpKernel,
}

impl SliceResampler {
    pub fn new(header: GridHeader, ssp: SliceProfile, kernel: InterpKernel) -> Self {
        Self { header, ssp, kernel }
    }

    /// entries generated per row before merging duplicate columns
    fn row_capacity(&self) -> usize {
        let n = self.kernel.half_width() as usize;
        let h = self.ssp.half_width() as usize;
        (2 * h + 1) * 8 * n * n * n
    }

    /// resampling matrix for slice z acquired with the given slice-to-reconstruction transform
    pub fn slice_matrix(&self, transform: &SliceTransform, z: usize) -> SliceMatrix {
        let size = self.header.size;
        let [nx, ny, _] = size;
        let n = self.kernel.half_width() as i64;
        let h = self.ssp.half_width();

        // slice positions whose reconstruction coordinate is further than the kernel reach from the
        // grid contribute nothing, so a slice moved out of the volume gives an empty matrix
        let (z_lo, z_hi) = transform.slice_z_range(&size, n as f64 + 0.5);
        let reaches_grid = (-h..=h).any(|s| {
            let zs = (z as i32 + s) as f64;
            self.ssp.weight(s) != 0. && zs >= z_lo && zs <= z_hi
        });
        if !reaches_grid {
            return SliceMatrix { n_cols: self.header.n_voxels(), row_ptr: vec![0; nx * ny + 1], col_idx: vec![], values: vec![] };
        }

        let mut row_ptr = Vec::with_capacity(nx * ny + 1);
        let mut col_idx = Vec::with_capacity(nx * ny * 8 * (n * n * n) as usize);
        let mut values = Vec::with_capacity(col_idx.capacity());
        row_ptr.push(0);

        let mut entries: Vec<(usize, f32)> = Vec::with_capacity(self.row_capacity());

        for y in 0..ny {
            for x in 0..nx {
                entries.clear();
                for s in -h..=h {
                    let w_s = self.ssp.weight(s);
                    if w_s == 0. {
                        continue;
                    }
                    let ps = Vector3::new(x as f64, y as f64, z as f64 + s as f64);
                    let pr = transform.to_recon(&ps).map(|c| c as f32);
                    let base = pr.map(|c| c.ceil() as i64);
                    for rz in -n..n {
                        for ry in -n..n {
                            for rx in -n..n {
                                let p = [base[0] + rx, base[1] + ry, base[2] + rz];
                                if let Some(idx) = checked_index_col_maj3(&p, &size) {
                                    let d = [pr[0] - p[0] as f32, pr[1] - p[1] as f32, pr[2] - p[2] as f32];
                                    let w = w_s * self.kernel.weight(&d);
                                    if w != 0. {
                                        entries.push((idx, w));
                                    }
                                }
                            }
                        }
                    }
                }
                // merge duplicate columns
                entries.sort_unstable_by_key(|e| e.0);
                let mut last: Option<usize> = None;
                for &(c, w) in &entries {
                    if last == Some(c) {
                        *values.last_mut().expect("entry exists") += w;
                    } else {
                        col_idx.push(c);
                        values.push(w);
                        last = Some(c);
                    }
                }
                row_ptr.push(values.len());
            }
        }

        SliceMatrix { n_cols: self.header.n_voxels(), row_ptr, col_idx, values }
    }
}
