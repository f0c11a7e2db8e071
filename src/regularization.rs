//! Laplacian regularisation rows appended below the measurement rows.
//!
//! Each active term contributes `lambda * L * x_j` for every coefficient block j, where L is the
//! graph Laplacian of the reconstruction grid (7-point stencil in voxel units, only in-grid
//! neighbours). L is symmetric, so the same kernel serves forward and adjoint products.

use rayon::prelude::*;

const SPATIAL_AXES: [bool; 3] = [true, true, true];
const SLICE_AXES: [bool; 3] = [false, false, true];

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Regularization {
    /// weight of the 3-D spatial Laplacian
    pub spatial: f32,
    /// weight of the Laplacian along the slice direction only
    pub slice: f32,
}

impl Regularization {
    pub fn new(spatial: f32, slice: f32) -> Self {
        Self { spatial, slice }
    }

    /// active terms as (weight, axes), in row-block order
    pub fn terms(&self) -> Vec<(f32, [bool; 3])> {
        [(self.spatial, SPATIAL_AXES), (self.slice, SLICE_AXES)]
            .into_iter()
            .filter(|(w, _)| *w != 0.)
            .collect()
    }

    pub fn n_rows(&self, n_voxels: usize, n_coefs: usize) -> usize {
        self.terms().len() * n_voxels * n_coefs
    }
}

/// dst += alpha * L * x on a single x-fastest volume
pub fn laplacian_acc(size: &[usize; 3], axes: [bool; 3], x: &[f32], alpha: f32, dst: &mut [f32]) {
    let [nx, ny, nz] = *size;
    let nxy = nx * ny;
    assert_eq!(x.len(), nxy * nz, "unexpected source length");
    assert_eq!(dst.len(), x.len(), "unexpected destination length");
    let strides = [1, nx, nxy];

    dst.par_chunks_mut(nxy).enumerate().for_each(|(iz, plane)| {
        plane.iter_mut().enumerate().for_each(|(i, d)| {
            let sub = [i % nx, i / nx, iz];
            let idx = iz * nxy + i;
            let xi = x[idx];
            let mut acc = 0f32;
            for axis in 0..3 {
                if !axes[axis] {
                    continue;
                }
                if sub[axis] > 0 {
                    acc += x[idx - strides[axis]] - xi;
                }
                if sub[axis] + 1 < size[axis] {
                    acc += x[idx + strides[axis]] - xi;
                }
            }
            *d += alpha * acc;
        });
    });
}
