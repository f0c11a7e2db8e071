//! Matrix-free reconstruction operator.
//!
//! Columns hold nc coefficient blocks of nxyz voxels each (block j at j * nxyz). Rows hold the
//! acquired slices (acquisition a at a * nxy) followed by the regularisation rows, one nxyz block
//! per (term, coefficient). Nothing is materialised beyond the optional slice-matrix cache.

use crate::array_utils::{dot, to_col_maj_vec};
use crate::basis::{QSpaceBasis, RadialBasis};
use crate::error::{ReconError, Result};
use crate::layout::AcquisitionLayout;
use crate::psf::{InterpKernel, SliceProfile};
use crate::regularization::{laplacian_acc, Regularization};
use crate::resample::{SliceMatrix, SliceResampler};
use crate::shells::Shells;
use crate::transform::{pose, GridHeader, SliceTransform};
use ndarray::{Array2, ArrayView2, ArrayView4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::borrow::Cow;
use std::ops::Range;
use tracing::{debug, info};

pub const DEFAULT_ADJOINT_BATCH_SIZE: usize = 64;

/// A linear map given only by its action. Both products accumulate into `dst`.
pub trait LinearOperator: Sync {
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;
    /// dst += A * src
    fn apply(&self, src: &[f32], dst: &mut [f32]);
    /// dst += A^T * src
    fn apply_adjoint(&self, src: &[f32], dst: &mut [f32]);
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub lmax: Option<usize>,
    pub ssp: SliceProfile,
    pub kernel: InterpKernel,
    pub regularization: Regularization,
    pub cache_slice_matrices: bool,
    pub adjoint_batch_size: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            lmax: None,
            ssp: SliceProfile::default(),
            kernel: InterpKernel::default(),
            regularization: Regularization::default(),
            cache_slice_matrices: false,
            adjoint_batch_size: DEFAULT_ADJOINT_BATCH_SIZE,
        }
    }
}

/// compact M^T y of one acquisition and its angular coefficients
struct AdjointPartial {
    span: Range<usize>,
    values: Vec<f32>,
    coefs: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ReconMatrix {
    layout: AcquisitionLayout,
    basis: QSpaceBasis,
    resampler: SliceResampler,
    transforms: Vec<SliceTransform>,
    slice_weights: Array2<f32>,
    voxel_weights: Option<Vec<f32>>,
    regularization: Regularization,
    cache: Option<Vec<SliceMatrix>>,
    adjoint_batch_size: usize,
}

impl ReconMatrix {
    /// `grad` holds one gradient direction per volume in its first three columns. Without a motion
    /// table every acquisition is taken to be at rest.
    pub fn new(
        header: GridHeader,
        n_vols: usize,
        grad: &ArrayView2<f32>,
        shells: &Shells,
        motion: Option<ArrayView2<f32>>,
        rf: &[RadialBasis],
        config: &OperatorConfig,
    ) -> Result<Self> {
        let motion = motion.map_or_else(|| Array2::zeros((n_vols, 6)), |m| m.to_owned());
        if motion.ncols() != 6 {
            return Err(ReconError::MotionColumns(motion.ncols()));
        }
        if grad.nrows() != n_vols {
            return Err(ReconError::GradientRows { expected: n_vols, found: grad.nrows() });
        }
        if grad.ncols() < 3 {
            return Err(ReconError::GradientColumns { expected: "at least 3 (x y z)", found: grad.ncols() });
        }
        if let Some(row) = motion.rows().into_iter().position(|r| r.iter().any(|p| !p.is_finite())) {
            return Err(ReconError::MotionNonFinite(row));
        }
        if shells.volume_count() != n_vols {
            return Err(ReconError::GradientRows { expected: n_vols, found: shells.volume_count() });
        }
        if config.adjoint_batch_size == 0 {
            return Err(ReconError::Parameter("adjoint batch size must be positive".to_string()));
        }

        let layout = AcquisitionLayout::new(header.size, n_vols, motion.nrows(), shells.shell_index())?;
        debug!("motion granularity: {:?}", layout.granularity());

        info!("building angular basis ...");
        let basis = QSpaceBasis::new(&layout, grad, &motion.view(), shells.count(), config.lmax, rf)?;
        info!("lmax = {}, {} coefficients per voxel", basis.lmax(), basis.n_coefs());

        let transforms = (0..layout.n_acquisitions())
            .map(|a| {
                let (v, z) = layout.acquisition(a);
                SliceTransform::new(&header, &pose(&motion.view(), layout.motion_row(v, z)))
            })
            .collect();

        let slice_weights = Array2::ones((layout.n_slices(), n_vols));
        let resampler = SliceResampler::new(header, config.ssp, config.kernel);

        let mut op = Self {
            layout,
            basis,
            resampler,
            transforms,
            slice_weights,
            voxel_weights: None,
            regularization: config.regularization,
            cache: None,
            adjoint_batch_size: config.adjoint_batch_size,
        };

        if config.cache_slice_matrices {
            info!("caching {} slice matrices ...", op.layout.n_acquisitions());
            let cache: Vec<SliceMatrix> =
                (0..op.layout.n_acquisitions()).into_par_iter().map(|a| op.build_slice_matrix(a)).collect();
            let nnz: usize = cache.iter().map(|m| m.nnz()).sum();
            debug!("slice matrix cache holds {} non-zeros", nnz);
            op.cache = Some(cache);
        }

        Ok(op)
    }

    /// per-slice weights W with shape (nz, nv); W[z, v] scales every row of acquisition (v, z)
    pub fn with_slice_weights(mut self, weights: Array2<f32>) -> Result<Self> {
        let (nz, nv) = (self.layout.n_slices(), self.layout.n_vols());
        if weights.dim() != (nz, nv) {
            return Err(ReconError::WeightShape {
                expected_rows: nz,
                expected_cols: nv,
                rows: weights.nrows(),
                cols: weights.ncols(),
            });
        }
        let excluded = weights.iter().filter(|&&w| w == 0.).count();
        if excluded > 0 {
            debug!("{} of {} slices carry zero weight", excluded, weights.len());
        }
        self.slice_weights = weights;
        Ok(self)
    }

    /// per-voxel weights with shape (nx, ny, nz, nv)
    pub fn with_voxel_weights(mut self, weights: ArrayView4<f32>) -> Result<Self> {
        let [nx, ny, nz] = self.layout.size();
        let expected = vec![nx, ny, nz, self.layout.n_vols()];
        if weights.shape() != expected.as_slice() {
            return Err(ReconError::VoxelWeightShape { expected, found: weights.shape().to_vec() });
        }
        self.voxel_weights = Some(to_col_maj_vec(&weights));
        Ok(self)
    }

    pub fn basis(&self) -> &QSpaceBasis {
        &self.basis
    }

    pub fn n_coefs(&self) -> usize {
        self.basis.n_coefs()
    }

    pub fn n_measurements(&self) -> usize {
        self.layout.n_measurements()
    }

    pub fn adjoint(&self) -> ReconMatrixAdjoint<'_> {
        ReconMatrixAdjoint { op: self }
    }

    fn build_slice_matrix(&self, a: usize) -> SliceMatrix {
        let (_, z) = self.layout.acquisition(a);
        self.resampler.slice_matrix(&self.transforms[a], z)
    }

    fn slice_matrix(&self, a: usize) -> Cow<'_, SliceMatrix> {
        match &self.cache {
            Some(cache) => Cow::Borrowed(&cache[a]),
            None => Cow::Owned(self.build_slice_matrix(a)),
        }
    }

    #[inline]
    fn slice_weight(&self, a: usize) -> f32 {
        let (v, z) = self.layout.acquisition(a);
        self.slice_weights[[z, v]]
    }

    fn voxel_weights(&self, a: usize) -> Option<&[f32]> {
        let nxy = self.layout.n_slice_voxels();
        self.voxel_weights.as_ref().map(|w| &w[a * nxy..(a + 1) * nxy])
    }

    /// dst += scale * Y_a (M_a x), optionally weighted per voxel
    fn forward_acquisition(&self, a: usize, src: &[f32], scale: f32, voxel_weights: Option<&[f32]>, dst: &mut [f32]) {
        let nxyz = self.layout.n_voxels();
        let coefs: Vec<f32> = self.basis.row(a).iter().map(|&y| scale * y).collect();
        let m = self.slice_matrix(a);
        dst.iter_mut().enumerate().for_each(|(i, d)| {
            let (cols, vals) = m.row(i);
            let acc: f32 = cols
                .iter()
                .zip(vals)
                .map(|(&c, &v)| v * coefs.iter().enumerate().map(|(j, &cj)| cj * src[j * nxyz + c]).sum::<f32>())
                .sum();
            *d += voxel_weights.map_or(acc, |w| w[i] * acc);
        });
    }

    fn adjoint_partial(&self, a: usize, y: &[f32]) -> Option<AdjointPartial> {
        let w = self.slice_weight(a);
        if w == 0. {
            return None;
        }
        let y: Cow<[f32]> = match self.voxel_weights(a) {
            Some(vw) => Cow::Owned(y.iter().zip(vw).map(|(y, w)| y * w).collect()),
            None => Cow::Borrowed(y),
        };
        let (span, values) = self.slice_matrix(a).transpose_mul(&y);
        let coefs = self.basis.row(a).iter().map(|&c| w * c).collect();
        Some(AdjointPartial { span, values, coefs })
    }

    fn forward_measurements(&self, src: &[f32], dst: &mut [f32]) {
        let nxy = self.layout.n_slice_voxels();
        dst.par_chunks_mut(nxy).enumerate().for_each(|(a, d)| {
            let w = self.slice_weight(a);
            if w != 0. {
                self.forward_acquisition(a, src, w, self.voxel_weights(a), d);
            }
        });
    }

    /// Acquisitions are processed in batches. The partial products of a batch are computed in
    /// parallel, then summed into dst over disjoint chunks in acquisition order, so the result does
    /// not depend on the number of threads.
    fn adjoint_measurements(&self, src: &[f32], dst: &mut [f32]) {
        let nxy = self.layout.n_slice_voxels();
        let nz = self.layout.n_slices();
        let n_acq = self.layout.n_acquisitions();

        for start in (0..n_acq).step_by(self.adjoint_batch_size) {
            let end = (start + self.adjoint_batch_size).min(n_acq);
            let partials: Vec<AdjointPartial> = (start..end)
                .into_par_iter()
                .filter_map(|a| self.adjoint_partial(a, &src[a * nxy..(a + 1) * nxy]))
                .collect();
            if partials.is_empty() {
                continue;
            }
            // one chunk per (coefficient, slice plane)
            dst.par_chunks_mut(nxy).enumerate().for_each(|(chunk, out)| {
                let j = chunk / nz;
                let lo = (chunk % nz) * nxy;
                let hi = lo + nxy;
                for p in &partials {
                    let cj = p.coefs[j];
                    let s = p.span.start.max(lo);
                    let e = p.span.end.min(hi);
                    if cj == 0. || s >= e {
                        continue;
                    }
                    let r = &p.values[(s - p.span.start)..(e - p.span.start)];
                    out[(s - lo)..(e - lo)].iter_mut().zip(r).for_each(|(d, &r)| *d += cj * r);
                }
            });
        }
    }

    fn forward_regularization(&self, src: &[f32], dst: &mut [f32]) {
        let nxyz = self.layout.n_voxels();
        let nc = self.n_coefs();
        let size = self.layout.size();
        for (t, (lambda, axes)) in self.regularization.terms().into_iter().enumerate() {
            for j in 0..nc {
                let block = (t * nc + j) * nxyz;
                laplacian_acc(&size, axes, &src[j * nxyz..(j + 1) * nxyz], lambda, &mut dst[block..block + nxyz]);
            }
        }
    }

    fn adjoint_regularization(&self, src: &[f32], dst: &mut [f32]) {
        let nxyz = self.layout.n_voxels();
        let nc = self.n_coefs();
        let size = self.layout.size();
        for (t, (lambda, axes)) in self.regularization.terms().into_iter().enumerate() {
            for j in 0..nc {
                let block = (t * nc + j) * nxyz;
                laplacian_acc(&size, axes, &src[block..block + nxyz], lambda, &mut dst[j * nxyz..(j + 1) * nxyz]);
            }
        }
    }

    /// Right-hand side matching the operator's weighting: the acquired data scaled by the slice
    /// and voxel weights, followed by zeros for the regularisation rows.
    pub fn weighted_rhs(&self, data: &[f32]) -> Vec<f32> {
        let nxy = self.layout.n_slice_voxels();
        assert_eq!(data.len(), self.n_measurements(), "unexpected data length");
        let mut rhs = vec![0f32; self.rows()];
        rhs[..self.n_measurements()].par_chunks_mut(nxy).enumerate().for_each(|(a, d)| {
            let w = self.slice_weight(a);
            let y = &data[a * nxy..(a + 1) * nxy];
            match self.voxel_weights(a) {
                Some(vw) => d.iter_mut().zip(y).zip(vw).for_each(|((d, y), vw)| *d = w * vw * y),
                None => d.iter_mut().zip(y).for_each(|(d, y)| *d = w * y),
            }
        });
        rhs
    }

    /// Projects coefficients back into acquired-slice space with unit weights. Slices excluded by a
    /// zero weight are left at zero unless `complete` is set.
    pub fn predict(&self, x: &[f32], complete: bool) -> Vec<f32> {
        assert_eq!(x.len(), self.cols(), "unexpected coefficient length");
        let nxy = self.layout.n_slice_voxels();
        let mut out = vec![0f32; self.n_measurements()];
        out.par_chunks_mut(nxy).enumerate().for_each(|(a, d)| {
            if complete || self.slice_weight(a) != 0. {
                self.forward_acquisition(a, x, 1., None, d);
            }
        });
        out
    }

    /// |<Ax, y> - <x, A^T y>| / max(1, |<Ax, y>|) for random x and y
    pub fn adjoint_mismatch(&self, seed: u64) -> f64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let x: Vec<f32> = (0..self.cols()).map(|_| rng.random_range(-1f32..1f32)).collect();
        let y: Vec<f32> = (0..self.rows()).map(|_| rng.random_range(-1f32..1f32)).collect();
        let mut ax = vec![0f32; self.rows()];
        let mut aty = vec![0f32; self.cols()];
        self.apply(&x, &mut ax);
        self.apply_adjoint(&y, &mut aty);
        let lhs = dot(&ax, &y);
        let rhs = dot(&x, &aty);
        (lhs - rhs).abs() / lhs.abs().max(1.)
    }
}

impl LinearOperator for ReconMatrix {
    fn rows(&self) -> usize {
        self.n_measurements() + self.regularization.n_rows(self.layout.n_voxels(), self.n_coefs())
    }

    fn cols(&self) -> usize {
        self.layout.n_voxels() * self.n_coefs()
    }

    fn apply(&self, src: &[f32], dst: &mut [f32]) {
        assert_eq!(src.len(), self.cols(), "unexpected source length");
        assert_eq!(dst.len(), self.rows(), "unexpected destination length");
        let (meas, reg) = dst.split_at_mut(self.n_measurements());
        self.forward_measurements(src, meas);
        self.forward_regularization(src, reg);
    }

    fn apply_adjoint(&self, src: &[f32], dst: &mut [f32]) {
        assert_eq!(src.len(), self.rows(), "unexpected source length");
        assert_eq!(dst.len(), self.cols(), "unexpected destination length");
        let (meas, reg) = src.split_at(self.n_measurements());
        self.adjoint_measurements(meas, dst);
        self.adjoint_regularization(reg, dst);
    }
}

/// Transposed view of a [`ReconMatrix`].
#[derive(Debug, Clone, Copy)]
pub struct ReconMatrixAdjoint<'a> {
    op: &'a ReconMatrix,
}

impl ReconMatrixAdjoint<'_> {
    pub fn adjoint(&self) -> &ReconMatrix {
        self.op
    }
}

impl LinearOperator for ReconMatrixAdjoint<'_> {
    fn rows(&self) -> usize {
        self.op.cols()
    }

    fn cols(&self) -> usize {
        self.op.rows()
    }

    fn apply(&self, src: &[f32], dst: &mut [f32]) {
        self.op.apply_adjoint(src, dst)
    }

    fn apply_adjoint(&self, src: &[f32], dst: &mut [f32]) {
        self.op.apply(src, dst)
    }
}
