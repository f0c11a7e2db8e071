//! Angular (q-space) basis: maps reconstruction coefficients to the signal measured along each
//! acquisition's motion-rotated gradient direction.

use crate::error::{ReconError, Result};
use crate::layout::AcquisitionLayout;
use crate::sh;
use crate::transform::{pose, rotate, SliceTransform};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use tracing::debug;

pub const DEFAULT_LMAX: usize = 4;

/// Multi-shell radial basis: one row per shell, one column per even SH band (l = 0, 2, 4, ..).
#[derive(Debug, Clone, PartialEq)]
pub struct RadialBasis {
    pub name: String,
    pub matrix: Array2<f32>,
}

impl RadialBasis {
    pub fn new(name: impl Into<String>, matrix: Array2<f32>) -> Self {
        Self { name: name.into(), matrix }
    }

    pub fn n_bands(&self) -> usize {
        self.matrix.ncols()
    }

    /// highest SH order this basis function supports
    pub fn max_order(&self) -> usize {
        2 * (self.n_bands() - 1)
    }
}

/// Resolves the maximum harmonic order. With radial bases, lmax is clamped to the highest order any
/// basis supports, and further capped by the caller's request.
pub fn resolve_lmax(requested: Option<usize>, rf: &[RadialBasis]) -> Result<usize> {
    if let Some(l) = requested {
        if l % 2 != 0 {
            return Err(ReconError::Parameter(format!("lmax must be even, got {l}")));
        }
    }
    for r in rf {
        if r.n_bands() == 0 {
            return Err(ReconError::RadialBasisEmpty(r.name.clone()));
        }
    }
    let lmax = if rf.is_empty() {
        requested.unwrap_or(DEFAULT_LMAX)
    } else {
        let basis_lmax = rf.iter().map(|r| r.max_order()).max().unwrap_or(0);
        requested.map_or(basis_lmax, |l| l.min(basis_lmax))
    };
    Ok(lmax)
}

/// total number of angular coefficients per voxel
pub fn n_coefs(lmax: usize, rf: &[RadialBasis]) -> usize {
    if rf.is_empty() {
        sh::n_for_l(lmax)
    } else {
        rf.iter().map(|r| sh::n_for_l(r.max_order().min(lmax))).sum()
    }
}

#[derive(Debug, Clone)]
pub struct QSpaceBasis {
    lmax: usize,
    n_coefs: usize,
    shell_basis: Vec<Array2<f32>>,
    y: Array2<f32>,
}

impl QSpaceBasis {
    /// `grad` holds one direction per volume in its first three columns. `motion` is the (validated)
    /// motion table matching the layout's granularity.
    pub fn new(
        layout: &AcquisitionLayout,
        grad: &ArrayView2<f32>,
        motion: &ArrayView2<f32>,
        n_shells: usize,
        lmax: Option<usize>,
        rf: &[RadialBasis],
    ) -> Result<Self> {
        if grad.nrows() != layout.n_vols() {
            return Err(ReconError::GradientRows { expected: layout.n_vols(), found: grad.nrows() });
        }
        for r in rf {
            if r.matrix.nrows() != n_shells {
                return Err(ReconError::RadialBasisShells {
                    name: r.name.clone(),
                    expected: n_shells,
                    found: r.matrix.nrows(),
                });
            }
        }
        let lmax = resolve_lmax(lmax, rf)?;
        let n_coefs = n_coefs(lmax, rf);

        debug!("building shell bases for {} shells, lmax = {}, nc = {}", n_shells, lmax, n_coefs);
        let shell_basis = (0..n_shells).map(|s| shell_basis(s, lmax, n_coefs, rf)).collect::<Vec<_>>();

        let mut basis = Self { lmax, n_coefs, shell_basis, y: Array2::zeros((0, n_coefs)) };
        basis.y = basis.rotated_design_matrix(layout, grad, motion);
        Ok(basis)
    }

    fn rotated_design_matrix(&self, layout: &AcquisitionLayout, grad: &ArrayView2<f32>, motion: &ArrayView2<f32>) -> Array2<f32> {
        let nz = layout.n_slices();
        let mut y = Array2::<f32>::zeros((layout.n_acquisitions(), self.n_coefs));
        for v in 0..layout.n_vols() {
            let dir = direction(grad, v);
            let basis = &self.shell_basis[layout.shell(v)];
            for z in 0..nz {
                let rot = SliceTransform::rotation(&pose(motion, layout.motion_row(v, z)));
                let delta = Array1::from_vec(sh::delta(&rotate(&rot, &dir), self.lmax));
                y.row_mut(layout.acq_index(v, z)).assign(&basis.dot(&delta));
            }
        }
        y
    }

    pub fn lmax(&self) -> usize {
        self.lmax
    }

    pub fn n_coefs(&self) -> usize {
        self.n_coefs
    }

    pub fn n_shells(&self) -> usize {
        self.shell_basis.len()
    }

    /// (nc x N(lmax)) matrix mapping SH coefficients of a delta to the coefficients of one shell
    pub fn shell_basis(&self, s: usize) -> &Array2<f32> {
        &self.shell_basis[s]
    }

    /// rotated design matrix, one row per acquisition
    pub fn y(&self) -> &Array2<f32> {
        &self.y
    }

    #[inline]
    pub fn row(&self, acq: usize) -> ArrayView1<f32> {
        self.y.row(acq)
    }
}

fn direction(grad: &ArrayView2<f32>, v: usize) -> [f32; 3] {
    [grad[[v, 0]], grad[[v, 1]], grad[[v, 2]]]
}

/// Band l of every radial basis function is weighted by that function's coefficient for shell s.
/// Without radial bases the shell basis is the identity.
fn shell_basis(s: usize, lmax: usize, n_coefs: usize, rf: &[RadialBasis]) -> Array2<f32> {
    let n_sh = sh::n_for_l(lmax);
    if rf.is_empty() {
        return Array2::eye(n_sh);
    }
    let mut b = Array2::<f32>::zeros((n_coefs, n_sh));
    let mut j = 0;
    for r in rf {
        for band in 0..r.n_bands() {
            if 2 * band > lmax {
                break;
            }
            let start = if band == 0 { 0 } else { sh::n_for_l(2 * band - 2) };
            let end = sh::n_for_l(2 * band);
            for i in start..end {
                b[[j, i]] = r.matrix[[s, band]];
                j += 1;
            }
        }
    }
    assert_eq!(j, n_coefs, "shell basis rows must match the coefficient count");
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn grad(n: usize) -> Array2<f32> {
        Array2::from_shape_fn((n, 3), |(v, c)| {
            let t = v as f32 * 0.7;
            match c {
                0 => t.cos() * 0.6,
                1 => t.sin() * 0.6,
                _ => 0.8,
            }
        })
    }

    #[test]
    fn coefficient_count_without_radial_basis() {
        assert_eq!(resolve_lmax(None, &[]).unwrap(), DEFAULT_LMAX);
        assert_eq!(n_coefs(4, &[]), 15);
        assert_eq!(n_coefs(8, &[]), 45);
        assert!(resolve_lmax(Some(3), &[]).is_err());
    }

    #[test]
    fn coefficient_count_with_radial_basis() {
        let rf = vec![
            RadialBasis::new("wm", Array2::ones((2, 4))),  // up to l = 6
            RadialBasis::new("gm", Array2::ones((2, 1))),  // l = 0
            RadialBasis::new("csf", Array2::ones((2, 2))), // up to l = 2
        ];
        assert_eq!(resolve_lmax(None, &rf).unwrap(), 6);
        assert_eq!(resolve_lmax(Some(4), &rf).unwrap(), 4);
        assert_eq!(resolve_lmax(Some(10), &rf).unwrap(), 6);
        assert_eq!(n_coefs(6, &rf), 28 + 1 + 6);
        assert_eq!(n_coefs(4, &rf), 15 + 1 + 6);
    }

    #[test]
    fn design_matrix_shape_and_identity_basis() {
        let layout = AcquisitionLayout::new([2, 2, 3], 4, 4, vec![0; 4]).unwrap();
        let g = grad(4);
        let motion = Array2::<f32>::zeros((4, 6));
        let basis = QSpaceBasis::new(&layout, &g.view(), &motion.view(), 1, Some(2), &[]).unwrap();
        assert_eq!(basis.n_coefs(), 6);
        assert_eq!(basis.y().dim(), (12, 6));
        assert_eq!(basis.shell_basis(0), &Array2::<f32>::eye(6));

        // zero motion: every slice of a volume shares the delta along the nominal direction
        for v in 0..4 {
            let nominal = sh::delta(&direction(&g.view(), v), 2);
            for z in 0..3 {
                let row = basis.row(layout.acq_index(v, z));
                row.iter().zip(&nominal).for_each(|(a, b)| assert!((a - b).abs() < 1e-6));
            }
        }
    }

    #[test]
    fn per_slice_rotation_changes_rows() {
        let layout = AcquisitionLayout::new([2, 2, 2], 1, 2, vec![0]).unwrap();
        let g = array![[1f32, 0., 0.]];
        // second slice rotated by 90 degrees about z: x -> y
        let motion = array![[0f32, 0., 0., 0., 0., 0.], [0., 0., 0., 0., 0., std::f32::consts::FRAC_PI_2]];
        let basis = QSpaceBasis::new(&layout, &g.view(), &motion.view(), 1, Some(2), &[]).unwrap();
        let expected = sh::delta(&[0., 1., 0.], 2);
        basis.row(1).iter().zip(&expected).for_each(|(a, b)| assert!((a - b).abs() < 1e-5));
        let unrotated = sh::delta(&[1., 0., 0.], 2);
        basis.row(0).iter().zip(&unrotated).for_each(|(a, b)| assert!((a - b).abs() < 1e-6));
    }

    #[test]
    fn radial_basis_weights_bands() {
        let layout = AcquisitionLayout::new([2, 2, 1], 2, 2, vec![0, 1]).unwrap();
        let g = grad(2);
        let motion = Array2::<f32>::zeros((2, 6));
        let rf = vec![RadialBasis::new("wm", array![[1f32, 0.5], [2., 0.25]])];
        let basis = QSpaceBasis::new(&layout, &g.view(), &motion.view(), 2, None, &rf).unwrap();
        assert_eq!(basis.lmax(), 2);
        assert_eq!(basis.n_coefs(), 6);
        let d = sh::delta(&[g[[1, 0]], g[[1, 1]], g[[1, 2]]], 2);
        let row = basis.row(1);
        assert!((row[0] - 2. * d[0]).abs() < 1e-6);
        for i in 1..6 {
            assert!((row[i] - 0.25 * d[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn radial_basis_shell_mismatch_is_fatal() {
        let layout = AcquisitionLayout::new([2, 2, 1], 2, 2, vec![0, 1]).unwrap();
        let g = grad(2);
        let motion = Array2::<f32>::zeros((2, 6));
        let rf = vec![RadialBasis::new("wm", Array2::ones((3, 2)))];
        let err = QSpaceBasis::new(&layout, &g.view(), &motion.view(), 2, None, &rf).unwrap_err();
        assert!(matches!(err, ReconError::RadialBasisShells { expected: 2, found: 3, .. }));
    }
}
