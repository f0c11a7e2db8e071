//! Least-squares conjugate gradient (CGLS) on the normal equations A^T A x = A^T b, written
//! against [`LinearOperator`] so it never needs A in explicit form.
//!
//! Vectors are stored in single precision; inner products accumulate in double precision.

use crate::array_utils::dot;
use crate::operator::LinearOperator;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

pub const DEFAULT_TOLERANCE: f64 = 1e-4;
pub const DEFAULT_MAX_ITER: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SolveReport {
    pub iterations: usize,
    /// |A^T (b - Ax)| / |A^T b|
    pub relative_residual: f64,
    pub converged: bool,
}

/// y += alpha * x
fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    y.par_iter_mut().zip(x.par_iter()).for_each(|(y, &x)| *y += alpha * x);
}

fn norm2(x: &[f32]) -> f64 {
    dot(x, x)
}

/// Minimises |Ax - b| starting from `x0` (zero if None). Iteration stops once the relative
/// normal-equation residual drops below `tolerance` or after `max_iter` iterations. Running out
/// of iterations is not an error: the last iterate is returned with `converged = false`.
pub fn cgls<A: LinearOperator + ?Sized>(
    op: &A,
    b: &[f32],
    x0: Option<&[f32]>,
    tolerance: f64,
    max_iter: usize,
) -> (Vec<f32>, SolveReport) {
    let (m, n) = (op.rows(), op.cols());
    assert_eq!(b.len(), m, "right-hand side must have one entry per operator row");

    let mut x = match x0 {
        Some(x0) => {
            assert_eq!(x0.len(), n, "initial guess must have one entry per operator column");
            x0.to_vec()
        }
        None => vec![0f32; n],
    };

    let mut atb = vec![0f32; n];
    op.apply_adjoint(b, &mut atb);
    let rhs_norm2 = norm2(&atb);
    if rhs_norm2 == 0. {
        info!("right-hand side is in the null space of the operator, returning zero");
        return (vec![0f32; n], SolveReport { iterations: 0, relative_residual: 0., converged: true });
    }
    let threshold = tolerance * tolerance * rhs_norm2;

    // r = b - A x
    let mut residual = b.to_vec();
    if x.iter().any(|&v| v != 0.) {
        let mut ax = vec![0f32; m];
        op.apply(&x, &mut ax);
        axpy(-1., &ax, &mut residual);
    }

    // z = A^T r
    let mut z = vec![0f32; n];
    op.apply_adjoint(&residual, &mut z);
    let mut abs_new = norm2(&z);
    if abs_new < threshold {
        let relative_residual = (abs_new / rhs_norm2).sqrt();
        info!("initial guess already within tolerance ({:.3e})", relative_residual);
        return (x, SolveReport { iterations: 0, relative_residual, converged: true });
    }

    let mut p = z.clone();
    let mut tmp = vec![0f32; m];
    let mut iterations = 0;
    while iterations < max_iter {
        tmp.par_iter_mut().for_each(|t| *t = 0.);
        op.apply(&p, &mut tmp);
        let tmp_norm2 = norm2(&tmp);
        if tmp_norm2 == 0. {
            break;
        }
        let alpha = (abs_new / tmp_norm2) as f32;
        axpy(alpha, &p, &mut x);
        axpy(-alpha, &tmp, &mut residual);

        z.par_iter_mut().for_each(|z| *z = 0.);
        op.apply_adjoint(&residual, &mut z);
        let abs_old = abs_new;
        abs_new = norm2(&z);
        iterations += 1;
        debug!("iteration {}: relative residual {:.3e}", iterations, (abs_new / rhs_norm2).sqrt());
        if abs_new < threshold {
            break;
        }

        let beta = (abs_new / abs_old) as f32;
        p.par_iter_mut().zip(z.par_iter()).for_each(|(p, &z)| *p = z + beta * *p);
    }

    let relative_residual = (abs_new / rhs_norm2).sqrt();
    let converged = abs_new < threshold;
    if converged {
        info!("converged after {} iterations, relative residual {:.3e}", iterations, relative_residual);
    } else {
        warn!(
            "no convergence within {} iterations (relative residual {:.3e}, tolerance {:.1e})",
            iterations, relative_residual, tolerance
        );
    }
    (x, SolveReport { iterations, relative_residual, converged })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{OperatorConfig, ReconMatrix};
    use crate::psf::{InterpKernel, SliceProfile};
    use crate::regularization::Regularization;
    use crate::sh;
    use crate::shells::Shells;
    use crate::transform::GridHeader;
    use ndarray::{array, Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Dense(Array2<f32>);

    impl LinearOperator for Dense {
        fn rows(&self) -> usize {
            self.0.nrows()
        }
        fn cols(&self) -> usize {
            self.0.ncols()
        }
        fn apply(&self, src: &[f32], dst: &mut [f32]) {
            let y = self.0.dot(&Array1::from_vec(src.to_vec()));
            dst.iter_mut().zip(y.iter()).for_each(|(d, y)| *d += y);
        }
        fn apply_adjoint(&self, src: &[f32], dst: &mut [f32]) {
            let y = self.0.t().dot(&Array1::from_vec(src.to_vec()));
            dst.iter_mut().zip(y.iter()).for_each(|(d, y)| *d += y);
        }
    }

    #[test]
    fn square_system() {
        let a = Dense(array![[4f32, 1., 0.], [1., 3., 1.], [0., 1., 2.]]);
        let b = [1f32, 2., 3.];
        let (x, report) = cgls(&a, &b, None, 1e-6, 50);
        assert!(report.converged);
        let mut ax = vec![0f32; 3];
        a.apply(&x, &mut ax);
        ax.iter().zip(&b).for_each(|(ax, b)| assert!((ax - b).abs() < 1e-4));
    }

    #[test]
    fn overdetermined_matches_normal_equations() {
        // line fit through four points
        let a = Dense(array![[1f32, 0.], [1., 1.], [1., 2.], [1., 3.]]);
        let b = [1f32, 2.9, 5.1, 7.];
        let (x, report) = cgls(&a, &b, None, 1e-7, 20);
        assert!(report.converged);
        // closed form least squares: slope 2.02, intercept 0.97
        assert!((x[0] - 0.97).abs() < 1e-3, "intercept {}", x[0]);
        assert!((x[1] - 2.02).abs() < 1e-3, "slope {}", x[1]);
    }

    #[test]
    fn zero_rhs_and_exact_initial_guess() {
        let a = Dense(array![[2f32, 0.], [0., 1.]]);
        let (x, report) = cgls(&a, &[0., 0.], Some(&[5f32, 5.][..]), 1e-6, 10);
        assert_eq!(x, vec![0., 0.]);
        assert_eq!(report.iterations, 0);

        let (x, report) = cgls(&a, &[2., 3.], Some(&[1f32, 3.][..]), 1e-6, 10);
        assert_eq!(x, vec![1., 3.]);
        assert_eq!(report.iterations, 0);
        assert!(report.converged);
    }

    #[test]
    fn iteration_limit_returns_last_iterate() {
        let a = Dense(Array2::from_shape_fn((6, 6), |(i, j)| if i == j { (i + 1) as f32 } else { 0.1 }));
        let b = [1f32; 6];
        let (x, report) = cgls(&a, &b, None, 1e-12, 1);
        assert_eq!(report.iterations, 1);
        assert!(!report.converged);
        assert!(x.iter().any(|&v| v != 0.));
        assert!(report.relative_residual > 0.);
    }

    fn unit_z_shell(n_vols: usize) -> (Array2<f32>, Shells) {
        let g = Array2::from_shape_fn((n_vols, 4), |(_, c)| if c == 2 { 1. } else if c == 3 { 1000. } else { 0. });
        (g, Shells::new(&vec![1000.; n_vols], 10., 80.))
    }

    #[test]
    fn constant_image_is_recovered() {
        let header = GridHeader::new([4, 4, 2], [1., 1., 1.]);
        let (g, shells) = unit_z_shell(1);
        let config = OperatorConfig { lmax: Some(0), ssp: SliceProfile::gaussian(0.).unwrap(), ..Default::default() };
        let op = ReconMatrix::new(header, 1, &g.view(), &shells, None, &[], &config).unwrap();
        let data = vec![3f32; 32];
        let (x, report) = cgls(&op, &op.weighted_rhs(&data), None, 1e-4, 10);
        assert!(report.converged);
        let y00 = sh::delta(&[0., 0., 1.], 0)[0];
        x.iter().for_each(|&v| assert!((v * y00 - 3.).abs() < 1e-4));
    }

    #[test]
    fn in_plane_shift_is_accounted_for() {
        let header = GridHeader::new([4, 4, 2], [1., 1., 1.]);
        let (g, shells) = unit_z_shell(1);
        let config = OperatorConfig {
            lmax: Some(0),
            ssp: SliceProfile::gaussian(0.).unwrap(),
            kernel: InterpKernel::Linear,
            ..Default::default()
        };
        // second slice displaced by half a voxel along x
        let motion = array![[0f32, 0., 0., 0., 0., 0.], [0.5, 0., 0., 0., 0., 0.]];
        let moved = ReconMatrix::new(header.clone(), 1, &g.view(), &shells, Some(motion.view()), &[], &config).unwrap();
        let still = ReconMatrix::new(header, 1, &g.view(), &shells, None, &[], &config).unwrap();

        let x_true: Vec<f32> = (0..32).map(|i| 1. + 0.1 * (i % 4) as f32 + 0.05 * ((i / 4) % 4) as f32 + 0.2 * (i / 16) as f32).collect();
        let mut data = vec![0f32; 32];
        moved.apply(&x_true, &mut data);

        let max_err = |x: &[f32]| x.iter().zip(&x_true).map(|(a, b)| (a - b).abs()).fold(0f32, f32::max);
        let (x_moved, _) = cgls(&moved, &data, None, 1e-6, 100);
        let (x_still, _) = cgls(&still, &data, None, 1e-6, 100);
        let (e_moved, e_still) = (max_err(&x_moved), max_err(&x_still));
        assert!(e_moved < 1e-2, "motion-aware error {e_moved}");
        assert!(e_still > 10. * e_moved, "motion-blind error {e_still} vs {e_moved}");
    }

    fn gradient_energy(size: [usize; 3], x: &[f32]) -> f64 {
        let [nx, ny, nz] = size;
        let idx = |i: usize, j: usize, k: usize| i + nx * (j + ny * k);
        let mut e = 0f64;
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let c = x[idx(i, j, k)] as f64;
                    if i + 1 < nx {
                        e += (x[idx(i + 1, j, k)] as f64 - c).powi(2);
                    }
                    if j + 1 < ny {
                        e += (x[idx(i, j + 1, k)] as f64 - c).powi(2);
                    }
                    if k + 1 < nz {
                        e += (x[idx(i, j, k + 1)] as f64 - c).powi(2);
                    }
                }
            }
        }
        e
    }

    #[test]
    fn regularization_smooths_the_solution() {
        let size = [4, 4, 4];
        let (g, shells) = unit_z_shell(1);
        let mut rng = StdRng::seed_from_u64(7);
        let data: Vec<f32> = (0..64).map(|_| rng.random_range(0f32..1f32)).collect();

        let energies: Vec<f64> = [0f32, 0.1, 0.3]
            .iter()
            .map(|&lambda| {
                let config = OperatorConfig {
                    lmax: Some(0),
                    ssp: SliceProfile::gaussian(0.).unwrap(),
                    regularization: Regularization::new(lambda, 0.),
                    ..Default::default()
                };
                let op = ReconMatrix::new(GridHeader::new(size, [1., 1., 1.]), 1, &g.view(), &shells, None, &[], &config)
                    .unwrap();
                let (x, _) = cgls(&op, &op.weighted_rhs(&data), None, 1e-6, 200);
                gradient_energy(size, &x)
            })
            .collect();
        assert!(energies[0] > energies[1], "{energies:?}");
        assert!(energies[1] > energies[2], "{energies:?}");
    }
}
