//! Rigid motion and voxel/scanner geometry.
//!
//! Poses are 6-vectors (tx, ty, tz, rx, ry, rz) in scanner space: translation followed by three
//! Euler angles composed as Rx(rx) * Ry(ry) * Rz(rz).

use nalgebra::{Matrix3, Rotation3, Vector3};
use ndarray::ArrayView2;

/// rotation matrix Rx(a1) * Ry(a2) * Rz(a3)
pub fn euler_rotation(a1: f64, a2: f64, a3: f64) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Vector3::x_axis(), a1)
        * Rotation3::from_axis_angle(&Vector3::y_axis(), a2)
        * Rotation3::from_axis_angle(&Vector3::z_axis(), a3)
}

/// x -> linear * x + translation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub linear: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Affine {
    pub fn identity() -> Self {
        Self { linear: Matrix3::identity(), translation: Vector3::zeros() }
    }

    pub fn scaling(s: &[f64; 3]) -> Self {
        Self { linear: Matrix3::from_diagonal(&Vector3::from(*s)), translation: Vector3::zeros() }
    }

    /// rigid transform from a 6-parameter pose
    pub fn rigid(pose: &[f32; 6]) -> Self {
        let p = pose.map(|x| x as f64);
        Self {
            linear: euler_rotation(p[3], p[4], p[5]).into_inner(),
            translation: Vector3::new(p[0], p[1], p[2]),
        }
    }

    #[inline]
    pub fn apply(&self, x: &Vector3<f64>) -> Vector3<f64> {
        self.linear * x + self.translation
    }

    /// self ∘ other (other applied first)
    pub fn compose(&self, other: &Affine) -> Affine {
        Affine { linear: self.linear * other.linear, translation: self.apply(&other.translation) }
    }

    /// Inverse of a transform whose linear part is a rotation: transpose the rotation and rotate
    /// the negated translation.
    pub fn rigid_inverse(&self) -> Affine {
        let linear = self.linear.transpose();
        Affine { linear, translation: -(linear * self.translation) }
    }
}

/// Geometry of the reconstruction grid. `orientation` is the rigid voxel-to-scanner transform
/// applied after scaling by the voxel size.
#[derive(Debug, Clone, PartialEq)]
pub struct GridHeader {
    pub size: [usize; 3],
    pub voxel_size: [f64; 3],
    pub orientation: Affine,
}

impl GridHeader {
    pub fn new(size: [usize; 3], voxel_size: [f64; 3]) -> Self {
        Self { size, voxel_size, orientation: Affine::identity() }
    }

    pub fn n_voxels(&self) -> usize {
        self.size.iter().product()
    }

    pub fn voxel2scanner(&self) -> Affine {
        self.orientation.compose(&Affine::scaling(&self.voxel_size))
    }

    pub fn scanner2voxel(&self) -> Affine {
        let inv_vox = self.voxel_size.map(|v| 1. / v);
        Affine::scaling(&inv_vox).compose(&self.orientation.rigid_inverse())
    }
}

/// Voxel-to-voxel maps between an acquired slice and the reconstruction grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceTransform {
    /// slice voxel -> reconstruction voxel
    pub s2r: Affine,
    /// reconstruction voxel -> slice voxel
    pub r2s: Affine,
}

impl SliceTransform {
    pub fn new(header: &GridHeader, pose: &[f32; 6]) -> Self {
        let rigid = Affine::rigid(pose);
        let v2s = header.voxel2scanner();
        let s2v = header.scanner2voxel();
        Self {
            s2r: s2v.compose(&rigid).compose(&v2s),
            r2s: s2v.compose(&rigid.rigid_inverse()).compose(&v2s),
        }
    }

    #[inline]
    pub fn to_recon(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.s2r.apply(p)
    }

    #[inline]
    pub fn to_slice(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.r2s.apply(p)
    }

    /// Range of slice-space z covered by the reconstruction grid grown by `margin` voxels on every
    /// side. A slice position outside this range maps to no grid point within `margin`.
    pub fn slice_z_range(&self, size: &[usize; 3], margin: f64) -> (f64, f64) {
        let lo = -margin;
        let hi = size.map(|n| n as f64 - 1. + margin);
        let mut range = (f64::INFINITY, f64::NEG_INFINITY);
        for corner in 0..8 {
            let c = Vector3::new(
                if corner & 1 == 0 { lo } else { hi[0] },
                if corner & 2 == 0 { lo } else { hi[1] },
                if corner & 4 == 0 { lo } else { hi[2] },
            );
            let z = self.to_slice(&c).z;
            range = (range.0.min(z), range.1.max(z));
        }
        range
    }

    /// rotation component acting on directions in scanner space
    pub fn rotation(pose: &[f32; 6]) -> Rotation3<f64> {
        euler_rotation(pose[3] as f64, pose[4] as f64, pose[5] as f64)
    }
}

/// pose stored in one row of a (n x 6) motion table
pub fn pose(motion: &ArrayView2<f32>, row: usize) -> [f32; 6] {
    let mut p = [0f32; 6];
    p.iter_mut().zip(motion.row(row)).for_each(|(p, &m)| *p = m);
    p
}

/// rotate a direction vector
pub fn rotate(rot: &Rotation3<f64>, v: &[f32; 3]) -> [f32; 3] {
    let r = rot * Vector3::from(v.map(|x| x as f64));
    [r.x as f32, r.y as f32, r.z as f32]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &Vector3<f64>, b: &Vector3<f64>, tol: f64) -> bool {
        (a - b).amax() < tol
    }

    #[test]
    fn euler_order() {
        let r = euler_rotation(0.3, -0.2, 0.7);
        let expected = euler_rotation(0.3, 0., 0.) * euler_rotation(0., -0.2, 0.) * euler_rotation(0., 0., 0.7);
        assert!((r.matrix() - expected.matrix()).amax() < 1e-12);

        let (c, s) = (0.3f64.cos(), 0.3f64.sin());
        let rx = Matrix3::new(1., 0., 0., 0., c, -s, 0., s, c);
        assert!((euler_rotation(0.3, 0., 0.).matrix() - rx).amax() < 1e-12);

        // quarter turn about z maps x to y
        assert_eq!(rotate(&euler_rotation(0., 0., std::f64::consts::FRAC_PI_2), &[1., 0., 0.]).map(|c| c.round()), [0., 1., 0.]);
    }

    #[test]
    fn rigid_inverse_round_trip() {
        let t = Affine::rigid(&[1.5, -2., 0.25, 0.1, 0.4, -0.3]);
        let inv = t.rigid_inverse();
        let p = Vector3::new(3., -1., 7.);
        assert!(close(&inv.apply(&t.apply(&p)), &p, 1e-10));
        assert!(close(&t.apply(&inv.apply(&p)), &p, 1e-10));
    }

    #[test]
    fn slice_transform_is_consistent() {
        let mut header = GridHeader::new([10, 12, 8], [2., 2., 3.]);
        header.orientation = Affine::rigid(&[-10., 5., 2., 0.05, 0., 0.1]);
        let pose = [0.5, 1., -2., 0.02, -0.03, 0.1];
        let st = SliceTransform::new(&header, &pose);
        let p = Vector3::new(4., 5., 3.);
        assert!(close(&st.to_slice(&st.to_recon(&p)), &p, 1e-10));

        let v2s = header.voxel2scanner();
        let s2v = header.scanner2voxel();
        assert!(close(&s2v.apply(&v2s.apply(&p)), &p, 1e-10));
    }

    #[test]
    fn translation_in_voxel_units() {
        let header = GridHeader::new([10, 10, 10], [2., 2., 2.]);
        let st = SliceTransform::new(&header, &[1., 0., 0., 0., 0., 0.]);
        // 1 mm shift along x is half a voxel
        assert!(close(&st.to_recon(&Vector3::new(3., 3., 3.)), &Vector3::new(3.5, 3., 3.), 1e-12));
        let id = SliceTransform::new(&header, &[0.; 6]);
        assert!(close(&id.to_recon(&Vector3::new(3., 4., 5.)), &Vector3::new(3., 4., 5.), 1e-12));
    }

    #[test]
    fn slice_z_range_follows_motion() {
        let header = GridHeader::new([4, 4, 3], [1., 1., 2.]);
        let id = SliceTransform::new(&header, &[0.; 6]);
        let (lo, hi) = id.slice_z_range(&header.size, 1.);
        assert!((lo + 1.).abs() < 1e-12 && (hi - 3.).abs() < 1e-12);

        // 4 mm along z is two slices: slice z sees recon plane z + 2
        let up = SliceTransform::new(&header, &[0., 0., 4., 0., 0., 0.]);
        let (lo, hi) = up.slice_z_range(&header.size, 0.);
        assert!((lo + 2.).abs() < 1e-12 && hi.abs() < 1e-12);
    }
}
