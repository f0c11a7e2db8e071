//! Through-slice sensitivity profile and in-plane/through-plane interpolation kernels.

use crate::error::{ReconError, Result};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// through-slice neighbourhood considered by the slice profile. Contributions from slices further
/// away are ignored.
pub const SSP_HALF_WIDTH: i32 = 2;

const SSP_TAPS: usize = (2 * SSP_HALF_WIDTH + 1) as usize;

/// Slice sensitivity profile sampled at integer slice offsets -2..=2, normalised to unit sum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceProfile {
    weights: [f32; SSP_TAPS],
}

impl SliceProfile {
    /// Gaussian profile with a full-width-half-max given relative to the voxel size. A thickness
    /// of zero yields a delta profile.
    pub fn gaussian(relative_thickness: f32) -> Result<Self> {
        if !(relative_thickness >= 0.) || !relative_thickness.is_finite() {
            return Err(ReconError::Parameter(format!("slice thickness must be non-negative, got {relative_thickness}")));
        }
        let mut weights = [0f32; SSP_TAPS];
        if relative_thickness == 0. {
            weights[SSP_HALF_WIDTH as usize] = 1.;
            return Ok(Self { weights });
        }
        let sigma = relative_thickness / (2. * (2. * 2f32.ln()).sqrt());
        weights.iter_mut().enumerate().for_each(|(i, w)| {
            let s = i as f32 - SSP_HALF_WIDTH as f32;
            *w = (-s * s / (2. * sigma * sigma)).exp();
        });
        Self::normalised(weights)
    }

    /// Tabulated profile centred on the middle entry. Tables wider than the supported
    /// neighbourhood are truncated, narrower ones are zero-padded.
    pub fn tabulated(table: &[f32]) -> Result<Self> {
        if table.len() % 2 == 0 {
            return Err(ReconError::SliceProfileLength(table.len()));
        }
        if table.iter().any(|w| !w.is_finite() || *w < 0.) {
            return Err(ReconError::SliceProfileWeights);
        }
        let centre = (table.len() / 2) as i32;
        let mut weights = [0f32; SSP_TAPS];
        for s in -SSP_HALF_WIDTH..=SSP_HALF_WIDTH {
            let t = centre + s;
            if t >= 0 && (t as usize) < table.len() {
                weights[(s + SSP_HALF_WIDTH) as usize] = table[t as usize];
            }
        }
        Self::normalised(weights)
    }

    fn normalised(mut weights: [f32; SSP_TAPS]) -> Result<Self> {
        let sum: f32 = weights.iter().sum();
        if !(sum > 0.) {
            return Err(ReconError::SliceProfileWeights);
        }
        weights.iter_mut().for_each(|w| *w /= sum);
        Ok(Self { weights })
    }

    pub fn half_width(&self) -> i32 {
        SSP_HALF_WIDTH
    }

    /// weight of the slice at an integer offset, zero outside the supported neighbourhood
    #[inline]
    pub fn weight(&self, offset: i32) -> f32 {
        if offset.abs() > SSP_HALF_WIDTH {
            0.
        } else {
            self.weights[(offset + SSP_HALF_WIDTH) as usize]
        }
    }
}

impl Default for SliceProfile {
    fn default() -> Self {
        // unit-thickness gaussian
        Self::gaussian(1.).expect("unit thickness is valid")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelType {
    Sinc,
    Linear,
}

/// Separable interpolation kernel with bounded support. For a continuous coordinate p, the
/// neighbourhood is ceil(p) + r for r in -n..n along each axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InterpKernel {
    /// truncated sinc with half-width n
    Sinc(i32),
    /// tri-linear, half-width 1
    Linear,
}

impl InterpKernel {
    pub fn new(kind: KernelType, half_width: usize) -> Result<Self> {
        match kind {
            KernelType::Sinc if half_width > 0 => Ok(Self::Sinc(half_width as i32)),
            KernelType::Sinc => Err(ReconError::Parameter("sinc kernel half-width must be at least 1".to_string())),
            KernelType::Linear => Ok(Self::Linear),
        }
    }

    #[inline]
    pub fn half_width(&self) -> i32 {
        match self {
            Self::Sinc(n) => *n,
            Self::Linear => 1,
        }
    }

    #[inline]
    fn weight_1d(&self, d: f32) -> f32 {
        match self {
            Self::Sinc(n) => {
                if d.abs() >= *n as f32 {
                    0.
                } else if d.abs() < 1e-6 {
                    1.
                } else {
                    (PI * d).sin() / (PI * d)
                }
            }
            Self::Linear => (1. - d.abs()).max(0.),
        }
    }

    /// interpolation weight for a 3-D displacement between a continuous coordinate and a grid point
    #[inline]
    pub fn weight(&self, d: &[f32; 3]) -> f32 {
        self.weight_1d(d[0]) * self.weight_1d(d[1]) * self.weight_1d(d[2])
    }
}

impl Default for InterpKernel {
    fn default() -> Self {
        Self::Sinc(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaussian_profile_sums_to_one() {
        for thickness in [0.5f32, 1., 2., 3.] {
            let ssp = SliceProfile::gaussian(thickness).unwrap();
            let sum: f32 = (-2..=2).map(|s| ssp.weight(s)).sum();
            assert!((sum - 1.).abs() < 1e-6);
            assert!(ssp.weight(0) >= ssp.weight(1));
            assert_eq!(ssp.weight(1), ssp.weight(-1));
            assert_eq!(ssp.weight(3), 0.);
        }
    }

    #[test]
    fn zero_thickness_is_delta() {
        let ssp = SliceProfile::gaussian(0.).unwrap();
        assert_eq!(ssp.weight(0), 1.);
        assert_eq!(ssp.weight(1), 0.);
        assert_eq!(ssp.weight(-2), 0.);
    }

    #[test]
    fn tabulated_profile() {
        let ssp = SliceProfile::tabulated(&[1., 2., 1.]).unwrap();
        assert!((ssp.weight(0) - 0.5).abs() < 1e-6);
        assert!((ssp.weight(-1) - 0.25).abs() < 1e-6);
        assert_eq!(ssp.weight(2), 0.);

        // truncated to the supported neighbourhood before normalising
        let wide = SliceProfile::tabulated(&[1., 1., 1., 1., 1., 1., 1.]).unwrap();
        assert!((wide.weight(2) - 0.2).abs() < 1e-6);

        assert!(matches!(SliceProfile::tabulated(&[1., 1.]), Err(ReconError::SliceProfileLength(2))));
        assert!(matches!(SliceProfile::tabulated(&[0., 0., 0.]), Err(ReconError::SliceProfileWeights)));
        assert!(SliceProfile::tabulated(&[1., -1., 1.]).is_err());
    }

    #[test]
    fn kernels_interpolate_at_grid_points() {
        for kernel in [InterpKernel::Sinc(2), InterpKernel::Sinc(3), InterpKernel::Linear] {
            assert_eq!(kernel.weight(&[0., 0., 0.]), 1.);
            assert!(kernel.weight(&[1., 0., 0.]).abs() < 1e-6);
            assert!(kernel.weight(&[0., -2., 0.]).abs() < 1e-6);
        }
        let n = InterpKernel::Sinc(2);
        assert_eq!(n.weight(&[2.5, 0., 0.]), 0.);
        assert!((InterpKernel::Linear.weight(&[0.25, 0.5, 0.]) - 0.375).abs() < 1e-6);
    }
}
