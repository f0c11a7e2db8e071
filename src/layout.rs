//! Indexing of acquisitions (volume, slice) shared by the basis, resampling and operator code.

use crate::error::{ReconError, Result};

/// whether the motion table holds one pose per volume or one per slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionGranularity {
    Volume,
    Slice,
}

/// Acquisition a = v * nz + z is slice z of volume v. Its data occupy rows
/// a * nxy .. (a + 1) * nxy of the measurement vector.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionLayout {
    size: [usize; 3],
    n_vols: usize,
    granularity: MotionGranularity,
    shell_idx: Vec<usize>,
}

impl AcquisitionLayout {
    /// Infers the motion granularity from the motion table row count. `shell_idx` assigns each
    /// volume to a shell.
    pub fn new(size: [usize; 3], n_vols: usize, motion_rows: usize, shell_idx: Vec<usize>) -> Result<Self> {
        let nz = size[2];
        let granularity = match motion_rows {
            r if r == n_vols => MotionGranularity::Volume,
            r if r == n_vols * nz => MotionGranularity::Slice,
            rows => {
                return Err(ReconError::MotionRows { rows, n_vols, n_slices: n_vols * nz });
            }
        };
        assert_eq!(shell_idx.len(), n_vols, "expected one shell index per volume");
        Ok(Self { size, n_vols, granularity, shell_idx })
    }

    pub fn size(&self) -> [usize; 3] {
        self.size
    }

    pub fn n_vols(&self) -> usize {
        self.n_vols
    }

    pub fn n_slices(&self) -> usize {
        self.size[2]
    }

    pub fn n_slice_voxels(&self) -> usize {
        self.size[0] * self.size[1]
    }

    pub fn n_voxels(&self) -> usize {
        self.size.iter().product()
    }

    pub fn n_acquisitions(&self) -> usize {
        self.n_vols * self.size[2]
    }

    pub fn n_measurements(&self) -> usize {
        self.n_acquisitions() * self.n_slice_voxels()
    }

    pub fn granularity(&self) -> MotionGranularity {
        self.granularity
    }

    #[inline]
    pub fn acq_index(&self, v: usize, z: usize) -> usize {
        v * self.size[2] + z
    }

    /// (volume, slice) of an acquisition index
    #[inline]
    pub fn acquisition(&self, a: usize) -> (usize, usize) {
        (a / self.size[2], a % self.size[2])
    }

    /// row of the motion table holding the pose of slice z in volume v
    #[inline]
    pub fn motion_row(&self, v: usize, z: usize) -> usize {
        match self.granularity {
            MotionGranularity::Volume => v,
            MotionGranularity::Slice => self.acq_index(v, z),
        }
    }

    #[inline]
    pub fn shell(&self, v: usize) -> usize {
        self.shell_idx[v]
    }
}
