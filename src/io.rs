//! Input and output: whitespace-delimited text tables, `.npy` volumes and raw big-endian slice
//! stacks. All images are (x, y, z[, volume, ..]) with x varying fastest in the flat buffers the
//! operator consumes.

use crate::error::{ReconError, Result};
use byteorder::ByteOrder;
use ndarray::{Array, Array2, Array4, ArrayD, Dimension, Ix4, ShapeBuilder};
use ndarray_npy::{read_npy, write_npy};
use rayon::prelude::*;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Reads a numeric table from a text file. Values are separated by whitespace or commas; empty
/// lines and lines starting with '#' are skipped. Every row must have the same number of columns.
pub fn read_matrix(path: impl AsRef<Path>) -> Result<Array2<f32>> {
    let path = path.as_ref();
    let mut s = String::new();
    File::open(path)?.read_to_string(&mut s)?;

    let parse_err = |reason: String| ReconError::MatrixParse { path: path.to_path_buf(), reason };

    let mut values = vec![];
    let mut n_cols: Option<usize> = None;
    let mut n_rows = 0;
    for (line_no, line) in s.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split(|c: char| c.is_ascii_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(|t| t.parse::<f32>().map_err(|e| parse_err(format!("line {}: '{}': {}", line_no + 1, t, e))))
            .collect::<Result<Vec<f32>>>()?;
        match n_cols {
            Some(n) if n != row.len() => {
                return Err(parse_err(format!("line {} has {} columns, expected {}", line_no + 1, row.len(), n)));
            }
            _ => n_cols = Some(row.len()),
        }
        values.extend(row);
        n_rows += 1;
    }
    let n_cols = n_cols.unwrap_or(0);
    debug!("read {} x {} matrix from {}", n_rows, n_cols, path.display());
    Array2::from_shape_vec((n_rows, n_cols), values).map_err(|e| parse_err(e.to_string()))
}

/// writes a table with one row per line
pub fn write_matrix(path: impl AsRef<Path>, m: &Array2<f32>) -> Result<()> {
    let s = m
        .rows()
        .into_iter()
        .map(|r| r.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(path, s + "\n")?;
    Ok(())
}

pub fn read_image(path: impl AsRef<Path>) -> Result<ArrayD<f32>> {
    let path = path.as_ref();
    read_npy(path).map_err(|e| ReconError::ImageRead { path: path.to_path_buf(), reason: e.to_string() })
}

/// Reads a 4-D (x, y, z, volume) image. A 3-D image is taken as a single volume.
pub fn read_image4(path: impl AsRef<Path>) -> Result<Array4<f32>> {
    let img = read_image(path)?;
    let img = match img.ndim() {
        3 => img.insert_axis(ndarray::Axis(3)),
        4 => img,
        n => return Err(ReconError::ImageDims(n)),
    };
    img.into_dimensionality::<Ix4>().map_err(|e| ReconError::Parameter(e.to_string()))
}

pub fn write_image<D: Dimension>(path: impl AsRef<Path>, img: &Array<f32, D>) -> Result<()> {
    let path = path.as_ref();
    debug!("writing {:?} image to {}", img.shape(), path.display());
    write_npy(path, img).map_err(|e| ReconError::ImageWrite { path: path.to_path_buf(), reason: e.to_string() })
}

/// builds an image of the given shape from a column-major (x-fastest) buffer
pub fn image_from_col_maj(shape: &[usize], data: Vec<f32>) -> Result<ArrayD<f32>> {
    ArrayD::from_shape_vec(shape.f(), data).map_err(|e| ReconError::Parameter(e.to_string()))
}

/// replaces NaN and infinite values with zero, returning how many were replaced
pub fn replace_non_finite(data: &mut [f32]) -> usize {
    let n = data
        .par_iter_mut()
        .map(|x| {
            if x.is_finite() {
                0
            } else {
                *x = 0.;
                1
            }
        })
        .sum();
    if n > 0 {
        warn!("replaced {} non-finite values with zero", n);
    }
    n
}

/// Reads a stack of raw big-endian i16 slices matched by a glob pattern. Files are sorted by name
/// and fill slices in (z, volume) order, so `dims[2] * dims[3]` files of `dims[0] * dims[1]`
/// values each are expected.
pub fn read_raw_slices(pattern: &str, dims: &[usize; 4]) -> Result<Array4<f32>> {
    let [nx, ny, nz, nv] = *dims;
    let read_err = |reason: String| ReconError::ImageRead { path: PathBuf::from(pattern), reason };
    let mut paths = glob::glob(pattern)
        .map_err(|e| read_err(e.to_string()))?
        .collect::<std::result::Result<Vec<PathBuf>, _>>()
        .map_err(|e| read_err(e.to_string()))?;
    if paths.len() != nz * nv {
        return Err(read_err(format!("found {} files, expected nz * nv = {}", paths.len(), nz * nv)));
    }
    paths.sort();

    let mut img = Array4::<f32>::zeros((nx, ny, nz, nv).f());
    let buffer = img.as_slice_memory_order_mut().ok_or_else(|| read_err("non-contiguous buffer".to_string()))?;
    buffer
        .par_chunks_exact_mut(nx * ny)
        .zip(paths.par_iter())
        .try_for_each(|(s, p)| read_i16_be_slice(p, s))?;
    Ok(img)
}

fn read_i16_be_slice(file: &Path, values: &mut [f32]) -> Result<()> {
    let mut bytes = Vec::<u8>::with_capacity(values.len() * std::mem::size_of::<i16>());
    File::open(file)?.read_to_end(&mut bytes)?;
    if bytes.len() != values.len() * std::mem::size_of::<i16>() {
        return Err(ReconError::ImageRead {
            path: file.to_path_buf(),
            reason: format!("expected {} bytes, found {}", values.len() * std::mem::size_of::<i16>(), bytes.len()),
        });
    }
    let mut raw = vec![0i16; values.len()];
    byteorder::BigEndian::read_i16_into(&bytes, &mut raw);
    values.iter_mut().zip(raw).for_each(|(x, r)| *x = r as f32);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array_utils::to_col_maj_vec;
    use ndarray::{array, Array3};

    #[test]
    fn matrix_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motion.txt");
        std::fs::write(&path, "# tx ty tz rx ry rz\n0 0 0 0 0 0\n\n1.5, -2, 0.25, 0.1 0.2 0.3\n").unwrap();
        let m = read_matrix(&path).unwrap();
        assert_eq!(m, array![[0f32, 0., 0., 0., 0., 0.], [1.5, -2., 0.25, 0.1, 0.2, 0.3]]);

        let out = dir.path().join("copy.txt");
        write_matrix(&out, &m).unwrap();
        assert_eq!(read_matrix(&out).unwrap(), m);
    }

    #[test]
    fn ragged_matrix_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grad.txt");
        std::fs::write(&path, "1 0 0 1000\n0 1 0\n").unwrap();
        assert!(matches!(read_matrix(&path), Err(ReconError::MatrixParse { .. })));
        std::fs::write(&path, "1 0 x 1000\n").unwrap();
        assert!(matches!(read_matrix(&path), Err(ReconError::MatrixParse { .. })));
    }

    #[test]
    fn npy_images_keep_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dwi.npy");
        let img = Array4::from_shape_fn((3, 2, 2, 2).f(), |(x, y, z, v)| (x + 3 * y + 6 * z + 12 * v) as f32);
        write_image(&path, &img).unwrap();
        let back = read_image4(&path).unwrap();
        assert_eq!(back, img);
        let flat = to_col_maj_vec(&back.view());
        flat.iter().enumerate().for_each(|(i, &v)| assert_eq!(v, i as f32));

        let vol = Array3::<f32>::ones((2, 2, 2));
        write_image(&path, &vol).unwrap();
        assert_eq!(read_image4(&path).unwrap().dim(), (2, 2, 2, 1));

        let rebuilt = image_from_col_maj(&[3, 2, 2, 2], flat).unwrap();
        assert_eq!(rebuilt.into_dimensionality::<Ix4>().unwrap(), img);
    }

    #[test]
    fn non_finite_values_are_zeroed() {
        let mut x = vec![1., f32::NAN, f32::INFINITY, -2., f32::NEG_INFINITY];
        assert_eq!(replace_non_finite(&mut x), 3);
        assert_eq!(x, vec![1., 0., 0., -2., 0.]);
    }

    #[test]
    fn raw_slice_stack() {
        let dir = tempfile::tempdir().unwrap();
        let (nx, ny, nz, nv) = (3, 2, 2, 2);
        for k in 0..nz * nv {
            let values: Vec<i16> = (0..nx * ny).map(|i| (k * 100 + i) as i16).collect();
            let mut bytes = vec![0u8; values.len() * 2];
            byteorder::BigEndian::write_i16_into(&values, &mut bytes);
            std::fs::write(dir.path().join(format!("slice.{:04}.raw", k)), bytes).unwrap();
        }
        let pattern = dir.path().join("slice.*.raw").display().to_string();
        let img = read_raw_slices(&pattern, &[nx, ny, nz, nv]).unwrap();
        assert_eq!(img[[1, 1, 0, 0]], 4.);
        assert_eq!(img[[2, 0, 1, 0]], 102.);
        assert_eq!(img[[0, 1, 1, 1]], 303.);

        assert!(read_raw_slices(&pattern, &[nx, ny, 3, nv]).is_err());
    }
}
