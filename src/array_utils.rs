// Array utilities for column-major (x-fastest) memory layouts

use ndarray::{ArrayView, Dimension};

#[inline(always)]
pub fn subscript_to_index_col_maj3(subscript: &[usize; 3], size: &[usize; 3]) -> usize {
    let z_stride = size[0] * size[1];
    let y_stride = size[0];
    subscript[2] * z_stride + subscript[1] * y_stride + subscript[0]
}

/// returns the linear index of a signed grid coordinate, or None if it falls outside the grid
#[inline(always)]
pub fn checked_index_col_maj3(coord: &[i64; 3], size: &[usize; 3]) -> Option<usize> {
    let in_bounds = coord.iter().zip(size).all(|(&c, &n)| c >= 0 && (c as usize) < n);
    if in_bounds {
        Some(subscript_to_index_col_maj3(&[coord[0] as usize, coord[1] as usize, coord[2] as usize], size))
    } else {
        None
    }
}

/// flattens an array into a column-major (first axis fastest) buffer
pub fn to_col_maj_vec<D: Dimension>(a: &ArrayView<f32, D>) -> Vec<f32> {
    a.t().iter().copied().collect()
}

/// inner product accumulated in double precision
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    assert_eq!(a.len(), b.len(), "vectors must have the same length");
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x_varies_fastest() {
        let size = [4, 3, 5];
        assert_eq!(subscript_to_index_col_maj3(&[1, 2, 3], &size), 1 + 2 * 4 + 3 * 12);
        assert_eq!(subscript_to_index_col_maj3(&[3, 2, 4], &size), 59);
        assert_eq!(subscript_to_index_col_maj3(&[1, 0, 0], &size), 1);
    }

    #[test]
    fn out_of_bounds_is_none() {
        let size = [4, 3, 5];
        assert_eq!(checked_index_col_maj3(&[-1, 0, 0], &size), None);
        assert_eq!(checked_index_col_maj3(&[0, 3, 0], &size), None);
        assert_eq!(checked_index_col_maj3(&[0, 0, 5], &size), None);
        assert_eq!(checked_index_col_maj3(&[3, 2, 4], &size), Some(59));
    }

    #[test]
    fn col_maj_flatten() {
        use ndarray::{Array3, ShapeBuilder};
        let size = [3, 2, 4];
        let a = Array3::from_shape_fn(size.f(), |(i, j, k)| (i + 10 * j + 100 * k) as f32);
        let flat = to_col_maj_vec(&a.view());
        for k in 0..size[2] {
            for j in 0..size[1] {
                for i in 0..size[0] {
                    assert_eq!(flat[subscript_to_index_col_maj3(&[i, j, k], &size)], (i + 10 * j + 100 * k) as f32);
                }
            }
        }
        assert_eq!(flat, a.as_slice_memory_order().unwrap());
    }
}
