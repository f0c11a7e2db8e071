//! Real, even-order spherical harmonics.
//!
//! Coefficients for orders l = 0, 2, .., lmax are stored band by band, with index(l, m) = l(l+1)/2 + m
//! for -l <= m <= l. Positive m holds the cosine term, negative m the sine term.

use std::f64::consts::{PI, SQRT_2};

/// number of coefficients in an even-order series truncated at lmax
#[inline]
pub fn n_for_l(lmax: usize) -> usize {
    (lmax + 1) * (lmax + 2) / 2
}

#[inline]
pub fn index(l: usize, m: i64) -> usize {
    assert!(m.unsigned_abs() as usize <= l, "|m| must not exceed l");
    ((l * (l + 1) / 2) as i64 + m) as usize
}

/// orthonormalised associated Legendre functions P_l^m(x) for l = m..=lmax, including the
/// Condon-Shortley phase. Entries below m are left at zero.
pub fn plm_sph(lmax: usize, m: usize, x: f64) -> Vec<f64> {
    let mut p = vec![0f64; lmax + 1];
    if m > lmax {
        return p;
    }
    let x2 = x * x;
    if m > 0 && x2 >= 1.0 {
        return p;
    }

    // P_m^m
    let mut pmm = (1. / (4. * PI)).sqrt();
    if m > 0 {
        let mut f = 1f64;
        for k in 1..=m {
            f *= (2 * k - 1) as f64 / (2 * k) as f64;
        }
        pmm *= ((2 * m + 1) as f64 * f).sqrt() * (1. - x2).powf(0.5 * m as f64);
        if m % 2 == 1 {
            pmm = -pmm;
        }
    }
    p[m] = pmm;
    if lmax == m {
        return p;
    }

    p[m + 1] = x * ((2 * m + 3) as f64).sqrt() * pmm;

    for l in (m + 2)..=lmax {
        let lf = l as f64;
        let mf = m as f64;
        let a = ((4. * lf * lf - 1.) / (lf * lf - mf * mf)).sqrt();
        let b = (((lf - 1.) * (lf - 1.) - mf * mf) / (4. * (lf - 1.) * (lf - 1.) - 1.)).sqrt();
        p[l] = a * (x * p[l - 1] - b * p[l - 2]);
    }
    p
}

/// Evaluates every basis function of the even-order series at a direction. This is the SH
/// expansion of a delta function pointing along `dir`. Non-unit directions are normalised;
/// a null direction is evaluated at the equator.
pub fn delta(dir: &[f32; 3], lmax: usize) -> Vec<f32> {
    assert_eq!(lmax % 2, 0, "lmax must be even");
    let mut out = vec![0f32; n_for_l(lmax)];

    let [x, y, z] = dir.map(|c| c as f64);
    let norm = (x * x + y * y + z * z).sqrt();
    let cos_el = if norm > 0. { z / norm } else { 0. };
    let az = y.atan2(x);

    let al = plm_sph(lmax, 0, cos_el);
    for l in (0..=lmax).step_by(2) {
        out[index(l, 0)] = al[l] as f32;
    }
    for m in 1..=lmax {
        let al = plm_sph(lmax, m, cos_el);
        let c = SQRT_2 * (m as f64 * az).cos();
        let s = SQRT_2 * (m as f64 * az).sin();
        let l_start = if m % 2 == 1 { m + 1 } else { m };
        for l in (l_start..=lmax).step_by(2) {
            out[index(l, m as i64)] = (al[l] * c) as f32;
            out[index(l, -(m as i64))] = (al[l] * s) as f32;
        }
    }
    out
}
