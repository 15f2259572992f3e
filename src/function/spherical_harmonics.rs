//! Real spherical harmonics up to degree 3.

/// The maximum degree of spherical harmonics.
pub const SH_DEGREE_MAX: u32 = 3;

/// `SH_C[degree][order]`
pub const SH_C: [&[f32]; 4] = [
    &[0.28209479177387814],
    &[0.4886025119029199, 0.4886025119029199, 0.4886025119029199],
    &[
        1.0925484305920792,
        -1.0925484305920792,
        0.31539156525252005,
        -1.0925484305920792,
        0.5462742152960396,
    ],
    &[
        -0.5900435899266435,
        2.890611442640554,
        -0.4570457994644658,
        0.3731763325901154,
        -0.4570457994644658,
        1.445305721320277,
        -0.5900435899266435,
    ],
];

/// The count of SH coefficients per channel for a degree.
#[inline]
pub const fn sh_count(degree: u32) -> usize {
    ((degree + 1) * (degree + 1)) as usize
}

/// Evaluating the SH basis of `degree` at the unit `direction`.
///
/// Only the first [`sh_count(degree)`](sh_count) entries of the output are written.
pub fn sh_basis(
    degree: u32,
    direction: [f32; 3],
    basis: &mut [f32; 16],
) {
    let [x, y, z] = direction;

    basis[0] = SH_C[0][0];
    if degree < 1 {
        return;
    }

    basis[1] = -SH_C[1][0] * y;
    basis[2] = SH_C[1][1] * z;
    basis[3] = -SH_C[1][2] * x;
    if degree < 2 {
        return;
    }

    let (xx, yy, zz) = (x * x, y * y, z * z);
    let (xy, yz, xz) = (x * y, y * z, x * z);
    basis[4] = SH_C[2][0] * xy;
    basis[5] = SH_C[2][1] * yz;
    basis[6] = SH_C[2][2] * (2.0 * zz - xx - yy);
    basis[7] = SH_C[2][3] * xz;
    basis[8] = SH_C[2][4] * (xx - yy);
    if degree < 3 {
        return;
    }

    basis[9] = SH_C[3][0] * y * (3.0 * xx - yy);
    basis[10] = SH_C[3][1] * xy * z;
    basis[11] = SH_C[3][2] * y * (4.0 * zz - xx - yy);
    basis[12] = SH_C[3][3] * z * (2.0 * zz - 3.0 * xx - 3.0 * yy);
    basis[13] = SH_C[3][4] * x * (4.0 * zz - xx - yy);
    basis[14] = SH_C[3][5] * z * (xx - yy);
    basis[15] = SH_C[3][6] * x * (xx - 3.0 * yy);
}

/// RGB in `[0, 1]` to the DC coefficient.
#[inline]
pub fn rgb_to_sh_dc(value: f32) -> f32 {
    (value - 0.5) / SH_C[0][0]
}

/// The DC coefficient to RGB.
#[inline]
pub fn sh_dc_to_rgb(value: f32) -> f32 {
    value * SH_C[0][0] + 0.5
}

#[cfg(test)]
mod tests {
    #[test]
    fn dc_round_trip() {
        use super::*;

        [0.0_f32, 0.25, 0.5, 1.0].into_iter().for_each(|v| {
            let output = sh_dc_to_rgb(rgb_to_sh_dc(v));
            assert!((output - v).abs() < 1e-6);
        });
    }

    #[test]
    fn basis_counts() {
        use super::*;

        assert_eq!(sh_count(0), 1);
        assert_eq!(sh_count(1), 4);
        assert_eq!(sh_count(3), 16);

        let mut basis = [f32::NAN; 16];
        sh_basis(1, [0.0, 0.0, 1.0], &mut basis);
        assert_eq!(basis[0], SH_C[0][0]);
        assert_eq!(basis[2], SH_C[1][1]);
        assert!(basis[4].is_nan(), "Degree 2 should be untouched");
    }
}
