//! The simulation box, or cell, which wraps at each face indefinitely. Unlike an orthorhombic box,
//! we store the full matrix so we can support triclinic cells.
//!
//! The box vectors are the *rows* of the matrix: a = box[0], b = box[1], c = box[2]. The matrix
//! must be lower-triangular (a along x, b in the xy plane), with positive diagonal. Any cell can be
//! rotated into this form.

use lin_alg::f64::Vec3;

use crate::PmeError;

/// Row-major 3x3 tensor. Used for the box, its reciprocal, virials, and pressure.
pub type Matrix3 = [[f64; 3]; 3];

pub(crate) const ZERO_MATRIX: Matrix3 = [[0.; 3]; 3];

pub(crate) fn mat_add(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut r = ZERO_MATRIX;
    for i in 0..3 {
        for j in 0..3 {
            r[i][j] = a[i][j] + b[i][j];
        }
    }
    r
}

pub(crate) fn mat_scale(a: &Matrix3, s: f64) -> Matrix3 {
    let mut r = *a;
    for row in &mut r {
        for v in row {
            *v *= s;
        }
    }
    r
}

/// a · b
pub(crate) fn mat_mul(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut r = ZERO_MATRIX;
    for i in 0..3 {
        for j in 0..3 {
            r[i][j] = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
        }
    }
    r
}

/// aᵀ · b
pub(crate) fn mat_tmul(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut r = ZERO_MATRIX;
    for i in 0..3 {
        for j in 0..3 {
            r[i][j] = a[0][i] * b[0][j] + a[1][i] * b[1][j] + a[2][i] * b[2][j];
        }
    }
    r
}

/// a · bᵀ
pub(crate) fn mat_mult(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut r = ZERO_MATRIX;
    for i in 0..3 {
        for j in 0..3 {
            r[i][j] = a[i][0] * b[j][0] + a[i][1] * b[j][1] + a[i][2] * b[j][2];
        }
    }
    r
}

/// Inverse of a lower-triangular matrix with non-zero diagonal.
pub(crate) fn mat_inv_lower(a: &Matrix3) -> Matrix3 {
    let mut r = ZERO_MATRIX;
    r[0][0] = 1. / a[0][0];
    r[1][1] = 1. / a[1][1];
    r[2][2] = 1. / a[2][2];
    r[1][0] = -a[1][0] * r[0][0] * r[1][1];
    r[2][1] = -a[2][1] * r[1][1] * r[2][2];
    r[2][0] = (a[1][0] * a[2][1] * r[1][1] - a[2][0]) * r[0][0] * r[2][2];
    r
}

/// Lower-triangular box matrix. See the module docs for the convention.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimBox {
    pub m: Matrix3,
}

impl SimBox {
    pub fn new(m: Matrix3) -> Result<Self, PmeError> {
        if m[0][1] != 0. || m[0][2] != 0. || m[1][2] != 0. {
            return Err(PmeError::config(
                "Box matrix must be lower-triangular: a along x, b in the xy plane.",
            ));
        }
        if !(m[0][0] > 0. && m[1][1] > 0. && m[2][2] > 0.) {
            return Err(PmeError::config("Box matrix diagonal must be positive."));
        }
        if m.iter().flatten().any(|v| !v.is_finite()) {
            return Err(PmeError::config("Box matrix contains non-finite values."));
        }

        Ok(Self { m })
    }

    /// A rectangular box with the given edge lengths.
    pub fn orthorhombic(lx: f64, ly: f64, lz: f64) -> Result<Self, PmeError> {
        Self::new([[lx, 0., 0.], [0., ly, 0.], [0., 0., lz]])
    }

    pub fn volume(&self) -> f64 {
        self.m[0][0] * self.m[1][1] * self.m[2][2]
    }

    pub fn recip(&self) -> RecipBox {
        RecipBox::new(&self.m)
    }

    /// Box vector lengths |a|, |b|, |c|.
    pub fn lengths(&self) -> [f64; 3] {
        self.m
            .map(|row| (row[0] * row[0] + row[1] * row[1] + row[2] * row[2]).sqrt())
    }

    pub fn is_orthorhombic(&self) -> bool {
        self.m[1][0] == 0. && self.m[2][0] == 0. && self.m[2][1] == 0.
    }
}

/// The reciprocal box: the non-zero entries of the inverse of the (lower-triangular) box matrix.
/// Fractional coordinates are `s = r · recip`, component-wise:
/// sx = x rxx + y ryx + z rzx, sy = y ryy + z rzy, sz = z rzz.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecipBox {
    pub rxx: f64,
    pub ryx: f64,
    pub ryy: f64,
    pub rzx: f64,
    pub rzy: f64,
    pub rzz: f64,
}

impl RecipBox {
    pub fn new(b: &Matrix3) -> Self {
        let inv = mat_inv_lower(b);

        Self {
            rxx: inv[0][0],
            ryx: inv[1][0],
            ryy: inv[1][1],
            rzx: inv[2][0],
            rzy: inv[2][1],
            rzz: inv[2][2],
        }
    }

    /// Fractional coordinates in units of box vectors; [0, 1) inside the primary cell.
    pub fn fractional(&self, r: Vec3) -> [f64; 3] {
        [
            r.x * self.rxx + r.y * self.ryx + r.z * self.rzx,
            r.y * self.ryy + r.z * self.rzy,
            r.z * self.rzz,
        ]
    }

    /// The Cartesian reciprocal-lattice vector for signed integer indices (mx, my, mz).
    /// Without the factor of 2π.
    pub fn lattice_vec(&self, mx: f64, my: f64, mz: f64) -> [f64; 3] {
        [
            mx * self.rxx,
            mx * self.ryx + my * self.ryy,
            mx * self.rzx + my * self.rzy + mz * self.rzz,
        ]
    }
}

/// Wrap a position into the primary (possibly triclinic) unit cell, so that its fractional
/// coordinates are in [0, 1). The spreader requires this of its inputs. The cell is the sheared
/// one spanned by the box vectors, not the rectangular brick of the diagonal.
pub fn wrap_to_unit_cell(cell: &SimBox, p: Vec3) -> Vec3 {
    let recip = cell.recip();
    let b = &cell.m;
    let mut r = [p.x, p.y, p.z];

    let frac = |r: &[f64; 3], m: usize| recip.fractional(Vec3::new(r[0], r[1], r[2]))[m];
    let shift_by = |r: &mut [f64; 3], m: usize, n: f64| {
        for d in 0..=m {
            r[d] -= n * b[m][d];
        }
    };

    // Shifting by box vector m only changes fractional coordinate m.
    for m in (0..3).rev() {
        let n = frac(&r, m).floor();
        if n != 0. {
            shift_by(&mut r, m, n);
        }

        // Rounding can land exactly on the upper face.
        let s = frac(&r, m);
        if s >= 1. {
            shift_by(&mut r, m, 1.);
        } else if s < 0. {
            shift_by(&mut r, m, -1.);
        }
    }

    Vec3::new(r[0], r[1], r[2])
}
