//! Symmetric positive definite inversion for the term coupling matrices.

use nalgebra::DMatrix;

use crate::error::{Error, Result};

/// Relative determinant below which a coupling matrix is treated as singular.
const MIN_RELATIVE_DETERMINANT: f64 = 1e-12;

/// Inverse and determinant of a symmetric positive definite matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct SpdInverse {
    pub inverse: DMatrix<f64>,
    pub determinant: f64,
}

/// Inverts `matrix` through its Cholesky factorisation.
///
/// `scale` only labels the error. Fails when the matrix is not positive
/// definite, when its determinant is negligible relative to the product of its
/// diagonal, or when the inverse contains non-finite values.
pub fn invert_spd(matrix: &DMatrix<f64>, scale: usize) -> Result<SpdInverse> {
    debug_assert!(matrix.is_square());
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(Error::NonFinite {
            what: "coupling matrix",
            scale,
        });
    }

    let cholesky = matrix
        .clone()
        .cholesky()
        .ok_or(Error::NotPositiveDefinite { scale })?;

    let l = cholesky.l_dirty();
    let determinant: f64 = (0..matrix.nrows()).map(|i| l[(i, i)] * l[(i, i)]).product();
    let diagonal: f64 = matrix.diagonal().iter().product();
    if !(determinant > 0.0) || determinant <= MIN_RELATIVE_DETERMINANT * diagonal.abs() {
        return Err(Error::DegenerateCoupling { scale, determinant });
    }

    let inverse = cholesky.inverse();
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(Error::NonFinite {
            what: "inverse coupling matrix",
            scale,
        });
    }

    Ok(SpdInverse {
        inverse,
        determinant,
    })
}
