//! Error types for deconvolution.

use thiserror::Error;

use crate::image::Shape;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Inconsistent inputs or settings, detected at `initialize()`.
    Configuration,
    /// Image shapes that do not conform to each other.
    DimensionMismatch,
    /// Numerical failure that aborts the current solve.
    Numerical,
}

/// Errors that can occur while setting up or running a deconvolution.
#[derive(Debug, Error)]
pub enum Error {
    #[error("No Taylor terms supplied")]
    NoTerms,

    #[error("PSF vector has {actual} images, expected {expected} (2 * {terms} - 1)")]
    PsfCount {
        terms: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Got {actual} {what} images for {expected} Taylor terms")]
    TermCount {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Basis functions must be set before initialization")]
    BasisFunctionUnset,

    #[error("Invalid deconvolution control '{field}': {reason}")]
    InvalidControl { field: &'static str, reason: String },

    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Dimension mismatch for {what} {index}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        index: usize,
        expected: Shape,
        actual: Shape,
    },

    #[error("Coupling matrix for scale {scale} is not positive definite")]
    NotPositiveDefinite { scale: usize },

    #[error("Coupling matrix for scale {scale} is degenerate (determinant {determinant:e})")]
    DegenerateCoupling { scale: usize, determinant: f64 },

    #[error("Non-finite {what} for scale {scale}")]
    NonFinite { what: &'static str, scale: usize },

    #[error("PSF normalisation {value} is not positive")]
    PsfNormalisation { value: f64 },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoTerms
            | Error::PsfCount { .. }
            | Error::TermCount { .. }
            | Error::BasisFunctionUnset
            | Error::InvalidControl { .. }
            | Error::ThreadPool(_) => ErrorKind::Configuration,
            Error::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Error::NotPositiveDefinite { .. }
            | Error::DegenerateCoupling { .. }
            | Error::NonFinite { .. }
            | Error::PsfNormalisation { .. } => ErrorKind::Numerical,
        }
    }

    /// Scale index involved in a numerical failure, if any.
    pub fn scale(&self) -> Option<usize> {
        match self {
            Error::NotPositiveDefinite { scale }
            | Error::DegenerateCoupling { scale, .. }
            | Error::NonFinite { scale, .. } => Some(*scale),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fails with [`Error::DimensionMismatch`] unless `actual == expected`.
pub(crate) fn ensure_shape(
    what: &'static str,
    index: usize,
    expected: Shape,
    actual: Shape,
) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::DimensionMismatch {
            what,
            index,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psf_count_message() {
        let err = Error::PsfCount {
            terms: 2,
            expected: 3,
            actual: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("2 images"));
        assert!(msg.contains("expected 3"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let err = Error::DimensionMismatch {
            what: "weight",
            index: 0,
            expected: Shape::new(64, 64),
            actual: Shape::new(32, 64),
        };
        let msg = err.to_string();
        assert!(msg.contains("weight"));
        assert!(msg.contains("64x64"));
        assert!(msg.contains("32x64"));
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_numerical_errors_report_scale() {
        let err = Error::NotPositiveDefinite { scale: 3 };
        assert_eq!(err.kind(), ErrorKind::Numerical);
        assert_eq!(err.scale(), Some(3));
        assert!(err.to_string().contains("scale 3"));

        let err = Error::DegenerateCoupling {
            scale: 1,
            determinant: 0.0,
        };
        assert_eq!(err.scale(), Some(1));
        assert_eq!(Error::BasisFunctionUnset.scale(), None);
    }

    #[test]
    fn test_ensure_shape() {
        assert!(ensure_shape("psf", 1, Shape::new(8, 8), Shape::new(8, 8)).is_ok());
        let err = ensure_shape("psf", 1, Shape::new(8, 8), Shape::new(8, 9)).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { index: 1, .. }));
    }
}
