//! Version counters for deconvolver inputs.
//!
//! Caches remember the versions of the inputs they were built from and are
//! rebuilt when any of them moves on.

/// Monotonic change counter of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(u64);

impl Version {
    #[inline]
    pub fn bump(&mut self) {
        self.0 += 1;
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Current versions of every input the caches depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputVersions {
    pub basis: Version,
    pub psf: Version,
    pub residual: Version,
    pub weight: Version,
}
