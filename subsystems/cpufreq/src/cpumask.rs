//! # CPU Masks
//!
//! Fixed-width CPU sets used for domain membership and the online map.

use core::fmt;
use core::ops::{BitAnd, BitOr, Not};
use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert;

/// Maximum number of CPUs tracked by the core
pub const MAX_CPUS: usize = 64;

const_assert!(MAX_CPUS <= u64::BITS as usize);

// =============================================================================
// CpuMask
// =============================================================================

/// A set of CPU ids
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    /// The empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Set containing a single CPU
    pub const fn of(cpu: usize) -> Self {
        if cpu < MAX_CPUS {
            Self(1 << cpu)
        } else {
            Self(0)
        }
    }

    /// Build from a raw bitmap
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Build from a list of CPU ids
    pub fn from_cpus(cpus: &[usize]) -> Self {
        cpus.iter().fold(Self::empty(), |mask, &cpu| mask | Self::of(cpu))
    }

    /// Raw bitmap
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Add a CPU
    pub fn set(&mut self, cpu: usize) {
        self.0 |= Self::of(cpu).0;
    }

    /// Remove a CPU
    pub fn clear(&mut self, cpu: usize) {
        self.0 &= !Self::of(cpu).0;
    }

    /// Check membership
    pub const fn test(&self, cpu: usize) -> bool {
        self.0 & Self::of(cpu).0 != 0
    }

    /// Number of CPUs in the set
    pub const fn weight(&self) -> u32 {
        self.0.count_ones()
    }

    /// Whether the set is empty
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Lowest-numbered CPU in the set
    pub const fn first(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Copy of the set without `cpu`
    pub fn without(mut self, cpu: usize) -> Self {
        self.clear(cpu);
        self
    }

    /// Iterate CPU ids in ascending order
    pub fn iter(&self) -> CpuMaskIter {
        CpuMaskIter(self.0)
    }
}

impl BitAnd for CpuMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for CpuMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Not for CpuMask {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl IntoIterator for CpuMask {
    type Item = usize;
    type IntoIter = CpuMaskIter;

    fn into_iter(self) -> CpuMaskIter {
        CpuMaskIter(self.0)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Space-separated CPU list, the format of `affected_cpus`
impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cpu) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", cpu)?;
        }
        Ok(())
    }
}

/// Iterator over the CPUs of a mask
#[derive(Debug, Clone)]
pub struct CpuMaskIter(u64);

impl Iterator for CpuMaskIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let cpu = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(cpu)
    }
}

// =============================================================================
// AtomicCpuMask
// =============================================================================

/// Lock-free CPU set, used for the online map
#[derive(Debug, Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    /// Create an empty mask
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Snapshot of the current set
    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::Acquire))
    }

    /// Add or remove a CPU
    pub fn assign(&self, cpu: usize, present: bool) {
        let bit = CpuMask::of(cpu).0;
        if present {
            self.0.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.0.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// Check membership
    pub fn test(&self, cpu: usize) -> bool {
        self.load().test(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec::Vec;

    #[test]
    fn test_mask_basic_ops() {
        let mut mask = CpuMask::from_cpus(&[3, 1, 7]);
        assert_eq!(mask.weight(), 3);
        assert_eq!(mask.first(), Some(1));
        assert_eq!(mask.iter().collect::<Vec<_>>(), [1, 3, 7]);

        mask.clear(1);
        assert!(!mask.test(1));
        assert_eq!(mask.first(), Some(3));
        assert_eq!(mask.to_string(), "3 7");
    }

    #[test]
    fn test_mask_out_of_range_ignored() {
        let mut mask = CpuMask::empty();
        mask.set(MAX_CPUS);
        assert!(mask.is_empty());
        assert!(!mask.test(MAX_CPUS + 5));
    }

    #[test]
    fn test_atomic_mask() {
        let online = AtomicCpuMask::new();
        online.assign(0, true);
        online.assign(2, true);
        online.assign(0, false);
        assert_eq!(online.load(), CpuMask::of(2));
    }
}
