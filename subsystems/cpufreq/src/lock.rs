//! # Domain Lock Table
//!
//! One reader/writer lock per scaling domain, reached through an owner map:
//!
//! ```text
//!   cpu ──▶ owner[cpu] ──▶ locks[owner]
//!    2         0             RwLock (domain of CPUs 0-3)
//! ```
//!
//! The owner entry of a CPU changes on merge and on owner promotion. A
//! caller resolves the owner, takes that lock, then re-checks that the CPU is
//! still online and still owned by the same CPU. A CPU that went offline in
//! between fails with [`CpuFreqError::StaleCpu`]; an owner change retries.
//!
//! Lock order: domain lock, then registry lock, then policy data lock.
//! Governor callbacks run with the domain writer lock held and must not take
//! any domain lock themselves.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cpumask::{AtomicCpuMask, MAX_CPUS};
use crate::error::{CpuFreqError, CpuFreqResult};

const NO_OWNER: usize = usize::MAX;

/// Per-domain reader/writer locks indexed through the owning CPU
pub struct DomainLockTable {
    owner: [AtomicUsize; MAX_CPUS],
    locks: [RwLock<()>; MAX_CPUS],
}

impl DomainLockTable {
    /// Create a table with no CPU assigned
    pub fn new() -> Self {
        Self {
            owner: core::array::from_fn(|_| AtomicUsize::new(NO_OWNER)),
            locks: core::array::from_fn(|_| RwLock::new(())),
        }
    }

    /// Owning CPU currently recorded for `cpu`
    pub fn owner_of(&self, cpu: usize) -> Option<usize> {
        let owner = self.owner.get(cpu)?.load(Ordering::Acquire);
        (owner != NO_OWNER).then_some(owner)
    }

    /// Point `cpu` at a new owning CPU, or detach it
    pub(crate) fn set_owner(&self, cpu: usize, owner: Option<usize>) {
        if let Some(slot) = self.owner.get(cpu) {
            let owner = owner.filter(|&o| o < MAX_CPUS).unwrap_or(NO_OWNER);
            slot.store(owner, Ordering::Release);
        }
    }

    /// Take the reader lock of `cpu`'s domain
    pub fn read<'a>(
        &'a self,
        cpu: usize,
        online: &AtomicCpuMask,
    ) -> CpuFreqResult<DomainReadGuard<'a>> {
        loop {
            let owner = self.owner_of(cpu).ok_or(CpuFreqError::NotFound)?;
            let guard = self.locks[owner].read();
            if let Some(owner) = self.revalidate(cpu, owner, online)? {
                return Ok(DomainReadGuard {
                    owner,
                    _guard: guard,
                });
            }
        }
    }

    /// Take the writer lock of `cpu`'s domain
    pub fn write<'a>(
        &'a self,
        cpu: usize,
        online: &AtomicCpuMask,
    ) -> CpuFreqResult<DomainWriteGuard<'a>> {
        loop {
            let owner = self.owner_of(cpu).ok_or(CpuFreqError::NotFound)?;
            let guard = self.locks[owner].write();
            if let Some(owner) = self.revalidate(cpu, owner, online)? {
                return Ok(DomainWriteGuard {
                    owner,
                    _guard: guard,
                });
            }
        }
    }

    /// `Ok(None)` asks the caller to drop its guard and retry
    fn revalidate(
        &self,
        cpu: usize,
        owner: usize,
        online: &AtomicCpuMask,
    ) -> CpuFreqResult<Option<usize>> {
        if !online.test(cpu) {
            log::debug!("cpufreq: CPU {} went offline while locking", cpu);
            return Err(CpuFreqError::StaleCpu);
        }
        if self.owner_of(cpu) != Some(owner) {
            return Ok(None);
        }
        Ok(Some(owner))
    }
}

impl Default for DomainLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DomainLockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for cpu in 0..MAX_CPUS {
            if let Some(owner) = self.owner_of(cpu) {
                map.entry(&cpu, &owner);
            }
        }
        map.finish()
    }
}

/// Held reader lock of one domain
pub struct DomainReadGuard<'a> {
    owner: usize,
    _guard: RwLockReadGuard<'a, ()>,
}

impl DomainReadGuard<'_> {
    /// Owning CPU of the locked domain
    pub fn owner(&self) -> usize {
        self.owner
    }
}

impl fmt::Debug for DomainReadGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainReadGuard").field("owner", &self.owner).finish()
    }
}

/// Held writer lock of one domain
pub struct DomainWriteGuard<'a> {
    owner: usize,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl DomainWriteGuard<'_> {
    /// Owning CPU of the locked domain
    pub fn owner(&self) -> usize {
        self.owner
    }
}

impl fmt::Debug for DomainWriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainWriteGuard").field("owner", &self.owner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn online(cpus: &[usize]) -> AtomicCpuMask {
        let mask = AtomicCpuMask::new();
        for &cpu in cpus {
            mask.assign(cpu, true);
        }
        mask
    }

    #[test]
    fn test_shared_owner_excludes_writers() {
        let table = DomainLockTable::new();
        let online = online(&[0, 1]);
        table.set_owner(0, Some(0));
        table.set_owner(1, Some(0));

        let guard = table.write(1, &online).unwrap();
        assert_eq!(guard.owner(), 0);
        assert!(table.locks[0].try_read().is_none());
        drop(guard);

        let r0 = table.read(0, &online).unwrap();
        let r1 = table.read(1, &online).unwrap();
        assert_eq!(r0.owner(), r1.owner());
    }

    #[test]
    fn test_offline_cpu_is_stale() {
        let table = DomainLockTable::new();
        let online = online(&[0]);
        table.set_owner(3, Some(3));

        assert_eq!(table.write(3, &online).unwrap_err(), CpuFreqError::StaleCpu);
        // the failed attempt released the lock
        assert!(table.locks[3].try_write().is_some());
    }

    #[test]
    fn test_owner_change_while_waiting_retries() {
        let table = DomainLockTable::new();
        let online = online(&[0, 1]);
        table.set_owner(0, Some(0));
        table.set_owner(1, Some(0));

        let held = table.write(0, &online).unwrap();
        let acquired = thread::scope(|s| {
            let waiter = s.spawn(|| {
                table.write(1, &online).map(|guard| {
                    let old_free = table.locks[0].try_write().is_some();
                    let new_held = table.locks[1].try_read().is_none();
                    (guard.owner(), old_free, new_held)
                })
            });
            thread::sleep(Duration::from_millis(50));
            table.set_owner(1, Some(1));
            drop(held);
            waiter.join().unwrap()
        });
        assert_eq!(acquired, Ok((1, true, true)));
    }

    #[test]
    fn test_offline_while_waiting_is_stale() {
        let table = DomainLockTable::new();
        let online = online(&[0, 1]);
        table.set_owner(0, Some(0));
        table.set_owner(1, Some(0));

        let held = table.write(0, &online).unwrap();
        let ret = thread::scope(|s| {
            let waiter = s.spawn(|| table.read(1, &online).map(|guard| guard.owner()));
            thread::sleep(Duration::from_millis(50));
            online.assign(1, false);
            drop(held);
            waiter.join().unwrap()
        });
        assert_eq!(ret, Err(CpuFreqError::StaleCpu));
        assert!(table.locks[0].try_write().is_some());
        assert!(table.locks[1].try_write().is_some());
    }

    #[test]
    fn test_unmapped_cpu() {
        let table = DomainLockTable::new();
        let online = online(&[0]);
        assert_eq!(table.read(0, &online).unwrap_err(), CpuFreqError::NotFound);
        assert_eq!(table.read(MAX_CPUS, &online).unwrap_err(), CpuFreqError::NotFound);
    }
}
