//! Memory ceiling accounting.
//!
//! A [`MemoryBudget`] tracks the bytes charged by one process context against a
//! hard ceiling. Every footprint change of a group or communicator goes through
//! [`MemoryBudget::reserve`] / [`MemoryBudget::release`]; a reservation that
//! would exceed the ceiling fails instead of allocating.
//!
//! `max` is the share currently granted to the context, `glo_max` the process
//! ceiling that `max` may never exceed.

use crate::mesh_error::ParMeshError;
use log::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryBudget {
    cur: usize,
    max: usize,
    glo_max: usize,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl MemoryBudget {
    /// Budget whose share is the whole process ceiling.
    pub fn new(glo_max: usize) -> Self {
        Self {
            cur: 0,
            max: glo_max,
            glo_max,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    pub fn current(&self) -> usize {
        self.cur
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn glo_max(&self) -> usize {
        self.glo_max
    }

    pub fn available(&self) -> usize {
        self.max.saturating_sub(self.cur)
    }

    /// Charge `bytes` against the budget.
    pub fn reserve(&mut self, bytes: usize, context: &'static str) -> Result<(), ParMeshError> {
        match self.cur.checked_add(bytes) {
            Some(total) if total <= self.max => {
                self.cur = total;
                Ok(())
            }
            _ => Err(ParMeshError::OutOfMemory {
                context,
                requested: bytes,
                current: self.cur,
                max: self.max,
            }),
        }
    }

    /// Charge room for `n` values of `T`.
    pub fn reserve_for<T>(&mut self, n: usize, context: &'static str) -> Result<(), ParMeshError> {
        let bytes = n
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(ParMeshError::OutOfMemory {
                context,
                requested: usize::MAX,
                current: self.cur,
                max: self.max,
            })?;
        self.reserve(bytes, context)
    }

    /// Return `bytes` to the budget.
    pub fn release(&mut self, bytes: usize) {
        if bytes > self.cur {
            warn!(
                "tried to free more memory than allocated ({bytes} > {}); possible accounting leak",
                self.cur
            );
            self.cur = 0;
        } else {
            self.cur -= bytes;
        }
    }

    /// Move a charge from `old` to `new` bytes. Shrinking never fails.
    pub fn resize(
        &mut self,
        old: usize,
        new: usize,
        context: &'static str,
    ) -> Result<(), ParMeshError> {
        if new >= old {
            self.reserve(new - old, context)
        } else {
            self.release(old - new);
            Ok(())
        }
    }

    /// Shrink the share to what is in use and hand the rest over as a budget
    /// of its own, for scratch work that must not grow the context.
    pub fn devote_remaining(&mut self) -> MemoryBudget {
        let spare = self.available();
        self.max = self.cur;
        MemoryBudget::new(spare)
    }

    /// Sanity check: this context plus the extra usages must stay below the
    /// process ceiling.
    pub fn check_cur_and_max(
        &self,
        others: impl IntoIterator<Item = usize>,
        context: &'static str,
    ) -> Result<(), ParMeshError> {
        let total = others
            .into_iter()
            .fold(self.cur, |acc, used| acc.saturating_add(used));
        if total > self.glo_max {
            return Err(ParMeshError::OutOfMemory {
                context,
                requested: total - self.cur,
                current: self.cur,
                max: self.glo_max,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_a_hard_cap() {
        let mut b = MemoryBudget::new(100);
        b.reserve(60, "a").unwrap();
        let err = b.reserve(41, "b").unwrap_err();
        assert!(matches!(err, ParMeshError::OutOfMemory { context: "b", .. }));
        assert_eq!(b.current(), 60);
        b.reserve(40, "c").unwrap();
        assert_eq!(b.available(), 0);
    }

    #[test]
    fn release_saturates() {
        let mut b = MemoryBudget::new(100);
        b.reserve(10, "a").unwrap();
        b.release(25);
        assert_eq!(b.current(), 0);
    }

    #[test]
    fn resize_and_share() {
        let mut b = MemoryBudget::new(500);
        b.reserve_for::<f64>(10, "metric").unwrap();
        assert_eq!(b.current(), 80);
        b.resize(80, 600, "grow").unwrap_err();
        b.resize(80, 40, "shrink").unwrap();
        assert_eq!(b.current(), 40);
        let spare = b.devote_remaining();
        assert_eq!((spare.max(), spare.current()), (460, 0));
        assert_eq!(b.max(), 40);
        assert!(b.reserve(1, "after").is_err());
        assert_eq!(b.glo_max(), 500);
    }

    #[test]
    fn global_check_counts_groups() {
        let mut b = MemoryBudget::new(100);
        b.reserve(50, "ctx").unwrap();
        assert!(b.check_cur_and_max([20, 30], "ok").is_ok());
        assert!(b.check_cur_and_max([20, 31], "over").is_err());
    }
}
