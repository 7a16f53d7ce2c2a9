// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CPU bitmasks: the plain [`CpuSet`] value and the atomic [`ResidencySet`].
//!
//! Joining and leaving are single-bit atomic RMWs. A reset to one CPU is a
//! plain store, done only under the owner's context lock.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert;

use crate::types::CpuId;

/// Upper bound on CPUs tracked by a residency mask.
pub const MAX_CPUS: usize = 64;

const_assert!(MAX_CPUS <= u64::BITS as usize);

#[inline]
const fn bit(cpu: CpuId) -> u64 {
    1u64 << cpu.as_index()
}

/// Snapshot of a CPU mask.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & bit(cpu) != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    #[must_use]
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | bit(cpu))
    }

    /// Iterates member CPUs in ascending order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut rest = self.0;
        core::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let idx = rest.trailing_zeros();
            rest &= rest - 1;
            Some(CpuId::from_raw(idx as u16))
        })
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(CpuId::as_raw)).finish()
    }
}

/// CPUs that may hold live translations for one address space.
#[derive(Default)]
pub struct ResidencySet(AtomicU64);

impl ResidencySet {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Adds `cpu`; returns whether it was already a member.
    #[inline]
    pub fn insert(&self, cpu: CpuId) -> bool {
        debug_assert!(cpu.as_index() < MAX_CPUS);
        self.0.fetch_or(bit(cpu), Ordering::AcqRel) & bit(cpu) != 0
    }

    /// Removes `cpu`; returns whether it was a member.
    #[inline]
    pub fn remove(&self, cpu: CpuId) -> bool {
        debug_assert!(cpu.as_index() < MAX_CPUS);
        self.0.fetch_and(!bit(cpu), Ordering::AcqRel) & bit(cpu) != 0
    }

    /// Replaces the whole set with `cpu` alone.
    ///
    /// Used when the owner is given a new context id: translations other
    /// CPUs hold are tagged with the old one.
    #[inline]
    pub fn reset_to(&self, cpu: CpuId) {
        debug_assert!(cpu.as_index() < MAX_CPUS);
        self.0.store(bit(cpu), Ordering::Release);
    }

    #[inline]
    pub fn contains(&self, cpu: CpuId) -> bool {
        self.snapshot().contains(cpu)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    #[inline]
    pub fn snapshot(&self) -> CpuSet {
        CpuSet(self.0.load(Ordering::Acquire))
    }
}

impl fmt::Debug for ResidencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResidencySet").field(&self.snapshot()).finish()
    }
}
