// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the mm context code
//! OWNERS: @kernel-mm-team
//! PUBLIC API: CpuId, MmId, PageTableRoot
//! INVARIANTS: MmId is never zero (zero encodes "no address space" in per-CPU slots)

use core::fmt;
use core::num::NonZeroU64;

/// Logical CPU identifier used to index per-CPU state and residency masks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_boot(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Identity of an address space as handed out by the owning task subsystem.
///
/// **Ownership**: the process/task layer mints these; this crate only compares them.
/// **Invariant**: non-zero, unique among live address spaces.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct MmId(NonZeroU64);

impl MmId {
    /// Constructs an id from its raw value; zero is rejected.
    #[inline]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for MmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mm{}", self.as_raw())
    }
}

/// Physical address of a first-level translation table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PageTableRoot(usize);

impl PageTableRoot {
    #[inline]
    pub const fn new(pa: usize) -> Self {
        Self(pa)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for PageTableRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
