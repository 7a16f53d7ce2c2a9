// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-CPU record of the address space last switched into.
//!
//! Each slot is written only by its own CPU (switch path) and read by that
//! CPU's rollover handler, so plain atomic loads and swaps are enough.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::cpumask::MAX_CPUS;
use crate::types::{CpuId, MmId};

const NONE: u64 = 0;

pub struct PerCpuActive {
    slots: [AtomicU64; MAX_CPUS],
}

impl PerCpuActive {
    pub const fn new() -> Self {
        Self { slots: [const { AtomicU64::new(NONE) }; MAX_CPUS] }
    }

    #[inline]
    fn slot(&self, cpu: CpuId) -> &AtomicU64 {
        &self.slots[cpu.as_index()]
    }

    /// Address space currently active on `cpu`, if any.
    #[inline]
    pub fn get(&self, cpu: CpuId) -> Option<MmId> {
        MmId::from_raw(self.slot(cpu).load(Ordering::Acquire))
    }

    /// Records `mm` as active on `cpu` and returns the previous occupant.
    #[inline]
    pub fn replace(&self, cpu: CpuId, mm: MmId) -> Option<MmId> {
        MmId::from_raw(self.slot(cpu).swap(mm.as_raw(), Ordering::AcqRel))
    }

    /// Clears the slot if it still names `mm`.
    pub fn clear_if(&self, cpu: CpuId, mm: MmId) -> bool {
        self.slot(cpu)
            .compare_exchange(mm.as_raw(), NONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for PerCpuActive {
    fn default() -> Self {
        Self::new()
    }
}
