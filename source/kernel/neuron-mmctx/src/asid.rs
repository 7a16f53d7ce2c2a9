// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Generation-based ASID allocation
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AsidAllocator (refresh/ensure_flushed/handle_rollover/generation/
//!             flushed_generation), Allocation
//! DEPENDS_ON: hal::Platform (local flushes, rollover broadcast)
//! INVARIANTS: counter only grows; ASID 0 of every generation is never handed out;
//!             ASIDs 1..=cpus of a rolled-over generation belong to the per-CPU rollover handlers;
//!             a CPU loads an id of generation g only after flushing for g;
//!             storing a new id into an mm resets its residency to the storing CPU
//!
//! There is no free path. An address space's ASID becomes reusable once the
//! counter has moved to a later generation, and every holder of an old id
//! reallocates on its next activation.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::address_space::AddressSpace;
use crate::context_id::{AsidLayout, ContextId};
use crate::cpumask::MAX_CPUS;
use crate::hal::{flush_local, FlushScope, Platform};
use crate::types::CpuId;

/// Result of one counter increment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub id: ContextId,
    /// This increment wrapped the ASID field and started a new generation.
    pub rollover: bool,
}

pub struct AsidAllocator {
    layout: AsidLayout,
    cpus: usize,
    scope: FlushScope,
    counter: AtomicU64,
    // Highest generation each CPU has flushed its TLB for.
    flushed: [AtomicU64; MAX_CPUS],
}

impl AsidAllocator {
    /// Creates the allocator at generation 1, ASID 0.
    pub const fn new(layout: AsidLayout, cpus: usize, scope: FlushScope) -> Self {
        Self {
            layout,
            cpus,
            scope,
            counter: AtomicU64::new(layout.first_version()),
            flushed: [const { AtomicU64::new(1) }; MAX_CPUS],
        }
    }

    #[inline]
    pub fn layout(&self) -> AsidLayout {
        self.layout
    }

    /// Raw counter: current generation and the last ASID handed out.
    #[inline]
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.layout.generation_of(self.counter())
    }

    /// Optimistic staleness test used on every activation.
    ///
    /// The load may miss a concurrent rollover. The id it accepted is then
    /// replaced on this CPU by the rollover handler once the broadcast lands,
    /// so a missed rollover never outlives the broadcast. A stale read in the
    /// other direction only costs a trip through [`refresh`](Self::refresh).
    #[inline]
    pub fn is_current(&self, id: ContextId) -> bool {
        id.is_current(self.counter(), self.layout)
    }

    /// Gives `mm` an id of the current generation unless another CPU already did.
    ///
    /// Returns the id to load and the allocation performed, if any.
    pub fn refresh<P: Platform + ?Sized>(
        &self,
        cpu: CpuId,
        mm: &AddressSpace,
        platform: &P,
    ) -> (ContextId, Option<Allocation>) {
        let _guard = mm.lock_context();
        let observed = mm.context_id();
        if self.is_current(observed) {
            return (observed, None);
        }
        let allocation = self.bump();
        mm.set_context_id(allocation.id);
        mm.residency().reset_to(cpu);
        log::trace!(target: "mm", "asid: {} -> {} on cpu {}", mm.id(), allocation.id, cpu);
        if allocation.rollover {
            self.rollover(cpu, allocation.id.generation(self.layout), platform);
        }
        (allocation.id, Some(allocation))
    }

    /// Flushes `cpu` if it has not yet flushed for `generation`.
    ///
    /// Covers the window between another CPU's rollover increment and the
    /// arrival of its broadcast on this CPU.
    pub fn ensure_flushed<P: Platform + ?Sized>(
        &self,
        cpu: CpuId,
        generation: u64,
        platform: &P,
    ) -> bool {
        if self.flushed_generation(cpu) >= generation {
            return false;
        }
        self.flush_for(cpu, generation, platform);
        true
    }

    /// Highest generation `cpu` has flushed for.
    #[inline]
    pub fn flushed_generation(&self, cpu: CpuId) -> u64 {
        self.flushed[cpu.as_index()].load(Ordering::Acquire)
    }

    /// Rollover broadcast handler for `cpu`.
    ///
    /// Flushes locally and moves `active` (the address space this CPU is
    /// running) onto the CPU's reserved ASID of `generation`, reloading the
    /// MMU with it. Never waits: if `active`'s context lock is held the
    /// reserved id is loaded without being stored.
    ///
    /// May run in the middle of a switch on `cpu`; the switch notices through
    /// [`flushed_generation`](Self::flushed_generation) and reloads.
    pub fn handle_rollover<P: Platform + ?Sized>(
        &self,
        cpu: CpuId,
        generation: u64,
        active: Option<&AddressSpace>,
        platform: &P,
    ) -> Option<ContextId> {
        self.flush_for(cpu, generation, platform);
        let mm = active?;
        let reserved = self.reserved_id(cpu, generation);
        let id = match mm.try_lock_context() {
            Some(_guard) => {
                let current = mm.context_id();
                if self.is_current(current) {
                    current
                } else {
                    mm.set_context_id(reserved);
                    mm.residency().reset_to(cpu);
                    reserved
                }
            }
            None => reserved,
        };
        platform.load(cpu, mm.root(), id);
        Some(id)
    }

    /// Id reserved for `cpu`'s rollover handler in `generation`.
    #[inline]
    pub fn reserved_id(&self, cpu: CpuId, generation: u64) -> ContextId {
        ContextId::compose(self.layout, generation, cpu.as_raw() + 1)
    }

    fn bump(&self) -> Allocation {
        let mut current = self.counter.load(Ordering::Relaxed);
        loop {
            let mut next = current + 1;
            let rollover = self.layout.asid_of(next) == 0;
            if rollover {
                // Skip ASID 0 and the per-CPU reserved ASIDs.
                next += self.cpus as u64 + 1;
            }
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Allocation { id: ContextId::from_raw(next), rollover },
                Err(actual) => current = actual,
            }
        }
    }

    fn rollover<P: Platform + ?Sized>(&self, cpu: CpuId, generation: u64, platform: &P) {
        log::debug!(target: "mm", "asid: rollover to generation {} on cpu {}", generation, cpu);
        self.flush_for(cpu, generation, platform);
        platform.broadcast_rollover(cpu, generation);
    }

    pub(crate) fn flush_for<P: Platform + ?Sized>(
        &self,
        cpu: CpuId,
        generation: u64,
        platform: &P,
    ) {
        flush_local(platform, cpu, self.scope);
        self.flushed[cpu.as_index()].fetch_max(generation, Ordering::AcqRel);
    }
}
