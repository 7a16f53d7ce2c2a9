// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Context validation run on every non-trivial activation
//! OWNERS: @kernel-mm-team
//! PUBLIC API: ContextValidator, Validation, AsidValidator, NoAsidValidator, Validator
//! DEPENDS_ON: asid::AsidAllocator, hal::Platform
//! INVARIANTS: both checks run on every activation; a stale generation is never accepted;
//!             dynamic_stamp never exceeds the live dynamic-mapping generation;
//!             an id loaded after this CPU flushed for a later generation is replaced
//!
//! Two checks, independent of each other:
//! - generation: the stored context id must belong to the allocator's generation
//! - dynamic mappings: the kernel half of the table must match the live kernel
//!   mapping generation
//!
//! CPUs without ASIDs only run the second check.

use crate::address_space::AddressSpace;
use crate::asid::{Allocation, AsidAllocator};
use crate::context_id::ContextId;
use crate::hal::Platform;
use crate::types::CpuId;

/// What validation did to an address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Validation {
    /// Id to load into the MMU.
    pub id: ContextId,
    pub allocation: Option<Allocation>,
    /// Kernel dynamic mappings were resynchronised.
    pub remapped: bool,
    /// This CPU flushed to catch up with a rollover it had not seen yet.
    pub catch_up_flush: bool,
}

/// Capability that brings an address space up to date before it is loaded.
pub trait ContextValidator {
    fn validate<P: Platform + ?Sized>(&self, cpu: CpuId, mm: &AddressSpace, platform: &P)
        -> Validation;

    /// Re-checks `loaded` once it is in the MMU of `cpu`.
    ///
    /// A rollover handler can run on `cpu` between [`validate`](Self::validate)
    /// and the load. Returns what to load instead when that happened.
    fn recheck<P: Platform + ?Sized>(
        &self,
        _cpu: CpuId,
        _mm: &AddressSpace,
        _loaded: ContextId,
        _platform: &P,
    ) -> Option<Validation> {
        None
    }
}

/// Brings `mm`'s kernel dynamic mappings up to date.
///
/// Retries if the live generation moves while the copy is in progress, so
/// the stored stamp always names mappings that were actually copied.
pub fn sync_dynamic_mappings<P: Platform + ?Sized>(mm: &AddressSpace, platform: &P) -> bool {
    let mut seq = platform.dynamic_generation();
    if mm.dynamic_stamp() == seq {
        return false;
    }
    loop {
        platform.sync_dynamic_mappings(mm.root());
        mm.set_dynamic_stamp(seq);
        let now = platform.dynamic_generation();
        if now == seq {
            log::debug!(target: "mm", "remap: {} synced to dynamic generation {}", mm.id(), seq);
            return true;
        }
        seq = now;
    }
}

/// Validator for CPUs with hardware ASIDs.
pub struct AsidValidator {
    allocator: AsidAllocator,
}

impl AsidValidator {
    pub const fn new(allocator: AsidAllocator) -> Self {
        Self { allocator }
    }

    #[inline]
    pub fn allocator(&self) -> &AsidAllocator {
        &self.allocator
    }
}

impl ContextValidator for AsidValidator {
    fn validate<P: Platform + ?Sized>(
        &self,
        cpu: CpuId,
        mm: &AddressSpace,
        platform: &P,
    ) -> Validation {
        let layout = self.allocator.layout();
        let stored = mm.context_id();
        let (id, allocation) = if self.allocator.is_current(stored) {
            (stored, None)
        } else {
            self.allocator.refresh(cpu, mm, platform)
        };
        let remapped = sync_dynamic_mappings(mm, platform);
        let catch_up_flush = self.allocator.ensure_flushed(cpu, id.generation(layout), platform);
        Validation { id, allocation, remapped, catch_up_flush }
    }

    fn recheck<P: Platform + ?Sized>(
        &self,
        cpu: CpuId,
        mm: &AddressSpace,
        loaded: ContextId,
        platform: &P,
    ) -> Option<Validation> {
        let layout = self.allocator.layout();
        if self.allocator.flushed_generation(cpu) <= loaded.generation(layout) {
            return None;
        }
        // The handler flushed before `loaded` went in, so its ASID may
        // already tag entries on behalf of a newer owner.
        let stored = mm.context_id();
        let (id, allocation) = if self.allocator.is_current(stored) {
            (stored, None)
        } else {
            self.allocator.refresh(cpu, mm, platform)
        };
        self.allocator.flush_for(cpu, id.generation(layout), platform);
        log::debug!(
            target: "mm",
            "asid: cpu {} replaces {} with {} for {}",
            cpu,
            loaded,
            id,
            mm.id()
        );
        Some(Validation { id, allocation, remapped: false, catch_up_flush: true })
    }
}

/// Validator for CPUs without ASIDs: the MMU load itself discards old
/// translations, so only kernel mapping freshness is tracked.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoAsidValidator;

impl ContextValidator for NoAsidValidator {
    fn validate<P: Platform + ?Sized>(
        &self,
        _cpu: CpuId,
        mm: &AddressSpace,
        platform: &P,
    ) -> Validation {
        Validation {
            id: mm.context_id(),
            allocation: None,
            remapped: sync_dynamic_mappings(mm, platform),
            catch_up_flush: false,
        }
    }
}

/// Strategy chosen from [`ContextStrategy`](crate::ContextStrategy) at construction.
pub enum Validator {
    Asid(AsidValidator),
    NoAsid(NoAsidValidator),
}

impl Validator {
    /// ASID allocator, when the strategy has one.
    pub fn allocator(&self) -> Option<&AsidAllocator> {
        match self {
            Validator::Asid(v) => Some(v.allocator()),
            Validator::NoAsid(_) => None,
        }
    }
}

impl ContextValidator for Validator {
    fn validate<P: Platform + ?Sized>(
        &self,
        cpu: CpuId,
        mm: &AddressSpace,
        platform: &P,
    ) -> Validation {
        match self {
            Validator::Asid(v) => v.validate(cpu, mm, platform),
            Validator::NoAsid(v) => v.validate(cpu, mm, platform),
        }
    }

    fn recheck<P: Platform + ?Sized>(
        &self,
        cpu: CpuId,
        mm: &AddressSpace,
        loaded: ContextId,
        platform: &P,
    ) -> Option<Validation> {
        match self {
            Validator::Asid(v) => v.recheck(cpu, mm, loaded, platform),
            Validator::NoAsid(v) => v.recheck(cpu, mm, loaded, platform),
        }
    }
}
