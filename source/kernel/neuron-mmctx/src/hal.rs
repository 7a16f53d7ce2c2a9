// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware and kernel primitives the switch path drives.

use bitflags::bitflags;

use crate::config::CacheModel;
use crate::context_id::ContextId;
use crate::types::{CpuId, PageTableRoot};

bitflags! {
    /// Local maintenance required when a CPU stops trusting its translations.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FlushScope: u8 {
        const TLB = 1 << 0;
        const CACHE = 1 << 1;
        const ICACHE = 1 << 2;
    }
}

impl FlushScope {
    /// Scope of a generation-rollover flush for the given cache model.
    pub fn for_rollover(cache: &CacheModel) -> Self {
        let mut scope = FlushScope::TLB;
        if cache.is_vivt() {
            scope |= FlushScope::CACHE;
        }
        if cache.icache_vivt_asid_tagged {
            scope |= FlushScope::ICACHE;
        }
        scope
    }
}

/// Architecture and kernel services used by [`MmContext`](crate::MmContext).
///
/// Every method runs on the context-switch path, possibly with interrupts
/// masked, and must complete without blocking.
pub trait Platform {
    /// Loads `root` into the MMU of `cpu`, tagged with `id`.
    fn load(&self, cpu: CpuId, root: PageTableRoot, id: ContextId);

    /// Invalidates every TLB entry on `cpu`.
    fn flush_tlb_all(&self, cpu: CpuId);

    /// Cleans and invalidates the whole data cache of `cpu`.
    fn flush_cache_all(&self, cpu: CpuId);

    /// Invalidates the instruction cache of `cpu`.
    fn flush_icache(&self, cpu: CpuId);

    /// Signals every online CPU except `origin` to run
    /// [`MmContext::handle_rollover`](crate::MmContext::handle_rollover) for
    /// `generation`, passing the address space its active slot names.
    ///
    /// Asynchronous: it may return before the handlers ran, and a handler may
    /// land anywhere, including inside that CPU's own switch. The switch path
    /// flushes before loading an id newer than the CPU's last flush, and
    /// reloads when a handler overtook the load.
    fn broadcast_rollover(&self, origin: CpuId, generation: u64);

    /// Current kernel dynamic-mapping generation.
    fn dynamic_generation(&self) -> u64;

    /// Copies the live kernel dynamic mappings into the table at `root`.
    fn sync_dynamic_mappings(&self, root: PageTableRoot);
}

/// Applies `scope` on `cpu`.
pub(crate) fn flush_local<P: Platform + ?Sized>(platform: &P, cpu: CpuId, scope: FlushScope) {
    if scope.contains(FlushScope::TLB) {
        platform.flush_tlb_all(cpu);
    }
    if scope.contains(FlushScope::CACHE) {
        platform.flush_cache_all(cpu);
    }
    if scope.contains(FlushScope::ICACHE) {
        platform.flush_icache(cpu);
    }
}
