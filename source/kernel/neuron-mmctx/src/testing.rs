// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Test-only Platform that records hardware calls
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use spin::Mutex;

use crate::address_space::AddressSpace;
use crate::context_id::ContextId;
use crate::hal::Platform;
use crate::switch::MmContext;
use crate::types::{CpuId, MmId, PageTableRoot};

type Interrupt = Box<dyn FnOnce(&MmContext<RecordingPlatform>) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Load { cpu: CpuId, root: PageTableRoot, id: ContextId },
    FlushTlb(CpuId),
    FlushCache(CpuId),
    FlushIcache(CpuId),
    Broadcast { origin: CpuId, generation: u64 },
    SyncDynamic(PageTableRoot),
}

pub struct RecordingPlatform {
    events: Mutex<Vec<Event>>,
    dynamic_generation: AtomicU64,
    // Number of upcoming syncs that bump the dynamic generation mid-copy.
    racing_syncs: AtomicUsize,
    context: OnceLock<Weak<MmContext<RecordingPlatform>>>,
    interrupt: Mutex<Option<Interrupt>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            dynamic_generation: AtomicU64::new(0),
            racing_syncs: AtomicUsize::new(0),
            context: OnceLock::new(),
            interrupt: Mutex::new(None),
        }
    }

    /// Lets interrupts armed with [`interrupt_next_sync`](Self::interrupt_next_sync)
    /// reach `ctx`, the context owning this platform.
    pub fn attach(&self, ctx: &Arc<MmContext<RecordingPlatform>>) {
        let _ = self.context.set(Arc::downgrade(ctx));
    }

    /// Runs `interrupt` from inside the next dynamic-mapping sync, after the
    /// switch in progress chose its id and before it loads it.
    pub fn interrupt_next_sync(
        &self,
        interrupt: impl FnOnce(&MmContext<RecordingPlatform>) + Send + 'static,
    ) {
        *self.interrupt.lock() = Some(Box::new(interrupt));
    }

    /// Drops an armed interrupt; returns whether one was still pending.
    pub fn cancel_interrupt(&self) -> bool {
        self.interrupt.lock().take().is_some()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn bump_dynamic_generation(&self) {
        self.dynamic_generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn bump_during_next_syncs(&self, syncs: usize) {
        self.racing_syncs.store(syncs, Ordering::Release);
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl Platform for RecordingPlatform {
    fn load(&self, cpu: CpuId, root: PageTableRoot, id: ContextId) {
        self.record(Event::Load { cpu, root, id });
    }

    fn flush_tlb_all(&self, cpu: CpuId) {
        self.record(Event::FlushTlb(cpu));
    }

    fn flush_cache_all(&self, cpu: CpuId) {
        self.record(Event::FlushCache(cpu));
    }

    fn flush_icache(&self, cpu: CpuId) {
        self.record(Event::FlushIcache(cpu));
    }

    fn broadcast_rollover(&self, origin: CpuId, generation: u64) {
        self.record(Event::Broadcast { origin, generation });
    }

    fn dynamic_generation(&self) -> u64 {
        self.dynamic_generation.load(Ordering::Acquire)
    }

    fn sync_dynamic_mappings(&self, root: PageTableRoot) {
        self.record(Event::SyncDynamic(root));
        let racing = self.racing_syncs.load(Ordering::Acquire);
        if racing > 0 {
            self.racing_syncs.store(racing - 1, Ordering::Release);
            self.bump_dynamic_generation();
        }
        let interrupt = self.interrupt.lock().take();
        if let Some(interrupt) = interrupt {
            if let Some(ctx) = self.context.get().and_then(Weak::upgrade) {
                interrupt(&*ctx);
            }
        }
    }
}

/// Address space `raw` with a distinct root and stamp 0.
pub fn space(raw: u64) -> AddressSpace {
    let id = MmId::from_raw(raw).expect("non-zero mm id");
    AddressSpace::new(id, PageTableRoot::new(0x4000 * raw as usize), 0)
}
