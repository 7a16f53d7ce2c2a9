// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Context state carried by every user address space.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::context_id::ContextId;
use crate::cpumask::ResidencySet;
use crate::types::{MmId, PageTableRoot};

/// The part of an address space this crate reads and mutates.
///
/// The task layer owns the value (typically embedded in its mm object) and
/// hands out shared references; all mutation goes through atomics or the
/// context lock, so `&AddressSpace` may be used from several CPUs at once.
pub struct AddressSpace {
    id: MmId,
    root: PageTableRoot,
    context_id: AtomicU64,
    dynamic_stamp: AtomicU64,
    residency: ResidencySet,
    // Serialises reallocation of this address space's context id.
    context_lock: Mutex<()>,
}

impl AddressSpace {
    /// Creates the context record for a fresh address space.
    ///
    /// `dynamic_stamp` is the kernel mapping generation the caller copied the
    /// kernel half of `root` from.
    pub const fn new(id: MmId, root: PageTableRoot, dynamic_stamp: u64) -> Self {
        Self {
            id,
            root,
            context_id: AtomicU64::new(ContextId::UNASSIGNED.raw()),
            dynamic_stamp: AtomicU64::new(dynamic_stamp),
            residency: ResidencySet::new(),
            context_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn id(&self) -> MmId {
        self.id
    }

    #[inline]
    pub fn root(&self) -> PageTableRoot {
        self.root
    }

    /// Last assigned context id. May be stale; see [`ContextId::is_current`].
    #[inline]
    pub fn context_id(&self) -> ContextId {
        ContextId::from_raw(self.context_id.load(Ordering::Acquire))
    }

    /// Kernel mapping generation this address space was last synchronised to.
    #[inline]
    pub fn dynamic_stamp(&self) -> u64 {
        self.dynamic_stamp.load(Ordering::Acquire)
    }

    #[inline]
    pub fn residency(&self) -> &ResidencySet {
        &self.residency
    }

    pub(crate) fn set_context_id(&self, id: ContextId) {
        self.context_id.store(id.raw(), Ordering::Release);
    }

    pub(crate) fn set_dynamic_stamp(&self, stamp: u64) {
        self.dynamic_stamp.store(stamp, Ordering::Release);
    }

    pub(crate) fn lock_context(&self) -> MutexGuard<'_, ()> {
        self.context_lock.lock()
    }

    pub(crate) fn try_lock_context(&self) -> Option<MutexGuard<'_, ()>> {
        self.context_lock.try_lock()
    }
}

// Shared by every CPU that runs or invalidates it.
static_assertions::assert_impl_all!(AddressSpace: Send, Sync);

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("context_id", &self.context_id())
            .field("dynamic_stamp", &self.dynamic_stamp())
            .field("residency", &self.residency.snapshot())
            .finish()
    }
}
