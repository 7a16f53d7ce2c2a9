// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Post-activation page-table integrity checks (debug builds / vendor monitors)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: IntegrityHook, NoIntegrityCheck, PageTableAudit, PageTableVerifier, FailureSignal,
//!             TableWalker
//! INVARIANTS: checks never alter or block activation; violations are logged and signalled only
//!
//! The audit asks an external verifier whether the first-level table of the
//! incoming address space, and optionally every second-level table it
//! references, is mapped read-only.

use core::ops::RangeInclusive;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::address_space::AddressSpace;
use crate::types::{CpuId, PageTableRoot};

/// Capability consulted after every activation.
pub trait IntegrityHook {
    fn after_activate(&self, cpu: CpuId, mm: &AddressSpace);
}

/// Default hook: does nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoIntegrityCheck;

impl IntegrityHook for NoIntegrityCheck {
    #[inline(always)]
    fn after_activate(&self, _cpu: CpuId, _mm: &AddressSpace) {}
}

/// Failure code signalled for a writable page-table page.
pub const PGT_NOT_PROTECTED: u32 = 0x3f80_f221;
/// Severity reported for a first-level table page.
pub const SEVERITY_L1: u32 = 1;
/// Severity reported for a second-level table.
pub const SEVERITY_L2: u32 = 101;

/// Pages spanned by a first-level table (16 KiB).
pub const L1_PAGES: usize = 4;
pub const L1_PAGE_SIZE: usize = 0x1000;
/// First-level descriptors per table.
pub const L1_ENTRIES: usize = 0x1000;

const DESC_TYPE_MASK: u32 = 0x3;
const DESC_COARSE_TABLE: u32 = 0x1;
const COARSE_TABLE_ADDR_MASK: u32 = !0x3ff;

/// Descriptor values pointing into the section-to-table region; not audited.
pub const DEFAULT_SKIP_WINDOW: RangeInclusive<u32> = 0x07e0_0000..=0x07f0_0000;

/// Size class of a verified region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionClass {
    L1Page,
    L2Table,
}

impl RegionClass {
    /// Encoding understood by the verifier.
    pub const fn raw(self) -> u32 {
        match self {
            RegionClass::L1Page => 0x1,
            RegionClass::L2Table => 0x101,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
}

impl Protection {
    pub const fn raw(self) -> u32 {
        match self {
            Protection::ReadOnly => 1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerifyResult {
    Protected,
    NotProtected,
    AlreadyVerified,
}

/// External monitor answering "is this region mapped with `expected`?".
pub trait PageTableVerifier {
    fn verify(&self, addr: usize, class: RegionClass, expected: Protection) -> VerifyResult;
}

/// Channel carrying failure codes out of the audit.
pub trait FailureSignal {
    fn signal(&self, code: u32, severity: u32);
}

/// Read access to first-level descriptors.
pub trait TableWalker {
    /// Raw first-level descriptor `index` of the table at `root`.
    fn l1_entry(&self, root: PageTableRoot, index: usize) -> u32;
    /// Kernel virtual address of physical address `pa`.
    fn phys_to_virt(&self, pa: usize) -> usize;
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct AuditScope: u8 {
        const L1_TABLES = 1 << 0;
        const L2_TABLES = 1 << 1;
    }
}

/// Outcome of one audit pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub violations: u32,
    pub verified_tables: u32,
}

pub struct PageTableAudit<V, S, W> {
    verifier: V,
    signal: S,
    walker: W,
    scope: AuditScope,
    skip: Option<RangeInclusive<u32>>,
    verified_tables: AtomicU64,
    violations: AtomicU64,
}

impl<V, S, W> PageTableAudit<V, S, W>
where
    V: PageTableVerifier,
    S: FailureSignal,
    W: TableWalker,
{
    pub fn new(verifier: V, signal: S, walker: W, scope: AuditScope) -> Self {
        Self {
            verifier,
            signal,
            walker,
            scope,
            skip: Some(DEFAULT_SKIP_WINDOW),
            verified_tables: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_skip_window(mut self, skip: Option<RangeInclusive<u32>>) -> Self {
        self.skip = skip;
        self
    }

    /// Second-level tables confirmed read-only since boot.
    pub fn verified_tables(&self) -> u64 {
        self.verified_tables.load(Ordering::Relaxed)
    }

    /// Violations signalled since boot.
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Audits `mm`'s tables within the configured scope.
    pub fn audit(&self, mm: &AddressSpace) -> AuditReport {
        let mut report = AuditReport::default();
        if self.scope.contains(AuditScope::L1_TABLES) {
            self.audit_l1(mm, &mut report);
        }
        if self.scope.contains(AuditScope::L2_TABLES) {
            self.audit_l2(mm, &mut report);
        }
        self.violations.fetch_add(report.violations as u64, Ordering::Relaxed);
        self.verified_tables.fetch_add(report.verified_tables as u64, Ordering::Relaxed);
        report
    }

    fn audit_l1(&self, mm: &AddressSpace, report: &mut AuditReport) {
        let base = self.walker.phys_to_virt(mm.root().raw());
        for page in 0..L1_PAGES {
            let addr = base + page * L1_PAGE_SIZE;
            if self.verifier.verify(addr, RegionClass::L1Page, Protection::ReadOnly)
                == VerifyResult::NotProtected
            {
                log::error!(
                    target: "mm",
                    "integrity: {} L1 page {:#x} not read-only",
                    mm.id(),
                    addr
                );
                self.signal.signal(PGT_NOT_PROTECTED, SEVERITY_L1);
                report.violations += 1;
            }
        }
    }

    fn audit_l2(&self, mm: &AddressSpace, report: &mut AuditReport) {
        for index in 0..L1_ENTRIES {
            let desc = self.walker.l1_entry(mm.root(), index);
            if desc & DESC_TYPE_MASK != DESC_COARSE_TABLE {
                continue;
            }
            if self.skip.as_ref().is_some_and(|window| window.contains(&desc)) {
                continue;
            }
            let va = self.walker.phys_to_virt((desc & COARSE_TABLE_ADDR_MASK) as usize);
            match self.verifier.verify(va, RegionClass::L2Table, Protection::ReadOnly) {
                VerifyResult::NotProtected => {
                    log::error!(
                        target: "mm",
                        "integrity: {} L2 table {:#x} (desc {:#x}) not read-only",
                        mm.id(),
                        va,
                        desc
                    );
                    self.signal.signal(PGT_NOT_PROTECTED, SEVERITY_L2);
                    report.violations += 1;
                }
                VerifyResult::Protected => report.verified_tables += 1,
                VerifyResult::AlreadyVerified => {}
            }
        }
    }
}

impl<V, S, W> IntegrityHook for PageTableAudit<V, S, W>
where
    V: PageTableVerifier,
    S: FailureSignal,
    W: TableWalker,
{
    fn after_activate(&self, _cpu: CpuId, mm: &AddressSpace) {
        let _ = self.audit(mm);
    }
}
