// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: mm switch entry point called by the scheduler on every context switch
//! OWNERS: @kernel-mm-team, @kernel-sched-team
//! PUBLIC API: MmContext (new/with_hook/new_address_space/switch_mm/activate_mm/handle_rollover/
//!             retire_address_space), SwitchOutcome, Activation
//! DEPENDS_ON: validator::Validator, percpu::PerCpuActive, hal::Platform, integrity::IntegrityHook
//! INVARIANTS: no hardware work when the resident, already-active address space is re-entered;
//!             a CPU joining a non-empty residency set flushes its icache before running there;
//!             VIVT CPUs leave the outgoing address space's residency set on every real switch;
//!             the id left loaded is never older than this CPU's latest rollover flush
//!
//! Phases of one switch:
//!
//! ```text
//! Idle --(next has no mm)--------------------------> Idle        (lazy TLB)
//! Idle --(resident and already active)-------------> Idle        (unchanged)
//! Idle --(otherwise)--> Validating --> Activating --> Idle
//! Activating --(rollover handler ran on this CPU before the load)--> Activating
//! ```

use crate::address_space::AddressSpace;
use crate::asid::AsidAllocator;
use crate::config::{ContextStrategy, MmContextConfig};
use crate::context_id::ContextId;
use crate::error::ConfigError;
use crate::hal::{FlushScope, Platform};
use crate::integrity::{IntegrityHook, NoIntegrityCheck};
use crate::percpu::PerCpuActive;
use crate::types::{CpuId, MmId, PageTableRoot};
use crate::validator::{AsidValidator, ContextValidator, NoAsidValidator, Validation, Validator};

/// What a switch did.
#[must_use = "switch outcomes carry allocation/rollover evidence"]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Incoming task has no address space; the loaded one stays in place.
    LazyTlb,
    /// Incoming address space is already active and resident on this CPU.
    Unchanged,
    Activated(Activation),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Activation {
    /// Id loaded into the MMU.
    pub context_id: ContextId,
    pub allocated: bool,
    pub rollover: bool,
    pub remapped: bool,
    pub icache_flushed: bool,
    /// Local flush for a rollover whose broadcast had not reached this CPU.
    pub catch_up_flush: bool,
}

enum SwitchPhase {
    Idle,
    Validating { icache_flushed: bool },
    Activating { icache_flushed: bool, validation: Validation },
}

/// Boot-scoped mm context state: allocator, per-CPU slots, platform and hook.
pub struct MmContext<P: Platform, H: IntegrityHook = NoIntegrityCheck> {
    config: MmContextConfig,
    validator: Validator,
    active: PerCpuActive,
    platform: P,
    hook: H,
}

impl<P: Platform> MmContext<P> {
    /// Builds the context layer without an integrity hook.
    pub fn new(config: MmContextConfig, platform: P) -> Result<Self, ConfigError> {
        Self::with_hook(config, platform, NoIntegrityCheck)
    }
}

impl<P: Platform, H: IntegrityHook> MmContext<P, H> {
    pub fn with_hook(config: MmContextConfig, platform: P, hook: H) -> Result<Self, ConfigError> {
        let layout = config.validate()?;
        let validator = match config.strategy {
            ContextStrategy::Asid => Validator::Asid(AsidValidator::new(AsidAllocator::new(
                layout,
                config.cpus,
                FlushScope::for_rollover(&config.cache),
            ))),
            ContextStrategy::NoAsid => Validator::NoAsid(NoAsidValidator),
        };
        log::info!(
            target: "mm",
            "mmctx: strategy={:?} asid_bits={} cpus={} dcache={:?} icache_asid_tagged={}",
            config.strategy,
            layout.bits(),
            config.cpus,
            config.cache.dcache,
            config.cache.icache_vivt_asid_tagged
        );
        Ok(Self { config, validator, active: PerCpuActive::new(), platform, hook })
    }

    #[inline]
    pub fn config(&self) -> &MmContextConfig {
        &self.config
    }

    #[inline]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    #[inline]
    pub fn hook(&self) -> &H {
        &self.hook
    }

    /// ASID allocator, absent for [`ContextStrategy::NoAsid`].
    #[inline]
    pub fn allocator(&self) -> Option<&AsidAllocator> {
        self.validator.allocator()
    }

    /// Address space last switched into on `cpu`.
    #[inline]
    pub fn active_on(&self, cpu: CpuId) -> Option<MmId> {
        self.active.get(cpu)
    }

    /// Context record for a new address space whose kernel half was just
    /// copied from the live mappings.
    pub fn new_address_space(&self, id: MmId, root: PageTableRoot) -> AddressSpace {
        AddressSpace::new(id, root, self.platform.dynamic_generation())
    }

    /// Switches `cpu` from `prev` to `next`.
    ///
    /// `prev` is the address space currently loaded on `cpu` (the lazily kept
    /// one if a kernel thread ran in between); `next` is `None` when the
    /// incoming task owns no address space.
    pub fn switch_mm(
        &self,
        cpu: CpuId,
        prev: Option<&AddressSpace>,
        next: Option<&AddressSpace>,
    ) -> SwitchOutcome {
        debug_assert!(cpu.as_index() < self.config.cpus);
        let Some(next) = next else {
            return SwitchOutcome::LazyTlb;
        };

        let mut phase = SwitchPhase::Idle;
        loop {
            phase = match phase {
                SwitchPhase::Idle => {
                    let icache_flushed = self.flush_icache_on_migration(cpu, next);
                    let was_resident = next.residency().insert(cpu);
                    let previous = self.active.replace(cpu, next.id());
                    if was_resident && previous == Some(next.id()) {
                        return SwitchOutcome::Unchanged;
                    }
                    SwitchPhase::Validating { icache_flushed }
                }
                SwitchPhase::Validating { icache_flushed } => {
                    let validation = self.validator.validate(cpu, next, &self.platform);
                    SwitchPhase::Activating { icache_flushed, validation }
                }
                SwitchPhase::Activating { icache_flushed, validation } => {
                    self.platform.load(cpu, next.root(), validation.id);
                    match self.validator.recheck(cpu, next, validation.id, &self.platform) {
                        Some(retry) => SwitchPhase::Activating {
                            icache_flushed,
                            validation: Validation {
                                allocation: retry.allocation.or(validation.allocation),
                                remapped: validation.remapped,
                                ..retry
                            },
                        },
                        None => return self.finish(cpu, prev, next, icache_flushed, validation),
                    }
                }
            };
        }
    }

    /// Installs `next` on `cpu` at exec time.
    pub fn activate_mm(
        &self,
        cpu: CpuId,
        prev: Option<&AddressSpace>,
        next: &AddressSpace,
    ) -> SwitchOutcome {
        self.switch_mm(cpu, prev, Some(next))
    }

    /// Rollover broadcast entry for `cpu`; `active` is the address space it
    /// is currently running, if any. Returns the id reloaded into the MMU.
    pub fn handle_rollover(
        &self,
        cpu: CpuId,
        generation: u64,
        active: Option<&AddressSpace>,
    ) -> Option<ContextId> {
        let allocator = self.validator.allocator()?;
        if let Some(mm) = active {
            if self.active.get(cpu) != Some(mm.id()) {
                log::warn!(
                    target: "mm",
                    "rollover: cpu {} handler given {} but slot differs",
                    cpu,
                    mm.id()
                );
            }
        }
        allocator.handle_rollover(cpu, generation, active, &self.platform)
    }

    /// Clears every per-CPU slot still naming `mm` before its id is recycled.
    ///
    /// Returns the number of slots cleared.
    pub fn retire_address_space(&self, mm: &AddressSpace) -> usize {
        (0..self.config.cpus)
            .map(|idx| CpuId::from_raw(idx as u16))
            .filter(|cpu| self.active.clear_if(*cpu, mm.id()))
            .count()
    }

    fn finish(
        &self,
        cpu: CpuId,
        prev: Option<&AddressSpace>,
        next: &AddressSpace,
        icache_flushed: bool,
        validation: Validation,
    ) -> SwitchOutcome {
        self.hook.after_activate(cpu, next);
        // A reallocation while validating resets the set to this CPU alone;
        // a concurrent one elsewhere may have dropped it.
        let _ = next.residency().insert(cpu);
        if self.config.cache.is_vivt() {
            if let Some(prev) = prev.filter(|prev| prev.id() != next.id()) {
                prev.residency().remove(cpu);
            }
        }
        log::trace!(
            target: "mm",
            "switch: cpu {} -> {} id={} residency={:?}",
            cpu,
            next.id(),
            validation.id,
            next.residency().snapshot()
        );
        SwitchOutcome::Activated(Activation {
            context_id: validation.id,
            allocated: validation.allocation.is_some(),
            rollover: validation.allocation.is_some_and(|a| a.rollover),
            remapped: validation.remapped,
            icache_flushed,
            catch_up_flush: validation.catch_up_flush,
        })
    }

    fn flush_icache_on_migration(&self, cpu: CpuId, next: &AddressSpace) -> bool {
        let residency = next.residency().snapshot();
        if residency.is_empty() || residency.contains(cpu) {
            return false;
        }
        self.platform.flush_icache(cpu);
        true
    }
}
