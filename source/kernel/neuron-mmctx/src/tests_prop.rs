// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for mm switching across CPUs
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Drives random switch sequences with a
//! tiny ASID space so rollovers happen constantly.
//!
//! TEST_SCOPE:
//!   - Uniqueness of loaded context ids across CPUs
//!   - Rollover handlers landing in the middle of a switch
//!   - Fast path on re-entry of the active, resident address space
//!   - One allocation per stale activation, none otherwise
//!   - Residency after reallocation
//!
//! TEST_SCENARIOS:
//!   - loaded_ids_identify_address_spaces(): equal loaded ids on two CPUs iff same address space
//!   - reentry_is_free_and_allocation_tracks_staleness(): per-step outcome matches prior state
//!   - staleness_is_a_generation_comparison(): is_current agrees with generation equality

use std::sync::{Arc, Mutex};

use super::address_space::AddressSpace;
use super::config::MmContextConfig;
use super::context_id::{AsidLayout, ContextId};
use super::cpumask::CpuSet;
use super::switch::{MmContext, SwitchOutcome};
use super::testing::{space, Event, RecordingPlatform};
use super::types::CpuId;
use proptest::prelude::*;

const CPUS: usize = 3;
const SPACES: usize = 6;

#[derive(Clone, Copy, Debug)]
struct Step {
    cpu: u16,
    next: Option<usize>,
    /// Switch another CPU performs from inside this one, delivering its
    /// rollover broadcast before this switch loads.
    nested: Option<(u16, usize)>,
}

fn arb_step() -> impl Strategy<Value = Step> {
    (
        0..CPUS as u16,
        prop::option::weighted(0.85, 0..SPACES),
        prop::option::weighted(0.2, (0..CPUS as u16, 0..SPACES)),
    )
        .prop_map(|(cpu, next, nested)| Step { cpu, next, nested })
}

type Ctx = MmContext<RecordingPlatform>;

fn running<'a>(ctx: &Ctx, spaces: &'a [AddressSpace], cpu: CpuId) -> Option<&'a AddressSpace> {
    ctx.active_on(cpu).map(|id| &spaces[id.as_raw() as usize - 1])
}

fn deliver(ctx: &Ctx, spaces: &[AddressSpace], origin: CpuId, generation: u64) {
    for cpu in (0..CPUS as u16).map(CpuId::from_raw).filter(|cpu| *cpu != origin) {
        let _ = ctx.handle_rollover(cpu, generation, running(ctx, spaces, cpu));
    }
}

/// Runs switches and delivers rollover broadcasts synchronously.
struct Harness {
    ctx: Arc<Ctx>,
    spaces: Arc<Vec<AddressSpace>>,
    loaded: [Option<ContextId>; CPUS],
    // Per space: last id loaded for it and the CPUs that loaded that id.
    last_load: [Option<(ContextId, CpuSet)>; SPACES],
    // Generations already broadcast from inside a switch.
    delivered: Arc<Mutex<Vec<u64>>>,
}

impl Harness {
    fn new() -> Self {
        // 8 ASIDs: 0 reserved, 1..=3 per-CPU, 4..=7 allocatable.
        let config = MmContextConfig { asid_bits: 3, cpus: CPUS, ..Default::default() };
        let ctx = Arc::new(MmContext::new(config, RecordingPlatform::new()).unwrap());
        ctx.platform().attach(&ctx);
        Self {
            ctx,
            spaces: Arc::new((1..=SPACES as u64).map(space).collect()),
            loaded: [None; CPUS],
            last_load: [None; SPACES],
            delivered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn take_events(&self) -> Vec<Event> {
        let events = self.ctx.platform().events();
        self.ctx.platform().clear();
        events
    }

    /// Returns the outcome, the hardware events of the step, and whether a
    /// nested switch ran inside it.
    fn step(&mut self, step: Step) -> (SwitchOutcome, Vec<Event>, bool) {
        let cpu = CpuId::from_raw(step.cpu);
        let nested = step.nested.filter(|(other, _)| *other != step.cpu && step.next.is_some());
        if let Some((other, j)) = nested {
            // Every space needs a remap, so the switch reaches the sync callback.
            self.ctx.platform().bump_dynamic_generation();
            let spaces = self.spaces.clone();
            let delivered = self.delivered.clone();
            self.ctx.platform().interrupt_next_sync(move |ctx| {
                let other = CpuId::from_raw(other);
                let before = ctx.allocator().unwrap().generation();
                let _ = ctx.switch_mm(other, running(ctx, &spaces, other), Some(&spaces[j]));
                let after = ctx.allocator().unwrap().generation();
                if after != before {
                    delivered.lock().unwrap().push(after);
                    deliver(ctx, &spaces, other, after);
                }
            });
        }
        let prev = running(&self.ctx, &self.spaces, cpu);
        let next = step.next.map(|i| &self.spaces[i]);
        let outcome = self.ctx.switch_mm(cpu, prev, next);
        let interrupted = nested.is_some() && !self.ctx.platform().cancel_interrupt();
        let events = self.take_events();
        self.absorb(&events);
        (outcome, events, interrupted)
    }

    fn absorb(&mut self, events: &[Event]) {
        let mut pending = events.to_vec();
        while !pending.is_empty() {
            for event in pending {
                match event {
                    Event::Load { cpu, root, id } => {
                        self.loaded[cpu.as_index()] = Some(id);
                        let slot = &mut self.last_load[root.raw() / 0x4000 - 1];
                        *slot = match *slot {
                            Some((last, cpus)) if last == id => Some((id, cpus.with(cpu))),
                            _ => Some((id, CpuSet::EMPTY.with(cpu))),
                        };
                    }
                    Event::Broadcast { origin, generation } => {
                        if !self.delivered.lock().unwrap().contains(&generation) {
                            deliver(&self.ctx, &self.spaces, origin, generation);
                        }
                    }
                    _ => {}
                }
            }
            pending = self.take_events();
        }
    }

    fn check_loaded_ids(&self) -> Result<(), TestCaseError> {
        let allocator = self.ctx.allocator().unwrap();
        let running: Vec<_> = (0..CPUS as u16)
            .map(|cpu| self.ctx.active_on(CpuId::from_raw(cpu)).map(|id| id.as_raw()))
            .collect();
        for a in 0..CPUS {
            let (Some(mm_a), Some(id_a)) = (running[a], self.loaded[a]) else { continue };
            prop_assert!(allocator.is_current(id_a), "cpu {} runs stale id {}", a, id_a);
            for b in a + 1..CPUS {
                let (Some(mm_b), Some(id_b)) = (running[b], self.loaded[b]) else { continue };
                prop_assert_eq!(
                    mm_a == mm_b,
                    id_a == id_b,
                    "cpu {} runs mm{} as {}, cpu {} runs mm{} as {}",
                    a,
                    mm_a,
                    id_a,
                    b,
                    mm_b,
                    id_b
                );
            }
        }
        Ok(())
    }

    /// Every CPU in a residency set loaded the space's current id.
    fn check_residency(&self) -> Result<(), TestCaseError> {
        for (mm, last) in self.spaces.iter().zip(&self.last_load) {
            let resident = mm.residency().snapshot();
            let loaded = match last {
                Some((id, cpus)) if *id == mm.context_id() => *cpus,
                _ => CpuSet::EMPTY,
            };
            prop_assert_eq!(
                resident.bits() & !loaded.bits(),
                0,
                "{} resident on {:?}, current id loaded on {:?}",
                mm.id(),
                resident,
                loaded
            );
        }
        Ok(())
    }
}

proptest! {
    #[test]
    fn loaded_ids_identify_address_spaces(steps in prop::collection::vec(arb_step(), 1..200)) {
        let mut harness = Harness::new();
        for step in steps {
            let _ = harness.step(step);
            harness.check_loaded_ids()?;
            harness.check_residency()?;
        }
    }

    #[test]
    fn reentry_is_free_and_allocation_tracks_staleness(
        steps in prop::collection::vec(arb_step(), 1..200),
    ) {
        let mut harness = Harness::new();
        for step in steps {
            let cpu = CpuId::from_raw(step.cpu);
            let slot = harness.ctx.active_on(cpu);
            let allocator = harness.ctx.allocator().unwrap();
            let stale = step.next.map(|i| !allocator.is_current(harness.spaces[i].context_id()));
            let resident = step.next.is_some_and(|i| harness.spaces[i].residency().contains(cpu));
            let target = step.next.map(|i| harness.spaces[i].id());

            let (outcome, events, interrupted) = harness.step(step);
            if interrupted {
                continue;
            }
            match (target, outcome) {
                (None, outcome) => {
                    prop_assert_eq!(outcome, SwitchOutcome::LazyTlb);
                    prop_assert!(events.is_empty());
                }
                (Some(id), SwitchOutcome::Unchanged) => {
                    prop_assert_eq!(slot, Some(id));
                    prop_assert!(resident);
                    prop_assert!(events.is_empty());
                }
                (Some(id), SwitchOutcome::Activated(activation)) => {
                    prop_assert!(slot != Some(id) || !resident);
                    prop_assert_eq!(Some(activation.allocated), stale);
                    let loads = events.iter().filter(|e| matches!(e, Event::Load { .. })).count();
                    prop_assert_eq!(loads, 1);
                }
                (Some(_), SwitchOutcome::LazyTlb) => {
                    prop_assert!(false, "lazy outcome with a next mm")
                }
            }
        }
    }

    #[test]
    fn staleness_is_a_generation_comparison(
        bits in 1u8..=16,
        generation in 1u64..1 << 20,
        asid in any::<u16>(),
        counter_generation in 1u64..1 << 20,
        counter_asid in any::<u16>(),
    ) {
        let layout = AsidLayout::new(bits).unwrap();
        let mask = layout.asid_mask() as u16;
        let id = ContextId::compose(layout, generation, asid & mask);
        let counter = layout.compose(counter_generation, counter_asid & mask);
        prop_assert_eq!(id.is_current(counter, layout), generation == counter_generation);
        prop_assert_eq!(id.generation(layout), generation);
    }
}
