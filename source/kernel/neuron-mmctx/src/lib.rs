// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space context ids and mm switch synchronisation for NEURON
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, proptest interleavings, host integration tests
//! PUBLIC API: MmContext (new/new_address_space/switch_mm/activate_mm/handle_rollover/
//!             retire_address_space),
//!             AddressSpace, ContextId, AsidLayout, Platform, IntegrityHook, MmContextConfig
//! DEPENDS_ON: Platform (TLB load, cache maintenance, IPI broadcast, kernel mapping sync)
//! INVARIANTS: No two live address spaces share a (generation, ASID) pair;
//!             an id of generation g is loaded on a CPU only after that CPU flushed for g;
//!             re-entering the active, resident address space performs no hardware work
//!
//! The allocator hands out ASIDs from a single packed counter: the low
//! `asid_bits` form the next ASID and the remaining bits the generation. An
//! address space whose stored generation differs from the counter's gets a
//! fresh id on its next activation. Wrapping the low bits starts a new
//! generation and invalidates every CPU's TLB before any id from that
//! generation is used.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

pub mod address_space;
pub mod asid;
pub mod config;
pub mod context_id;
pub mod cpumask;
pub mod error;
pub mod hal;
pub mod integrity;
pub mod percpu;
pub mod switch;
pub mod types;
pub mod validator;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests_prop;

pub use address_space::AddressSpace;
pub use config::{CacheModel, CacheTagging, ContextStrategy, MmContextConfig};
pub use context_id::{AsidLayout, ContextId};
pub use cpumask::{CpuSet, ResidencySet, MAX_CPUS};
pub use error::ConfigError;
pub use hal::{FlushScope, Platform};
pub use integrity::{IntegrityHook, NoIntegrityCheck};
pub use switch::{Activation, MmContext, SwitchOutcome};
pub use types::{CpuId, MmId, PageTableRoot};
