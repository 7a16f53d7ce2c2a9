// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Construction-time errors. The switch path itself cannot fail.

use thiserror::Error;

/// Rejected [`MmContextConfig`](crate::MmContextConfig) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// ASID width outside the supported range.
    #[error("unsupported ASID width: {bits} bits (expected 1..=16)")]
    AsidBits { bits: u8 },
    /// At least one CPU is required.
    #[error("no CPUs configured")]
    NoCpus,
    /// More CPUs than a residency mask can represent.
    #[error("{cpus} CPUs configured, residency masks hold at most {max}")]
    TooManyCpus { cpus: usize, max: usize },
    /// Rollover reserves one ASID per CPU plus one for the allocating address space.
    #[error("{cpus} CPUs leave no allocatable ASID in a {asids}-entry generation")]
    ReservedExceedsAsidSpace { cpus: usize, asids: u64 },
}
