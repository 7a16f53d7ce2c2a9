// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-time configuration of the mm context layer.

use crate::context_id::AsidLayout;
use crate::cpumask::MAX_CPUS;
use crate::error::ConfigError;

/// How the data cache is indexed and tagged.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheTagging {
    /// Virtually indexed, virtually tagged: lines are not disambiguated by ASID.
    Vivt,
    /// Virtually indexed, physically tagged.
    Vipt,
    /// Physically indexed, physically tagged.
    Pipt,
}

/// Cache properties relevant to context switching.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheModel {
    pub dcache: CacheTagging,
    /// Instruction cache is VIVT with ASID tags and must be invalidated on ASID reuse.
    pub icache_vivt_asid_tagged: bool,
}

impl CacheModel {
    #[inline]
    pub const fn is_vivt(&self) -> bool {
        matches!(self.dcache, CacheTagging::Vivt)
    }
}

impl Default for CacheModel {
    fn default() -> Self {
        Self { dcache: CacheTagging::Vipt, icache_vivt_asid_tagged: false }
    }
}

/// Which context validator runs on activation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ContextStrategy {
    /// CPU tags TLB entries with ASIDs; ids are allocated per generation.
    #[default]
    Asid,
    /// CPU has no ASIDs; only kernel mapping freshness is tracked.
    NoAsid,
}

/// Configuration consumed by [`MmContext::new`](crate::MmContext::new).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MmContextConfig {
    /// Width of the hardware ASID field.
    pub asid_bits: u8,
    /// Number of CPUs that may run the switch path.
    pub cpus: usize,
    pub cache: CacheModel,
    pub strategy: ContextStrategy,
}

impl MmContextConfig {
    /// Fixed v1 CPU count used when nothing else is configured.
    pub const DEFAULT_CPUS: usize = 4;

    /// Checks the configuration and returns the derived ASID layout.
    pub fn validate(&self) -> Result<AsidLayout, ConfigError> {
        let layout = AsidLayout::new(self.asid_bits)?;
        if self.cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.cpus > MAX_CPUS {
            return Err(ConfigError::TooManyCpus { cpus: self.cpus, max: MAX_CPUS });
        }
        // ASID 0 plus one reserved ASID per CPU, and at least one left to allocate.
        if self.strategy == ContextStrategy::Asid && self.cpus as u64 + 2 > layout.asid_count() {
            return Err(ConfigError::ReservedExceedsAsidSpace {
                cpus: self.cpus,
                asids: layout.asid_count(),
            });
        }
        Ok(layout)
    }
}

impl Default for MmContextConfig {
    fn default() -> Self {
        Self {
            asid_bits: AsidLayout::DEFAULT.bits(),
            cpus: Self::DEFAULT_CPUS,
            cache: CacheModel::default(),
            strategy: ContextStrategy::Asid,
        }
    }
}
