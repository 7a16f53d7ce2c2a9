// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Packed (generation, ASID) context ids.
//!
//! ```text
//!  63                        bits          0
//! +-----------------------------+-----------+
//! |         generation          |   ASID    |
//! +-----------------------------+-----------+
//! ```
//!
//! The same packing is used for the global allocation counter, so a stored
//! id is current exactly when its generation bits equal the counter's.

use core::fmt;

use crate::error::ConfigError;

/// Bit layout of a packed context id.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AsidLayout {
    bits: u8,
}

impl AsidLayout {
    /// 8-bit ASIDs, the width every supported core implements.
    pub const DEFAULT: Self = Self { bits: 8 };

    /// Widest ASID field accepted.
    pub const MAX_BITS: u8 = 16;

    /// Builds a layout with `bits` ASID bits.
    pub const fn new(bits: u8) -> Result<Self, ConfigError> {
        if bits == 0 || bits > Self::MAX_BITS {
            return Err(ConfigError::AsidBits { bits });
        }
        Ok(Self { bits })
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.bits
    }

    /// Number of ASID values per generation, including the reserved ASID 0.
    #[inline]
    pub const fn asid_count(self) -> u64 {
        1u64 << self.bits
    }

    #[inline]
    pub const fn asid_mask(self) -> u64 {
        self.asid_count() - 1
    }

    /// Counter value of generation 1, ASID 0: the allocator's boot value.
    #[inline]
    pub const fn first_version(self) -> u64 {
        self.asid_count()
    }

    #[inline]
    pub const fn generation_of(self, raw: u64) -> u64 {
        raw >> self.bits
    }

    #[inline]
    pub const fn asid_of(self, raw: u64) -> u16 {
        (raw & self.asid_mask()) as u16
    }

    /// Packs `generation` and `asid`; excess ASID bits are masked off.
    #[inline]
    pub const fn compose(self, generation: u64, asid: u16) -> u64 {
        (generation << self.bits) | (asid as u64 & self.asid_mask())
    }

    /// `(a ^ b) >> bits == 0`: both values carry the same generation.
    #[inline]
    pub const fn same_generation(self, a: u64, b: u64) -> bool {
        (a ^ b) >> self.bits == 0
    }
}

impl Default for AsidLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Context id stored per address space and loaded into the MMU.
///
/// Generation 0 is never live, so [`ContextId::UNASSIGNED`] compares stale
/// against every counter value and forces an allocation on first use.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ContextId(u64);

impl ContextId {
    pub const UNASSIGNED: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn compose(layout: AsidLayout, generation: u64, asid: u16) -> Self {
        Self(layout.compose(generation, asid))
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn asid(self, layout: AsidLayout) -> u16 {
        layout.asid_of(self.0)
    }

    #[inline]
    pub const fn generation(self, layout: AsidLayout) -> u64 {
        layout.generation_of(self.0)
    }

    /// Returns true when this id belongs to the generation of `counter`.
    #[inline]
    pub const fn is_current(self, counter: u64, layout: AsidLayout) -> bool {
        layout.same_generation(self.0, counter)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
