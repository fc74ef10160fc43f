// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Backing storage for memory-mapped RAM, ROM and bank-switched windows.
//!
//! Regions are plain byte vectors owned by the machine; address spaces refer to
//! them by [`RegionId`]. All multi-byte access goes through [`AccessWidth`] and
//! [`Endianness`] so no handler ever shifts bytes around by hand.

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BankId(pub(crate) usize);

/// Byte order of a bus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-spec", serde(rename_all = "lowercase"))]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Width of a single bus access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-spec", serde(rename_all = "lowercase"))]
pub enum AccessWidth {
    #[default]
    Byte,
    Word,
    Dword,
    Qword,
}

impl AccessWidth {
    pub const fn bytes(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Dword => 4,
            AccessWidth::Qword => 8,
        }
    }

    pub const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// All-ones mask covering this width.
    pub const fn mask(self) -> u64 {
        match self {
            AccessWidth::Qword => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    pub const fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(AccessWidth::Byte),
            2 => Some(AccessWidth::Word),
            4 => Some(AccessWidth::Dword),
            8 => Some(AccessWidth::Qword),
            _ => None,
        }
    }
}

/// Assemble a value from consecutive bytes.
pub fn combine_bytes(bytes: &[u8], endianness: Endianness) -> u64 {
    match endianness {
        Endianness::Little => bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64),
        Endianness::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64),
    }
}

/// Spread `value` over `out`, the inverse of [`combine_bytes`].
pub fn split_bytes(value: u64, out: &mut [u8], endianness: Endianness) {
    let len = out.len();
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = match endianness {
            Endianness::Little => i * 8,
            Endianness::Big => (len - 1 - i) * 8,
        };
        *slot = (value >> shift) as u8;
    }
}

/// Bit position of byte `index` (0 = lowest address) inside a `width`-sized word.
pub const fn lane_shift(index: usize, width: AccessWidth, endianness: Endianness) -> u32 {
    match endianness {
        Endianness::Little => index as u32 * 8,
        Endianness::Big => (width.bytes() - 1 - index) as u32 * 8,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-spec", serde(rename_all = "lowercase"))]
pub enum RegionKind {
    Ram,
    Rom,
}

/// A named block of bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryRegion {
    name: String,
    kind: RegionKind,
    data: Vec<u8>,
}

impl MemoryRegion {
    pub fn ram(name: impl Into<String>, size: usize, fill: u8) -> Self {
        Self {
            name: name.into(),
            kind: RegionKind::Ram,
            data: vec![fill; size],
        }
    }

    pub fn rom(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind: RegionKind::Rom,
            data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Host-side mutable view, used for ROM loading and debuggers. Bus writes
    /// to ROM entries never reach this.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Bounds-checked read of `width` bytes at `offset`.
    pub fn read(&self, offset: usize, width: AccessWidth, endianness: Endianness) -> Option<u64> {
        let end = offset.checked_add(width.bytes())?;
        self.data
            .get(offset..end)
            .map(|bytes| combine_bytes(bytes, endianness))
    }

    /// Bounds-checked write; returns `false` when the range falls outside the region.
    pub fn write(
        &mut self,
        offset: usize,
        width: AccessWidth,
        endianness: Endianness,
        value: u64,
    ) -> bool {
        let Some(end) = offset.checked_add(width.bytes()) else {
            return false;
        };
        match self.data.get_mut(offset..end) {
            Some(bytes) => {
                split_bytes(value, bytes, endianness);
                true
            }
            None => false,
        }
    }
}

/// A window into a region whose base can be switched at runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct Bank {
    name: String,
    region: RegionId,
    base: usize,
    stride: usize,
    count: usize,
    current: usize,
}

impl Bank {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> RegionId {
        self.region
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Byte offset into the backing region of the selected entry.
    pub fn offset(&self) -> usize {
        self.base + self.current * self.stride
    }

    pub(crate) fn current_mut(&mut self) -> &mut usize {
        &mut self.current
    }
}

/// Every region and bank of one machine.
#[derive(Debug, Default)]
pub struct Memory {
    regions: Vec<MemoryRegion>,
    banks: Vec<Bank>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_region(&mut self, region: MemoryRegion) -> Result<RegionId, ConfigError> {
        if self.find_region(region.name()).is_some() {
            return Err(ConfigError::DuplicateRegion {
                name: region.name.clone(),
            });
        }
        self.regions.push(region);
        Ok(RegionId(self.regions.len() - 1))
    }

    pub fn find_region(&self, name: &str) -> Option<RegionId> {
        self.regions
            .iter()
            .position(|r| r.name == name)
            .map(RegionId)
    }

    pub fn region(&self, id: RegionId) -> &MemoryRegion {
        &self.regions[id.0]
    }

    pub fn region_mut(&mut self, id: RegionId) -> &mut MemoryRegion {
        &mut self.regions[id.0]
    }

    pub fn regions(&self) -> impl Iterator<Item = (RegionId, &MemoryRegion)> {
        self.regions.iter().enumerate().map(|(i, r)| (RegionId(i), r))
    }

    pub(crate) fn regions_mut(&mut self) -> impl Iterator<Item = &mut MemoryRegion> {
        self.regions.iter_mut()
    }

    /// Create a bank of `count` entries, `stride` bytes apart, starting at `base`.
    pub fn add_bank(
        &mut self,
        name: impl Into<String>,
        region: RegionId,
        base: usize,
        count: usize,
        stride: usize,
    ) -> Result<BankId, ConfigError> {
        let name = name.into();
        if self.find_bank(&name).is_some() {
            return Err(ConfigError::DuplicateBank { name });
        }
        let len = self.region(region).len();
        let last = count
            .checked_sub(1)
            .and_then(|n| n.checked_mul(stride))
            .and_then(|n| n.checked_add(base));
        match last {
            Some(last) if last < len => {}
            _ => {
                return Err(ConfigError::BankOutOfRegion {
                    bank: name,
                    region: self.region(region).name().to_string(),
                });
            }
        }
        self.banks.push(Bank {
            name,
            region,
            base,
            stride,
            count,
            current: 0,
        });
        Ok(BankId(self.banks.len() - 1))
    }

    pub fn find_bank(&self, name: &str) -> Option<BankId> {
        self.banks.iter().position(|b| b.name == name).map(BankId)
    }

    pub fn bank(&self, id: BankId) -> &Bank {
        &self.banks[id.0]
    }

    pub(crate) fn banks_mut(&mut self) -> impl Iterator<Item = &mut Bank> {
        self.banks.iter_mut()
    }

    /// Retarget a bank. Handlers that map the bank see the new entry on their
    /// next access; nothing is reinstalled.
    pub fn set_bank_pointer(&mut self, id: BankId, index: usize) -> Result<(), ConfigError> {
        let bank = &mut self.banks[id.0];
        if index >= bank.count {
            return Err(ConfigError::BankIndexOutOfRange {
                bank: bank.name.clone(),
                index,
                count: bank.count,
            });
        }
        bank.current = index;
        Ok(())
    }

    /// Resolve a bank-relative offset to a region and an offset inside it.
    pub(crate) fn bank_target(&self, id: BankId, offset: usize) -> (RegionId, usize) {
        let bank = &self.banks[id.0];
        (bank.region, bank.offset() + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_split_respect_endianness() {
        let bytes = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(combine_bytes(&bytes, Endianness::Little), 0x7856_3412);
        assert_eq!(combine_bytes(&bytes, Endianness::Big), 0x1234_5678);

        let mut out = [0u8; 2];
        split_bytes(0xBEEF, &mut out, Endianness::Big);
        assert_eq!(out, [0xBE, 0xEF]);
        split_bytes(0xBEEF, &mut out, Endianness::Little);
        assert_eq!(out, [0xEF, 0xBE]);
    }

    #[test]
    fn region_access_is_bounds_checked() {
        let mut ram = MemoryRegion::ram("ram", 4, 0);
        assert!(ram.write(2, AccessWidth::Word, Endianness::Little, 0xABCD));
        assert_eq!(ram.read(2, AccessWidth::Word, Endianness::Little), Some(0xABCD));
        assert_eq!(ram.read(3, AccessWidth::Word, Endianness::Little), None);
        assert!(!ram.write(4, AccessWidth::Byte, Endianness::Little, 1));
    }

    #[test]
    fn bank_pointer_switches_offset() {
        let mut mem = Memory::new();
        let rom = mem
            .add_region(MemoryRegion::rom("cart", (0..64).collect()))
            .unwrap();
        let bank = mem.add_bank("page", rom, 0, 4, 16).unwrap();
        assert_eq!(mem.bank_target(bank, 3), (rom, 3));
        mem.set_bank_pointer(bank, 2).unwrap();
        assert_eq!(mem.bank_target(bank, 3), (rom, 35));
        assert!(matches!(
            mem.set_bank_pointer(bank, 4),
            Err(ConfigError::BankIndexOutOfRange { index: 4, .. })
        ));
    }

    #[test]
    fn bank_must_fit_region() {
        let mut mem = Memory::new();
        let rom = mem.add_region(MemoryRegion::rom("cart", vec![0; 32])).unwrap();
        assert!(mem.add_bank("page", rom, 0, 3, 16).is_err());
        assert!(mem.add_bank("page", rom, 0, 2, 16).is_ok());
    }

    #[test]
    fn lane_shift_follows_byte_order() {
        assert_eq!(lane_shift(1, AccessWidth::Word, Endianness::Little), 8);
        assert_eq!(lane_shift(1, AccessWidth::Word, Endianness::Big), 0);
        assert_eq!(AccessWidth::Dword.mask(), 0xFFFF_FFFF);
        assert_eq!(AccessWidth::Qword.mask(), u64::MAX);
    }
}
