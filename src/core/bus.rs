// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Address spaces: a masked address bus plus an ordered handler table.
//!
//! Entries are matched newest-first, so a later install over an overlapping
//! range takes priority. Mirror bits are stripped from the address before the
//! range test, which makes one entry answer at every mirrored alias.

use crate::core::memory::{AccessWidth, BankId, Endianness, RegionId};
use crate::error::ConfigError;
use crate::tree::DeviceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(pub(crate) usize);

fn default_open_bus() -> u8 {
    0xFF
}

/// Shape of a bus: address width, data width, byte order and open-bus value.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
pub struct SpaceConfig {
    pub name: String,
    pub addr_bits: u8,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub data_width: AccessWidth,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub endianness: Endianness,
    /// Byte driven onto the bus when nothing answers.
    #[cfg_attr(feature = "serde-spec", serde(default = "default_open_bus"))]
    pub open_bus: u8,
}

impl SpaceConfig {
    pub fn new(name: impl Into<String>, addr_bits: u8, data_width: AccessWidth) -> Self {
        Self {
            name: name.into(),
            addr_bits,
            data_width,
            endianness: Endianness::Little,
            open_bus: default_open_bus(),
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.endianness = Endianness::Big;
        self
    }

    pub fn with_open_bus(mut self, value: u8) -> Self {
        self.open_bus = value;
        self
    }

    pub fn addr_mask(&self) -> u64 {
        if self.addr_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.addr_bits) - 1
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-spec", serde(rename_all = "lowercase"))]
pub enum Access {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Byte-lane selection for an 8-bit device on a wider bus.
///
/// Only addresses where `address % stride == lane` reach the device; the
/// device sees `offset / stride` as its register index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
pub struct Lanes {
    pub stride: u8,
    pub lane: u8,
}

/// What answers inside a mapped range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    Ram(RegionId),
    Rom(RegionId),
    Bank(BankId),
    /// A device handler. `width` is the handler's natural data width and
    /// offsets passed to it are counted in units of that width.
    Device {
        device: DeviceId,
        map: u32,
        width: AccessWidth,
    },
    /// Reads return the value, writes are swallowed.
    Nop(u64),
    /// Explicit hole; behaves like an unmapped address.
    Unmapped,
}

/// One installed range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub mirror: u64,
    pub access: Access,
    pub lanes: Option<Lanes>,
    /// Byte offset into the backing region or bank window.
    pub region_offset: u64,
    pub kind: HandlerKind,
}

impl MapEntry {
    pub fn new(start: u64, end: u64, kind: HandlerKind) -> Self {
        Self {
            start,
            end,
            mirror: 0,
            access: Access::ReadWrite,
            lanes: None,
            region_offset: 0,
            kind,
        }
    }

    pub fn ram(start: u64, end: u64, region: RegionId) -> Self {
        Self::new(start, end, HandlerKind::Ram(region))
    }

    pub fn rom(start: u64, end: u64, region: RegionId) -> Self {
        Self::new(start, end, HandlerKind::Rom(region)).access(Access::Read)
    }

    pub fn bank(start: u64, end: u64, bank: BankId) -> Self {
        Self::new(start, end, HandlerKind::Bank(bank))
    }

    pub fn device(start: u64, end: u64, device: DeviceId, map: u32, width: AccessWidth) -> Self {
        Self::new(start, end, HandlerKind::Device { device, map, width })
    }

    pub fn nop(start: u64, end: u64, value: u64) -> Self {
        Self::new(start, end, HandlerKind::Nop(value))
    }

    pub fn unmapped(start: u64, end: u64) -> Self {
        Self::new(start, end, HandlerKind::Unmapped)
    }

    pub fn mirror(mut self, mirror: u64) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn lanes(mut self, stride: u8, lane: u8) -> Self {
        self.lanes = Some(Lanes { stride, lane });
        self
    }

    pub fn region_offset(mut self, offset: u64) -> Self {
        self.region_offset = offset;
        self
    }

    /// Number of bytes covered by the range.
    pub fn span(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Clone, Copy, Debug)]
struct Installed {
    entry: MapEntry,
    select: u64,
}

/// A successful lookup: which entry answered and at what byte offset into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub index: usize,
    pub offset: u64,
}

/// A named bus owned by one device.
#[derive(Debug)]
pub struct AddressSpace {
    config: SpaceConfig,
    owner: DeviceId,
    label: String,
    mask: u64,
    entries: Vec<Installed>,
}

impl AddressSpace {
    pub fn new(owner: DeviceId, owner_tag: &str, config: SpaceConfig) -> Result<Self, ConfigError> {
        if config.addr_bits == 0 || config.addr_bits > 64 {
            return Err(ConfigError::InvalidSpace {
                space: config.name.clone(),
                bits: config.addr_bits,
            });
        }
        let label = if owner_tag == ":" {
            format!(":{}", config.name)
        } else {
            format!("{owner_tag}:{}", config.name)
        };
        Ok(Self {
            mask: config.addr_mask(),
            config,
            owner,
            label,
            entries: Vec::new(),
        })
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Owner tag and space name, e.g. `:cpu:program`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn owner(&self) -> DeviceId {
        self.owner
    }

    pub fn addr_mask(&self) -> u64 {
        self.mask
    }

    pub fn endianness(&self) -> Endianness {
        self.config.endianness
    }

    /// The open-bus byte replicated across `width`.
    pub fn open_value(&self, width: AccessWidth) -> u64 {
        u64::from_ne_bytes([self.config.open_bus; 8]) & width.mask()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MapEntry> {
        self.entries.iter().map(|e| &e.entry)
    }

    pub fn entry(&self, index: usize) -> &MapEntry {
        &self.entries[index].entry
    }

    /// Validate and append an entry. Range and lane checks only; callers
    /// check region bounds since those live outside the space.
    pub fn install(&mut self, entry: MapEntry) -> Result<(), ConfigError> {
        if entry.start > entry.end {
            return Err(ConfigError::InvalidRange {
                space: self.label.clone(),
                start: entry.start,
                end: entry.end,
            });
        }
        if entry.end > self.mask || entry.mirror & !self.mask != 0 {
            return Err(ConfigError::RangeOutOfSpace {
                space: self.label.clone(),
                start: entry.start,
                end: entry.end,
                bits: self.config.addr_bits,
            });
        }
        if let Some(lanes) = entry.lanes {
            let byte_device = matches!(
                entry.kind,
                HandlerKind::Device {
                    width: AccessWidth::Byte,
                    ..
                }
            );
            if !byte_device || lanes.stride < 2 || lanes.lane >= lanes.stride {
                return Err(ConfigError::InvalidLanes {
                    space: self.label.clone(),
                    stride: lanes.stride,
                    lane: lanes.lane,
                });
            }
        }
        log::trace!(
            "{}: {:#x}..={:#x} mirror {:#x} -> {:?}",
            self.label,
            entry.start,
            entry.end,
            entry.mirror,
            entry.kind
        );
        self.entries.push(Installed {
            entry,
            select: self.mask & !entry.mirror,
        });
        Ok(())
    }

    /// Find the newest entry covering `address` for the given direction.
    pub fn lookup(&self, address: u64, write: bool) -> Option<Route> {
        let address = address & self.mask;
        self.entries
            .iter()
            .enumerate()
            .rev()
            .find_map(|(index, installed)| {
                let entry = &installed.entry;
                let allowed = if write {
                    entry.access.writes()
                } else {
                    entry.access.reads()
                };
                if !allowed {
                    return None;
                }
                let folded = address & installed.select;
                (folded >= entry.start && folded <= entry.end).then(|| Route {
                    index,
                    offset: folded - entry.start,
                })
            })
    }
}
