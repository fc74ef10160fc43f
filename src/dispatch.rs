// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bus dispatch: routing reads and writes through an address space.
//!
//! Accesses that don't fit their handler are split. A memory access that
//! would run past its entry (or across a mirror fold) goes byte by byte. A
//! device access wider than the handler is cut into handler-width pieces; a
//! narrower one is sent as the containing handler word with a lane mask.

use crate::core::bus::{HandlerKind, MapEntry, Route, SpaceId};
use crate::core::memory::{combine_bytes, AccessWidth, Endianness, RegionId, RegionKind};
use crate::error::ConfigError;
use crate::machine::{Machine, Phase};
use crate::tree::DeviceId;

impl Machine {
    pub fn read(&mut self, space: SpaceId, address: u64, width: AccessWidth) -> u64 {
        let address = address & self.spaces[space.0].addr_mask();
        self.read_at(space, address, width)
    }

    pub fn write(&mut self, space: SpaceId, address: u64, width: AccessWidth, value: u64) {
        let address = address & self.spaces[space.0].addr_mask();
        self.write_at(space, address, width, value & width.mask())
    }

    pub fn read_u8(&mut self, space: SpaceId, address: u64) -> u8 {
        self.read(space, address, AccessWidth::Byte) as u8
    }

    pub fn write_u8(&mut self, space: SpaceId, address: u64, value: u8) {
        self.write(space, address, AccessWidth::Byte, value as u64)
    }

    /// Side-effect-free read for debuggers: memory and constant handlers
    /// only. Device ranges read as open bus and nothing is logged.
    pub fn peek(&self, space: SpaceId, address: u64, width: AccessWidth) -> u64 {
        let s = &self.spaces[space.0];
        let address = address & s.addr_mask();
        let route = s.lookup(address, false);
        if let Some(HandlerKind::Nop(value)) = route.map(|r| s.entry(r.index).kind) {
            return value & width.mask();
        }
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().take(width.bytes()).enumerate() {
            *byte = self.peek_byte(space, address.wrapping_add(i as u64) & s.addr_mask());
        }
        combine_bytes(&bytes[..width.bytes()], s.endianness())
    }

    fn peek_byte(&self, space: SpaceId, address: u64) -> u8 {
        let s = &self.spaces[space.0];
        let open = s.open_value(AccessWidth::Byte) as u8;
        let Some(route) = s.lookup(address, false) else {
            return open;
        };
        let entry = s.entry(route.index);
        match entry.kind {
            HandlerKind::Ram(_) | HandlerKind::Rom(_) | HandlerKind::Bank(_) => {
                let (region, offset) = self.memory_target(entry, route.offset);
                self.memory
                    .region(region)
                    .read(offset, AccessWidth::Byte, Endianness::Little)
                    .map_or(open, |v| v as u8)
            }
            HandlerKind::Nop(value) => value as u8,
            HandlerKind::Device { .. } | HandlerKind::Unmapped => open,
        }
    }

    /// Install a handler entry, checking that memory-backed ranges fit
    /// their region. Refused once the machine is running.
    pub(crate) fn install_entry(
        &mut self,
        space: SpaceId,
        entry: MapEntry,
    ) -> Result<(), ConfigError> {
        if matches!(self.phase, Phase::Running | Phase::Stopped) {
            return Err(ConfigError::Sealed {
                operation: "handler installation",
            });
        }
        let span = entry.end.saturating_sub(entry.start) + 1;
        let fits = |region: RegionId, base: u64| {
            base.checked_add(entry.region_offset)
                .and_then(|b| b.checked_add(span))
                .is_some_and(|needed| needed <= self.memory.region(region).len() as u64)
        };
        let backing = match entry.kind {
            HandlerKind::Ram(region) | HandlerKind::Rom(region) => Some((region, fits(region, 0))),
            HandlerKind::Bank(bank) => {
                let bank = self.memory.bank(bank);
                let last = bank.base() + bank.count().saturating_sub(1) * bank.stride();
                Some((bank.region(), fits(bank.region(), last as u64)))
            }
            _ => None,
        };
        if let Some((region, false)) = backing {
            return Err(ConfigError::RegionTooSmall {
                space: self.spaces[space.0].label().to_string(),
                region: self.memory.region(region).name().to_string(),
                start: entry.start,
            });
        }
        self.spaces[space.0].install(entry)
    }

    fn memory_target(&self, entry: &MapEntry, offset: u64) -> (RegionId, usize) {
        let offset = (entry.region_offset + offset) as usize;
        match entry.kind {
            HandlerKind::Bank(bank) => self.memory.bank_target(bank, offset),
            HandlerKind::Ram(region) | HandlerKind::Rom(region) => (region, offset),
            _ => unreachable!("memory_target on a non-memory handler"),
        }
    }

    /// True when every byte of the access lands in the same entry, in order.
    fn contiguous(
        &self,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
        route: Route,
        write: bool,
    ) -> bool {
        let s = &self.spaces[space.0];
        let last = width.bytes() as u64 - 1;
        match address.checked_add(last) {
            Some(end) if end <= s.addr_mask() => {
                s.lookup(end, write)
                    == Some(Route {
                        index: route.index,
                        offset: route.offset + last,
                    })
            }
            _ => false,
        }
    }

    fn read_miss(&mut self, space: SpaceId, address: u64, width: AccessWidth) -> u64 {
        let s = &self.spaces[space.0];
        self.diag.unmapped_read(space.0, s.label(), address);
        s.open_value(width)
    }

    fn write_miss(&mut self, space: SpaceId, address: u64, value: u64) {
        let s = &self.spaces[space.0];
        self.diag.unmapped_write(space.0, s.label(), address, value);
    }

    fn read_at(&mut self, space: SpaceId, address: u64, width: AccessWidth) -> u64 {
        let Some(route) = self.spaces[space.0].lookup(address, false) else {
            return self.read_miss(space, address, width);
        };
        let entry = *self.spaces[space.0].entry(route.index);
        match entry.kind {
            HandlerKind::Unmapped => self.read_miss(space, address, width),
            HandlerKind::Nop(value) => value & width.mask(),
            HandlerKind::Ram(_) | HandlerKind::Rom(_) | HandlerKind::Bank(_) => {
                if width != AccessWidth::Byte
                    && !self.contiguous(space, address, width, route, false)
                {
                    return self.split_read(space, address, width, AccessWidth::Byte);
                }
                let (region, offset) = self.memory_target(&entry, route.offset);
                let endianness = self.spaces[space.0].endianness();
                match self.memory.region(region).read(offset, width, endianness) {
                    Some(value) => value,
                    None => self.read_miss(space, address, width),
                }
            }
            HandlerKind::Device {
                device,
                map,
                width: handler,
            } => self.read_device(
                space,
                address,
                width,
                &entry,
                route.offset,
                device,
                map,
                handler,
            ),
        }
    }

    fn write_at(&mut self, space: SpaceId, address: u64, width: AccessWidth, value: u64) {
        let Some(route) = self.spaces[space.0].lookup(address, true) else {
            return self.write_miss(space, address, value);
        };
        let entry = *self.spaces[space.0].entry(route.index);
        match entry.kind {
            HandlerKind::Unmapped => self.write_miss(space, address, value),
            HandlerKind::Nop(_) => {}
            HandlerKind::Rom(_) => {
                log::trace!(
                    "{}: write of {value:#x} to ROM at {address:#x} ignored",
                    self.spaces[space.0].label()
                );
            }
            HandlerKind::Ram(_) | HandlerKind::Bank(_) => {
                if width != AccessWidth::Byte
                    && !self.contiguous(space, address, width, route, true)
                {
                    return self.split_write(space, address, width, AccessWidth::Byte, value);
                }
                let (region, offset) = self.memory_target(&entry, route.offset);
                if self.memory.region(region).kind() == RegionKind::Rom {
                    log::trace!(
                        "{}: write of {value:#x} to banked ROM at {address:#x} ignored",
                        self.spaces[space.0].label()
                    );
                    return;
                }
                let endianness = self.spaces[space.0].endianness();
                if !self.memory.region_mut(region).write(offset, width, endianness, value) {
                    self.write_miss(space, address, value);
                }
            }
            HandlerKind::Device {
                device,
                map,
                width: handler,
            } => self.write_device(
                space,
                address,
                width,
                value,
                &entry,
                route.offset,
                device,
                map,
                handler,
            ),
        }
    }

    fn split_read(
        &mut self,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
        piece: AccessWidth,
    ) -> u64 {
        let mask = self.spaces[space.0].addr_mask();
        let endianness = self.spaces[space.0].endianness();
        let step = piece.bytes();
        let bits = piece.bits();
        let mut value = 0u64;
        for i in 0..width.bytes() / step {
            let part = self.read_at(space, address.wrapping_add((i * step) as u64) & mask, piece);
            value = match endianness {
                Endianness::Little => value | part << (i as u32 * bits),
                Endianness::Big => value << bits | part,
            };
        }
        value
    }

    fn split_write(
        &mut self,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
        piece: AccessWidth,
        value: u64,
    ) {
        let mask = self.spaces[space.0].addr_mask();
        let endianness = self.spaces[space.0].endianness();
        let step = piece.bytes();
        let bits = piece.bits();
        let count = width.bytes() / step;
        for i in 0..count {
            let shift = match endianness {
                Endianness::Little => i as u32 * bits,
                Endianness::Big => (count - 1 - i) as u32 * bits,
            };
            let part = (value >> shift) & piece.mask();
            self.write_at(space, address.wrapping_add((i * step) as u64) & mask, piece, part);
        }
    }

    /// Where a narrow access sits inside its handler word.
    fn sub_shift(
        &self,
        space: SpaceId,
        within: u64,
        width: AccessWidth,
        handler: AccessWidth,
    ) -> u32 {
        let bytes = match self.spaces[space.0].endianness() {
            Endianness::Little => within,
            Endianness::Big => handler.bytes() as u64 - within - width.bytes() as u64,
        };
        bytes as u32 * 8
    }

    #[allow(clippy::too_many_arguments)]
    fn read_device(
        &mut self,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
        entry: &MapEntry,
        offset: u64,
        device: DeviceId,
        map: u32,
        handler: AccessWidth,
    ) -> u64 {
        if let Some(lanes) = entry.lanes {
            if width != AccessWidth::Byte {
                return self.split_read(space, address, width, AccessWidth::Byte);
            }
            let stride = lanes.stride as u64;
            if (entry.start + offset) % stride != lanes.lane as u64 {
                return self.spaces[space.0].open_value(width);
            }
            return self.device_read(space, device, map, offset / stride, 0xFF);
        }
        let hw = handler.bytes() as u64;
        let w = width.bytes() as u64;
        let within = offset % hw;
        if w > hw {
            return self.split_read(space, address, width, handler);
        }
        if w == hw {
            if within != 0 {
                return self.split_read(space, address, width, AccessWidth::Byte);
            }
            return self.device_read(space, device, map, offset / hw, handler.mask());
        }
        if within + w > hw {
            return self.split_read(space, address, width, AccessWidth::Byte);
        }
        let shift = self.sub_shift(space, within, width, handler);
        let value = self.device_read(space, device, map, offset / hw, width.mask() << shift);
        (value >> shift) & width.mask()
    }

    #[allow(clippy::too_many_arguments)]
    fn write_device(
        &mut self,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
        value: u64,
        entry: &MapEntry,
        offset: u64,
        device: DeviceId,
        map: u32,
        handler: AccessWidth,
    ) {
        if let Some(lanes) = entry.lanes {
            if width != AccessWidth::Byte {
                return self.split_write(space, address, width, AccessWidth::Byte, value);
            }
            let stride = lanes.stride as u64;
            if (entry.start + offset) % stride == lanes.lane as u64 {
                self.device_write(device, map, offset / stride, value, 0xFF);
            }
            return;
        }
        let hw = handler.bytes() as u64;
        let w = width.bytes() as u64;
        let within = offset % hw;
        if w > hw {
            return self.split_write(space, address, width, handler, value);
        }
        if w == hw {
            if within != 0 {
                return self.split_write(space, address, width, AccessWidth::Byte, value);
            }
            return self.device_write(device, map, offset / hw, value, handler.mask());
        }
        if within + w > hw {
            return self.split_write(space, address, width, AccessWidth::Byte, value);
        }
        let shift = self.sub_shift(space, within, width, handler);
        self.device_write(device, map, offset / hw, value << shift, width.mask() << shift);
    }

    fn device_read(
        &mut self,
        space: SpaceId,
        device: DeviceId,
        map: u32,
        offset: u64,
        mask: u64,
    ) -> u64 {
        match self.call_device(device, |dev, ctx| dev.read(ctx, map, offset, mask)) {
            Some(value) => value & mask,
            None => self.spaces[space.0].open_value(AccessWidth::Qword) & mask,
        }
    }

    fn device_write(&mut self, device: DeviceId, map: u32, offset: u64, value: u64, mask: u64) {
        self.call_device(device, |dev, ctx| dev.write(ctx, map, offset, value & mask, mask));
    }
}
