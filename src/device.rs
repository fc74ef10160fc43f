// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device behavior traits and the contexts devices see.
//!
//! Devices never hold references to each other. Everything they touch
//! (buses, timers, lines, other devices) goes through a [`DeviceContext`]
//! handed to each callback, or a [`DeviceBuilder`] during construction.

use std::any::Any;
use std::collections::BTreeMap;

use crate::core::bus::{MapEntry, SpaceConfig, SpaceId};
use crate::core::memory::{AccessWidth, BankId, MemoryRegion, RegionId};
use crate::core::time::TimeValue;
use crate::error::ConfigError;
use crate::machine::{Machine, Phase};
use crate::scheduler::{LineId, SuspendReason, TimerId};
use crate::state::StateVisitor;
use crate::tree::{DeviceFinder, DeviceId};

/// Static configuration attached to a device node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceConfig {
    /// Input clock in Hz; zero for unclocked devices.
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub clock: u32,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub params: BTreeMap<String, u64>,
}

impl DeviceConfig {
    pub fn new(clock: u32) -> Self {
        Self {
            clock,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: u64) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<u64> {
        self.params.get(key).copied()
    }
}

/// Upcast helper so trait objects can be downcast to their concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Behavior of one node in the device tree.
///
/// `read`/`write` receive the map index the handler was installed with and an
/// offset counted in units of the handler's width. `mask` marks the bits the
/// access actually drives; a narrow access on a wide handler only sets the
/// bits of its lane.
pub trait Device: AsAny {
    fn kind(&self) -> &'static str;

    /// Called once, in dependency order, after every finder is bound.
    /// Timers, regions and handler installs are only allowed here.
    fn start(&mut self, _ctx: &mut DeviceContext<'_>) -> Result<(), ConfigError> {
        Ok(())
    }

    fn reset(&mut self, _ctx: &mut DeviceContext<'_>) {}

    /// Called in reverse start order when the machine shuts down.
    fn stop(&mut self, _ctx: &mut DeviceContext<'_>) {}

    fn read(&mut self, _ctx: &mut DeviceContext<'_>, _map: u32, _offset: u64, mask: u64) -> u64 {
        mask
    }

    fn write(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _map: u32,
        _offset: u64,
        _value: u64,
        _mask: u64,
    ) {
    }

    fn timer(&mut self, _ctx: &mut DeviceContext<'_>, _timer: TimerId, _param: u64) {}

    /// Visit every piece of persistent state. The same items must be
    /// visited in the same order on every call.
    fn state(&mut self, _state: &mut StateVisitor<'_>) {}

    /// Recompute derived values after a state load.
    fn post_load(&mut self, _ctx: &mut DeviceContext<'_>) {}

    fn executor(&mut self) -> Option<&mut dyn Executor> {
        None
    }
}

/// A device that consumes emulated cycles: a CPU or anything shaped like one.
pub trait Executor {
    /// Run until [`DeviceContext::should_yield`] turns true, reporting every
    /// cycle through [`DeviceContext::consume_cycles`] before the bus access
    /// it pays for.
    fn execute(&mut self, ctx: &mut DeviceContext<'_>);
}

/// The tree root. Owns nothing but machine-level state items.
#[derive(Debug, Default)]
pub struct Root;

impl Device for Root {
    fn kind(&self) -> &'static str {
        "root"
    }
}

/// Construction-time handle: declare finders, spaces and output lines.
pub struct DeviceBuilder<'a> {
    pub(crate) machine: &'a mut Machine,
    pub(crate) id: DeviceId,
}

impl DeviceBuilder<'_> {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn tag(&self) -> &str {
        self.machine.tree.tag(self.id)
    }

    pub fn config(&self) -> &DeviceConfig {
        self.machine.tree.config(self.id)
    }

    pub fn clock(&self) -> u32 {
        self.config().clock
    }

    pub fn param(&self, key: &str) -> Option<u64> {
        self.config().param(key)
    }

    /// A reference that must resolve or the machine fails to build.
    pub fn required_device(&mut self, path: &str) -> DeviceFinder {
        self.machine.tree.declare_finder(self.id, path, true)
    }

    /// A reference that may stay unbound.
    pub fn optional_device(&mut self, path: &str) -> DeviceFinder {
        self.machine.tree.declare_finder(self.id, path, false)
    }

    pub fn add_space(&mut self, config: SpaceConfig) -> Result<SpaceId, ConfigError> {
        self.machine.add_space(self.id, config)
    }

    pub fn add_output(&mut self, name: &str) -> Result<LineId, ConfigError> {
        self.machine
            .scheduler
            .add_output(self.id, name)
            .ok_or_else(|| ConfigError::DuplicateLine {
                device: self.machine.tree.tag(self.id).to_string(),
                line: name.to_string(),
            })
    }
}

/// Runtime handle passed to every device callback.
pub struct DeviceContext<'a> {
    pub(crate) machine: &'a mut Machine,
    pub(crate) this: DeviceId,
}

impl<'a> DeviceContext<'a> {
    pub(crate) fn new(machine: &'a mut Machine, this: DeviceId) -> Self {
        Self { machine, this }
    }

    pub fn id(&self) -> DeviceId {
        self.this
    }

    pub fn tag(&self) -> &str {
        self.machine.tree.tag(self.this)
    }

    pub fn config(&self) -> &DeviceConfig {
        self.machine.tree.config(self.this)
    }

    pub fn clock(&self) -> u32 {
        self.config().clock
    }

    /// Current emulated time. Inside an executor's timeslice this is that
    /// executor's local time, which may run ahead of the global clock.
    pub fn now(&self) -> TimeValue {
        self.machine.scheduler.current_time()
    }

    pub fn finder(&self, finder: DeviceFinder) -> Option<DeviceId> {
        self.machine.tree.finder_target(finder)
    }

    pub fn device_tag(&self, id: DeviceId) -> &str {
        self.machine.tree.tag(id)
    }

    /// Borrow another device. `None` for the calling device itself, which
    /// is checked out while it runs.
    pub fn device<T: Device>(&self, id: DeviceId) -> Option<&T> {
        self.machine.tree.behavior(id)?.as_any().downcast_ref::<T>()
    }

    pub fn device_mut<T: Device>(&mut self, id: DeviceId) -> Option<&mut T> {
        self.machine.tree.behavior_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    // ---- address spaces ----

    pub fn space(&self, name: &str) -> Option<SpaceId> {
        self.machine.find_space(self.this, name)
    }

    pub fn find_space(&self, device: DeviceId, name: &str) -> Option<SpaceId> {
        self.machine.find_space(device, name)
    }

    pub fn read(&mut self, space: SpaceId, address: u64, width: AccessWidth) -> u64 {
        self.machine.read(space, address, width)
    }

    pub fn write(&mut self, space: SpaceId, address: u64, width: AccessWidth, value: u64) {
        self.machine.write(space, address, width, value)
    }

    pub fn read_u8(&mut self, space: SpaceId, address: u64) -> u8 {
        self.machine.read(space, address, AccessWidth::Byte) as u8
    }

    pub fn write_u8(&mut self, space: SpaceId, address: u64, value: u8) {
        self.machine.write(space, address, AccessWidth::Byte, value as u64)
    }

    pub fn peek(&self, space: SpaceId, address: u64, width: AccessWidth) -> u64 {
        self.machine.peek(space, address, width)
    }

    /// Install a handler. Only during start.
    pub fn install(&mut self, space: SpaceId, entry: MapEntry) -> Result<(), ConfigError> {
        self.machine.install_entry(space, entry)
    }

    /// Install this device as the handler for `start..=end`.
    pub fn install_self(
        &mut self,
        space: SpaceId,
        start: u64,
        end: u64,
        map: u32,
        width: AccessWidth,
    ) -> Result<(), ConfigError> {
        let entry = MapEntry::device(start, end, self.this, map, width);
        self.machine.install_entry(space, entry)
    }

    /// Punch a hole: `start..=end` reads as open bus from now on.
    pub fn unmap(&mut self, space: SpaceId, start: u64, end: u64) -> Result<(), ConfigError> {
        self.machine.install_entry(space, MapEntry::unmapped(start, end))
    }

    /// Constant reads, ignored writes.
    pub fn nop(
        &mut self,
        space: SpaceId,
        start: u64,
        end: u64,
        value: u64,
    ) -> Result<(), ConfigError> {
        self.machine.install_entry(space, MapEntry::nop(start, end, value))
    }

    // ---- memory ----

    pub fn add_region(&mut self, region: MemoryRegion) -> Result<RegionId, ConfigError> {
        if self.machine.phase != Phase::Starting {
            return Err(ConfigError::Sealed {
                operation: "region allocation",
            });
        }
        self.machine.memory.add_region(region)
    }

    pub fn find_region(&self, name: &str) -> Option<RegionId> {
        self.machine.memory.find_region(name)
    }

    pub fn region(&self, id: RegionId) -> &MemoryRegion {
        self.machine.memory.region(id)
    }

    pub fn region_mut(&mut self, id: RegionId) -> &mut MemoryRegion {
        self.machine.memory.region_mut(id)
    }

    pub fn find_bank(&self, name: &str) -> Option<BankId> {
        self.machine.memory.find_bank(name)
    }

    pub fn set_bank_pointer(&mut self, bank: BankId, index: usize) -> Result<(), ConfigError> {
        self.machine.memory.set_bank_pointer(bank, index)
    }

    // ---- timers ----

    /// Allocate a timer owned by this device. Only during start.
    pub fn timer_alloc(&mut self, name: &str) -> Result<TimerId, ConfigError> {
        if self.machine.phase != Phase::Starting {
            return Err(ConfigError::Sealed {
                operation: "timer allocation",
            });
        }
        Ok(self.machine.scheduler.alloc_timer(self.this, name))
    }

    /// Fire once after `delay`. A `NEVER` delay disables the timer.
    pub fn timer_set(&mut self, timer: TimerId, delay: TimeValue, param: u64) {
        self.timer_adjust(timer, delay, param, TimeValue::NEVER);
    }

    /// Fire every `period`, first after one period.
    pub fn timer_set_periodic(&mut self, timer: TimerId, period: TimeValue, param: u64) {
        self.timer_adjust(timer, period, param, period);
    }

    pub fn timer_adjust(
        &mut self,
        timer: TimerId,
        delay: TimeValue,
        param: u64,
        period: TimeValue,
    ) {
        let expire = self.now() + delay;
        self.timer_adjust_at(timer, expire, param, period);
    }

    /// Fire once at an absolute time. Past times are clamped to now.
    pub fn timer_set_at(&mut self, timer: TimerId, at: TimeValue, param: u64) {
        self.timer_adjust_at(timer, at, param, TimeValue::NEVER);
    }

    fn timer_adjust_at(&mut self, timer: TimerId, at: TimeValue, param: u64, period: TimeValue) {
        let violation = self.machine.scheduler.adjust(timer, self.this, at, param, period);
        if let Some(violation) = violation {
            self.machine.scheduler_violation(self.this, violation);
        }
    }

    pub fn timer_enable(&mut self, timer: TimerId, enable: bool) {
        if let Some(violation) = self.machine.scheduler.enable(timer, self.this, enable) {
            self.machine.scheduler_violation(self.this, violation);
        }
    }

    pub fn timer_reset(&mut self, timer: TimerId) {
        self.timer_enable(timer, false);
    }

    /// Release a timer this device owns.
    pub fn timer_free(&mut self, timer: TimerId) {
        if let Some(violation) = self.machine.scheduler.free(timer, self.this) {
            self.machine.scheduler_violation(self.this, violation);
        }
    }

    pub fn timer_start(&self, timer: TimerId) -> TimeValue {
        self.machine.scheduler.timer_start(timer)
    }

    pub fn timer_enabled(&self, timer: TimerId) -> bool {
        self.machine.scheduler.timer_enabled(timer)
    }

    pub fn timer_param(&self, timer: TimerId) -> u64 {
        self.machine.scheduler.timer_param(timer)
    }

    pub fn timer_expire(&self, timer: TimerId) -> TimeValue {
        self.machine.scheduler.timer_expire(timer)
    }

    pub fn timer_remaining(&self, timer: TimerId) -> TimeValue {
        self.machine.scheduler.timer_remaining(timer)
    }

    pub fn timer_elapsed(&self, timer: TimerId) -> TimeValue {
        self.machine.scheduler.timer_elapsed(timer)
    }

    // ---- lines ----

    pub fn set_line(&mut self, line: LineId, state: bool) {
        if self.machine.scheduler.line_owner(line) != Some(self.this) {
            log::warn!("{}: driving a line it does not own", self.tag());
        }
        self.machine.scheduler.set_line(line, state);
    }

    pub fn line_state(&self, line: LineId) -> bool {
        self.machine.scheduler.line_state(line)
    }

    // ---- executor ----

    fn exec_index(&self) -> Option<usize> {
        self.machine.scheduler.exec_index(self.this)
    }

    /// Account `cycles` of progress for the running executor.
    pub fn consume_cycles(&mut self, cycles: u64) {
        if let Some(index) = self.exec_index() {
            self.machine.scheduler.consume(index, cycles);
        }
    }

    /// Cycles left in the current timeslice.
    pub fn cycles_left(&self) -> u64 {
        self.exec_index()
            .map(|index| self.machine.scheduler.cycles_left(index))
            .unwrap_or(0)
    }

    /// True once the budget is spent, the slice was cut short, or the
    /// executor stopped running.
    pub fn should_yield(&self) -> bool {
        self.exec_index()
            .map(|index| self.machine.scheduler.should_yield(index))
            .unwrap_or(true)
    }

    /// Current state of the executor's input lines as a bitmask.
    pub fn input_lines(&self) -> u32 {
        self.exec_index()
            .map(|index| self.machine.scheduler.input_lines(index))
            .unwrap_or(0)
    }

    pub fn input_line(&self, input: u8) -> bool {
        input < 32 && self.input_lines() & (1 << input) != 0
    }

    pub fn suspend(&mut self, reason: SuspendReason) {
        if let Some(index) = self.exec_index() {
            self.machine.scheduler.suspend(index, reason);
        }
    }

    pub fn resume(&mut self, reason: SuspendReason) {
        if let Some(index) = self.exec_index() {
            self.machine.scheduler.resume(index, reason);
        }
    }

    pub fn halt(&mut self) {
        if let Some(index) = self.exec_index() {
            self.machine.scheduler.halt(index);
        }
    }

    /// End the current timeslice at the executor's local time.
    pub fn abort_timeslice(&mut self) {
        self.machine.scheduler.abort_slice();
    }
}
