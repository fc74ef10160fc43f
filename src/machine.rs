// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The machine: device tree, memory, address spaces, scheduler and save
//! states bound together.
//!
//! Lifecycle: `build` creates every device, wires maps and lines, binds
//! finders, starts devices in dependency order, seals the save-state item
//! list and resets. From then on the host drives time with `run_for`,
//! `run_until` or `step`.

use std::collections::HashSet;
use std::io::{Read, Write};

use crate::config::{DeviceDecl, DeviceRegistry, LineDecl, MachineConfig, MapDecl, MapTarget};
use crate::core::bus::{AddressSpace, HandlerKind, MapEntry, SpaceConfig, SpaceId};
use crate::core::memory::{BankId, Memory, MemoryRegion, RegionId, RegionKind};
use crate::core::time::TimeValue;
use crate::device::{Device, DeviceBuilder, DeviceContext, Root};
use crate::diag::{Diagnostics, Notice};
use crate::error::{ConfigError, SaveStateError};
use crate::scheduler::{ExecState, LineId, Scheduler, SuspendReason, Violation, INPUT_LINES};
use crate::state::{ItemDesc, Pass, SaveStateRegistry, StateHeader, StateVisitor, VisitFault};
use crate::tree::{split_tag, DeviceId, DeviceTree};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Building,
    Starting,
    Running,
    Stopped,
}

pub struct Machine {
    pub(crate) name: String,
    pub(crate) phase: Phase,
    pub(crate) tree: DeviceTree,
    pub(crate) memory: Memory,
    pub(crate) spaces: Vec<AddressSpace>,
    pub(crate) scheduler: Scheduler,
    pub(crate) state: SaveStateRegistry,
    pub(crate) diag: Diagnostics,
    pub(crate) start_order: Vec<DeviceId>,
}

impl Machine {
    fn empty(name: &str, quantum: TimeValue) -> Self {
        Self {
            name: name.to_string(),
            phase: Phase::Building,
            tree: DeviceTree::new(Box::new(Root)),
            memory: Memory::new(),
            spaces: Vec::new(),
            scheduler: Scheduler::new(quantum),
            state: SaveStateRegistry::new(),
            diag: Diagnostics::new(),
            start_order: Vec::new(),
        }
    }

    /// Build, start and reset a machine. Nothing is started unless every
    /// declaration is valid and every required finder resolves.
    pub fn build(config: &MachineConfig, registry: &DeviceRegistry) -> Result<Self, ConfigError> {
        log::info!("building machine `{}`", config.name);
        let mut machine = Self::empty(&config.name, config.quantum());

        for decl in &config.devices {
            machine.create_device(decl, registry)?;
        }
        for decl in &config.regions {
            machine.memory.add_region(decl.to_region())?;
        }
        for decl in &config.banks {
            let region = machine
                .memory
                .find_region(&decl.region)
                .ok_or_else(|| ConfigError::UnknownRegion {
                    name: decl.region.clone(),
                })?;
            machine
                .memory
                .add_bank(&decl.name, region, decl.base, decl.count, decl.stride)?;
        }
        for decl in &config.spaces {
            let owner = machine.lookup_tag(&decl.device)?;
            machine.add_space(owner, decl.space.clone())?;
        }
        for decl in &config.maps {
            machine.install_decl(decl)?;
        }
        for decl in &config.lines {
            machine.connect_line(decl)?;
        }
        machine.tree.resolve_all(&mut machine.diag)?;
        machine.start()?;
        Ok(machine)
    }

    fn lookup_tag(&self, tag: &str) -> Result<DeviceId, ConfigError> {
        self.tree.find(tag).ok_or_else(|| ConfigError::UnknownDevice {
            tag: tag.to_string(),
        })
    }

    fn create_device(
        &mut self,
        decl: &DeviceDecl,
        registry: &DeviceRegistry,
    ) -> Result<DeviceId, ConfigError> {
        let (parent_tag, name) = split_tag(&decl.tag).ok_or_else(|| ConfigError::InvalidTag {
            tag: decl.tag.clone(),
        })?;
        let parent = self.lookup_tag(parent_tag)?;
        let factory = registry
            .get(&decl.kind)
            .ok_or_else(|| ConfigError::UnknownDeviceKind {
                kind: decl.kind.clone(),
            })?;
        let id = self.tree.add(parent, name, &decl.kind, decl.config.clone())?;
        let mut behavior = factory(&mut DeviceBuilder { machine: self, id })?;
        if behavior.executor().is_some() {
            let clock = decl.config.clock;
            if clock == 0 {
                return Err(ConfigError::DeviceStart {
                    tag: self.tree.tag(id).to_string(),
                    reason: "executor needs a nonzero clock".into(),
                });
            }
            self.scheduler.add_executor(id, clock);
        }
        self.tree.set_behavior(id, behavior);
        Ok(id)
    }

    pub(crate) fn add_space(
        &mut self,
        owner: DeviceId,
        config: SpaceConfig,
    ) -> Result<SpaceId, ConfigError> {
        if self.phase != Phase::Building {
            return Err(ConfigError::Sealed {
                operation: "address space creation",
            });
        }
        if self.find_space(owner, &config.name).is_some() {
            return Err(ConfigError::DuplicateSpace {
                device: self.tree.tag(owner).to_string(),
                space: config.name,
            });
        }
        let space = AddressSpace::new(owner, self.tree.tag(owner), config)?;
        self.spaces.push(space);
        Ok(SpaceId(self.spaces.len() - 1))
    }

    fn install_decl(&mut self, decl: &MapDecl) -> Result<(), ConfigError> {
        let owner = self.lookup_tag(&decl.device)?;
        let space = self
            .find_space(owner, &decl.space)
            .ok_or_else(|| ConfigError::UnknownSpace {
                device: decl.device.clone(),
                space: decl.space.clone(),
            })?;
        let region = |name: &str| {
            self.memory
                .find_region(name)
                .ok_or_else(|| ConfigError::UnknownRegion { name: name.to_string() })
        };
        let kind = match &decl.target {
            MapTarget::Ram(name) => HandlerKind::Ram(region(name)?),
            MapTarget::Rom(name) => HandlerKind::Rom(region(name)?),
            MapTarget::Bank(name) => HandlerKind::Bank(
                self.memory
                    .find_bank(name)
                    .ok_or_else(|| ConfigError::UnknownBank { name: name.clone() })?,
            ),
            MapTarget::Device { tag, map, width } => HandlerKind::Device {
                device: self
                    .tree
                    .resolve_path(owner, tag)
                    .ok_or_else(|| ConfigError::UnknownDevice { tag: tag.clone() })?,
                map: *map,
                width: *width,
            },
            MapTarget::Nop(value) => HandlerKind::Nop(*value),
            MapTarget::Unmapped => HandlerKind::Unmapped,
        };
        let mut entry = MapEntry::new(decl.start, decl.end, kind)
            .mirror(decl.mirror)
            .access(decl.access)
            .region_offset(decl.region_offset);
        entry.lanes = decl.lanes;
        self.install_entry(space, entry)
    }

    fn connect_line(&mut self, decl: &LineDecl) -> Result<(), ConfigError> {
        let source = self.lookup_tag(&decl.source)?;
        let target = self.lookup_tag(&decl.target)?;
        let line = self
            .scheduler
            .find_output(source, &decl.output)
            .ok_or_else(|| ConfigError::UnknownLine {
                device: decl.source.clone(),
                line: decl.output.clone(),
            })?;
        let exec = self
            .scheduler
            .exec_index(target)
            .ok_or_else(|| ConfigError::NotExecutor {
                tag: decl.target.clone(),
            })?;
        if decl.input >= INPUT_LINES {
            return Err(ConfigError::InvalidLineInput {
                device: decl.target.clone(),
                input: decl.input,
            });
        }
        self.scheduler.connect(line, exec, decl.input);
        Ok(())
    }

    fn start(&mut self) -> Result<(), ConfigError> {
        self.phase = Phase::Starting;
        self.start_order = self.tree.start_order(&mut self.diag);
        let mut items = Vec::new();
        let mut names = HashSet::new();

        for i in 0..self.start_order.len() {
            let id = self.start_order[i];
            if let Err(err) = self.start_device(id, &mut items, &mut names) {
                log::error!("start failed: {err}");
                self.stop_started();
                return Err(err);
            }
        }

        let mut visitor = StateVisitor::new(Pass::Register {
            items: &mut items,
            names: &mut names,
        });
        visit_machine_items(&mut self.memory, &mut self.scheduler, &mut visitor);
        if let Err(fault) = visitor.finish() {
            self.stop_started();
            return Err(registration_error(fault));
        }
        self.state.seal(&self.name, items);

        self.phase = Phase::Running;
        self.reset();
        log::info!(
            "machine `{}` running: {} devices, {} spaces, {} timers",
            self.name,
            self.tree.len(),
            self.spaces.len(),
            self.scheduler.timer_count()
        );
        Ok(())
    }

    fn start_device(
        &mut self,
        id: DeviceId,
        items: &mut Vec<ItemDesc>,
        names: &mut HashSet<String>,
    ) -> Result<(), ConfigError> {
        let result = self
            .call_device(id, |dev, ctx| dev.start(ctx))
            .unwrap_or_else(|| {
                Err(ConfigError::DeviceStart {
                    tag: self.tree.tag(id).to_string(),
                    reason: "no behavior attached".into(),
                })
            });
        result?;
        self.tree.set_started(id, true);
        log::debug!("started {}", self.tree.tag(id));

        let mut visitor = StateVisitor::new(Pass::Register { items, names });
        visitor.set_owner(self.tree.tag(id));
        if let Some(dev) = self.tree.behavior_mut(id) {
            dev.state(&mut visitor);
        }
        visitor.finish().map_err(registration_error)
    }

    fn stop_started(&mut self) {
        for i in (0..self.start_order.len()).rev() {
            let id = self.start_order[i];
            if self.tree.is_started(id) {
                self.call_device(id, |dev, ctx| dev.stop(ctx));
                self.tree.set_started(id, false);
            }
        }
        self.phase = Phase::Stopped;
    }

    /// Stop every device in reverse start order. Idempotent.
    pub fn stop(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        self.stop_started();
        log::info!("machine `{}` stopped at {}", self.name, self.scheduler.now());
    }

    /// Reset every device in start order and put executors back to running.
    pub fn reset(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        for index in 0..self.scheduler.executor_count() {
            self.scheduler.set_exec_state(index, ExecState::Running);
        }
        for i in 0..self.start_order.len() {
            let id = self.start_order[i];
            self.call_device(id, |dev, ctx| dev.reset(ctx));
        }
    }

    /// Run a callback with `id` checked out of the tree. `None` when the
    /// device is already dispatching further up the stack.
    pub(crate) fn call_device<R>(
        &mut self,
        id: DeviceId,
        f: impl FnOnce(&mut dyn Device, &mut DeviceContext<'_>) -> R,
    ) -> Option<R> {
        let Some(mut device) = self.tree.take(id) else {
            let tag = self.tree.tag(id).to_string();
            self.diag.reentrant(&tag);
            return None;
        };
        let result = f(device.as_mut(), &mut DeviceContext::new(self, id));
        self.tree.restore(id, device);
        Some(result)
    }

    pub(crate) fn scheduler_violation(&mut self, device: DeviceId, violation: Violation) {
        let detail = violation.to_string();
        self.diag.report(Notice::SchedulerViolation {
            device: self.tree.tag(device).to_string(),
            detail: detail.clone(),
        });
        debug_assert!(false, "scheduler invariant violated: {detail}");
    }

    // ---- accessors ----

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn tree(&self) -> &DeviceTree {
        &self.tree
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diag
    }

    pub fn find(&self, tag: &str) -> Option<DeviceId> {
        self.tree.find(tag)
    }

    pub fn device<T: Device>(&self, tag: &str) -> Option<&T> {
        let id = self.tree.find(tag)?;
        self.tree.behavior(id)?.as_any().downcast_ref::<T>()
    }

    pub fn device_mut<T: Device>(&mut self, tag: &str) -> Option<&mut T> {
        let id = self.tree.find(tag)?;
        self.tree.behavior_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    /// Run `f` against a device with a live context, as if the host were a
    /// bus master at the current time.
    pub fn call<T: Device, R>(
        &mut self,
        tag: &str,
        f: impl FnOnce(&mut T, &mut DeviceContext<'_>) -> R,
    ) -> Option<R> {
        let id = self.tree.find(tag)?;
        self.call_device(id, |dev, ctx| dev.as_any_mut().downcast_mut::<T>().map(|d| f(d, ctx)))
            .flatten()
    }

    pub fn find_space(&self, device: DeviceId, name: &str) -> Option<SpaceId> {
        self.spaces
            .iter()
            .position(|s| s.owner() == device && s.name() == name)
            .map(SpaceId)
    }

    /// Look up a space by owner tag and name.
    pub fn space(&self, tag: &str, name: &str) -> Option<SpaceId> {
        self.find_space(self.tree.find(tag)?, name)
    }

    pub fn space_info(&self, space: SpaceId) -> &AddressSpace {
        &self.spaces[space.0]
    }

    pub fn find_region(&self, name: &str) -> Option<RegionId> {
        self.memory.find_region(name)
    }

    pub fn region(&self, id: RegionId) -> &MemoryRegion {
        self.memory.region(id)
    }

    /// Mutable access to region bytes, e.g. for loading a ROM image.
    pub fn region_mut(&mut self, id: RegionId) -> &mut MemoryRegion {
        self.memory.region_mut(id)
    }

    pub fn find_bank(&self, name: &str) -> Option<BankId> {
        self.memory.find_bank(name)
    }

    pub fn set_bank_pointer(&mut self, bank: BankId, index: usize) -> Result<(), ConfigError> {
        self.memory.set_bank_pointer(bank, index)
    }

    pub fn bank_index(&self, bank: BankId) -> usize {
        self.memory.bank(bank).current()
    }

    pub fn find_line(&self, tag: &str, output: &str) -> Option<LineId> {
        self.scheduler.find_output(self.tree.find(tag)?, output)
    }

    /// Drive a line from the host.
    pub fn set_line(&mut self, line: LineId, state: bool) {
        self.scheduler.set_line(line, state);
    }

    pub fn exec_state(&self, tag: &str) -> Option<ExecState> {
        self.scheduler.exec_state(self.tree.find(tag)?)
    }

    pub fn suspend(&mut self, tag: &str, reason: SuspendReason) {
        if let Some(index) = self.tree.find(tag).and_then(|id| self.scheduler.exec_index(id)) {
            self.scheduler.suspend(index, reason);
        }
    }

    pub fn resume(&mut self, tag: &str, reason: SuspendReason) {
        if let Some(index) = self.tree.find(tag).and_then(|id| self.scheduler.exec_index(id)) {
            self.scheduler.resume(index, reason);
        }
    }

    // ---- time ----

    pub fn time(&self) -> TimeValue {
        self.scheduler.current_time()
    }

    pub fn next_event_time(&mut self) -> TimeValue {
        self.scheduler.next_expiry()
    }

    /// Advance by one scheduling step. Returns `false` when nothing can
    /// happen any more (no armed timers and no running executors).
    pub fn step(&mut self) -> bool {
        self.step_until(TimeValue::NEVER)
    }

    pub fn run_for(&mut self, duration: TimeValue) {
        let until = self.scheduler.now() + duration;
        self.run_until(until);
    }

    pub fn run_until(&mut self, until: TimeValue) {
        while self.scheduler.now() < until {
            if !self.step_until(until) {
                break;
            }
        }
    }

    fn step_until(&mut self, limit: TimeValue) -> bool {
        if self.phase != Phase::Running {
            return false;
        }
        let now = self.scheduler.now();
        let mut target = self.scheduler.next_expiry().min(limit);
        if self.scheduler.any_running() {
            target = target.min(now + self.scheduler.quantum());
        }
        if target.is_never() {
            return false;
        }
        let mut target = target.max(now);

        for index in 0..self.scheduler.executor_count() {
            let slot = self.scheduler.executor(index);
            if slot.state != ExecState::Running {
                continue;
            }
            let device = slot.device;
            let local = self.scheduler.local_time(index);
            if local >= target {
                continue;
            }
            let budget = (target - local).as_cycles(self.scheduler.clock(index));
            if budget == 0 {
                continue;
            }
            self.scheduler.begin_slice(index, budget, target);
            self.call_device(device, |dev, ctx| {
                if let Some(exec) = dev.executor() {
                    exec.execute(ctx);
                }
            });
            let outcome = self.scheduler.end_slice();
            if outcome.ran == 0 && self.scheduler.executor(index).state == ExecState::Running {
                self.scheduler.consume(index, 1);
            }
            if outcome.aborted {
                target = target.min(self.scheduler.local_time(index).max(now));
            }
        }

        self.scheduler.advance_to(target);
        while let Some((timer, param)) = self.scheduler.pop_due() {
            let owner = self.scheduler.timer_owner(timer);
            self.call_device(owner, |dev, ctx| dev.timer(ctx, timer, param));
        }
        true
    }

    // ---- save states ----

    pub fn state_items(&self) -> &[ItemDesc] {
        self.state.items()
    }

    pub fn state_identity(&self) -> u64 {
        self.state.identity()
    }

    pub fn save_all<W: Write>(&mut self, writer: &mut W) -> Result<(), SaveStateError> {
        let payload = self.capture()?;
        self.state.header().write_to(writer)?;
        writer.write_all(&payload)?;
        log::debug!("saved {} bytes of state at {}", payload.len(), self.scheduler.now());
        Ok(())
    }

    pub fn save_to_vec(&mut self) -> Result<Vec<u8>, SaveStateError> {
        let mut out = Vec::new();
        self.save_all(&mut out)?;
        Ok(out)
    }

    /// Replace the whole machine state. On any failure the machine is
    /// exactly as it was before the call.
    pub fn load_all<R: Read>(&mut self, reader: &mut R) -> Result<(), SaveStateError> {
        if self.phase != Phase::Running {
            return Err(SaveStateError::NotRunning);
        }
        let header = StateHeader::read_from(reader)?;
        self.state.validate(&header)?;
        let mut payload = Vec::with_capacity(self.state.payload_len());
        reader.read_to_end(&mut payload)?;
        if payload.len() as u64 != header.payload_len {
            return Err(SaveStateError::PayloadLengthMismatch {
                expected: header.payload_len,
                found: payload.len() as u64,
            });
        }

        let backup = self.capture()?;
        if let Err(err) = self.apply(&payload) {
            log::warn!("state load failed: {err}; restoring previous state");
            if let Err(restore) = self.apply(&backup) {
                log::error!("restoring previous state failed: {restore}");
            }
            self.scheduler.rebuild_queue();
            return Err(err);
        }
        self.scheduler.rebuild_queue();
        for i in 0..self.start_order.len() {
            let id = self.start_order[i];
            self.call_device(id, |dev, ctx| dev.post_load(ctx));
        }
        log::debug!("loaded state, now at {}", self.scheduler.now());
        Ok(())
    }

    pub fn load_from_slice(&mut self, mut bytes: &[u8]) -> Result<(), SaveStateError> {
        self.load_all(&mut bytes)
    }

    fn capture(&mut self) -> Result<Vec<u8>, SaveStateError> {
        if self.phase != Phase::Running {
            return Err(SaveStateError::NotRunning);
        }
        let Machine {
            tree,
            memory,
            scheduler,
            state,
            start_order,
            ..
        } = self;
        let mut out = Vec::with_capacity(state.payload_len());
        let mut visitor = StateVisitor::new(Pass::Save {
            items: state.items(),
            next: 0,
            out: &mut out,
        });
        visit_all(tree, start_order, memory, scheduler, &mut visitor);
        visitor.finish()?;
        Ok(out)
    }

    fn apply(&mut self, payload: &[u8]) -> Result<(), SaveStateError> {
        let Machine {
            tree,
            memory,
            scheduler,
            state,
            start_order,
            ..
        } = self;
        let mut visitor = StateVisitor::new(Pass::Load {
            items: state.items(),
            next: 0,
            input: payload,
            pos: 0,
        });
        visit_all(tree, start_order, memory, scheduler, &mut visitor);
        visitor.finish()?;
        Ok(())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map a fault raised while items are being registered. A rejected item
/// fails its owner's start.
fn registration_error(fault: VisitFault) -> ConfigError {
    let (name, reason) = match fault {
        VisitFault::Duplicate(name) => return ConfigError::DuplicateStateItem { name },
        VisitFault::Corrupt(name) => (name, "rejected while registering"),
        VisitFault::Mismatch { found, .. } => (found, "visited out of order"),
    };
    let (tag, item) = name.split_once('.').unwrap_or((name.as_str(), ""));
    ConfigError::DeviceStart {
        tag: tag.to_string(),
        reason: format!("state item `{item}` {reason}"),
    }
}

fn visit_all(
    tree: &mut DeviceTree,
    order: &[DeviceId],
    memory: &mut Memory,
    scheduler: &mut Scheduler,
    visitor: &mut StateVisitor<'_>,
) {
    for &id in order {
        visitor.set_owner(tree.tag(id));
        if let Some(dev) = tree.behavior_mut(id) {
            dev.state(visitor);
        }
    }
    visit_machine_items(memory, scheduler, visitor);
}

/// RAM contents, bank selections and scheduler state, owned by the root.
fn visit_machine_items(
    memory: &mut Memory,
    scheduler: &mut Scheduler,
    visitor: &mut StateVisitor<'_>,
) {
    visitor.set_owner(":");
    for region in memory.regions_mut() {
        if region.kind() == RegionKind::Ram {
            let name = format!("region.{}", region.name());
            visitor.item(&name, region.data_mut());
        }
    }
    for bank in memory.banks_mut() {
        let name = format!("bank.{}", bank.name());
        let mut current = bank.current() as u64;
        visitor.item(&name, &mut current);
        if visitor.is_loading() {
            if (current as usize) < bank.count() {
                *bank.current_mut() = current as usize;
            } else {
                visitor.reject(&name);
            }
        }
    }
    scheduler.state(visitor);
}
