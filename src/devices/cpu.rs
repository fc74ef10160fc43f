// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Scripted CPU: an executor that replays a fixed list of bus operations.
//!
//! It has no instruction set. Each [`BusOp`] costs a configured number of
//! cycles, which are consumed before the access so the access happens at the
//! right local time. Input lines are sampled between operations; every rising
//! line is recorded as an acknowledged interrupt.

use crate::core::bus::{SpaceConfig, SpaceId};
use crate::core::memory::AccessWidth;
use crate::core::time::TimeValue;
use crate::device::{Device, DeviceBuilder, DeviceContext, Executor};
use crate::error::ConfigError;
use crate::scheduler::SuspendReason;
use crate::state::StateVisitor;

/// Cycles charged for a bus access when the op does not say otherwise.
pub const DEFAULT_ACCESS_CYCLES: u32 = 4;

/// Most reads and acks kept for inspection; older ones are dropped.
pub const HISTORY_LEN: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusOp {
    Read {
        address: u64,
        width: AccessWidth,
        cycles: u32,
    },
    Write {
        address: u64,
        width: AccessWidth,
        value: u64,
        cycles: u32,
    },
    Idle {
        cycles: u32,
    },
    /// Sleep until an input line is raised. Falls through if one already is.
    WaitForInterrupt,
    Jump {
        target: u32,
    },
    Halt,
}

impl BusOp {
    pub fn read(address: u64) -> Self {
        BusOp::Read {
            address,
            width: AccessWidth::Byte,
            cycles: DEFAULT_ACCESS_CYCLES,
        }
    }

    pub fn write(address: u64, value: u8) -> Self {
        BusOp::Write {
            address,
            width: AccessWidth::Byte,
            value: value as u64,
            cycles: DEFAULT_ACCESS_CYCLES,
        }
    }

    pub fn idle(cycles: u32) -> Self {
        BusOp::Idle { cycles }
    }

    pub fn jump(target: u32) -> Self {
        BusOp::Jump { target }
    }
}

/// A value fetched by a `Read` op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRecord {
    pub at: TimeValue,
    pub address: u64,
    pub value: u64,
}

/// An interrupt noticed at an operation boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub input: u8,
    pub at: TimeValue,
}

/// The tail of an event stream whose entries are numbered from zero.
#[derive(Debug)]
struct History<T> {
    first: u64,
    entries: Vec<T>,
}

impl<T> History<T> {
    fn new() -> Self {
        Self {
            first: 0,
            entries: Vec::new(),
        }
    }

    fn push(&mut self, entry: T) {
        if self.entries.len() == HISTORY_LEN {
            self.entries.drain(..HISTORY_LEN / 2);
            self.first += (HISTORY_LEN / 2) as u64;
        }
        self.entries.push(entry);
    }

    /// Keep only entries numbered below `total`, so the next push is
    /// number `total`.
    fn rewind(&mut self, total: u64) {
        let end = self.first + self.entries.len() as u64;
        if total > end || total < self.first {
            self.entries.clear();
            self.first = total;
        } else {
            self.entries.truncate((total - self.first) as usize);
        }
    }
}

#[derive(Debug)]
pub struct ScriptedCpu {
    program: Vec<BusOp>,
    space: SpaceId,
    pc: u32,
    last_read: u64,
    lines_seen: u32,
    ops: u64,
    interrupts: u64,
    read_count: u64,
    reads: History<ReadRecord>,
    acks: History<Ack>,
}

impl ScriptedCpu {
    pub const KIND: &'static str = "scripted_cpu";

    /// Declares a byte-wide `program` space; its width comes from the
    /// `addr_bits` parameter (16 by default).
    pub fn new(builder: &mut DeviceBuilder<'_>, program: Vec<BusOp>) -> Result<Self, ConfigError> {
        let bits = builder.param("addr_bits").unwrap_or(16) as u8;
        let space = builder.add_space(SpaceConfig::new("program", bits, AccessWidth::Byte))?;
        Ok(Self {
            program,
            space,
            pc: 0,
            last_read: 0,
            lines_seen: 0,
            ops: 0,
            interrupts: 0,
            read_count: 0,
            reads: History::new(),
            acks: History::new(),
        })
    }

    /// Factory for a registry entry running `program`.
    pub fn factory(
        program: Vec<BusOp>,
    ) -> impl Fn(&mut DeviceBuilder<'_>) -> Result<Box<dyn Device>, ConfigError> + 'static {
        move |builder| Ok(Box::new(ScriptedCpu::new(builder, program.clone())?))
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn last_read(&self) -> u64 {
        self.last_read
    }

    /// Operations executed since start.
    pub fn ops(&self) -> u64 {
        self.ops
    }

    pub fn interrupts(&self) -> u64 {
        self.interrupts
    }

    /// The most recent reads, at most [`HISTORY_LEN`].
    pub fn reads(&self) -> &[ReadRecord] {
        &self.reads.entries
    }

    /// The most recent acknowledged interrupts, at most [`HISTORY_LEN`].
    pub fn acks(&self) -> &[Ack] {
        &self.acks.entries
    }

    fn sample_lines(&mut self, ctx: &DeviceContext<'_>) -> u32 {
        let lines = ctx.input_lines();
        let mut rising = lines & !self.lines_seen;
        self.lines_seen = lines;
        while rising != 0 {
            let input = rising.trailing_zeros() as u8;
            rising &= rising - 1;
            self.interrupts += 1;
            self.acks.push(Ack { input, at: ctx.now() });
            log::trace!("{}: interrupt {input} at {}", ctx.tag(), ctx.now());
        }
        lines
    }
}

impl Executor for ScriptedCpu {
    fn execute(&mut self, ctx: &mut DeviceContext<'_>) {
        while !ctx.should_yield() {
            let lines = self.sample_lines(ctx);
            let Some(op) = self.program.get(self.pc as usize).copied() else {
                // ran off the end: idle out the slice
                let left = ctx.cycles_left().max(1);
                ctx.consume_cycles(left);
                continue;
            };
            self.pc += 1;
            self.ops += 1;
            match op {
                BusOp::Read {
                    address,
                    width,
                    cycles,
                } => {
                    ctx.consume_cycles(cycles as u64);
                    let value = ctx.read(self.space, address, width);
                    self.last_read = value;
                    self.read_count += 1;
                    self.reads.push(ReadRecord {
                        at: ctx.now(),
                        address,
                        value,
                    });
                }
                BusOp::Write {
                    address,
                    width,
                    value,
                    cycles,
                } => {
                    ctx.consume_cycles(cycles as u64);
                    ctx.write(self.space, address, width, value);
                }
                BusOp::Idle { cycles } => ctx.consume_cycles(cycles as u64),
                BusOp::WaitForInterrupt => {
                    ctx.consume_cycles(1);
                    if lines == 0 {
                        ctx.suspend(SuspendReason::WaitForInterrupt);
                    }
                }
                BusOp::Jump { target } => {
                    ctx.consume_cycles(1);
                    self.pc = target;
                }
                BusOp::Halt => {
                    log::debug!("{}: halted at op {}", ctx.tag(), self.pc - 1);
                    ctx.halt();
                }
            }
        }
    }
}

impl Device for ScriptedCpu {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn reset(&mut self, _ctx: &mut DeviceContext<'_>) {
        self.pc = 0;
        self.last_read = 0;
        self.lines_seen = 0;
    }

    fn state(&mut self, state: &mut StateVisitor<'_>) {
        state.item("pc", &mut self.pc);
        state.item("last_read", &mut self.last_read);
        state.item("lines_seen", &mut self.lines_seen);
        state.item("ops", &mut self.ops);
        state.item("interrupts", &mut self.interrupts);
        state.item("read_count", &mut self.read_count);
    }

    fn post_load(&mut self, _ctx: &mut DeviceContext<'_>) {
        self.reads.rewind(self.read_count);
        self.acks.rewind(self.interrupts);
    }

    fn executor(&mut self) -> Option<&mut dyn Executor> {
        Some(self)
    }
}
