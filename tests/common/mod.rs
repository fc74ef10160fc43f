// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Machines and small devices shared by the integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use chipframe_core::devices::{BusOp, Riot6532, ScriptedCpu};
use chipframe_core::state::StateVisitor;
use chipframe_core::{
    AccessWidth, ConfigError, Device, DeviceBuilder, DeviceConfig, DeviceContext, DeviceRegistry,
    Machine, MachineConfig, MapDecl, MapTarget, SpaceConfig, TimeValue, TimerId,
};

pub const CLOCK: u32 = 1_000_000;

pub fn usec(n: u64) -> TimeValue {
    TimeValue::from_usec(n)
}

/// Sixteen-bit register file answering word-wide accesses.
#[derive(Debug, Default)]
pub struct WordRegs {
    pub regs: [u16; 8],
    /// (offset, mask) of every access, in order.
    pub accesses: Vec<(u64, u64)>,
}

impl WordRegs {
    pub const KIND: &'static str = "word_regs";
}

impl Device for WordRegs {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn read(&mut self, _ctx: &mut DeviceContext<'_>, _map: u32, offset: u64, mask: u64) -> u64 {
        self.accesses.push((offset, mask));
        self.regs[offset as usize % 8] as u64
    }

    fn write(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _map: u32,
        offset: u64,
        value: u64,
        mask: u64,
    ) {
        self.accesses.push((offset, mask));
        let reg = &mut self.regs[offset as usize % 8];
        *reg = ((*reg as u64 & !mask) | (value & mask)) as u16;
    }
}

/// Eight-bit register file.
#[derive(Debug, Default)]
pub struct ByteRegs {
    pub regs: [u8; 16],
}

impl ByteRegs {
    pub const KIND: &'static str = "byte_regs";
}

impl Device for ByteRegs {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn read(&mut self, _ctx: &mut DeviceContext<'_>, _map: u32, offset: u64, _mask: u64) -> u64 {
        self.regs[offset as usize % 16] as u64
    }

    fn write(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _map: u32,
        offset: u64,
        value: u64,
        _mask: u64,
    ) {
        self.regs[offset as usize % 16] = value as u8;
    }
}

/// Arms a set of timers for the same instant on every reset and records
/// the order they fire in.
#[derive(Debug, Default)]
pub struct Chimes {
    timers: Vec<TimerId>,
    pub fired: Vec<u64>,
}

impl Chimes {
    pub const KIND: &'static str = "chimes";
    pub const NAMES: [&'static str; 3] = ["low", "mid", "high"];
}

impl Device for Chimes {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn start(&mut self, ctx: &mut DeviceContext<'_>) -> Result<(), ConfigError> {
        for name in Self::NAMES {
            self.timers.push(ctx.timer_alloc(name)?);
        }
        Ok(())
    }

    fn reset(&mut self, ctx: &mut DeviceContext<'_>) {
        // arm out of index order: high, low, mid
        for index in [2, 0, 1] {
            ctx.timer_set(self.timers[index], usec(10), index as u64);
        }
    }

    fn timer(&mut self, _ctx: &mut DeviceContext<'_>, _timer: TimerId, param: u64) {
        self.fired.push(param);
    }
}

/// Records lifecycle calls into a shared journal. The `state` parameter
/// misbehaves during item registration: 1 registers `count` twice, 2
/// rejects it.
pub struct Tracer {
    journal: Rc<RefCell<Vec<String>>>,
    fail_start: bool,
    state_mode: u64,
    count: u32,
}

impl Tracer {
    pub const KIND: &'static str = "tracer";

    pub fn register(registry: &mut DeviceRegistry, kind: &str, journal: &Rc<RefCell<Vec<String>>>) {
        let journal = Rc::clone(journal);
        registry.register(kind, move |builder: &mut DeviceBuilder<'_>| {
            if let Some(target) = builder.param("needs") {
                builder.required_device(&format!(":dev{target}"));
            }
            if let Some(target) = builder.param("wants") {
                builder.optional_device(&format!("dev{target}"));
            }
            let fail_start = builder.param("fail").is_some();
            Ok(Box::new(Tracer {
                journal: Rc::clone(&journal),
                fail_start,
                state_mode: builder.param("state").unwrap_or(0),
                count: 0,
            }) as Box<dyn Device>)
        });
    }
}

impl Device for Tracer {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn start(&mut self, ctx: &mut DeviceContext<'_>) -> Result<(), ConfigError> {
        if self.fail_start {
            return Err(ConfigError::DeviceStart {
                tag: ctx.tag().to_string(),
                reason: "refusing to start".into(),
            });
        }
        self.journal.borrow_mut().push(format!("start {}", ctx.tag()));
        Ok(())
    }

    fn stop(&mut self, ctx: &mut DeviceContext<'_>) {
        self.journal.borrow_mut().push(format!("stop {}", ctx.tag()));
    }

    fn state(&mut self, state: &mut StateVisitor<'_>) {
        state.item("count", &mut self.count);
        match self.state_mode {
            1 => state.item("count", &mut self.count),
            2 => state.reject("count"),
            _ => {}
        }
    }
}

/// A byte-wide 16-bit bus owned by the root, with RIOT RAM at 0x80 and
/// RIOT I/O at 0x280.
pub fn riot_bus(config: MachineConfig) -> MachineConfig {
    config
        .device(":riot", Riot6532::KIND, DeviceConfig::new(CLOCK))
        .space(":", SpaceConfig::new("bus", 16, AccessWidth::Byte))
        .map(MapDecl::new(
            ":",
            "bus",
            0x0080,
            0x00FF,
            MapTarget::Device {
                tag: ":riot".into(),
                map: 0,
                width: AccessWidth::Byte,
            },
        ))
        .map(MapDecl::new(
            ":",
            "bus",
            0x0280,
            0x029F,
            MapTarget::Device {
                tag: ":riot".into(),
                map: 1,
                width: AccessWidth::Byte,
            },
        ))
}

/// A scripted CPU wired to a RIOT: RIOT RAM at 0x80, I/O at 0x280, 4 KiB
/// of work RAM at 0x1000 and the RIOT interrupt on input 0.
pub fn cpu_and_riot_config() -> MachineConfig {
    let riot = |map| MapTarget::Device {
        tag: ":riot".into(),
        map,
        width: AccessWidth::Byte,
    };
    MachineConfig::new("cpu-riot")
        .device(":cpu", "test_cpu", DeviceConfig::new(CLOCK))
        .device(":riot", Riot6532::KIND, DeviceConfig::new(CLOCK))
        .ram("work", 0x1000)
        .map(MapDecl::new(":cpu", "program", 0x0080, 0x00FF, riot(0)))
        .map(MapDecl::new(":cpu", "program", 0x0280, 0x029F, riot(1)))
        .map(MapDecl::new(":cpu", "program", 0x1000, 0x1FFF, MapTarget::Ram("work".into())))
        .line(":riot", "irq", ":cpu", 0)
}

pub fn build_with_program(config: &MachineConfig, program: Vec<BusOp>) -> Machine {
    let mut registry = DeviceRegistry::with_builtin();
    registry.register("test_cpu", ScriptedCpu::factory(program));
    Machine::build(config, &registry).unwrap()
}

pub fn cpu_and_riot(program: Vec<BusOp>) -> Machine {
    build_with_program(&cpu_and_riot_config(), program)
}

/// Same wiring plus an extra RAM region, so the save-state layout differs.
pub fn cpu_and_riot_with_scratch(program: Vec<BusOp>) -> Machine {
    build_with_program(&cpu_and_riot_config().ram("scratch", 0x100), program)
}

/// A CPU that keeps the RIOT timer running and sleeps between interrupts.
pub fn riot_loop_program() -> Vec<BusOp> {
    vec![
        BusOp::write(0x1000, 0x11),
        BusOp::write(0x029D, 0x20), // 33 x 8 clocks, irq on
        BusOp::WaitForInterrupt,
        BusOp::read(0x029C),
        BusOp::Write {
            address: 0x1001,
            width: AccessWidth::Byte,
            value: 0x22,
            cycles: 7,
        },
        BusOp::jump(1),
    ]
}

pub fn registry_with_test_devices() -> DeviceRegistry {
    let mut registry = DeviceRegistry::with_builtin();
    registry.register(WordRegs::KIND, |_| Ok(Box::new(WordRegs::default())));
    registry.register(ByteRegs::KIND, |_| Ok(Box::new(ByteRegs::default())));
    registry.register(Chimes::KIND, |_| Ok(Box::new(Chimes::default())));
    registry
}
