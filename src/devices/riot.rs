// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! 6532-style RIOT: 128 bytes of RAM, two 8-bit I/O ports and an interval
//! timer with a shared interrupt output.
//!
//! Handler map 0 is the RAM (offsets 0..128). Map 1 is the I/O block, decoded
//! from address bits A0..A4 like the real part:
//!
//! | A4 | A3 | A2 | A1 | A0 | read               | write                    |
//! |----|----|----|----|----|--------------------|--------------------------|
//! | -  | -  | 0  | r  | r  | port register `r`  | port register `r`        |
//! | -  | e  | 1  | -  | 0  | timer, clears flag | edge control (A4 = 0)    |
//! | -  | -  | 1  | -  | 1  | interrupt flags    | edge control (A4 = 0)    |
//! | 1  | e  | 1  | p  | p  |                    | timer, prescaler `p`     |
//!
//! `e` is the timer interrupt enable. After a timer write of `N` with
//! prescaler `P` the timer reads `N - elapsed / P` and underflows after
//! exactly `(N + 1) * P` clocks, setting flag bit 7. From then on it counts
//! down once per clock, wrapping from 0x00 to 0xFF.

use bitflags::bitflags;

use crate::core::time::TimeValue;
use crate::device::{Device, DeviceBuilder, DeviceContext};
use crate::error::ConfigError;
use crate::scheduler::{LineId, TimerId};
use crate::state::StateVisitor;

pub const RAM_SIZE: usize = 128;

/// Map index of the RAM handler.
pub const MAP_RAM: u32 = 0;
/// Map index of the I/O and timer handler.
pub const MAP_IO: u32 = 1;

const REG_ORA: u64 = 0;
const REG_DDRA: u64 = 1;
const REG_ORB: u64 = 2;

const A0: u64 = 0x01;
const A1: u64 = 0x02;
const A2: u64 = 0x04;
const A3: u64 = 0x08;
const A4: u64 = 0x10;

/// log2 of the 1, 8, 64 and 1024 prescalers.
const PRESCALE_SHIFTS: [u8; 4] = [0, 3, 6, 10];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqFlags: u8 {
        const TIMER = 0x80;
        const PA7 = 0x40;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Port {
    output: u8,
    ddr: u8,
    input: u8,
}

impl Port {
    /// Pin levels: driven bits from the output latch, the rest from outside.
    fn pins(&self) -> u8 {
        (self.output & self.ddr) | (self.input & !self.ddr)
    }
}

#[derive(Debug)]
pub struct Riot6532 {
    irq: LineId,
    timer: Option<TimerId>,
    ram: [u8; RAM_SIZE],
    port_a: Port,
    port_b: Port,
    timer_shift: u8,
    timer_value: u8,
    timer_loaded: TimeValue,
    timer_irq_enable: bool,
    pa7_irq_enable: bool,
    pa7_rising: bool,
    flags: IrqFlags,
    irq_state: bool,
}

impl Riot6532 {
    pub const KIND: &'static str = "riot6532";

    pub fn new(builder: &mut DeviceBuilder<'_>) -> Result<Self, ConfigError> {
        if builder.clock() == 0 {
            return Err(ConfigError::DeviceStart {
                tag: builder.tag().to_string(),
                reason: "RIOT needs a clock".into(),
            });
        }
        let irq = builder.add_output("irq")?;
        Ok(Self {
            irq,
            timer: None,
            ram: [0; RAM_SIZE],
            port_a: Port::default(),
            port_b: Port::default(),
            timer_shift: 0,
            timer_value: 0,
            timer_loaded: TimeValue::ZERO,
            timer_irq_enable: false,
            pa7_irq_enable: false,
            pa7_rising: false,
            flags: IrqFlags::empty(),
            irq_state: false,
        })
    }

    pub fn irq_line(&self) -> LineId {
        self.irq
    }

    pub fn flags(&self) -> IrqFlags {
        self.flags
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq_state
    }

    pub fn ram(&self) -> &[u8; RAM_SIZE] {
        &self.ram
    }

    pub fn port_a_pins(&self) -> u8 {
        self.port_a.pins()
    }

    pub fn port_b_pins(&self) -> u8 {
        self.port_b.pins()
    }

    /// Prescaler currently selected, in clocks per count.
    pub fn prescaler(&self) -> u32 {
        1 << self.timer_shift
    }

    /// Drive port A from outside. PA7 transitions may latch an interrupt.
    pub fn set_port_a_input(&mut self, ctx: &mut DeviceContext<'_>, value: u8) {
        let before = self.port_a.pins();
        self.port_a.input = value;
        self.check_pa7(ctx, before);
    }

    pub fn set_port_b_input(&mut self, value: u8) {
        self.port_b.input = value;
    }

    /// Timer count as the chip would present it at the current time.
    pub fn timer_count(&self, ctx: &DeviceContext<'_>) -> u8 {
        let elapsed = (ctx.now() - self.timer_loaded).as_cycles(ctx.clock());
        let underflow = (self.timer_value as u64 + 1) << self.timer_shift;
        if elapsed < underflow {
            self.timer_value - (elapsed >> self.timer_shift) as u8
        } else {
            0xFF - ((elapsed - underflow) & 0xFF) as u8
        }
    }

    fn check_pa7(&mut self, ctx: &mut DeviceContext<'_>, before: u8) {
        let was = before & 0x80 != 0;
        let now = self.port_a.pins() & 0x80 != 0;
        if was != now && now == self.pa7_rising {
            self.flags.insert(IrqFlags::PA7);
            self.update_irq(ctx);
        }
    }

    fn update_irq(&mut self, ctx: &mut DeviceContext<'_>) {
        let state = (self.flags.contains(IrqFlags::TIMER) && self.timer_irq_enable)
            || (self.flags.contains(IrqFlags::PA7) && self.pa7_irq_enable);
        if state != self.irq_state {
            self.irq_state = state;
            ctx.set_line(self.irq, state);
        }
    }

    fn write_timer(&mut self, ctx: &mut DeviceContext<'_>, offset: u64, value: u8) {
        self.timer_shift = PRESCALE_SHIFTS[(offset & (A1 | A0)) as usize];
        self.timer_value = value;
        self.timer_loaded = ctx.now();
        self.timer_irq_enable = offset & A3 != 0;
        self.flags.remove(IrqFlags::TIMER);
        if let Some(timer) = self.timer {
            let clocks = (value as u64 + 1) << self.timer_shift;
            ctx.timer_set(timer, TimeValue::cycles(clocks, ctx.clock()), 0);
        }
        log::trace!(
            "{}: timer {value:#04x} x{} (irq {})",
            ctx.tag(),
            self.prescaler(),
            self.timer_irq_enable
        );
        self.update_irq(ctx);
    }

    fn read_io(&mut self, ctx: &mut DeviceContext<'_>, offset: u64) -> u8 {
        if offset & A2 == 0 {
            return match offset & (A1 | A0) {
                REG_ORA => self.port_a.pins(),
                REG_DDRA => self.port_a.ddr,
                REG_ORB => self.port_b.pins(),
                _ => self.port_b.ddr,
            };
        }
        if offset & A0 == 0 {
            let count = self.timer_count(ctx);
            self.timer_irq_enable = offset & A3 != 0;
            self.flags.remove(IrqFlags::TIMER);
            self.update_irq(ctx);
            count
        } else {
            let flags = self.flags.bits();
            self.flags.remove(IrqFlags::PA7);
            self.update_irq(ctx);
            flags
        }
    }

    fn write_io(&mut self, ctx: &mut DeviceContext<'_>, offset: u64, value: u8) {
        if offset & A2 == 0 {
            let before = self.port_a.pins();
            match offset & (A1 | A0) {
                REG_ORA => self.port_a.output = value,
                REG_DDRA => self.port_a.ddr = value,
                REG_ORB => self.port_b.output = value,
                _ => self.port_b.ddr = value,
            }
            self.check_pa7(ctx, before);
        } else if offset & A4 != 0 {
            self.write_timer(ctx, offset, value);
        } else {
            self.pa7_irq_enable = offset & A1 != 0;
            self.pa7_rising = offset & A0 != 0;
            self.update_irq(ctx);
        }
    }
}

impl Device for Riot6532 {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn start(&mut self, ctx: &mut DeviceContext<'_>) -> Result<(), ConfigError> {
        self.timer = Some(ctx.timer_alloc("interval")?);
        Ok(())
    }

    fn reset(&mut self, ctx: &mut DeviceContext<'_>) {
        self.port_a = Port::default();
        self.port_b = Port::default();
        self.timer_irq_enable = false;
        self.pa7_irq_enable = false;
        self.pa7_rising = false;
        self.flags = IrqFlags::empty();
        // free-running from 0xFF at x1024 until the first write
        self.timer_shift = 10;
        self.timer_value = 0xFF;
        self.timer_loaded = ctx.now();
        if let Some(timer) = self.timer {
            ctx.timer_reset(timer);
        }
        self.update_irq(ctx);
    }

    fn read(&mut self, ctx: &mut DeviceContext<'_>, map: u32, offset: u64, _mask: u64) -> u64 {
        match map {
            MAP_RAM => self.ram[offset as usize % RAM_SIZE] as u64,
            _ => self.read_io(ctx, offset & 0x1F) as u64,
        }
    }

    fn write(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        map: u32,
        offset: u64,
        value: u64,
        _mask: u64,
    ) {
        match map {
            MAP_RAM => self.ram[offset as usize % RAM_SIZE] = value as u8,
            _ => self.write_io(ctx, offset & 0x1F, value as u8),
        }
    }

    fn timer(&mut self, ctx: &mut DeviceContext<'_>, _timer: TimerId, _param: u64) {
        self.flags.insert(IrqFlags::TIMER);
        log::trace!("{}: timer underflow at {}", ctx.tag(), ctx.now());
        self.update_irq(ctx);
    }

    fn state(&mut self, state: &mut StateVisitor<'_>) {
        state.item("ram", &mut self.ram);
        state.item("port_a.output", &mut self.port_a.output);
        state.item("port_a.ddr", &mut self.port_a.ddr);
        state.item("port_a.input", &mut self.port_a.input);
        state.item("port_b.output", &mut self.port_b.output);
        state.item("port_b.ddr", &mut self.port_b.ddr);
        state.item("port_b.input", &mut self.port_b.input);
        state.item("timer_shift", &mut self.timer_shift);
        state.item("timer_value", &mut self.timer_value);
        state.item("timer_loaded", &mut self.timer_loaded);
        state.item("timer_irq_enable", &mut self.timer_irq_enable);
        state.item("pa7_irq_enable", &mut self.pa7_irq_enable);
        state.item("pa7_rising", &mut self.pa7_rising);
        let mut flags = self.flags.bits();
        state.item("flags", &mut flags);
        state.item("irq_state", &mut self.irq_state);
        if state.is_loading() {
            self.flags = IrqFlags::from_bits_truncate(flags);
            if !PRESCALE_SHIFTS.contains(&self.timer_shift) {
                state.reject("timer_shift");
            }
        }
    }
}
