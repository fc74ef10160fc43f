// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

// A small demo machine: a scripted CPU sleeping on a 6532 RIOT timer.
use anyhow::{Context, Result};
use chipframe_core::devices::{BusOp, Riot6532, ScriptedCpu};
use chipframe_core::{
    AccessWidth, DeviceConfig, DeviceRegistry, Machine, MachineConfig, MapDecl, MapTarget,
    TimeValue,
};

const CPU_CLOCK: u32 = 1_193_182;
const FRAMES: u32 = 10;

fn demo_program() -> Vec<BusOp> {
    vec![
        BusOp::write(0x0080, 0x01),
        BusOp::write(0x029D, 99), // 100 x 8 clocks, irq on
        BusOp::WaitForInterrupt,
        BusOp::read(0x029C), // ack, keep irq enabled
        BusOp::read(0xF000),
        BusOp::jump(1),
    ]
}

fn demo_config() -> MachineConfig {
    let mut cart = vec![0xEA; 0x1000];
    cart[0] = 0x4C;
    MachineConfig::new("demo")
        .device(":maincpu", "demo_cpu", DeviceConfig::new(CPU_CLOCK))
        .device(":riot", Riot6532::KIND, DeviceConfig::new(CPU_CLOCK))
        .rom("cart", cart)
        .map(MapDecl::new(
            ":maincpu",
            "program",
            0x0080,
            0x00FF,
            MapTarget::Device {
                tag: ":riot".into(),
                map: 0,
                width: AccessWidth::Byte,
            },
        ))
        .map(MapDecl::new(
            ":maincpu",
            "program",
            0x0280,
            0x029F,
            MapTarget::Device {
                tag: ":riot".into(),
                map: 1,
                width: AccessWidth::Byte,
            },
        ))
        .map(MapDecl::new(":maincpu", "program", 0xF000, 0xFFFF, MapTarget::Rom("cart".into())))
        .line(":riot", "irq", ":maincpu", 0)
}

fn load_config() -> Result<MachineConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(demo_config());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    parse_config(&text).with_context(|| format!("parsing {path}"))
}

#[cfg(feature = "serde-spec")]
fn parse_config(text: &str) -> Result<MachineConfig> {
    if text.trim_start().starts_with('{') {
        Ok(MachineConfig::from_json(text)?)
    } else {
        Ok(MachineConfig::from_yaml(text)?)
    }
}

#[cfg(not(feature = "serde-spec"))]
fn parse_config(_text: &str) -> Result<MachineConfig> {
    anyhow::bail!("machine descriptions need the `serde-spec` feature")
}

fn main() -> Result<()> {
    env_logger::init();

    println!("Chipframe v0.1.0");
    println!("================");

    let mut registry = DeviceRegistry::with_builtin();
    registry.register("demo_cpu", ScriptedCpu::factory(demo_program()));
    let config = load_config()?;
    let mut machine = Machine::build(&config, &registry).context("building machine")?;

    println!("Machine `{}` with {} state items", machine.name(), machine.state_items().len());

    let frame = TimeValue::from_hz(60);
    for _ in 0..FRAMES {
        machine.run_for(frame);
    }

    let snapshot = machine.save_to_vec()?;
    let saved_at = machine.time();
    machine.run_for(frame);
    machine.load_from_slice(&snapshot)?;
    anyhow::ensure!(machine.time() == saved_at, "state load did not restore the clock");

    println!("Emulated time:  {}", machine.time());
    println!("Scheduler steps: {}", machine.scheduler().steps());
    if let Some(cpu) = machine.device::<ScriptedCpu>(":maincpu") {
        println!("CPU ops:        {}", cpu.ops());
        println!("Interrupts:     {}", cpu.interrupts());
    }
    if let Some(riot) = machine.device::<Riot6532>(":riot") {
        println!("RIOT flags:     {:#04x}", riot.flags().bits());
    }
    println!(
        "Snapshot:       {} bytes, identity {:#018x}",
        snapshot.len(),
        machine.state_identity()
    );

    let notices = machine.diagnostics_mut().take_journal();
    if !notices.is_empty() {
        println!("Diagnostics:");
        for notice in notices {
            println!("  {notice}");
        }
    }
    Ok(())
}
