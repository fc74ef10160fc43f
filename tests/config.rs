// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

#![cfg(feature = "serde-spec")]

use chipframe_core::devices::{BusOp, ScriptedCpu};
use chipframe_core::{DeviceRegistry, Machine, MachineConfig, TimeValue};
use pretty_assertions::assert_eq;

const DEMO: &str = include_str!("../demos/machine.yaml");

fn demo_registry() -> DeviceRegistry {
    let mut registry = DeviceRegistry::with_builtin();
    registry.register(
        "demo_cpu",
        ScriptedCpu::factory(vec![
            BusOp::write(0x0180, 0x42), // mirror of RIOT RAM
            BusOp::read(0x0080),
            BusOp::read(0xF000),
            BusOp::Halt,
        ]),
    );
    registry
}

#[test]
fn demo_description_builds_and_runs() {
    let config = MachineConfig::from_yaml(DEMO).unwrap();
    assert_eq!(config.quantum(), TimeValue::from_usec(50));
    let mut m = Machine::build(&config, &demo_registry()).unwrap();
    m.run_for(TimeValue::from_usec(100));

    let cpu = m.device::<ScriptedCpu>(":maincpu").unwrap();
    let values: Vec<u64> = cpu.reads().iter().map(|r| r.value).collect();
    assert_eq!(values, vec![0x42, 0xEA]);
}

#[test]
fn json_and_yaml_describe_the_same_machine() {
    let config = MachineConfig::from_yaml(DEMO).unwrap();
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(MachineConfig::from_json(&json).unwrap(), config);
}

#[test]
fn malformed_description_is_a_parse_error() {
    let err = MachineConfig::from_yaml("name: [unclosed").unwrap_err();
    assert!(matches!(err, chipframe_core::ConfigError::Parse(_)));
}
