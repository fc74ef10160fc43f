// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use chipframe_core::diag::Notice;
use chipframe_core::{ConfigError, DeviceConfig, DeviceRegistry, Machine, MachineConfig, Phase};
use common::{riot_bus, Tracer};
use pretty_assertions::assert_eq;

type Journal = Rc<RefCell<Vec<String>>>;

fn registry(journal: &Journal) -> DeviceRegistry {
    let mut registry = DeviceRegistry::with_builtin();
    Tracer::register(&mut registry, Tracer::KIND, journal);
    registry
}

fn tracer(config: MachineConfig, tag: &str, params: &[(&str, u64)]) -> MachineConfig {
    let device = params
        .iter()
        .fold(DeviceConfig::default(), |c, &(key, value)| c.with_param(key, value));
    config.device(tag, Tracer::KIND, device)
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.borrow().clone()
}

#[test]
fn missing_required_device_aborts_before_any_start() {
    let journal = Journal::default();
    let config = MachineConfig::new("broken");
    let config = tracer(config, ":dev1", &[]);
    let config = tracer(config, ":dev2", &[("needs", 9)]);

    let err = Machine::build(&config, &registry(&journal)).err();
    assert_eq!(
        err,
        Some(ConfigError::MissingRequired {
            requester: ":dev2".into(),
            path: ":dev9".into(),
        })
    );
    assert!(entries(&journal).is_empty());
}

#[test]
fn dependencies_start_first_and_stop_last() {
    let journal = Journal::default();
    let config = MachineConfig::new("chain");
    let config = tracer(config, ":dev1", &[("needs", 3)]);
    let config = tracer(config, ":dev2", &[]);
    let config = tracer(config, ":dev3", &[("needs", 2)]);

    let mut m = Machine::build(&config, &registry(&journal)).unwrap();
    assert_eq!(m.phase(), Phase::Running);
    m.stop();
    m.stop();
    drop(m);
    assert_eq!(
        entries(&journal),
        vec![
            "start :dev2",
            "start :dev3",
            "start :dev1",
            "stop :dev1",
            "stop :dev3",
            "stop :dev2",
        ]
    );
}

#[test]
fn failed_start_stops_what_already_started() {
    let journal = Journal::default();
    let config = MachineConfig::new("half");
    let config = tracer(config, ":dev1", &[]);
    let config = tracer(config, ":dev2", &[("fail", 1)]);
    let config = tracer(config, ":dev3", &[]);

    let err = Machine::build(&config, &registry(&journal)).err();
    assert!(matches!(err, Some(ConfigError::DeviceStart { ref tag, .. }) if tag == ":dev2"));
    assert_eq!(entries(&journal), vec!["start :dev1", "stop :dev1"]);
}

#[test]
fn state_name_collision_aborts_the_build() {
    let journal = Journal::default();
    let config = MachineConfig::new("collide");
    let config = tracer(config, ":dev1", &[]);
    let config = tracer(config, ":dev2", &[("state", 1)]);
    let config = tracer(config, ":dev3", &[]);

    let err = Machine::build(&config, &registry(&journal)).err();
    assert_eq!(
        err,
        Some(ConfigError::DuplicateStateItem {
            name: ":dev2.count".into(),
        })
    );
    assert_eq!(
        entries(&journal),
        vec!["start :dev1", "start :dev2", "stop :dev2", "stop :dev1"]
    );
}

#[test]
fn rejected_state_item_fails_its_owner() {
    let journal = Journal::default();
    let config = MachineConfig::new("reject");
    let config = tracer(config, ":dev1", &[("state", 2)]);

    let err = Machine::build(&config, &registry(&journal)).err();
    assert_eq!(
        err,
        Some(ConfigError::DeviceStart {
            tag: ":dev1".into(),
            reason: "state item `count` rejected while registering".into(),
        })
    );
    assert_eq!(entries(&journal), vec!["start :dev1", "stop :dev1"]);
}

#[test]
fn missing_optional_device_is_only_noted() {
    let journal = Journal::default();
    let config = tracer(MachineConfig::new("optional"), ":dev1", &[("wants", 9)]);
    let m = Machine::build(&config, &registry(&journal)).unwrap();
    assert_eq!(
        m.diagnostics().journal(),
        &[Notice::UnresolvedOptional {
            requester: ":dev1".into(),
            path: "dev9".into(),
        }]
    );
}

#[test]
fn reference_cycle_still_starts_everything() {
    let journal = Journal::default();
    let config = MachineConfig::new("cycle");
    let config = tracer(config, ":dev1", &[("needs", 2)]);
    let config = tracer(config, ":dev2", &[("needs", 1)]);

    let m = Machine::build(&config, &registry(&journal)).unwrap();
    assert_eq!(entries(&journal), vec!["start :dev1", "start :dev2"]);
    assert!(m
        .diagnostics()
        .journal()
        .iter()
        .any(|n| matches!(n, Notice::FinderCycle { .. })));
}

#[test]
fn children_hang_off_declared_parents() {
    let journal = Journal::default();
    let config = MachineConfig::new("nested");
    let config = tracer(config, ":dev1", &[]);
    let config = tracer(config, ":dev1:port", &[("needs", 1)]);
    let m = Machine::build(&config, &registry(&journal)).unwrap();
    let port = m.find(":dev1:port").unwrap();
    assert_eq!(m.tree().parent(port), m.find(":dev1"));
    assert_eq!(entries(&journal), vec!["start :dev1", "start :dev1:port"]);
}

#[test]
fn tree_declaration_errors() {
    let journal = Journal::default();
    let registry = registry(&journal);

    let unknown_kind =
        MachineConfig::new("k").device(":x", "flux_capacitor", DeviceConfig::default());
    assert_eq!(
        Machine::build(&unknown_kind, &registry).err(),
        Some(ConfigError::UnknownDeviceKind {
            kind: "flux_capacitor".into()
        })
    );

    let duplicate = tracer(tracer(MachineConfig::new("d"), ":dev1", &[]), ":dev1", &[]);
    assert_eq!(
        Machine::build(&duplicate, &registry).err(),
        Some(ConfigError::DuplicateTag { tag: ":dev1".into() })
    );

    let orphan = tracer(MachineConfig::new("o"), ":nowhere:dev1", &[]);
    assert_eq!(
        Machine::build(&orphan, &registry).err(),
        Some(ConfigError::UnknownDevice {
            tag: ":nowhere".into()
        })
    );

    let bad_name = tracer(MachineConfig::new("n"), ":dev 1", &[]);
    assert!(matches!(
        Machine::build(&bad_name, &registry).err(),
        Some(ConfigError::InvalidTag { .. })
    ));
    assert!(entries(&journal).is_empty());
}

#[test]
fn line_wiring_errors() {
    let journal = Journal::default();
    let registry = registry(&journal);
    let base = || tracer(riot_bus(MachineConfig::new("lines")), ":dev1", &[]);

    let not_exec = base().line(":riot", "irq", ":dev1", 0);
    assert_eq!(
        Machine::build(&not_exec, &registry).err(),
        Some(ConfigError::NotExecutor { tag: ":dev1".into() })
    );

    let no_output = base().line(":riot", "nmi", ":dev1", 0);
    assert!(matches!(
        Machine::build(&no_output, &registry).err(),
        Some(ConfigError::UnknownLine { .. })
    ));
}
