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

use chipframe_core::{
    ConfigError, Device, DeviceConfig, DeviceContext, DeviceRegistry, Machine, MachineConfig,
    TimeValue, TimerId,
};
use common::usec;
use pretty_assertions::assert_eq;

/// Param that makes a cue cancel its sibling when it fires.
const CANCEL_SIBLING: u64 = 0xDEAD;

/// Two timers driven from the host through `Machine::call`.
#[derive(Debug, Default)]
struct Cues {
    a: Option<TimerId>,
    b: Option<TimerId>,
    fired: Vec<(u64, TimeValue)>,
}

impl Cues {
    fn a(&self) -> TimerId {
        self.a.unwrap()
    }

    fn b(&self) -> TimerId {
        self.b.unwrap()
    }
}

impl Device for Cues {
    fn kind(&self) -> &'static str {
        "cues"
    }

    fn start(&mut self, ctx: &mut DeviceContext<'_>) -> Result<(), ConfigError> {
        self.a = Some(ctx.timer_alloc("a")?);
        self.b = Some(ctx.timer_alloc("b")?);
        Ok(())
    }

    fn timer(&mut self, ctx: &mut DeviceContext<'_>, timer: TimerId, param: u64) {
        self.fired.push((param, ctx.now()));
        if param == CANCEL_SIBLING {
            let other = if timer == self.a() { self.b() } else { self.a() };
            ctx.timer_enable(other, false);
        }
    }
}

fn machine() -> Machine {
    let mut registry = DeviceRegistry::new();
    registry.register("cues", |_| Ok(Box::new(Cues::default())));
    let config = MachineConfig::new("cues")
        .device(":one", "cues", DeviceConfig::default())
        .device(":two", "cues", DeviceConfig::default());
    Machine::build(&config, &registry).unwrap()
}

fn fired(m: &Machine, tag: &str) -> Vec<(u64, TimeValue)> {
    m.device::<Cues>(tag).unwrap().fired.clone()
}

#[test]
fn periodic_timer_reports_its_position() {
    let mut m = machine();
    m.call::<Cues, _>(":one", |cues, ctx| ctx.timer_set_periodic(cues.a(), usec(10), 7));
    m.run_for(usec(35));
    assert_eq!(fired(&m, ":one"), vec![(7, usec(10)), (7, usec(20)), (7, usec(30))]);

    let position = m.call::<Cues, _>(":one", |cues, ctx| {
        let a = cues.a();
        (
            ctx.timer_start(a),
            ctx.timer_expire(a),
            ctx.timer_remaining(a),
            ctx.timer_elapsed(a),
            ctx.timer_param(a),
        )
    });
    assert_eq!(position, Some((usec(30), usec(40), usec(5), usec(5), 7)));
}

#[test]
fn cancel_inside_the_same_pass_wins() {
    let mut m = machine();
    m.call::<Cues, _>(":one", |cues, ctx| {
        ctx.timer_set(cues.a(), usec(10), CANCEL_SIBLING);
        ctx.timer_set(cues.b(), usec(10), 2);
    });
    m.run_for(usec(20));
    assert_eq!(fired(&m, ":one"), vec![(CANCEL_SIBLING, usec(10))]);
}

#[test]
fn ties_across_devices_follow_scheduling_order() {
    let mut m = machine();
    m.call::<Cues, _>(":two", |cues, ctx| ctx.timer_set(cues.a(), usec(5), 1));
    m.call::<Cues, _>(":one", |cues, ctx| ctx.timer_set(cues.a(), usec(5), CANCEL_SIBLING));
    m.call::<Cues, _>(":two", |cues, ctx| ctx.timer_set(cues.b(), usec(5), 3));
    m.run_for(usec(5));
    assert_eq!(fired(&m, ":two"), vec![(1, usec(5)), (3, usec(5))]);
    assert_eq!(fired(&m, ":one"), vec![(CANCEL_SIBLING, usec(5))]);
}

#[test]
fn never_delay_disarms() {
    let mut m = machine();
    m.call::<Cues, _>(":one", |cues, ctx| {
        ctx.timer_set(cues.a(), usec(10), 1);
        ctx.timer_adjust(cues.a(), TimeValue::NEVER, 1, TimeValue::NEVER);
        assert!(!ctx.timer_enabled(cues.a()));
        assert_eq!(ctx.timer_remaining(cues.a()), TimeValue::NEVER);
    });
    assert_eq!(m.next_event_time(), TimeValue::NEVER);
    m.run_for(usec(50));
    assert!(fired(&m, ":one").is_empty());
}

#[test]
fn reenabled_timer_keeps_its_expiry() {
    let mut m = machine();
    m.call::<Cues, _>(":one", |cues, ctx| {
        ctx.timer_set_at(cues.a(), usec(40), 4);
        ctx.timer_enable(cues.a(), false);
        ctx.timer_enable(cues.a(), true);
    });
    assert_eq!(m.next_event_time(), usec(40));
    m.run_for(usec(50));
    assert_eq!(fired(&m, ":one"), vec![(4, usec(40))]);
}

#[test]
fn timers_cannot_be_allocated_after_start() {
    let mut m = machine();
    let result = m.call::<Cues, _>(":one", |_, ctx| ctx.timer_alloc("late"));
    assert_eq!(
        result,
        Some(Err(ConfigError::Sealed {
            operation: "timer allocation"
        }))
    );
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "scheduler invariant violated")]
fn foreign_timer_use_asserts_in_debug_builds() {
    let mut m = machine();
    let theirs = m.device::<Cues>(":two").unwrap().a();
    m.call::<Cues, _>(":one", |_, ctx| ctx.timer_set(theirs, usec(1), 0));
}

#[cfg(not(debug_assertions))]
#[test]
fn foreign_timer_use_is_reported_in_release_builds() {
    use chipframe_core::diag::Notice;

    let mut m = machine();
    let theirs = m.device::<Cues>(":two").unwrap().a();
    m.call::<Cues, _>(":one", |_, ctx| ctx.timer_set(theirs, usec(1), 0));
    assert_eq!(m.next_event_time(), TimeValue::NEVER);
    assert!(matches!(
        m.diagnostics().journal(),
        [Notice::SchedulerViolation { device, .. }] if device == ":one"
    ));
}

#[cfg(not(debug_assertions))]
#[test]
fn freed_timer_stays_silent() {
    let mut m = machine();
    m.call::<Cues, _>(":one", |cues, ctx| {
        ctx.timer_free(cues.a());
        ctx.timer_set(cues.a(), usec(1), 0);
    });
    m.run_for(usec(10));
    assert!(fired(&m, ":one").is_empty());
}
