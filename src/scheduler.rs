// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Deterministic scheduler: timers, executors and interrupt lines.
//!
//! The global clock only moves forward. Executors run ahead of it inside a
//! timeslice and carry their own local time (`epoch + cycles / clock`);
//! anything they do that should land earlier than the slice end (a timer
//! armed for sooner, a line raised on another executor) aborts the slice so
//! the global clock stops where the executor did. Timers with equal expiry
//! fire in the order they were armed.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;

use bitvec::prelude::*;

use crate::core::time::TimeValue;
use crate::state::StateVisitor;
use crate::tree::DeviceId;

/// Number of input lines each executor samples.
pub const INPUT_LINES: u8 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LineId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SuspendReason {
    /// Wakes when any connected input line is asserted.
    WaitForInterrupt,
    /// Held by a halt line until explicitly resumed.
    HaltLine,
    /// Parked by a debugger.
    Debugger,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecState {
    Running,
    Suspended(SuspendReason),
    Halted,
}

impl ExecState {
    fn code(self) -> u8 {
        match self {
            ExecState::Running => 0,
            ExecState::Suspended(SuspendReason::WaitForInterrupt) => 1,
            ExecState::Suspended(SuspendReason::HaltLine) => 2,
            ExecState::Suspended(SuspendReason::Debugger) => 3,
            ExecState::Halted => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ExecState::Running,
            1 => ExecState::Suspended(SuspendReason::WaitForInterrupt),
            2 => ExecState::Suspended(SuspendReason::HaltLine),
            3 => ExecState::Suspended(SuspendReason::Debugger),
            4 => ExecState::Halted,
            _ => return None,
        })
    }
}

/// Misuse of the timer API. Applied as leniently as possible and then
/// reported by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Violation {
    NotOwner { timer: String },
    PastExpiry { timer: String, late: TimeValue },
    ZeroPeriod { timer: String },
    UnknownTimer,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NotOwner { timer } => {
                write!(f, "timer `{timer}` adjusted by a device that does not own it")
            }
            Violation::PastExpiry { timer, late } => {
                write!(f, "timer `{timer}` armed {late} in the past; clamped to now")
            }
            Violation::ZeroPeriod { timer } => {
                write!(f, "timer `{timer}` given a zero period; treated as one-shot")
            }
            Violation::UnknownTimer => write!(f, "unknown timer handle"),
        }
    }
}

#[derive(Debug)]
struct TimerSlot {
    owner: DeviceId,
    name: String,
    freed: bool,
    enabled: bool,
    start: TimeValue,
    expire: TimeValue,
    period: TimeValue,
    param: u64,
    seq: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Pending {
    expire: TimeValue,
    seq: u64,
    timer: usize,
}

#[derive(Debug)]
pub(crate) struct ExecSlot {
    pub(crate) device: DeviceId,
    clock: u32,
    epoch: TimeValue,
    cycles: u64,
    total: u64,
    pub(crate) state: ExecState,
    lines: BitArray<[u32; 1], Lsb0>,
}

impl ExecSlot {
    fn local_time(&self) -> TimeValue {
        self.epoch + TimeValue::cycles(self.cycles, self.clock)
    }

    fn rebase(&mut self, at: TimeValue) {
        self.epoch = at;
        self.cycles = 0;
    }
}

#[derive(Debug)]
struct Wire {
    source: DeviceId,
    name: String,
    target: Option<(usize, u8)>,
    state: bool,
}

#[derive(Clone, Copy, Debug)]
struct Slice {
    exec: usize,
    start_cycles: u64,
    budget: u64,
    target: TimeValue,
    aborted: bool,
}

/// What a finished timeslice amounted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SliceOutcome {
    pub(crate) ran: u64,
    pub(crate) aborted: bool,
}

#[derive(Debug)]
pub struct Scheduler {
    now: TimeValue,
    quantum: TimeValue,
    next_seq: u64,
    timers: Vec<TimerSlot>,
    queue: BinaryHeap<Reverse<Pending>>,
    executors: Vec<ExecSlot>,
    wires: Vec<Wire>,
    slice: Option<Slice>,
    steps: u64,
}

impl Scheduler {
    pub fn new(quantum: TimeValue) -> Self {
        Self {
            now: TimeValue::ZERO,
            quantum,
            next_seq: 0,
            timers: Vec::new(),
            queue: BinaryHeap::new(),
            executors: Vec::new(),
            wires: Vec::new(),
            slice: None,
            steps: 0,
        }
    }

    /// Global time: the point every device has been brought up to.
    pub fn now(&self) -> TimeValue {
        self.now
    }

    pub fn quantum(&self) -> TimeValue {
        self.quantum
    }

    /// Number of scheduling steps taken so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Time as seen by whoever is running: the executing executor's local
    /// time inside a timeslice, the global time otherwise.
    pub fn current_time(&self) -> TimeValue {
        match self.slice {
            Some(slice) => self.executors[slice.exec].local_time(),
            None => self.now,
        }
    }

    // ---- timers ----

    pub(crate) fn alloc_timer(&mut self, owner: DeviceId, name: &str) -> TimerId {
        self.timers.push(TimerSlot {
            owner,
            name: name.to_string(),
            freed: false,
            enabled: false,
            start: self.now,
            expire: TimeValue::NEVER,
            period: TimeValue::NEVER,
            param: 0,
            seq: 0,
        });
        TimerId(self.timers.len() - 1)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    fn owned(&self, timer: TimerId, caller: DeviceId) -> Result<&TimerSlot, Violation> {
        let slot = self
            .timers
            .get(timer.0)
            .filter(|slot| !slot.freed)
            .ok_or(Violation::UnknownTimer)?;
        if slot.owner != caller {
            return Err(Violation::NotOwner {
                timer: slot.name.clone(),
            });
        }
        Ok(slot)
    }

    fn arm(&mut self, index: usize, expire: TimeValue) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = &mut self.timers[index];
        slot.enabled = true;
        slot.expire = expire;
        slot.seq = seq;
        self.queue.push(Reverse(Pending {
            expire,
            seq,
            timer: index,
        }));
        if let Some(slice) = &mut self.slice {
            if expire < slice.target {
                slice.aborted = true;
            }
        }
    }

    fn disarm(&mut self, index: usize) {
        let slot = &mut self.timers[index];
        slot.enabled = false;
        slot.expire = TimeValue::NEVER;
    }

    /// Re-arm `timer` to fire at `expire`, then every `period` if finite.
    pub(crate) fn adjust(
        &mut self,
        timer: TimerId,
        caller: DeviceId,
        expire: TimeValue,
        param: u64,
        period: TimeValue,
    ) -> Option<Violation> {
        let slot = match self.owned(timer, caller) {
            Ok(slot) => slot,
            Err(violation) => return Some(violation),
        };
        let mut violation = None;
        let period = if period.is_zero() {
            violation = Some(Violation::ZeroPeriod {
                timer: slot.name.clone(),
            });
            TimeValue::NEVER
        } else {
            period
        };
        let current = self.current_time();
        let expire = if expire < current {
            violation = Some(Violation::PastExpiry {
                timer: slot.name.clone(),
                late: current - expire,
            });
            current
        } else {
            expire
        };

        let slot = &mut self.timers[timer.0];
        slot.param = param;
        slot.period = period;
        slot.start = current;
        if expire.is_never() {
            self.disarm(timer.0);
        } else {
            self.arm(timer.0, expire);
        }
        violation
    }

    pub(crate) fn enable(
        &mut self,
        timer: TimerId,
        caller: DeviceId,
        enable: bool,
    ) -> Option<Violation> {
        let slot = match self.owned(timer, caller) {
            Ok(slot) => slot,
            Err(violation) => return Some(violation),
        };
        if !enable {
            // keeps the expiry so a later enable picks it back up
            self.timers[timer.0].enabled = false;
        } else if !slot.enabled && !slot.expire.is_never() {
            let expire = slot.expire.max(self.current_time());
            self.arm(timer.0, expire);
        }
        None
    }

    /// Release a timer. It is disarmed and every later use is a violation.
    pub(crate) fn free(&mut self, timer: TimerId, caller: DeviceId) -> Option<Violation> {
        if let Err(violation) = self.owned(timer, caller) {
            return Some(violation);
        }
        self.disarm(timer.0);
        self.timers[timer.0].freed = true;
        None
    }

    pub fn timer_enabled(&self, timer: TimerId) -> bool {
        self.timers.get(timer.0).is_some_and(|t| t.enabled)
    }

    pub fn timer_param(&self, timer: TimerId) -> u64 {
        self.timers.get(timer.0).map_or(0, |t| t.param)
    }

    pub fn timer_expire(&self, timer: TimerId) -> TimeValue {
        match self.timers.get(timer.0) {
            Some(t) if t.enabled => t.expire,
            _ => TimeValue::NEVER,
        }
    }

    pub fn timer_remaining(&self, timer: TimerId) -> TimeValue {
        let expire = self.timer_expire(timer);
        if expire.is_never() {
            return TimeValue::NEVER;
        }
        expire - self.current_time()
    }

    /// When the timer was last armed (or last fired, for periodic timers).
    pub fn timer_start(&self, timer: TimerId) -> TimeValue {
        self.timers.get(timer.0).map_or(TimeValue::NEVER, |t| t.start)
    }

    pub fn timer_elapsed(&self, timer: TimerId) -> TimeValue {
        self.timers
            .get(timer.0)
            .map_or(TimeValue::ZERO, |t| self.current_time() - t.start)
    }

    pub(crate) fn timer_owner(&self, timer: TimerId) -> DeviceId {
        self.timers[timer.0].owner
    }

    fn is_live(&self, pending: &Pending) -> bool {
        let slot = &self.timers[pending.timer];
        slot.enabled && slot.seq == pending.seq
    }

    /// Earliest armed expiry, dropping stale queue entries on the way.
    pub fn next_expiry(&mut self) -> TimeValue {
        while let Some(Reverse(top)) = self.queue.peek().copied() {
            if self.is_live(&top) {
                return top.expire;
            }
            self.queue.pop();
        }
        TimeValue::NEVER
    }

    /// Pop the next timer due at or before the global time and reschedule
    /// it. Returns the timer and the parameter to deliver.
    pub(crate) fn pop_due(&mut self) -> Option<(TimerId, u64)> {
        let expire = self.next_expiry();
        if expire.is_never() || expire > self.now {
            return None;
        }
        let Reverse(top) = self.queue.pop()?;
        let index = top.timer;
        let (period, param) = {
            let slot = &self.timers[index];
            (slot.period, slot.param)
        };
        if period.is_never() || period.is_zero() {
            self.disarm(index);
        } else {
            self.timers[index].start = top.expire;
            self.arm(index, top.expire + period);
        }
        Some((TimerId(index), param))
    }

    /// Rebuild the queue from the timer table, e.g. after a state load.
    pub(crate) fn rebuild_queue(&mut self) {
        self.queue.clear();
        for (index, slot) in self.timers.iter().enumerate() {
            if slot.enabled && !slot.expire.is_never() {
                self.queue.push(Reverse(Pending {
                    expire: slot.expire,
                    seq: slot.seq,
                    timer: index,
                }));
            }
        }
    }

    // ---- executors ----

    pub(crate) fn add_executor(&mut self, device: DeviceId, clock: u32) -> usize {
        self.executors.push(ExecSlot {
            device,
            clock,
            epoch: self.now,
            cycles: 0,
            total: 0,
            state: ExecState::Running,
            lines: BitArray::ZERO,
        });
        self.executors.len() - 1
    }

    pub(crate) fn executor_count(&self) -> usize {
        self.executors.len()
    }

    pub(crate) fn executor(&self, index: usize) -> &ExecSlot {
        &self.executors[index]
    }

    pub(crate) fn exec_index(&self, device: DeviceId) -> Option<usize> {
        self.executors.iter().position(|e| e.device == device)
    }

    pub fn exec_state(&self, device: DeviceId) -> Option<ExecState> {
        self.exec_index(device).map(|i| self.executors[i].state)
    }

    /// Total cycles an executor has consumed since the machine started.
    pub fn exec_cycles(&self, device: DeviceId) -> Option<u64> {
        self.exec_index(device).map(|i| self.executors[i].total)
    }

    pub fn exec_local_time(&self, device: DeviceId) -> Option<TimeValue> {
        self.exec_index(device).map(|i| self.executors[i].local_time())
    }

    pub(crate) fn any_running(&self) -> bool {
        self.executors.iter().any(|e| e.state == ExecState::Running)
    }

    pub(crate) fn local_time(&self, index: usize) -> TimeValue {
        self.executors[index].local_time()
    }

    pub(crate) fn clock(&self, index: usize) -> u32 {
        self.executors[index].clock
    }

    pub(crate) fn begin_slice(&mut self, index: usize, budget: u64, target: TimeValue) {
        self.slice = Some(Slice {
            exec: index,
            start_cycles: self.executors[index].cycles,
            budget,
            target,
            aborted: false,
        });
    }

    pub(crate) fn end_slice(&mut self) -> SliceOutcome {
        match self.slice.take() {
            Some(slice) => SliceOutcome {
                ran: self.executors[slice.exec].cycles - slice.start_cycles,
                aborted: slice.aborted,
            },
            None => SliceOutcome { ran: 0, aborted: false },
        }
    }

    pub(crate) fn consume(&mut self, index: usize, cycles: u64) {
        let exec = &mut self.executors[index];
        exec.cycles += cycles;
        exec.total += cycles;
    }

    pub(crate) fn cycles_left(&self, index: usize) -> u64 {
        match self.slice {
            Some(slice) if slice.exec == index => {
                let ran = self.executors[index].cycles - slice.start_cycles;
                slice.budget.saturating_sub(ran)
            }
            _ => 0,
        }
    }

    pub(crate) fn should_yield(&self, index: usize) -> bool {
        match self.slice {
            Some(slice) if slice.exec == index => {
                slice.aborted
                    || self.executors[index].state != ExecState::Running
                    || self.cycles_left(index) == 0
            }
            _ => true,
        }
    }

    pub(crate) fn abort_slice(&mut self) {
        if let Some(slice) = &mut self.slice {
            slice.aborted = true;
        }
    }

    pub(crate) fn input_lines(&self, index: usize) -> u32 {
        self.executors[index].lines.as_raw_slice()[0]
    }

    pub(crate) fn suspend(&mut self, index: usize, reason: SuspendReason) {
        let exec = &mut self.executors[index];
        if exec.state != ExecState::Halted {
            exec.state = ExecState::Suspended(reason);
        }
    }

    pub(crate) fn resume(&mut self, index: usize, reason: SuspendReason) {
        if self.executors[index].state == ExecState::Suspended(reason) {
            let at = self.current_time().max(self.now);
            let exec = &mut self.executors[index];
            exec.state = ExecState::Running;
            exec.rebase(at);
        }
    }

    pub(crate) fn halt(&mut self, index: usize) {
        self.executors[index].state = ExecState::Halted;
    }

    /// Move global time forward; idle executors follow along.
    pub(crate) fn advance_to(&mut self, target: TimeValue) {
        if target > self.now {
            self.now = target;
        }
        self.steps += 1;
        let now = self.now;
        for exec in &mut self.executors {
            if exec.state != ExecState::Running {
                exec.rebase(now);
            }
        }
    }

    /// Bring every executor back to the global clock, e.g. on reset.
    pub(crate) fn rebase_all(&mut self) {
        let now = self.now;
        for exec in &mut self.executors {
            exec.rebase(now);
        }
    }

    pub(crate) fn set_exec_state(&mut self, index: usize, state: ExecState) {
        let now = self.now;
        let exec = &mut self.executors[index];
        exec.state = state;
        exec.rebase(now);
    }

    // ---- lines ----

    pub(crate) fn add_output(&mut self, source: DeviceId, name: &str) -> Option<LineId> {
        if self.find_output(source, name).is_some() {
            return None;
        }
        self.wires.push(Wire {
            source,
            name: name.to_string(),
            target: None,
            state: false,
        });
        Some(LineId(self.wires.len() - 1))
    }

    pub(crate) fn find_output(&self, source: DeviceId, name: &str) -> Option<LineId> {
        self.wires
            .iter()
            .position(|w| w.source == source && w.name == name)
            .map(LineId)
    }

    pub(crate) fn connect(&mut self, line: LineId, exec: usize, input: u8) {
        self.wires[line.0].target = Some((exec, input));
    }

    pub(crate) fn line_owner(&self, line: LineId) -> Option<DeviceId> {
        self.wires.get(line.0).map(|w| w.source)
    }

    pub fn line_state(&self, line: LineId) -> bool {
        self.wires.get(line.0).is_some_and(|w| w.state)
    }

    /// Drive a line. Asserting wakes a target waiting for an interrupt and
    /// cuts the current slice short if someone else is running.
    pub(crate) fn set_line(&mut self, line: LineId, state: bool) {
        let Some(wire) = self.wires.get_mut(line.0) else {
            return;
        };
        if wire.state == state {
            return;
        }
        wire.state = state;
        let Some((exec, input)) = wire.target else {
            return;
        };
        self.executors[exec].lines.set(input as usize, state);
        if !state {
            return;
        }
        if self.executors[exec].state == ExecState::Suspended(SuspendReason::WaitForInterrupt) {
            self.resume(exec, SuspendReason::WaitForInterrupt);
        }
        if let Some(slice) = &mut self.slice {
            if slice.exec != exec {
                slice.aborted = true;
            }
        }
    }

    // ---- persistence ----

    pub(crate) fn state(&mut self, visitor: &mut StateVisitor<'_>) {
        visitor.item("scheduler.now", &mut self.now);
        visitor.item("scheduler.seq", &mut self.next_seq);
        for (i, timer) in self.timers.iter_mut().enumerate() {
            let prefix = format!("timer{i}.{}", timer.name);
            visitor.item(&format!("{prefix}.freed"), &mut timer.freed);
            visitor.item(&format!("{prefix}.enabled"), &mut timer.enabled);
            visitor.item(&format!("{prefix}.start"), &mut timer.start);
            visitor.item(&format!("{prefix}.expire"), &mut timer.expire);
            visitor.item(&format!("{prefix}.period"), &mut timer.period);
            visitor.item(&format!("{prefix}.param"), &mut timer.param);
            visitor.item(&format!("{prefix}.seq"), &mut timer.seq);
        }
        for (i, exec) in self.executors.iter_mut().enumerate() {
            visitor.item(&format!("exec{i}.epoch"), &mut exec.epoch);
            visitor.item(&format!("exec{i}.cycles"), &mut exec.cycles);
            visitor.item(&format!("exec{i}.total"), &mut exec.total);
            let mut code = exec.state.code();
            visitor.item(&format!("exec{i}.state"), &mut code);
            let mut lines = exec.lines.as_raw_slice()[0];
            visitor.item(&format!("exec{i}.lines"), &mut lines);
            if visitor.is_loading() {
                match ExecState::from_code(code) {
                    Some(state) => exec.state = state,
                    None => visitor.reject(&format!("exec{i}.state")),
                }
                exec.lines = BitArray::new([lines]);
            }
        }
        for (i, wire) in self.wires.iter_mut().enumerate() {
            visitor.item(&format!("line{i}.{}", wire.name), &mut wire.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: DeviceId = DeviceId(1);

    fn scheduler() -> Scheduler {
        Scheduler::new(TimeValue::from_usec(100))
    }

    fn drain(s: &mut Scheduler, until: TimeValue) -> Vec<(usize, u64)> {
        s.advance_to(until);
        let mut fired = Vec::new();
        while let Some((timer, param)) = s.pop_due() {
            fired.push((timer.0, param));
        }
        fired
    }

    #[test]
    fn equal_expiries_fire_in_arm_order() {
        let mut s = scheduler();
        let a = s.alloc_timer(OWNER, "a");
        let b = s.alloc_timer(OWNER, "b");
        let c = s.alloc_timer(OWNER, "c");
        let at = TimeValue::from_usec(10);
        assert_eq!(s.adjust(b, OWNER, at, 2, TimeValue::NEVER), None);
        assert_eq!(s.adjust(c, OWNER, at, 3, TimeValue::NEVER), None);
        assert_eq!(s.adjust(a, OWNER, at, 1, TimeValue::NEVER), None);
        assert_eq!(drain(&mut s, at), vec![(b.0, 2), (c.0, 3), (a.0, 1)]);
    }

    #[test]
    fn disabled_timer_never_fires() {
        let mut s = scheduler();
        let t = s.alloc_timer(OWNER, "t");
        s.adjust(t, OWNER, TimeValue::from_usec(5), 0, TimeValue::NEVER);
        s.enable(t, OWNER, false);
        assert!(drain(&mut s, TimeValue::from_usec(10)).is_empty());
        assert_eq!(s.next_expiry(), TimeValue::NEVER);
        assert_eq!(s.timer_expire(t), TimeValue::NEVER);
    }

    #[test]
    fn reenable_restores_pending_expiry() {
        let mut s = scheduler();
        let t = s.alloc_timer(OWNER, "t");
        s.adjust(t, OWNER, TimeValue::from_usec(5), 3, TimeValue::NEVER);
        s.enable(t, OWNER, false);
        s.enable(t, OWNER, true);
        assert_eq!(s.next_expiry(), TimeValue::from_usec(5));
        assert_eq!(drain(&mut s, TimeValue::from_usec(5)), vec![(t.0, 3)]);
    }

    #[test]
    fn rearm_supersedes_previous_expiry() {
        let mut s = scheduler();
        let t = s.alloc_timer(OWNER, "t");
        s.adjust(t, OWNER, TimeValue::from_usec(5), 0, TimeValue::NEVER);
        s.adjust(t, OWNER, TimeValue::from_usec(20), 7, TimeValue::NEVER);
        assert!(drain(&mut s, TimeValue::from_usec(10)).is_empty());
        assert_eq!(drain(&mut s, TimeValue::from_usec(20)), vec![(t.0, 7)]);
    }

    #[test]
    fn periodic_timer_rearms_from_expiry() {
        let mut s = scheduler();
        let t = s.alloc_timer(OWNER, "tick");
        let period = TimeValue::from_usec(10);
        s.adjust(t, OWNER, period, 0, period);
        assert_eq!(drain(&mut s, TimeValue::from_usec(35)).len(), 3);
        assert_eq!(s.timer_expire(t), TimeValue::from_usec(40));
    }

    #[test]
    fn foreign_owner_is_rejected() {
        let mut s = scheduler();
        let t = s.alloc_timer(OWNER, "t");
        let violation = s.adjust(t, DeviceId(2), TimeValue::from_usec(1), 0, TimeValue::NEVER);
        assert!(matches!(violation, Some(Violation::NotOwner { .. })));
        assert!(!s.timer_enabled(t));
    }

    #[test]
    fn freed_timer_rejects_use() {
        let mut s = scheduler();
        let t = s.alloc_timer(OWNER, "t");
        s.adjust(t, OWNER, TimeValue::from_usec(5), 0, TimeValue::NEVER);
        assert!(s.free(t, DeviceId(2)).is_some());
        assert_eq!(s.free(t, OWNER), None);
        assert!(!s.timer_enabled(t));
        let violation = s.adjust(t, OWNER, TimeValue::from_usec(5), 0, TimeValue::NEVER);
        assert_eq!(violation, Some(Violation::UnknownTimer));
    }

    #[test]
    fn past_expiry_is_clamped() {
        let mut s = scheduler();
        s.advance_to(TimeValue::from_usec(50));
        let t = s.alloc_timer(OWNER, "t");
        let violation = s.adjust(t, OWNER, TimeValue::from_usec(10), 0, TimeValue::NEVER);
        assert!(matches!(violation, Some(Violation::PastExpiry { .. })));
        assert_eq!(s.timer_expire(t), TimeValue::from_usec(50));
        assert_eq!(drain(&mut s, TimeValue::from_usec(50)).len(), 1);
    }

    #[test]
    fn zero_period_degrades_to_one_shot() {
        let mut s = scheduler();
        let t = s.alloc_timer(OWNER, "t");
        let violation = s.adjust(t, OWNER, TimeValue::from_usec(1), 0, TimeValue::ZERO);
        assert!(matches!(violation, Some(Violation::ZeroPeriod { .. })));
        assert_eq!(drain(&mut s, TimeValue::from_usec(100)).len(), 1);
        assert!(!s.timer_enabled(t));
    }

    #[test]
    fn local_time_tracks_consumed_cycles() {
        let mut s = scheduler();
        let cpu = s.add_executor(OWNER, 1_000_000);
        s.begin_slice(cpu, 100, TimeValue::from_usec(100));
        s.consume(cpu, 40);
        assert_eq!(s.current_time(), TimeValue::from_usec(40));
        assert_eq!(s.cycles_left(cpu), 60);
        assert!(!s.should_yield(cpu));
        s.consume(cpu, 60);
        assert!(s.should_yield(cpu));
        assert_eq!(s.end_slice(), SliceOutcome { ran: 100, aborted: false });
        assert_eq!(s.current_time(), TimeValue::ZERO);
    }

    #[test]
    fn earlier_timer_aborts_slice() {
        let mut s = scheduler();
        let cpu = s.add_executor(OWNER, 1_000_000);
        let t = s.alloc_timer(OWNER, "t");
        s.begin_slice(cpu, 100, TimeValue::from_usec(100));
        s.consume(cpu, 10);
        s.adjust(t, OWNER, TimeValue::from_usec(30), 0, TimeValue::NEVER);
        assert!(s.should_yield(cpu));
        assert!(s.end_slice().aborted);
    }

    #[test]
    fn asserted_line_wakes_waiting_executor() {
        let mut s = scheduler();
        let cpu = s.add_executor(OWNER, 1_000_000);
        let line = s.add_output(DeviceId(2), "irq").unwrap();
        assert!(s.add_output(DeviceId(2), "irq").is_none());
        s.connect(line, cpu, 3);
        s.suspend(cpu, SuspendReason::WaitForInterrupt);
        s.advance_to(TimeValue::from_usec(7));
        s.set_line(line, true);
        assert_eq!(s.exec_state(OWNER), Some(ExecState::Running));
        assert_eq!(s.input_lines(cpu), 1 << 3);
        assert_eq!(s.local_time(cpu), TimeValue::from_usec(7));
        s.set_line(line, false);
        assert_eq!(s.input_lines(cpu), 0);
    }

    #[test]
    fn host_suspension_ignores_lines() {
        let mut s = scheduler();
        let cpu = s.add_executor(OWNER, 1_000_000);
        let line = s.add_output(DeviceId(2), "irq").unwrap();
        s.connect(line, cpu, 0);
        s.suspend(cpu, SuspendReason::HaltLine);
        s.set_line(line, true);
        assert_eq!(s.exec_state(OWNER), Some(ExecState::Suspended(SuspendReason::HaltLine)));
        s.resume(cpu, SuspendReason::HaltLine);
        assert_eq!(s.exec_state(OWNER), Some(ExecState::Running));
    }
}
