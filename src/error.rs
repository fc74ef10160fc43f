// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error taxonomy for machine construction and save states.
//!
//! Construction problems are [`ConfigError`]s and abort the build before any
//! device runs. Save-state problems are [`SaveStateError`]s and leave the
//! running machine untouched. Unmapped accesses are not errors at all; they
//! go to the diagnostics channel.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Fatal machine configuration problems.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required device `{path}` not found (requested by `{requester}`)")]
    MissingRequired { requester: String, path: String },
    #[error("invalid device tag `{tag}`")]
    InvalidTag { tag: String },
    #[error("duplicate device tag `{tag}`")]
    DuplicateTag { tag: String },
    #[error("unknown device `{tag}`")]
    UnknownDevice { tag: String },
    #[error("no device kind `{kind}` registered")]
    UnknownDeviceKind { kind: String },
    #[error("device `{device}` has no address space `{space}`")]
    UnknownSpace { device: String, space: String },
    #[error("address space `{space}` declared twice on `{device}`")]
    DuplicateSpace { device: String, space: String },
    #[error("address space `{space}`: unsupported address width of {bits} bits")]
    InvalidSpace { space: String, bits: u8 },
    #[error("address space `{space}`: range {start:#x}..={end:#x} is inverted")]
    InvalidRange { space: String, start: u64, end: u64 },
    #[error("address space `{space}`: range {start:#x}..={end:#x} exceeds the {bits}-bit bus")]
    RangeOutOfSpace {
        space: String,
        start: u64,
        end: u64,
        bits: u8,
    },
    #[error("address space `{space}`: lane selection {lane}/{stride} is not valid here")]
    InvalidLanes { space: String, stride: u8, lane: u8 },
    #[error("region `{region}` is too small for the range mapped at {start:#x} in `{space}`")]
    RegionTooSmall {
        space: String,
        region: String,
        start: u64,
    },
    #[error("unknown memory region `{name}`")]
    UnknownRegion { name: String },
    #[error("memory region `{name}` declared twice")]
    DuplicateRegion { name: String },
    #[error("unknown bank `{name}`")]
    UnknownBank { name: String },
    #[error("bank `{name}` declared twice")]
    DuplicateBank { name: String },
    #[error("bank `{bank}` does not fit inside region `{region}`")]
    BankOutOfRegion { bank: String, region: String },
    #[error("bank `{bank}` has {count} entries, cannot select entry {index}")]
    BankIndexOutOfRange {
        bank: String,
        index: usize,
        count: usize,
    },
    #[error("device `{device}` has no output line `{line}`")]
    UnknownLine { device: String, line: String },
    #[error("output line `{line}` declared twice on `{device}`")]
    DuplicateLine { device: String, line: String },
    #[error("input line {input} out of range on `{device}`")]
    InvalidLineInput { device: String, input: u8 },
    #[error("device `{tag}` is not an executor")]
    NotExecutor { tag: String },
    #[error("save-state item `{name}` registered twice")]
    DuplicateStateItem { name: String },
    #[error("{operation} is only allowed while the machine is being built")]
    Sealed { operation: &'static str },
    #[error("device `{tag}` failed to start: {reason}")]
    DeviceStart { tag: String, reason: String },
    #[error("machine description could not be parsed: {0}")]
    Parse(String),
}

/// Save-state failures. The running machine is never left half-restored.
#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("not a save state (bad magic)")]
    BadMagic,
    #[error("unsupported save-state version {0}")]
    UnsupportedVersion(u16),
    #[error(
        "save state belongs to a different machine \
         (identity {found:#018x}, expected {expected:#018x})"
    )]
    IdentityMismatch { expected: u64, found: u64 },
    #[error("save state holds {found} items, machine registers {expected}")]
    ItemCountMismatch { expected: u32, found: u32 },
    #[error("save-state payload is {found} bytes, expected {expected}")]
    PayloadLengthMismatch { expected: u64, found: u64 },
    #[error("save-state item mismatch: expected `{expected}`, found `{found}`")]
    ItemMismatch { expected: String, found: String },
    #[error("save-state item `{0}` rejected its data")]
    Corrupt(String),
    #[error("machine is not running")]
    NotRunning,
}
