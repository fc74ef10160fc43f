// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Save-state registry, visitor and stream format.
//!
//! Devices describe their persistent state by visiting named items in a fixed
//! order. The machine runs that visit three ways: once after start to
//! register the item list, then on every save and load to stream the bytes.
//!
//! Stream layout, all little-endian:
//!
//! ```text
//! magic "CHFS" | version u16 | identity u64 | item count u32 | payload u64 | payload
//! ```
//!
//! The identity hash covers the machine name and every item's qualified name,
//! size and element count, so a state only loads into an identical machine.

use std::collections::HashSet;
use std::io::{Read, Write};

use xxhash_rust::xxh3::xxh3_64;

use crate::core::time::TimeValue;
use crate::error::SaveStateError;

pub const MAGIC: [u8; 4] = *b"CHFS";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 8 + 4 + 8;

/// A value that can be persisted as a fixed-size little-endian byte run.
pub trait StateValue {
    fn state_size(&self) -> usize;

    fn elements(&self) -> usize {
        1
    }

    fn save_bytes(&self, out: &mut Vec<u8>);

    /// `bytes` is exactly `state_size()` long.
    fn load_bytes(&mut self, bytes: &[u8]);
}

macro_rules! int_state_value {
    ($($t:ty),*) => {$(
        impl StateValue for $t {
            fn state_size(&self) -> usize {
                std::mem::size_of::<$t>()
            }

            fn save_bytes(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn load_bytes(&mut self, bytes: &[u8]) {
                if let Ok(raw) = bytes.try_into() {
                    *self = <$t>::from_le_bytes(raw);
                }
            }
        }
    )*};
}

int_state_value!(u8, u16, u32, u64, i8, i16, i32, i64);

impl StateValue for bool {
    fn state_size(&self) -> usize {
        1
    }

    fn save_bytes(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn load_bytes(&mut self, bytes: &[u8]) {
        *self = bytes.first().is_some_and(|&b| b != 0);
    }
}

impl StateValue for TimeValue {
    fn state_size(&self) -> usize {
        16
    }

    fn save_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.seconds().to_le_bytes());
        out.extend_from_slice(&self.attoseconds().to_le_bytes());
    }

    fn load_bytes(&mut self, bytes: &[u8]) {
        let mut seconds = 0u64;
        let mut attos = 0u64;
        seconds.load_bytes(&bytes[..8]);
        attos.load_bytes(&bytes[8..16]);
        *self = TimeValue::from_raw_parts(seconds, attos);
    }
}

impl<T: StateValue, const N: usize> StateValue for [T; N] {
    fn state_size(&self) -> usize {
        self.iter().map(StateValue::state_size).sum()
    }

    fn elements(&self) -> usize {
        N
    }

    fn save_bytes(&self, out: &mut Vec<u8>) {
        for value in self {
            value.save_bytes(out);
        }
    }

    fn load_bytes(&mut self, bytes: &[u8]) {
        load_sequence(self.iter_mut(), bytes);
    }
}

impl<T: StateValue> StateValue for Vec<T> {
    fn state_size(&self) -> usize {
        self.iter().map(StateValue::state_size).sum()
    }

    fn elements(&self) -> usize {
        self.len()
    }

    fn save_bytes(&self, out: &mut Vec<u8>) {
        for value in self {
            value.save_bytes(out);
        }
    }

    fn load_bytes(&mut self, bytes: &[u8]) {
        load_sequence(self.iter_mut(), bytes);
    }
}

fn load_sequence<'v, T: StateValue + 'v>(values: impl Iterator<Item = &'v mut T>, bytes: &[u8]) {
    let mut pos = 0;
    for value in values {
        let size = value.state_size();
        let Some(chunk) = bytes.get(pos..pos + size) else {
            return;
        };
        value.load_bytes(chunk);
        pos += size;
    }
}

/// One registered item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemDesc {
    pub name: String,
    pub size: usize,
    pub elements: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum VisitFault {
    Duplicate(String),
    Mismatch { expected: String, found: String },
    Corrupt(String),
}

impl From<VisitFault> for SaveStateError {
    fn from(fault: VisitFault) -> Self {
        match fault {
            VisitFault::Duplicate(name) => SaveStateError::ItemMismatch {
                expected: "unique item".into(),
                found: name,
            },
            VisitFault::Mismatch { expected, found } => {
                SaveStateError::ItemMismatch { expected, found }
            }
            VisitFault::Corrupt(name) => SaveStateError::Corrupt(name),
        }
    }
}

pub(crate) enum Pass<'a> {
    Register {
        items: &'a mut Vec<ItemDesc>,
        names: &'a mut HashSet<String>,
    },
    Save {
        items: &'a [ItemDesc],
        next: usize,
        out: &'a mut Vec<u8>,
    },
    Load {
        items: &'a [ItemDesc],
        next: usize,
        input: &'a [u8],
        pos: usize,
    },
}

/// Walks the persistent state of every device in a fixed order.
pub struct StateVisitor<'a> {
    owner: String,
    pass: Pass<'a>,
    fault: Option<VisitFault>,
}

impl<'a> StateVisitor<'a> {
    pub(crate) fn new(pass: Pass<'a>) -> Self {
        Self {
            owner: String::new(),
            pass,
            fault: None,
        }
    }

    pub(crate) fn set_owner(&mut self, tag: &str) {
        self.owner.clear();
        self.owner.push_str(tag);
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.pass, Pass::Load { .. })
    }

    /// Persist `value` under `name`, qualified by the visiting device's tag.
    pub fn item<T: StateValue + ?Sized>(&mut self, name: &str, value: &mut T) {
        if self.fault.is_some() {
            return;
        }
        let qualified = format!("{}.{}", self.owner, name);
        let size = value.state_size();
        match &mut self.pass {
            Pass::Register { items, names } => {
                if !names.insert(qualified.clone()) {
                    self.fault = Some(VisitFault::Duplicate(qualified));
                    return;
                }
                items.push(ItemDesc {
                    name: qualified,
                    size,
                    elements: value.elements(),
                });
            }
            Pass::Save { items, next, out } => match items.get(*next) {
                Some(desc) if desc.name == qualified && desc.size == size => {
                    value.save_bytes(out);
                    *next += 1;
                }
                other => {
                    self.fault = Some(VisitFault::Mismatch {
                        expected: other.map_or_else(|| "<end>".to_string(), |d| d.name.clone()),
                        found: qualified,
                    });
                }
            },
            Pass::Load {
                items,
                next,
                input,
                pos,
            } => match items.get(*next) {
                Some(desc) if desc.name == qualified && desc.size == size => {
                    let Some(bytes) = input.get(*pos..*pos + size) else {
                        self.fault = Some(VisitFault::Corrupt(qualified));
                        return;
                    };
                    value.load_bytes(bytes);
                    *pos += size;
                    *next += 1;
                }
                other => {
                    self.fault = Some(VisitFault::Mismatch {
                        expected: other.map_or_else(|| "<end>".to_string(), |d| d.name.clone()),
                        found: qualified,
                    });
                }
            },
        }
    }

    /// Mark a loaded item as unusable; the load will be rolled back.
    pub fn reject(&mut self, name: &str) {
        if self.fault.is_none() {
            self.fault = Some(VisitFault::Corrupt(format!("{}.{}", self.owner, name)));
        }
    }

    /// Close the visit, checking that every registered item was seen.
    pub(crate) fn finish(self) -> Result<(), VisitFault> {
        if let Some(fault) = self.fault {
            return Err(fault);
        }
        match self.pass {
            Pass::Register { .. } => Ok(()),
            Pass::Save { items, next, .. } | Pass::Load { items, next, .. } => {
                match items.get(next) {
                    Some(desc) => Err(VisitFault::Mismatch {
                        expected: desc.name.clone(),
                        found: "<end>".into(),
                    }),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Fixed stream header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateHeader {
    pub version: u16,
    pub identity: u64,
    pub item_count: u32,
    pub payload_len: u64,
}

impl StateHeader {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut raw = [0u8; HEADER_LEN];
        raw[0..4].copy_from_slice(&MAGIC);
        raw[4..6].copy_from_slice(&self.version.to_le_bytes());
        raw[6..14].copy_from_slice(&self.identity.to_le_bytes());
        raw[14..18].copy_from_slice(&self.item_count.to_le_bytes());
        raw[18..26].copy_from_slice(&self.payload_len.to_le_bytes());
        writer.write_all(&raw)
    }

    /// Read and check the magic. Everything else is checked by the machine.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, SaveStateError> {
        let mut raw = [0u8; HEADER_LEN];
        reader.read_exact(&mut raw)?;
        if raw[0..4] != MAGIC {
            return Err(SaveStateError::BadMagic);
        }
        let mut version = 0u16;
        let mut identity = 0u64;
        let mut item_count = 0u32;
        let mut payload_len = 0u64;
        version.load_bytes(&raw[4..6]);
        identity.load_bytes(&raw[6..14]);
        item_count.load_bytes(&raw[14..18]);
        payload_len.load_bytes(&raw[18..26]);
        Ok(Self {
            version,
            identity,
            item_count,
            payload_len,
        })
    }
}

/// The sealed list of items a machine persists.
#[derive(Debug, Default)]
pub struct SaveStateRegistry {
    items: Vec<ItemDesc>,
    identity: u64,
    payload_len: usize,
    sealed: bool,
}

impl SaveStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seal(&mut self, machine: &str, items: Vec<ItemDesc>) {
        let mut key = Vec::with_capacity(64 + items.len() * 32);
        key.extend_from_slice(machine.as_bytes());
        key.push(0);
        for item in &items {
            key.extend_from_slice(item.name.as_bytes());
            key.push(0);
            key.extend_from_slice(&(item.size as u64).to_le_bytes());
            key.extend_from_slice(&(item.elements as u64).to_le_bytes());
        }
        self.identity = xxh3_64(&key);
        self.payload_len = items.iter().map(|i| i.size).sum();
        self.items = items;
        self.sealed = true;
        log::debug!(
            "save state sealed: {} items, {} bytes, identity {:#018x}",
            self.items.len(),
            self.payload_len,
            self.identity
        );
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn items(&self) -> &[ItemDesc] {
        &self.items
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn header(&self) -> StateHeader {
        StateHeader {
            version: VERSION,
            identity: self.identity,
            item_count: self.items.len() as u32,
            payload_len: self.payload_len as u64,
        }
    }

    /// Check a foreign header against this machine.
    pub fn validate(&self, header: &StateHeader) -> Result<(), SaveStateError> {
        if header.version != VERSION {
            return Err(SaveStateError::UnsupportedVersion(header.version));
        }
        if header.identity != self.identity {
            return Err(SaveStateError::IdentityMismatch {
                expected: self.identity,
                found: header.identity,
            });
        }
        if header.item_count as usize != self.items.len() {
            return Err(SaveStateError::ItemCountMismatch {
                expected: self.items.len() as u32,
                found: header.item_count,
            });
        }
        if header.payload_len != self.payload_len as u64 {
            return Err(SaveStateError::PayloadLengthMismatch {
                expected: self.payload_len as u64,
                found: header.payload_len,
            });
        }
        Ok(())
    }
}
