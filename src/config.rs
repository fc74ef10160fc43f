// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Machine descriptions and the device-kind registry.
//!
//! A [`MachineConfig`] is plain data: devices, memory, address maps and line
//! wiring. It can be built in code or, with the `serde-spec` feature, loaded
//! from YAML or JSON. [`Machine::build`](crate::machine::Machine::build)
//! turns it into a running machine.

use std::collections::HashMap;

use crate::core::bus::{Access, Lanes, SpaceConfig};
use crate::core::memory::{AccessWidth, MemoryRegion};
use crate::core::time::TimeValue;
use crate::device::{Device, DeviceBuilder, DeviceConfig};
use crate::devices::cpu::ScriptedCpu;
use crate::devices::riot::Riot6532;
use crate::error::ConfigError;

/// Scheduling quantum used when a description does not set one.
pub const DEFAULT_QUANTUM_NS: u64 = 100_000;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
pub struct MachineConfig {
    pub name: String,
    /// Longest stretch an executor may run ahead of the others, in ns.
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub quantum_ns: Option<u64>,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub devices: Vec<DeviceDecl>,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub regions: Vec<RegionDecl>,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub banks: Vec<BankDecl>,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub spaces: Vec<SpaceDecl>,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub maps: Vec<MapDecl>,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub lines: Vec<LineDecl>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceDecl {
    /// Full tag; the parent must be declared earlier.
    pub tag: String,
    pub kind: String,
    #[cfg_attr(feature = "serde-spec", serde(flatten))]
    pub config: DeviceConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionDecl {
    pub name: String,
    pub size: usize,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub rom: bool,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub fill: u8,
    /// Initial contents, copied to the start of the region.
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub data: Vec<u8>,
}

impl RegionDecl {
    pub fn to_region(&self) -> MemoryRegion {
        let mut bytes = vec![self.fill; self.size];
        let len = self.data.len().min(self.size);
        bytes[..len].copy_from_slice(&self.data[..len]);
        if self.rom {
            MemoryRegion::rom(self.name.clone(), bytes)
        } else {
            let mut region = MemoryRegion::ram(self.name.clone(), self.size, self.fill);
            region.as_mut_slice().copy_from_slice(&bytes);
            region
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
pub struct BankDecl {
    pub name: String,
    pub region: String,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub base: usize,
    pub count: usize,
    pub stride: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
pub struct SpaceDecl {
    /// Owning device tag.
    pub device: String,
    #[cfg_attr(feature = "serde-spec", serde(flatten))]
    pub space: SpaceConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-spec", serde(rename_all = "lowercase"))]
pub enum MapTarget {
    Ram(String),
    Rom(String),
    Bank(String),
    Device {
        /// Resolved like a finder path, relative to the space owner.
        tag: String,
        #[cfg_attr(feature = "serde-spec", serde(default))]
        map: u32,
        #[cfg_attr(feature = "serde-spec", serde(default))]
        width: AccessWidth,
    },
    Nop(u64),
    Unmapped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
pub struct MapDecl {
    /// Tag of the device owning the space.
    pub device: String,
    pub space: String,
    pub start: u64,
    pub end: u64,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub mirror: u64,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub access: Access,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub lanes: Option<Lanes>,
    #[cfg_attr(feature = "serde-spec", serde(default))]
    pub region_offset: u64,
    pub target: MapTarget,
}

impl MapDecl {
    pub fn new(device: &str, space: &str, start: u64, end: u64, target: MapTarget) -> Self {
        Self {
            device: device.to_string(),
            space: space.to_string(),
            start,
            end,
            mirror: 0,
            access: Access::ReadWrite,
            lanes: None,
            region_offset: 0,
            target,
        }
    }

    pub fn mirror(mut self, mirror: u64) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn lanes(mut self, stride: u8, lane: u8) -> Self {
        self.lanes = Some(Lanes { stride, lane });
        self
    }

    pub fn region_offset(mut self, offset: u64) -> Self {
        self.region_offset = offset;
        self
    }
}

/// Wire `source`'s output line to input `input` of executor `target`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-spec", derive(serde::Serialize, serde::Deserialize))]
pub struct LineDecl {
    pub source: String,
    pub output: String,
    pub target: String,
    pub input: u8,
}

impl MachineConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    #[cfg(feature = "serde-spec")]
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    #[cfg(feature = "serde-spec")]
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn quantum(&self) -> TimeValue {
        TimeValue::from_nsec(self.quantum_ns.unwrap_or(DEFAULT_QUANTUM_NS))
    }

    pub fn with_quantum_ns(mut self, ns: u64) -> Self {
        self.quantum_ns = Some(ns);
        self
    }

    pub fn device(mut self, tag: &str, kind: &str, config: DeviceConfig) -> Self {
        self.devices.push(DeviceDecl {
            tag: tag.to_string(),
            kind: kind.to_string(),
            config,
        });
        self
    }

    pub fn ram(mut self, name: &str, size: usize) -> Self {
        self.regions.push(RegionDecl {
            name: name.to_string(),
            size,
            rom: false,
            fill: 0,
            data: Vec::new(),
        });
        self
    }

    pub fn rom(mut self, name: &str, data: Vec<u8>) -> Self {
        self.regions.push(RegionDecl {
            name: name.to_string(),
            size: data.len(),
            rom: true,
            fill: 0,
            data,
        });
        self
    }

    pub fn bank(
        mut self,
        name: &str,
        region: &str,
        base: usize,
        count: usize,
        stride: usize,
    ) -> Self {
        self.banks.push(BankDecl {
            name: name.to_string(),
            region: region.to_string(),
            base,
            count,
            stride,
        });
        self
    }

    pub fn space(mut self, device: &str, space: SpaceConfig) -> Self {
        self.spaces.push(SpaceDecl {
            device: device.to_string(),
            space,
        });
        self
    }

    pub fn map(mut self, decl: MapDecl) -> Self {
        self.maps.push(decl);
        self
    }

    pub fn line(mut self, source: &str, output: &str, target: &str, input: u8) -> Self {
        self.lines.push(LineDecl {
            source: source.to_string(),
            output: output.to_string(),
            target: target.to_string(),
            input,
        });
        self
    }
}

pub type DeviceFactory =
    Box<dyn Fn(&mut DeviceBuilder<'_>) -> Result<Box<dyn Device>, ConfigError>>;

/// Maps device kind names to factories.
#[derive(Default)]
pub struct DeviceRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the bundled device kinds.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Riot6532::KIND, |b| Ok(Box::new(Riot6532::new(b)?)));
        registry.register(ScriptedCpu::KIND, |b| Ok(Box::new(ScriptedCpu::new(b, Vec::new())?)));
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&mut DeviceBuilder<'_>) -> Result<Box<dyn Device>, ConfigError> + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    pub fn get(&self, kind: &str) -> Option<&DeviceFactory> {
        self.factories.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
