// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Time, memory regions and address-space maps.

pub mod bus;
pub mod memory;
pub mod time;

pub use bus::{Access, AddressSpace, HandlerKind, Lanes, MapEntry, Route, SpaceConfig, SpaceId};
pub use memory::{AccessWidth, Bank, BankId, Endianness, Memory, MemoryRegion, RegionId, RegionKind};
pub use time::TimeValue;
