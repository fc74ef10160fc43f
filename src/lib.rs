// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chipframe emulation core
//!
//! A device tree, address-space dispatch with mirrors, banks and bus-width
//! adaptation, a deterministic scheduler of timers and executors, and a
//! save-state manager. Concrete chips live in [`devices`].

pub mod config;
pub mod core;
pub mod device;
pub mod devices;
pub mod diag;
mod dispatch;
pub mod error;
pub mod machine;
pub mod scheduler;
pub mod state;
pub mod tree;

// Re-export commonly used types
pub use config::{DeviceRegistry, MachineConfig, MapDecl, MapTarget};
pub use core::{AccessWidth, Endianness, SpaceConfig, SpaceId, TimeValue};
pub use device::{Device, DeviceBuilder, DeviceConfig, DeviceContext, Executor};
pub use error::{ConfigError, SaveStateError};
pub use machine::{Machine, Phase};
pub use scheduler::{ExecState, LineId, SuspendReason, TimerId};
pub use tree::{DeviceFinder, DeviceId};
