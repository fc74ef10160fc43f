// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Diagnostics channel for non-fatal notices.
//!
//! Every notice is forwarded to the `log` facade and kept in an append-only
//! journal. Unmapped accesses are reported once per distinct (space, address,
//! direction) per session; repeats are only counted.

use std::collections::HashSet;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    UnmappedRead {
        space: String,
        address: u64,
    },
    UnmappedWrite {
        space: String,
        address: u64,
        value: u64,
    },
    UnresolvedOptional {
        requester: String,
        path: String,
    },
    ReentrantAccess {
        device: String,
    },
    FinderCycle {
        devices: Vec<String>,
    },
    SchedulerViolation {
        device: String,
        detail: String,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::UnmappedRead { space, address } => {
                write!(f, "{space}: unmapped read from {address:#x}")
            }
            Notice::UnmappedWrite {
                space,
                address,
                value,
            } => write!(f, "{space}: unmapped write of {value:#x} to {address:#x}"),
            Notice::UnresolvedOptional { requester, path } => {
                write!(f, "{requester}: optional device `{path}` not present")
            }
            Notice::ReentrantAccess { device } => {
                write!(f, "{device}: access re-entered a device that is already dispatching")
            }
            Notice::FinderCycle { devices } => {
                write!(f, "device references form a cycle: {}", devices.join(", "))
            }
            Notice::SchedulerViolation { device, detail } => {
                write!(f, "{device}: scheduler invariant violated: {detail}")
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    journal: Vec<Notice>,
    seen: HashSet<(usize, u64, bool)>,
    reentrant: HashSet<String>,
    suppressed: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(&self) -> &[Notice] {
        &self.journal
    }

    /// Drain the journal, keeping the log-once bookkeeping.
    pub fn take_journal(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.journal)
    }

    /// Repeated unmapped accesses that were counted but not logged.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// Start a new session: previously reported addresses will be reported again.
    pub fn reset_session(&mut self) {
        self.seen.clear();
        self.reentrant.clear();
        self.suppressed = 0;
    }

    pub(crate) fn unmapped_read(&mut self, space_index: usize, space: &str, address: u64) {
        if self.seen.insert((space_index, address, false)) {
            self.report(Notice::UnmappedRead {
                space: space.to_string(),
                address,
            });
        } else {
            self.suppressed += 1;
        }
    }

    pub(crate) fn unmapped_write(
        &mut self,
        space_index: usize,
        space: &str,
        address: u64,
        value: u64,
    ) {
        if self.seen.insert((space_index, address, true)) {
            self.report(Notice::UnmappedWrite {
                space: space.to_string(),
                address,
                value,
            });
        } else {
            self.suppressed += 1;
        }
    }

    pub(crate) fn reentrant(&mut self, device: &str) {
        if self.reentrant.insert(device.to_string()) {
            self.report(Notice::ReentrantAccess {
                device: device.to_string(),
            });
        } else {
            self.suppressed += 1;
        }
    }

    pub(crate) fn report(&mut self, notice: Notice) {
        match &notice {
            Notice::UnmappedRead { .. } | Notice::UnmappedWrite { .. } => log::warn!("{notice}"),
            Notice::ReentrantAccess { .. } => log::warn!("{notice}"),
            Notice::UnresolvedOptional { .. } => log::debug!("{notice}"),
            Notice::FinderCycle { .. } => log::info!("{notice}"),
            Notice::SchedulerViolation { .. } => log::error!("{notice}"),
        }
        self.journal.push(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_accesses_reported_once_per_address() {
        let mut diag = Diagnostics::new();
        diag.unmapped_read(0, ":cpu:program", 0x1234);
        diag.unmapped_read(0, ":cpu:program", 0x1234);
        diag.unmapped_read(0, ":cpu:program", 0x1235);
        diag.unmapped_write(0, ":cpu:program", 0x1234, 0xAA);
        assert_eq!(diag.journal().len(), 3);
        assert_eq!(diag.suppressed(), 1);
    }

    #[test]
    fn reset_session_reports_again() {
        let mut diag = Diagnostics::new();
        diag.unmapped_read(1, ":io", 0x10);
        diag.take_journal();
        diag.unmapped_read(1, ":io", 0x10);
        assert!(diag.journal().is_empty());
        diag.reset_session();
        diag.unmapped_read(1, ":io", 0x10);
        assert_eq!(diag.journal().len(), 1);
    }

    #[test]
    fn notices_render_addresses_in_hex() {
        let notice = Notice::UnmappedWrite {
            space: ":cpu:program".into(),
            address: 0xFF00,
            value: 0x5A,
        };
        assert_eq!(notice.to_string(), ":cpu:program: unmapped write of 0x5a to 0xff00");
    }
}
