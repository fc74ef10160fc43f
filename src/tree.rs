// Copyright (C) 2025 Dayton Fishell
// Chipframe Emulation Core
// This file is part of Chipframe.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device tree: hierarchical tags, finders and start ordering.
//!
//! Nodes live in an arena indexed by [`DeviceId`]. The root is tagged `:` and
//! every other node is `parent:name` (`:cpu`, `:card:uart`). A device's
//! behavior is taken out of its node while it runs, so a node without a
//! behavior is either still being built or currently dispatching.

use std::collections::BTreeSet;

use crate::device::{Device, DeviceConfig};
use crate::diag::{Diagnostics, Notice};
use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) usize);

impl DeviceId {
    pub const ROOT: DeviceId = DeviceId(0);
}

/// Handle to a declared device reference, resolved before start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceFinder(pub(crate) usize);

pub(crate) struct DeviceNode {
    pub(crate) name: String,
    pub(crate) tag: String,
    pub(crate) kind: String,
    pub(crate) parent: Option<DeviceId>,
    pub(crate) children: Vec<DeviceId>,
    pub(crate) config: DeviceConfig,
    pub(crate) behavior: Option<Box<dyn Device>>,
    pub(crate) started: bool,
}

struct FinderSlot {
    requester: DeviceId,
    path: String,
    required: bool,
    target: Option<DeviceId>,
}

pub struct DeviceTree {
    nodes: Vec<DeviceNode>,
    finders: Vec<FinderSlot>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Split `:card:uart` into (`:card`, `uart`). Bare names hang off the root.
pub(crate) fn split_tag(tag: &str) -> Option<(&str, &str)> {
    let trimmed = tag.strip_prefix(':').unwrap_or(tag);
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind(':') {
        Some(pos) => Some((&tag[..tag.len() - trimmed.len() + pos], &trimmed[pos + 1..])),
        None => Some((":", trimmed)),
    }
}

impl DeviceTree {
    pub(crate) fn new(root: Box<dyn Device>) -> Self {
        Self {
            nodes: vec![DeviceNode {
                name: String::new(),
                tag: ":".to_string(),
                kind: root.kind().to_string(),
                parent: None,
                children: Vec::new(),
                config: DeviceConfig::default(),
                behavior: Some(root),
                started: false,
            }],
            finders: Vec::new(),
        }
    }

    /// Add a node without behavior; the factory fills it in afterwards.
    pub(crate) fn add(
        &mut self,
        parent: DeviceId,
        name: &str,
        kind: &str,
        config: DeviceConfig,
    ) -> Result<DeviceId, ConfigError> {
        let parent_tag = &self.nodes[parent.0].tag;
        let tag = if parent == DeviceId::ROOT {
            format!(":{name}")
        } else {
            format!("{parent_tag}:{name}")
        };
        if !valid_name(name) {
            return Err(ConfigError::InvalidTag { tag });
        }
        if self.child(parent, name).is_some() {
            return Err(ConfigError::DuplicateTag { tag });
        }
        let id = DeviceId(self.nodes.len());
        log::debug!("device {tag} ({kind})");
        self.nodes.push(DeviceNode {
            name: name.to_string(),
            tag,
            kind: kind.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            config,
            behavior: None,
            started: false,
        });
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    pub(crate) fn set_behavior(&mut self, id: DeviceId, behavior: Box<dyn Device>) {
        self.nodes[id.0].behavior = Some(behavior);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = DeviceId> {
        (0..self.nodes.len()).map(DeviceId)
    }

    pub fn tag(&self, id: DeviceId) -> &str {
        &self.nodes[id.0].tag
    }

    pub fn name(&self, id: DeviceId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn kind(&self, id: DeviceId) -> &str {
        &self.nodes[id.0].kind
    }

    pub fn parent(&self, id: DeviceId) -> Option<DeviceId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: DeviceId) -> &[DeviceId] {
        &self.nodes[id.0].children
    }

    pub fn config(&self, id: DeviceId) -> &DeviceConfig {
        &self.nodes[id.0].config
    }

    pub fn is_started(&self, id: DeviceId) -> bool {
        self.nodes[id.0].started
    }

    pub(crate) fn set_started(&mut self, id: DeviceId, started: bool) {
        self.nodes[id.0].started = started;
    }

    fn child(&self, parent: DeviceId, name: &str) -> Option<DeviceId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|c| self.nodes[c.0].name == name)
    }

    fn descend(&self, mut base: DeviceId, rest: &str) -> Option<DeviceId> {
        if rest.is_empty() {
            return Some(base);
        }
        for segment in rest.split(':') {
            base = self.child(base, segment)?;
        }
        Some(base)
    }

    /// Look up an absolute tag. Bare tags are taken relative to the root.
    pub fn find(&self, tag: &str) -> Option<DeviceId> {
        self.resolve_path(DeviceId::ROOT, tag)
    }

    /// Resolve a finder path from `from`.
    ///
    /// `:a:b` is absolute, `^x` climbs one level per `^` before descending,
    /// and a bare `x` is tried against the requester's children, then each
    /// ancestor's children up to the root.
    pub fn resolve_path(&self, from: DeviceId, path: &str) -> Option<DeviceId> {
        if let Some(rest) = path.strip_prefix(':') {
            return self.descend(DeviceId::ROOT, rest);
        }
        let ups = path.chars().take_while(|&c| c == '^').count();
        let rest = &path[ups..];
        if ups > 0 {
            let mut base = from;
            for _ in 0..ups {
                base = self.nodes[base.0].parent?;
            }
            return self.descend(base, rest);
        }
        if rest.is_empty() {
            return None;
        }
        let mut base = Some(from);
        while let Some(b) = base {
            if let Some(found) = self.descend(b, rest) {
                return Some(found);
            }
            base = self.nodes[b.0].parent;
        }
        None
    }

    pub(crate) fn declare_finder(
        &mut self,
        requester: DeviceId,
        path: &str,
        required: bool,
    ) -> DeviceFinder {
        self.finders.push(FinderSlot {
            requester,
            path: path.to_string(),
            required,
            target: None,
        });
        DeviceFinder(self.finders.len() - 1)
    }

    pub fn finder_target(&self, finder: DeviceFinder) -> Option<DeviceId> {
        self.finders.get(finder.0).and_then(|f| f.target)
    }

    /// Bind every declared finder. A missing required target fails the build.
    pub(crate) fn resolve_all(&mut self, diag: &mut Diagnostics) -> Result<(), ConfigError> {
        for i in 0..self.finders.len() {
            let (requester, target) = {
                let slot = &self.finders[i];
                (slot.requester, self.resolve_path(slot.requester, &slot.path))
            };
            self.finders[i].target = target;
            if target.is_some() {
                continue;
            }
            let slot = &self.finders[i];
            let requester_tag = self.nodes[requester.0].tag.clone();
            if slot.required {
                return Err(ConfigError::MissingRequired {
                    requester: requester_tag,
                    path: slot.path.clone(),
                });
            }
            diag.report(Notice::UnresolvedOptional {
                requester: requester_tag,
                path: slot.path.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn preorder(&self) -> Vec<DeviceId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![DeviceId::ROOT];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        order
    }

    /// Start order: every bound finder target before its requester, ties
    /// broken by tree pre-order. Devices caught in a reference cycle fall
    /// back to pre-order and are reported.
    pub(crate) fn start_order(&self, diag: &mut Diagnostics) -> Vec<DeviceId> {
        let preorder = self.preorder();
        let mut rank = vec![0usize; self.nodes.len()];
        for (pos, id) in preorder.iter().enumerate() {
            rank[id.0] = pos;
        }
        let mut indegree = vec![0usize; self.nodes.len()];
        let mut edges: Vec<Vec<DeviceId>> = vec![Vec::new(); self.nodes.len()];
        for slot in &self.finders {
            if let Some(target) = slot.target {
                if target != slot.requester {
                    edges[target.0].push(slot.requester);
                    indegree[slot.requester.0] += 1;
                }
            }
        }

        let mut ready: BTreeSet<(usize, DeviceId)> = preorder
            .iter()
            .filter(|id| indegree[id.0] == 0)
            .map(|&id| (rank[id.0], id))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some((_, id)) = ready.pop_first() {
            order.push(id);
            for &next in &edges[id.0] {
                indegree[next.0] -= 1;
                if indegree[next.0] == 0 {
                    ready.insert((rank[next.0], next));
                }
            }
        }

        if order.len() < self.nodes.len() {
            let stuck: Vec<DeviceId> = preorder
                .iter()
                .copied()
                .filter(|id| indegree[id.0] > 0)
                .collect();
            diag.report(Notice::FinderCycle {
                devices: stuck.iter().map(|id| self.nodes[id.0].tag.clone()).collect(),
            });
            order.extend(stuck);
        }
        order
    }

    pub(crate) fn take(&mut self, id: DeviceId) -> Option<Box<dyn Device>> {
        self.nodes.get_mut(id.0)?.behavior.take()
    }

    pub(crate) fn restore(&mut self, id: DeviceId, behavior: Box<dyn Device>) {
        self.nodes[id.0].behavior = Some(behavior);
    }

    pub(crate) fn behavior(&self, id: DeviceId) -> Option<&dyn Device> {
        self.nodes.get(id.0)?.behavior.as_deref()
    }

    pub(crate) fn behavior_mut(&mut self, id: DeviceId) -> Option<&mut (dyn Device + 'static)> {
        self.nodes.get_mut(id.0)?.behavior.as_deref_mut()
    }
}
