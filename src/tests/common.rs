// SPDX-License-Identifier: MPL-2.0 OR LGPL-3.0-or-later
/*
 * sandfence: access mediation for build-process sandboxing
 * Copyright (C) 2019-2026 The sandfence authors
 *
 * == MPL-2.0 ==
 *
 *  This Source Code Form is subject to the terms of the Mozilla Public
 *  License, v. 2.0. If a copy of the MPL was not distributed with this
 *  file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Alternatively, this Source Code Form may also (at your option) be used
 * under the terms of the GNU Lesser General Public License Version 3, as
 * described below:
 *
 * == LGPL-3.0-or-later ==
 *
 *  This program is free software: you can redistribute it and/or modify it
 *  under the terms of the GNU Lesser General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or (at
 *  your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful, but
 *  WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY  or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General
 * Public License  for more details.
 *
 *  You should have received a copy of the GNU Lesser General Public License
 *  along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Shared test fixtures: an in-memory [`SandboxFs`] and manifest builders.

use crate::{
    check::{FileExistence, FileReadContext},
    error::Error,
    manifest::{AccessPolicy, Manifest, ManifestFlags, ManifestNode},
    path::{CanonicalPath, PathStyle},
    reparse::{ReparseKind, SandboxFs},
    report::Report,
};

use std::collections::{HashMap, HashSet};

use crossbeam_channel::Receiver;

#[derive(Debug, Clone)]
struct ReparseEntry {
    kind: ReparseKind,
    /// `None` simulates a reparse point whose target cannot be read.
    target: Option<String>,
}

/// An in-memory filesystem standing in for the hook layer's OS primitives.
///
/// Paths are keyed under the sandbox's own equality rules (case-folded for
/// Windows-style paths), so the mock behaves like the filesystems it stands
/// in for.
#[derive(Debug, Default)]
pub(crate) struct MockFs {
    reparse: HashMap<String, ReparseEntry>,
    files: HashSet<String>,
    dirs: HashSet<String>,
}

fn key(path: &str) -> String {
    CanonicalPath::canonicalize(path)
        .expect("mock filesystem paths must canonicalize")
        .fold_case()
}

impl MockFs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_file(mut self, path: &str) -> Self {
        self.files.insert(key(path));
        self
    }

    pub(crate) fn with_dir(mut self, path: &str) -> Self {
        self.dirs.insert(key(path));
        self
    }

    pub(crate) fn with_symlink(mut self, path: &str, target: &str) -> Self {
        self.reparse.insert(
            key(path),
            ReparseEntry {
                kind: ReparseKind::Symlink,
                target: Some(target.to_string()),
            },
        );
        self
    }

    pub(crate) fn with_junction(mut self, path: &str, target: &str) -> Self {
        self.reparse.insert(
            key(path),
            ReparseEntry {
                kind: ReparseKind::MountPoint,
                target: Some(target.to_string()),
            },
        );
        self
    }

    pub(crate) fn with_opaque_reparse_point(mut self, path: &str) -> Self {
        self.reparse.insert(
            key(path),
            ReparseEntry {
                kind: ReparseKind::Symlink,
                target: None,
            },
        );
        self
    }
}

impl SandboxFs for MockFs {
    fn reparse_kind(&self, path: &CanonicalPath) -> Option<ReparseKind> {
        self.reparse.get(&path.fold_case()).map(|entry| entry.kind)
    }

    fn read_reparse_target(&self, path: &CanonicalPath) -> Result<Option<String>, Error> {
        Ok(self
            .reparse
            .get(&path.fold_case())
            .and_then(|entry| entry.target.clone()))
    }

    fn probe(&self, path: &CanonicalPath) -> FileReadContext {
        let key = path.fold_case();
        let exists =
            self.files.contains(&key) || self.dirs.contains(&key) || self.reparse.contains_key(&key);
        FileReadContext::new(
            if exists {
                FileExistence::Existent
            } else {
                FileExistence::Nonexistent
            },
            self.dirs.contains(&key),
        )
    }
}

/// A POSIX-style manifest with the given children under the root.
pub(crate) fn posix_manifest(
    pip_id: u64,
    flags: ManifestFlags,
    children: Vec<ManifestNode>,
) -> Manifest {
    let mut manifest = Manifest::new(pip_id, flags, PathStyle::Posix, AccessPolicy::empty());
    let mut root = ManifestNode::new("", AccessPolicy::empty());
    root.children = children;
    manifest.root = root;
    manifest
}

/// A prefix node granting `policy` to the whole subtree.
pub(crate) fn subtree(name: &str, policy: AccessPolicy) -> ManifestNode {
    ManifestNode::new(name, policy).with_default_child_policy(policy)
}

/// Drain everything currently sitting in a report queue.
pub(crate) fn drain(rx: &Receiver<Report>) -> Vec<Report> {
    let mut out = Vec::new();
    while let Ok(report) = rx.try_recv() {
        out.push(report);
    }
    out
}
