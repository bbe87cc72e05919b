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

#![forbid(unsafe_code)]

//! The abstract file-access manifest.
//!
//! The wire format of the manifest and its parser live in the build engine;
//! what reaches this crate is the already-parsed structure below. A
//! [`Manifest`] describes, for a single build step (pip), which path prefixes
//! may be read, written or created, which accesses must be reported, and the
//! global behavior flags of the sandbox for that pip. It is compiled into a
//! [`PolicyTree`](crate::policy::PolicyTree) when the root process of the pip
//! is tracked, and is immutable from then on.

use crate::path::PathStyle;

use bitflags::bitflags;

bitflags! {
    /// Per-node access policy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessPolicy: u16 {
        /// Reads of an existing file under this prefix are allowed.
        const ALLOW_READ = 1 << 0;
        /// Writes under this prefix are allowed.
        const ALLOW_WRITE = 1 << 1;
        /// Reads are allowed if (and only if) the file does not exist. Used
        /// for anti-dependencies: probing for a header that must not exist.
        const ALLOW_READ_IF_NONEXISTENT = 1 << 2;
        /// Directory creation under this prefix is allowed.
        const ALLOW_CREATE_DIRECTORY = 1 << 3;
        /// Symbolic-link creation under this prefix is allowed.
        const ALLOW_SYMLINK_CREATION = 1 << 4;
        /// Accesses under this prefix are reported to the build engine.
        const REPORT_ACCESS = 1 << 5;
        /// Accesses are reported only when the file exists.
        const REPORT_ACCESS_IF_EXISTENT = 1 << 6;
        /// Accesses are reported only when the file does not exist.
        const REPORT_ACCESS_IF_NONEXISTENT = 1 << 7;
        /// Accesses under this prefix are entirely invisible to the engine.
        const UNTRACKED = 1 << 8;
    }
}

bitflags! {
    /// Per-node scope flags, inherited by every descendant path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScopeFlags: u8 {
        /// Directory enumerations under this scope are reported.
        const REPORT_DIRECTORY_ENUMERATION = 1 << 0;
        /// Attribute reads under this scope see real timestamps instead of
        /// the normalized input timestamp.
        const ALLOW_REAL_INPUT_TIMESTAMPS = 1 << 1;
        /// Read/write opens of read-only inputs under this scope are
        /// narrowed to read-only instead of denied.
        const FORCE_READ_ONLY_FOR_READ_WRITE = 1 << 2;
        /// Close-like events under this scope are drained on a worker thread.
        const USE_EXTRA_THREAD_TO_DRAIN = 1 << 3;
    }
}

bitflags! {
    /// Global behavior flags for one pip's sandbox.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ManifestFlags: u32 {
        /// Unexpected accesses are denied rather than merely reported.
        const FAIL_UNEXPECTED_ACCESSES = 1 << 0;
        /// Skip reparse-point chain resolution entirely.
        const IGNORE_REPARSE_POINTS = 1 << 1;
        /// Skip reparse-point chain resolution except for open-like
        /// operations.
        const IGNORE_NON_CREATE_FILE_REPARSE_POINTS = 1 << 2;
        /// Enable read-level checks in Nt-family hooks.
        const MONITOR_NT_CREATE_FILE = 1 << 3;
        /// Enable Zw-family hooks.
        const MONITOR_ZW_CREATE_OPEN_QUERY_FILE = 1 << 4;
        /// Do not mediate the rename sub-operation of set-information hooks.
        const IGNORE_ZW_RENAME_FILE_INFORMATION = 1 << 5;
        /// Do not mediate the link/disposition/mode/name sub-operations of
        /// set-information hooks.
        const IGNORE_ZW_OTHER_FILE_INFORMATION = 1 << 6;
        /// Narrow read+write requests against read-only policy to read-only
        /// instead of denying them.
        const FORCE_READ_ONLY_FOR_REQUESTED_READ_WRITE = 1 << 7;
        /// Attribute reads of input files always return the canonical "new
        /// input" timestamp.
        const NORMALIZE_READ_TIMESTAMPS = 1 << 8;
        /// Directory creation requires create-directory policy even when the
        /// directory already exists.
        const DIRECTORY_CREATION_ACCESS_ENFORCEMENT = 1 << 9;
        /// Upgrade every Ignore report level to Report.
        const REPORT_ANY_ACCESS = 1 << 10;
        /// Batch close-event processing off-thread.
        const USE_EXTRA_THREAD_TO_DRAIN_NT_CLOSE = 1 << 11;
        /// Disable all mediation for this pip (observation passthrough).
        const DISABLE_HOOKS = 1 << 12;
    }
}

/// One node of the manifest's path-prefix hierarchy.
///
/// Node names are single path components; the root node's name is ignored.
#[derive(Debug, Clone)]
pub struct ManifestNode {
    /// The path component this node matches.
    pub name: String,
    /// Policy for the path ending at this node.
    pub policy: AccessPolicy,
    /// Policy inherited by descendant paths that have no node of their own.
    /// When absent, unmatched descendants fall back to this node's `policy`.
    pub default_child_policy: Option<AccessPolicy>,
    /// Scope flags applying to this node and everything below it.
    pub scope: ScopeFlags,
    /// Child nodes, one per matched component name.
    pub children: Vec<ManifestNode>,
}

impl ManifestNode {
    /// A leaf node matching `name` with the given policy.
    pub fn new(name: impl Into<String>, policy: AccessPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            default_child_policy: None,
            scope: ScopeFlags::empty(),
            children: Vec::new(),
        }
    }

    /// Builder-style child attachment.
    pub fn with_child(mut self, child: ManifestNode) -> Self {
        self.children.push(child);
        self
    }

    /// Builder-style scope flags.
    pub fn with_scope(mut self, scope: ScopeFlags) -> Self {
        self.scope = scope;
        self
    }

    /// Builder-style default policy for unmatched descendants.
    pub fn with_default_child_policy(mut self, policy: AccessPolicy) -> Self {
        self.default_child_policy = Some(policy);
        self
    }
}

/// The parsed manifest for one pip, as handed over by the build engine.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Opaque identifier of the build step this manifest belongs to.
    pub pip_id: u64,
    /// Global sandbox behavior for this pip.
    pub flags: ManifestFlags,
    /// Path style the manifest's prefixes are written in. This decides
    /// whether tree lookups case-fold.
    pub style: PathStyle,
    /// Root of the prefix hierarchy. Its `name` is unused.
    pub root: ManifestNode,
}

impl Manifest {
    /// A manifest with an empty prefix hierarchy: nothing is allowed beyond
    /// what the root policy grants.
    pub fn new(pip_id: u64, flags: ManifestFlags, style: PathStyle, root_policy: AccessPolicy) -> Self {
        Self {
            pip_id,
            flags,
            style,
            root: ManifestNode::new("", root_policy),
        }
    }
}
