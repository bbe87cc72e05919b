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

//! sandfence is the access-mediation core of a build system's
//! process-isolation layer. The OS-specific hook glue (kernel callbacks on
//! macOS, API detouring on Windows) reports every file-system and
//! process-lifecycle operation of a sandboxed build tool here, and the core
//! decides -- against the build step's immutable manifest -- whether to
//! allow it, deny it, or record it as an observed access for the build
//! engine.
//!
//! The pieces, leaves first:
//!
//!  * [`path`] -- canonical path representation (device prefixes, `.`/`..`
//!    folding, per-style case rules).
//!  * [`manifest`] / [`policy`] -- the per-pip policy tree mapping path
//!    prefixes to allowed and reported accesses.
//!  * [`check`] -- the access-check engine combining policy, requested
//!    access and observed file facts into a decision.
//!  * [`reparse`] -- symlink/junction chain expansion, so that every
//!    intermediate link target is checked and reported (not just the final
//!    file).
//!  * [`registry`] -- the tracked process trees (roots, forks, execs,
//!    exits) and their per-tree report-dedup caches.
//!  * [`report`] / [`queue`] -- fixed-size report records and the bounded
//!    per-client queues they are delivered through.
//!  * [`Sandbox`] -- the dispatch surface tying it all together.
//!
//! # Example
//!
//! ```
//! use sandfence::{
//!     manifest::{AccessPolicy, Manifest, ManifestFlags, ManifestNode},
//!     path::{CanonicalPath, PathStyle},
//!     reparse::{ReparseKind, SandboxFs},
//!     check::FileReadContext,
//!     HookDecision, Sandbox, VnodeKind,
//! };
//!
//! // The hook layer supplies the OS facts; tests (and this example) can
//! // stub them out.
//! struct NoFs;
//! impl SandboxFs for NoFs {
//!     fn reparse_kind(&self, _: &CanonicalPath) -> Option<ReparseKind> {
//!         None
//!     }
//!     fn read_reparse_target(
//!         &self,
//!         _: &CanonicalPath,
//!     ) -> Result<Option<String>, sandfence::error::Error> {
//!         Ok(None)
//!     }
//!     fn probe(&self, _: &CanonicalPath) -> FileReadContext {
//!         FileReadContext::default()
//!     }
//! }
//!
//! let sandbox = Sandbox::new(Box::new(NoFs));
//! let _queues = sandbox.attach_client(1, 0, 1, None);
//!
//! // Grant writes under /out, then track a build step rooted at pid 42.
//! let mut manifest = Manifest::new(7, ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
//!     PathStyle::Posix, AccessPolicy::empty());
//! manifest.root = ManifestNode::new("", AccessPolicy::empty()).with_child(
//!     ManifestNode::new("out", AccessPolicy::ALLOW_WRITE | AccessPolicy::REPORT_ACCESS)
//!         .with_default_child_policy(AccessPolicy::ALLOW_WRITE | AccessPolicy::REPORT_ACCESS),
//! );
//! sandbox.track_root_process(1, 42, &manifest)?;
//!
//! assert_eq!(
//!     sandbox.on_vnode_create(42, "/out/a.bin", VnodeKind::File),
//!     HookDecision::Allow,
//! );
//! assert!(matches!(
//!     sandbox.on_vnode_create(42, "/src/a.c", VnodeKind::File),
//!     HookDecision::Deny(_),
//! ));
//! # Ok::<(), sandfence::error::Error>(())
//! ```

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(missing_debug_implementations)]

// Hook dispatch surface.
mod sandbox;
#[doc(inline)]
pub use sandbox::*;

pub mod check;
pub mod error;
pub mod manifest;
pub mod metadata;
pub mod path;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod reparse;
pub mod report;

// Library tests.
#[cfg(test)]
mod tests;
