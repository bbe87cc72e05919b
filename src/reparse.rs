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

//! Reparse-point chain resolution.
//!
//! A tool that opens a symbolic link transitively reads every link target in
//! the chain. Treating only the final path as an access would under-report
//! build inputs and cause incorrect incremental builds, so [`resolve_chain`]
//! expands a reparse-point path into the ordered list of paths that must each
//! be policy-checked. Each chain element is derived from its predecessor by
//! exactly one reparse-point replacement, so intermediate locations (which
//! the OS traverses, and which the build engine therefore depends on) appear
//! in the chain in their own right.
//!
//! The subtle part is a reparse point with a *relative* target: the target is
//! interpreted relative to the link's location, and what "location" means
//! depends on how the prefix was reached. A directory symlink in the prefix
//! must first be substituted with its own target (that is what the OS does
//! during traversal), but a mount point / junction is left intact (relative
//! targets resolve against the junction's mount-point path, not its target).
//! Getting this wrong produces spurious accesses -- or misses real ones --
//! depending on filesystem layout.

use crate::{
    check::FileReadContext,
    error::{Error, ErrorImpl},
    path::{CanonicalPath, PathStyle},
};

use itertools::Itertools;

/// Maximum number of reparse-point traversals before resolution fails.
///
/// Cycles manifest as depth overflow, so no separate cycle detection is
/// needed.
pub const MAX_REPARSE_TRAVERSALS: usize = 64;

/// The kind of an actionable reparse point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReparseKind {
    /// A symbolic link (file or directory).
    Symlink,
    /// A mount point / junction.
    MountPoint,
}

/// The filesystem facts the core needs from the OS, supplied by the hook
/// layer.
///
/// Calls through this trait may block on the OS; the core never holds a lock
/// across them.
pub trait SandboxFs: Send + Sync {
    /// Classify the reparse point at `path`, if there is one. `None` means
    /// the path is not an actionable reparse point (or does not exist).
    fn reparse_kind(&self, path: &CanonicalPath) -> Option<ReparseKind>;

    /// Read the raw target of the reparse point at `path`.
    ///
    /// `Ok(None)` means the target is unreadable in a benign way (the chain
    /// simply ends there); `Err` means the read failed hard and the path must
    /// be treated as policy-indeterminate.
    fn read_reparse_target(&self, path: &CanonicalPath) -> Result<Option<String>, Error>;

    /// Observe the existence facts for `path`.
    fn probe(&self, path: &CanonicalPath) -> FileReadContext;
}

fn depth_exceeded(path: &CanonicalPath) -> Error {
    ErrorImpl::ReparseResolutionFailed {
        path: path.as_str().to_string().into(),
        description: format!("more than {MAX_REPARSE_TRAVERSALS} reparse-point traversals").into(),
    }
    .into()
}

/// Whether a reparse target is absolute for the given path style.
fn target_is_absolute(style: PathStyle, target: &str) -> bool {
    match style {
        PathStyle::Posix => target.starts_with('/'),
        PathStyle::Windows => {
            let bytes = target.as_bytes();
            target.starts_with('\\')
                || target.starts_with('/')
                || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
        }
    }
}

/// The outcome of one prefix-substitution attempt.
enum PrefixStep {
    /// A directory symlink in the prefix was substituted with its target;
    /// the returned path still ends in the original final component.
    Stepped(CanonicalPath),
    /// The prefix contains no directory symlinks (junctions are deliberately
    /// left intact); the path is ready for target splicing.
    Stable,
    /// The prefix cannot be resolved (unreadable or escaping target); the
    /// chain ends at the current path.
    Stuck,
}

/// Substitute the *first* directory-symlink component of `path`'s prefix
/// with its target, leaving everything after it verbatim.
///
/// One call performs at most one replacement; [`resolve_chain`]'s outer loop
/// re-walks the result, so nested prefix links are unwound one chain element
/// at a time and the traversal limit bounds the total work.
fn resolve_prefix_once(fs: &dyn SandboxFs, path: &CanonicalPath) -> Result<PrefixStep, Error> {
    let components: Vec<&str> = path.components().collect();
    let mut current = path.root();

    for (idx, part) in components.iter().enumerate() {
        if idx == components.len() - 1 {
            // The final component is the reparse point the caller is about
            // to replace; it is not part of the prefix.
            return Ok(PrefixStep::Stable);
        }

        let next = match current.extend(part) {
            Ok(next) => next,
            Err(_) => return Ok(PrefixStep::Stuck),
        };

        match fs.reparse_kind(&next) {
            Some(ReparseKind::Symlink) => {
                let target = match fs.read_reparse_target(&next)? {
                    Some(target) => target,
                    None => return Ok(PrefixStep::Stuck),
                };

                let substituted = if target_is_absolute(path.style(), &target) {
                    match CanonicalPath::canonicalize(&target) {
                        Ok(target) => target,
                        Err(_) => return Ok(PrefixStep::Stuck),
                    }
                } else {
                    // A directory symlink's relative target resolves against
                    // the symlink's parent, which is exactly `current`.
                    match current.extend(&target) {
                        Ok(target) => target,
                        Err(_) => return Ok(PrefixStep::Stuck),
                    }
                };

                // Re-attach the untouched remainder of the original path.
                let mut result = substituted;
                for rest in &components[idx + 1..] {
                    result = match result.extend(rest) {
                        Ok(result) => result,
                        Err(_) => return Ok(PrefixStep::Stuck),
                    };
                }
                return Ok(PrefixStep::Stepped(result));
            }
            // Mount points resolve relative targets against their
            // mount-point path, so the prefix is deliberately left intact.
            // Ordinary directories need no substitution either.
            Some(ReparseKind::MountPoint) | None => current = next,
        }
    }

    Ok(PrefixStep::Stable)
}

/// Compute the next path in a reparse chain.
///
/// Returns `None` when the chain ends at `path` (target unreadable or not
/// resolvable).
fn next_path(fs: &dyn SandboxFs, path: &CanonicalPath) -> Result<Option<CanonicalPath>, Error> {
    let target = match fs.read_reparse_target(path)? {
        Some(target) => target,
        None => return Ok(None),
    };

    if target_is_absolute(path.style(), &target) {
        return Ok(CanonicalPath::canonicalize(&target).ok());
    }

    // Relative target. If the prefix traverses a directory symlink, that
    // substitution is its own chain step -- the reparse point at the
    // substituted location is re-read on the next iteration.
    match resolve_prefix_once(fs, path)? {
        PrefixStep::Stepped(stepped) => Ok(Some(stepped)),
        PrefixStep::Stuck => Ok(None),
        PrefixStep::Stable => {
            // Splice the target over the final component and re-canonicalize.
            let parent = match path.parent() {
                Some(parent) => parent,
                None => return Ok(None),
            };
            Ok(parent.extend(&target).ok())
        }
    }
}

/// Expand a reparse-point path into the ordered chain of paths a traversal
/// of it touches.
///
/// The returned list begins with `start` and ends with the final path that
/// names a non-reparse-point file (or the first path whose target cannot be
/// read). Each element is canonical, and each successor is derived from its
/// predecessor by exactly one reparse-point replacement. Every element must
/// be policy-checked by the caller; reporting only the final path would
/// under-report the build's dynamic inputs.
pub fn resolve_chain(
    fs: &dyn SandboxFs,
    start: &CanonicalPath,
) -> Result<Vec<CanonicalPath>, Error> {
    let mut chain = vec![start.clone()];
    let mut current = start.clone();

    for _ in 0..MAX_REPARSE_TRAVERSALS {
        if fs.reparse_kind(&current).is_none() {
            return Ok(chain);
        }
        match next_path(fs, &current)? {
            Some(next) => {
                chain.push(next.clone());
                current = next;
            }
            None => return Ok(chain),
        }
    }

    Err(depth_exceeded(start))
}

/// Render a chain for tracing.
pub(crate) fn describe_chain(chain: &[CanonicalPath]) -> String {
    chain.iter().map(CanonicalPath::as_str).join(" -> ")
}
