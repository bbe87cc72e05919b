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

//! The policy tree.
//!
//! A [`PolicyTree`] maps path prefixes to [`AccessPolicy`] values. It is
//! compiled once from a [`Manifest`] when the root process of a pip is
//! tracked and never mutated afterwards, so it can be shared by reference
//! across every process of the tree and across every hook thread.
//!
//! Lookup walks the tree component-by-component and never fails: a path with
//! no matching prefix returns the root cursor with `matched = false`, which
//! yields the manifest's minimally permissive default policy.

use crate::{
    error::{Error, ErrorImpl},
    manifest::{AccessPolicy, Manifest, ManifestFlags, ManifestNode, ScopeFlags},
    path::{CanonicalPath, PathStyle},
};

use std::collections::HashMap;

/// One node of the compiled tree.
#[derive(Debug)]
struct PolicyNode {
    policy: AccessPolicy,
    default_child_policy: Option<AccessPolicy>,
    scope: ScopeFlags,
    children: HashMap<String, PolicyNode>,
}

impl PolicyNode {
    fn compile(style: PathStyle, decl: &ManifestNode, is_root: bool) -> Result<Self, Error> {
        if !is_root {
            if decl.name.is_empty() {
                Err(ErrorImpl::ManifestInvalid {
                    description: "manifest node has an empty component name".into(),
                })?
            }
            // Root atoms like `\\srv\share` legitimately contain
            // backslashes; anything else with a separator is malformed.
            let embedded_separator = decl.name.contains('/')
                || (decl.name.contains('\\') && !decl.name.starts_with(r"\\"));
            if embedded_separator {
                Err(ErrorImpl::ManifestInvalid {
                    description: format!(
                        "manifest node name {:?} contains a path separator",
                        decl.name
                    )
                    .into(),
                })?
            }
        }

        let mut children = HashMap::with_capacity(decl.children.len());
        for child in &decl.children {
            let key = fold_component(style, &child.name);
            let node = Self::compile(style, child, false)?;
            if children.insert(key, node).is_some() {
                Err(ErrorImpl::ManifestInvalid {
                    description: format!(
                        "duplicate manifest node {:?} under one parent",
                        child.name
                    )
                    .into(),
                })?
            }
        }

        Ok(Self {
            policy: decl.policy,
            default_child_policy: decl.default_child_policy,
            scope: decl.scope,
            children,
        })
    }
}

fn fold_component(style: PathStyle, name: &str) -> String {
    match style {
        PathStyle::Posix => name.to_string(),
        PathStyle::Windows => name.to_ascii_lowercase(),
    }
}

/// The result of a policy-tree walk.
///
/// A cursor carries enough state to compute the effective policy for the
/// looked-up path without re-walking the tree: the policy of the deepest node
/// reached (or the inherited default for unmatched suffixes), the union of
/// scope flags along the matched prefix, and whether the full path matched a
/// node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySearchCursor {
    /// Effective access policy for the looked-up path.
    pub policy: AccessPolicy,
    /// Union of the scope flags of every matched ancestor.
    pub scope: ScopeFlags,
    /// Whether every component of the path was matched by a tree node.
    pub matched: bool,
    /// Number of components that were matched.
    pub depth: usize,
}

/// A compiled, immutable policy tree.
#[derive(Debug)]
pub struct PolicyTree {
    style: PathStyle,
    root: PolicyNode,
}

impl PolicyTree {
    /// Compile the prefix hierarchy of a manifest.
    ///
    /// Structural problems (empty component names, separators inside a name,
    /// duplicate siblings under the tree's case-folding) are
    /// [`ManifestInvalid`](crate::error::ErrorKind::ManifestInvalid) errors;
    /// the caller refuses the root process in that case.
    pub fn build(manifest: &Manifest) -> Result<Self, Error> {
        Ok(Self {
            style: manifest.style,
            root: PolicyNode::compile(manifest.style, &manifest.root, true)?,
        })
    }

    /// The path style this tree folds lookups with.
    pub fn style(&self) -> PathStyle {
        self.style
    }

    /// Walk the tree along `path`'s components.
    ///
    /// Windows-style paths contribute their root (`C:`, `\\srv\share`) as
    /// the first atom of the walk, since drives and shares carry distinct
    /// policy. Unmatched suffix atoms inherit the deepest matched node's
    /// scope flags plus its default-for-children policy (falling back to
    /// the node's own policy when no default is declared).
    pub fn lookup(&self, path: &CanonicalPath) -> PolicySearchCursor {
        let mut node = &self.root;
        let mut scope = self.root.scope;
        let mut depth = 0;
        let mut matched = true;

        for component in path.root_atom().into_iter().chain(path.components()) {
            let key = fold_component(self.style, component);
            match node.children.get(&key) {
                Some(child) => {
                    node = child;
                    scope |= child.scope;
                    depth += 1;
                }
                None => {
                    matched = false;
                    break;
                }
            }
        }

        let policy = if matched {
            node.policy
        } else {
            node.default_child_policy.unwrap_or(node.policy)
        };

        PolicySearchCursor {
            policy,
            scope,
            matched,
            depth,
        }
    }

    /// The cursor an unreachable path resolves to.
    pub fn root_cursor(&self) -> PolicySearchCursor {
        PolicySearchCursor {
            policy: self
                .root
                .default_child_policy
                .unwrap_or(self.root.policy),
            scope: self.root.scope,
            matched: false,
            depth: 0,
        }
    }
}

/// A manifest compiled for enforcement: the policy tree plus the global
/// flags, owned by the root process record of a pip and shared by reference
/// with every descendant record.
#[derive(Debug)]
pub struct CompiledManifest {
    /// Identifier of the pip this manifest governs.
    pub pip_id: u64,
    /// Global sandbox behavior flags.
    pub flags: ManifestFlags,
    /// The compiled prefix hierarchy.
    pub tree: PolicyTree,
}

impl CompiledManifest {
    /// Compile a parsed manifest. Fails iff the tree fails structural checks.
    pub fn build(manifest: &Manifest) -> Result<Self, Error> {
        Ok(Self {
            pip_id: manifest.pip_id,
            flags: manifest.flags,
            tree: PolicyTree::build(manifest)?,
        })
    }
}
