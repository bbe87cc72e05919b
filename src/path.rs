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

//! Canonical path representation.
//!
//! Every path that reaches the access-check engine has been normalized into a
//! [`CanonicalPath`] first: device prefixes are stripped (but remembered as
//! the path's [`PathKind`]), `.` and `..` segments are folded away lexically,
//! and separators are normalized to the style's canonical separator. The
//! canonicalization is purely syntactic -- symlinks are *not* followed here,
//! that is the job of [`resolve_chain`](crate::reparse::resolve_chain).
//!
//! Two canonical paths are equal iff they denote the same filesystem location
//! under the sandbox's equality rules: comparison is case-insensitive for
//! Windows-style paths and exact for POSIX-style paths.

use crate::error::{Error, ErrorImpl};

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use memchr::memrchr;

/// Which namespace a raw path was addressed through.
///
/// The origin type is part of a path's identity: `\\?\C:\foo` and `C:\foo`
/// are looked up through different namespaces and are never considered equal,
/// even though they frequently name the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// An ordinary path (POSIX absolute path, Win32 drive path, or UNC path).
    PlainPath,
    /// An NT-namespace path (`\\?\` or `\??\` prefix).
    DeviceNt,
    /// A local-device path (`\\.\` prefix), which may refer to objects like
    /// `\\.\pipe` rather than a drive letter.
    DeviceLocal,
}

/// The separator and case-folding convention of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathStyle {
    /// `/`-separated, case-sensitive.
    Posix,
    /// `\`-separated, case-insensitive.
    Windows,
}

impl PathStyle {
    pub(crate) fn separator(self) -> char {
        match self {
            Self::Posix => '/',
            Self::Windows => '\\',
        }
    }

    fn is_separator(self, c: char) -> bool {
        match self {
            Self::Posix => c == '/',
            // Win32 APIs accept both separators.
            Self::Windows => c == '\\' || c == '/',
        }
    }
}

/// An immutable, canonicalized absolute path.
///
/// A canonical path exposes its [`last_component`] and [`parent`] without
/// re-parsing (the final separator offset is remembered at construction), and
/// [`extend`] composes new canonical paths against an existing one.
///
/// [`last_component`]: Self::last_component
/// [`parent`]: Self::parent
/// [`extend`]: Self::extend
#[derive(Debug, Clone)]
pub struct CanonicalPath {
    kind: PathKind,
    style: PathStyle,
    /// Normalized textual form, including the root prefix.
    path: Arc<str>,
    /// Length of the root prefix (`/`, `C:\`, `\\server\share`, ...).
    root_len: usize,
    /// Byte offset of the separator introducing the last component, if the
    /// path has any component beyond its root.
    last_sep: Option<usize>,
}

fn syntax_error(path: &str, description: &'static str) -> Error {
    ErrorImpl::PathSyntaxInvalid {
        path: path.to_string().into(),
        description: description.into(),
    }
    .into()
}

/// Splits off a recognised Windows device prefix.
///
/// Returns the detected kind and the rest of the path after the prefix. Both
/// NT prefix spellings (`\\?\` and `\??\`) normalize to [`PathKind::DeviceNt`].
fn strip_device_prefix(raw: &str) -> Option<(PathKind, &str)> {
    for nt in [r"\\?\", r"\??\"] {
        if let Some(rest) = raw.strip_prefix(nt) {
            return Some((PathKind::DeviceNt, rest));
        }
    }
    raw.strip_prefix(r"\\.\")
        .map(|rest| (PathKind::DeviceLocal, rest))
}

/// Returns whether `rest` starts with a drive specifier (`C:`).
fn has_drive(rest: &str) -> bool {
    let bytes = rest.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

impl CanonicalPath {
    /// Canonicalize a raw OS path.
    ///
    /// Recognized shapes:
    ///
    ///  * POSIX absolute paths (`/usr/lib`),
    ///  * Win32 drive paths (`C:\repo\out`, forward slashes accepted),
    ///  * UNC paths (`\\server\share\dir`),
    ///  * NT-namespace paths (`\\?\C:\repo`, `\??\C:\repo`, `\\?\UNC\s\s`),
    ///  * local-device paths (`\\.\pipe\foo`).
    ///
    /// `.` segments are removed and `..` segments are folded against their
    /// preceding component. A `..` that would escape the root of its path
    /// type is a syntax error, as are empty input, relative paths, and UNC
    /// prefixes missing the server or share component.
    pub fn canonicalize(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(syntax_error(raw, "empty path"));
        }

        let (kind, style, rest) = match strip_device_prefix(raw) {
            Some((kind, rest)) => (kind, PathStyle::Windows, rest),
            None => {
                if raw.starts_with('/') {
                    (PathKind::PlainPath, PathStyle::Posix, raw)
                } else if raw.starts_with(r"\\") || has_drive(raw) {
                    (PathKind::PlainPath, PathStyle::Windows, raw)
                } else if raw.starts_with('\\') {
                    return Err(syntax_error(raw, "unrecognized device syntax"));
                } else {
                    return Err(syntax_error(raw, "path is not absolute"));
                }
            }
        };

        let (root, tail) = Self::split_root(raw, kind, style, rest)?;

        let mut components: Vec<&str> = Vec::new();
        for part in tail.split(|c| style.is_separator(c)) {
            match part {
                "" | "." => continue,
                ".." => {
                    if components.pop().is_none() {
                        return Err(syntax_error(
                            raw,
                            "'..' component escapes the path root",
                        ));
                    }
                }
                _ => components.push(part),
            }
        }

        Ok(Self::assemble(kind, style, &root, &components))
    }

    /// Computes the normalized root prefix and the component tail.
    fn split_root(
        raw: &str,
        kind: PathKind,
        style: PathStyle,
        rest: &str,
    ) -> Result<(String, String), Error> {
        match kind {
            PathKind::PlainPath => match style {
                PathStyle::Posix => Ok(("/".to_string(), rest[1..].to_string())),
                PathStyle::Windows => {
                    if has_drive(rest) {
                        let tail = rest[2..].to_string();
                        if !tail.is_empty() && !tail.starts_with(['\\', '/']) {
                            // "C:foo" is drive-relative, which we cannot
                            // resolve without the per-drive working directory.
                            return Err(syntax_error(raw, "drive-relative path"));
                        }
                        Ok((format!("{}\\", &rest[..2]), tail))
                    } else {
                        // UNC: \\server\share[\...]
                        let unc = rest
                            .strip_prefix(r"\\")
                            .ok_or_else(|| syntax_error(raw, "unrecognized path root"))?;
                        Self::split_unc_root(raw, style, unc, r"\\")
                    }
                }
            },
            PathKind::DeviceNt => {
                if has_drive(rest) {
                    let tail = rest[2..].to_string();
                    Ok((format!(r"\\?\{}\", &rest[..2]), tail))
                } else if let Some(unc) = rest
                    .strip_prefix(r"UNC\")
                    .or_else(|| rest.strip_prefix("UNC/"))
                {
                    Self::split_unc_root(raw, style, unc, r"\\?\UNC\")
                } else {
                    Err(syntax_error(raw, "unrecognized device syntax"))
                }
            }
            PathKind::DeviceLocal => {
                // The first component after \\.\ names the device object.
                let mut parts = rest.splitn(2, |c| style.is_separator(c));
                let device = parts.next().unwrap_or("");
                if device.is_empty() {
                    return Err(syntax_error(raw, "missing device name"));
                }
                let tail = parts.next().unwrap_or("").to_string();
                Ok((format!(r"\\.\{device}"), tail))
            }
        }
    }

    /// UNC roots must carry both a server and a share name.
    fn split_unc_root(
        raw: &str,
        style: PathStyle,
        unc: &str,
        prefix: &str,
    ) -> Result<(String, String), Error> {
        let mut parts = unc.splitn(3, |c| style.is_separator(c));
        let server = parts.next().unwrap_or("");
        let share = parts.next().unwrap_or("");
        if server.is_empty() || share.is_empty() {
            return Err(syntax_error(raw, "malformed UNC path"));
        }
        let tail = parts.next().unwrap_or("").to_string();
        Ok((format!("{prefix}{server}\\{share}"), tail))
    }

    /// Joins a root and clean components into the final representation.
    fn assemble(kind: PathKind, style: PathStyle, root: &str, components: &[&str]) -> Self {
        let sep = style.separator();
        let root_ends_with_sep = root.ends_with(sep);

        let mut path = String::with_capacity(
            root.len() + components.iter().map(|c| c.len() + 1).sum::<usize>(),
        );
        path.push_str(root);

        let mut last_sep = None;
        for (idx, comp) in components.iter().enumerate() {
            if idx > 0 || !root_ends_with_sep {
                last_sep = Some(path.len());
                path.push(sep);
            } else {
                // First component directly after "C:\" etc; the separator
                // introducing it is the root's final byte.
                last_sep = Some(root.len() - 1);
            }
            path.push_str(comp);
        }

        Self {
            kind,
            style,
            path: path.into(),
            root_len: root.len(),
            last_sep,
        }
    }

    /// The origin type of this path.
    pub fn kind(&self) -> PathKind {
        self.kind
    }

    /// The separator/case convention of this path.
    pub fn style(&self) -> PathStyle {
        self.style
    }

    /// The normalized textual form.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Whether this path is its own root (it has no components).
    pub fn is_root(&self) -> bool {
        self.last_sep.is_none()
    }

    /// The final path component, or `None` for a bare root.
    pub fn last_component(&self) -> Option<&str> {
        self.last_sep.map(|idx| &self.path[idx + 1..])
    }

    /// This path truncated to its bare root (`/`, `C:\`, `\\server\share`).
    pub fn root(&self) -> Self {
        Self {
            kind: self.kind,
            style: self.style,
            path: self.path[..self.root_len].into(),
            root_len: self.root_len,
            last_sep: None,
        }
    }

    /// The parent path, or `None` for a bare root.
    pub fn parent(&self) -> Option<Self> {
        let last_sep = self.last_sep?;
        let end = last_sep.max(self.root_len);
        let parent: &str = &self.path[..end];

        // Re-derive the final separator offset of the shortened path. Only
        // bytes beyond the root can introduce a component.
        let new_last_sep = if parent.len() > self.root_len {
            memrchr(self.style.separator() as u8, parent.as_bytes())
        } else {
            None
        };

        Some(Self {
            kind: self.kind,
            style: self.style,
            path: parent.into(),
            root_len: self.root_len,
            last_sep: new_last_sep,
        })
    }

    /// Append `suffix` (one or more components, possibly containing `.` and
    /// `..`) to this path, re-normalizing the result.
    pub fn extend(&self, suffix: &str) -> Result<Self, Error> {
        let mut components: Vec<&str> = self.components().collect();
        for part in suffix.split(|c| self.style.is_separator(c)) {
            match part {
                "" | "." => continue,
                ".." => {
                    if components.pop().is_none() {
                        return Err(syntax_error(suffix, "'..' component escapes the path root"));
                    }
                }
                _ => components.push(part),
            }
        }
        Ok(Self::assemble(
            self.kind,
            self.style,
            &self.path[..self.root_len],
            &components,
        ))
    }

    /// Iterate over the components beyond the root.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        let style = self.style;
        self.path[self.root_len..]
            .split(move |c| style.is_separator(c))
            .filter(|part| !part.is_empty())
    }

    /// The root rendered as a single matchable atom (`C:`, `\\srv\share`,
    /// `\\?\C:`), or `None` for POSIX-style paths whose root is the bare
    /// `/`.
    ///
    /// Policy trees for Windows-style paths key their first level on this
    /// atom, since different drives and shares carry different policy.
    pub fn root_atom(&self) -> Option<&str> {
        match self.style {
            PathStyle::Posix => None,
            PathStyle::Windows => {
                let root = &self.path[..self.root_len];
                Some(root.strip_suffix('\\').unwrap_or(root))
            }
        }
    }

    /// A case-folded rendering suitable for use as a map key under the
    /// sandbox's path-equality rules.
    pub(crate) fn fold_case(&self) -> String {
        match self.style {
            PathStyle::Posix => self.path.to_string(),
            PathStyle::Windows => self.path.to_ascii_lowercase(),
        }
    }
}

impl PartialEq for CanonicalPath {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.style == other.style
            && match self.style {
                PathStyle::Posix => self.path == other.path,
                PathStyle::Windows => self.path.eq_ignore_ascii_case(&other.path),
            }
    }
}

impl Eq for CanonicalPath {}

impl Hash for CanonicalPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.style.hash(state);
        match self.style {
            PathStyle::Posix => self.path.hash(state),
            PathStyle::Windows => {
                for b in self.path.bytes() {
                    state.write_u8(b.to_ascii_lowercase());
                }
            }
        }
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}
