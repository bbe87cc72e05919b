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

//! Error types for sandfence.

use std::borrow::Cow;

/// Opaque error type for sandfence.
///
/// If you wish to do non-trivial error handling with sandfence errors, use
/// [`Error::kind`] to get an [`ErrorKind`] you can handle programmatically.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] Box<ErrorImpl>);

impl<E: Into<ErrorImpl>> From<E> for Error {
    #[doc(hidden)]
    fn from(err: E) -> Self {
        Self(Box::new(err.into()))
    }
}

impl Error {
    /// Get the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> ErrorImpl {
        *self.0
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ErrorImpl {
    #[error("invalid {name} argument: {description}")]
    InvalidArgument {
        name: Cow<'static, str>,
        description: Cow<'static, str>,
    },

    #[error("manifest failed structural checks: {description}")]
    ManifestInvalid { description: Cow<'static, str> },

    #[error("path {path:?} has invalid syntax: {description}")]
    PathSyntaxInvalid {
        path: Cow<'static, str>,
        description: Cow<'static, str>,
    },

    #[error("reparse-point resolution of {path:?} failed: {description}")]
    ReparseResolutionFailed {
        path: Cow<'static, str>,
        description: Cow<'static, str>,
    },

    #[error("report queues for client {client_id} are full")]
    ReportQueueFull { client_id: u32 },

    #[error("internal hook error: {description}")]
    HookInternal { description: Cow<'static, str> },

    #[error("{context}")]
    Wrapped {
        context: Cow<'static, str>,
        source: Box<ErrorImpl>,
    },
}

/// Underlying error class for sandfence errors.
///
/// This is similar in concept to [`std::io::ErrorKind`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The provided arguments to sandfence were invalid.
    InvalidArgument,
    /// The manifest supplied at root-process creation failed structural
    /// checks. The root is rejected and never tracked.
    ManifestInvalid,
    /// A raw path could not be canonicalized (unrecognized device syntax,
    /// malformed UNC, or a `..` that escapes the root of its path type).
    PathSyntaxInvalid,
    /// Reparse-point resolution exceeded the traversal limit or a target
    /// could not be read. The affected path is policy-indeterminate.
    ReparseResolutionFailed,
    /// The client's report queues latched the unrecoverable-failure state.
    /// Further hook calls for that client fail open.
    ReportQueueFull,
    /// Some internal error occurred. For more information, see the string
    /// description of the original [`Error`].
    HookInternal,
}

impl ErrorImpl {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::ManifestInvalid { .. } => ErrorKind::ManifestInvalid,
            Self::PathSyntaxInvalid { .. } => ErrorKind::PathSyntaxInvalid,
            Self::ReparseResolutionFailed { .. } => ErrorKind::ReparseResolutionFailed,
            Self::ReportQueueFull { .. } => ErrorKind::ReportQueueFull,
            Self::HookInternal { .. } => ErrorKind::HookInternal,
            Self::Wrapped { source, .. } => source.kind(),
        }
    }
}

impl ErrorKind {
    /// Return a C-like errno for the [`ErrorKind`].
    ///
    /// Pure-Rust errors are mapped to C errno values where appropriate, so
    /// that the hook layer can hand a plausible error back to the OS when an
    /// operation is short-circuited.
    pub(crate) fn errno(&self) -> Option<i32> {
        match self {
            ErrorKind::InvalidArgument
            | ErrorKind::ManifestInvalid
            | ErrorKind::PathSyntaxInvalid => Some(libc::EINVAL),
            ErrorKind::ReparseResolutionFailed => Some(libc::ELOOP),
            ErrorKind::ReportQueueFull => Some(libc::ENOSPC),
            ErrorKind::HookInternal => None,
        }
    }
}

// Private trait necessary to work around the "orphan trait" restriction.
pub(crate) trait ErrorExt: Sized {
    /// Wrap a `Result<..., Error>` with an additional context string.
    fn wrap<S: Into<String>>(self, context: S) -> Self {
        self.with_wrap(|| context.into())
    }

    /// Wrap a `Result<..., Error>` with an additional context string created by
    /// a closure.
    fn with_wrap<F>(self, context_fn: F) -> Self
    where
        F: FnOnce() -> String;
}

impl ErrorExt for ErrorImpl {
    fn with_wrap<F>(self, context_fn: F) -> Self
    where
        F: FnOnce() -> String,
    {
        Self::Wrapped {
            context: context_fn().into(),
            source: self.into(),
        }
    }
}

impl ErrorExt for Error {
    fn with_wrap<F>(self, context_fn: F) -> Self
    where
        F: FnOnce() -> String,
    {
        self.0.with_wrap(context_fn).into()
    }
}

impl<T, E: ErrorExt> ErrorExt for Result<T, E> {
    fn with_wrap<F>(self, context_fn: F) -> Self
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| err.with_wrap(context_fn))
    }
}
