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

//! The access-check engine.
//!
//! An access check combines three inputs: the policy for a path (a
//! [`PolicySearchCursor`] from the tree walk), the access a tool requested,
//! and the observed facts about the file (a [`FileReadContext`]). The output
//! is an [`AccessCheckResult`]: what to do with the operation, and whether to
//! report it.
//!
//! Checks are pure -- two calls with identical inputs produce identical
//! results -- and results form a commutative monoid under
//! [`AccessCheckResult::combine`], which is what makes multi-path operations
//! (reparse chains, rename source+destination) order-independent.

use crate::{
    manifest::{AccessPolicy, ManifestFlags, ScopeFlags},
    path::CanonicalPath,
    policy::PolicySearchCursor,
};

use bitflags::bitflags;

bitflags! {
    /// Access requested to produce an [`AccessCheckResult`]. Forms a lattice
    /// under union.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestedAccess: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const PROBE = 0x4;
        const ENUMERATE = 0x8;
        const ENUMERATION_PROBE = 0x10;
        const LOOKUP = 0x20;
    }
}

/// Type of read access requested of [`PolicyResult::check_read_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedReadAccess {
    /// Reading file contents.
    Read,
    /// Probing for existence or attributes.
    Probe,
    /// Enumerating a directory's entries.
    Enumerate,
    /// Probing an entry as part of a directory enumeration.
    EnumerationProbe,
    /// A name lookup observed in passing (advisory).
    Lookup,
}

impl From<RequestedReadAccess> for RequestedAccess {
    fn from(read: RequestedReadAccess) -> Self {
        match read {
            RequestedReadAccess::Read => Self::READ,
            RequestedReadAccess::Probe => Self::PROBE,
            RequestedReadAccess::Enumerate => Self::ENUMERATE,
            RequestedReadAccess::EnumerationProbe => Self::ENUMERATION_PROBE,
            RequestedReadAccess::Lookup => Self::LOOKUP,
        }
    }
}

/// Observed existence of the file an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileExistence {
    Existent,
    #[default]
    Nonexistent,
    /// The path cannot exist (the OS reported its name as invalid).
    InvalidPath,
}

/// The dynamic facts needed to finalize a read-level check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileReadContext {
    pub existence: FileExistence,
    pub opened_directory: bool,
}

impl FileReadContext {
    pub fn new(existence: FileExistence, opened_directory: bool) -> Self {
        Self {
            existence,
            opened_directory,
        }
    }

    /// Infer the existence fact from the errno an OS probe produced.
    pub fn infer_existence_from_errno(&mut self, errno: i32) {
        self.existence = match errno {
            0 => FileExistence::Existent,
            libc::ENOENT => FileExistence::Nonexistent,
            libc::ENOTDIR | libc::ENAMETOOLONG | libc::EILSEQ => FileExistence::InvalidPath,
            // Anything else (EACCES, EIO, ...) tells us the path names
            // something real enough to produce an error.
            _ => FileExistence::Existent,
        };
    }
}

/// Whether (and how loudly) an access is reported to the build engine.
///
/// Variant order matters: [`AccessCheckResult::combine`] takes the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportLevel {
    Ignore,
    Report,
    ReportExplicit,
}

/// What to do with the mediated operation.
///
/// Variant order matters: [`AccessCheckResult::combine`] takes the maximum.
/// `Warn` means "report it, but do not block it".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResultAction {
    Allow,
    Warn,
    Deny,
}

/// Syntactic validity of the checked path, for mapping denials onto the
/// right OS error.
///
/// Variant order matters: [`AccessCheckResult::combine`] takes the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathValidity {
    Valid,
    /// A parent component of the path does not exist ("path not found").
    PathComponentMissing,
    /// The path's name is not valid ("invalid name").
    PathSyntaxInvalid,
}

impl From<FileExistence> for PathValidity {
    fn from(existence: FileExistence) -> Self {
        match existence {
            FileExistence::InvalidPath => Self::PathSyntaxInvalid,
            _ => Self::Valid,
        }
    }
}

/// The result of applying policy to a proposed access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCheckResult {
    pub requested: RequestedAccess,
    pub action: ResultAction,
    pub report_level: ReportLevel,
    pub validity: PathValidity,
}

impl AccessCheckResult {
    pub fn new(requested: RequestedAccess, action: ResultAction, report_level: ReportLevel) -> Self {
        Self {
            requested,
            action,
            report_level,
            validity: PathValidity::Valid,
        }
    }

    /// The identity of [`combine`](Self::combine): no access requested,
    /// allowed, unreported.
    pub fn allow_none() -> Self {
        Self::new(RequestedAccess::empty(), ResultAction::Allow, ReportLevel::Ignore)
    }

    /// Combine two checks by taking the most restrictive action, the highest
    /// report level, the worst validity, and the union of requested accesses.
    /// Commutative and associative, with [`allow_none`](Self::allow_none) as
    /// identity.
    pub fn combine(self, other: Self) -> Self {
        Self {
            requested: self.requested | other.requested,
            action: self.action.max(other.action),
            report_level: self.report_level.max(other.report_level),
            validity: self.validity.max(other.validity),
        }
    }

    /// A copy of this result with a different report level.
    pub fn with_report_level(self, report_level: ReportLevel) -> Self {
        Self { report_level, ..self }
    }

    fn with_validity(self, validity: PathValidity) -> Self {
        Self { validity, ..self }
    }

    /// Whether a report should be sent for this access.
    pub fn should_report(&self) -> bool {
        self.report_level >= ReportLevel::Report
    }

    /// Whether the operation must be blocked outright. `Warn`-level failures
    /// proceed (they are reported as denied but not blocked).
    pub fn should_deny(&self) -> bool {
        self.action == ResultAction::Deny
    }

    /// The errno to hand back to the OS on denial.
    pub fn denial_errno(&self) -> i32 {
        debug_assert!(self.should_deny(), "denial_errno on a non-Deny result");
        match self.validity {
            PathValidity::Valid => libc::EACCES,
            PathValidity::PathComponentMissing => libc::ENOENT,
            PathValidity::PathSyntaxInvalid => libc::EINVAL,
        }
    }
}

/// The outcome of a combined read+write check, surfacing the
/// read-only narrowing to the hook layer so it can reissue the underlying OS
/// call with the reduced access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadWriteCheck {
    /// The request stands as issued.
    Full(AccessCheckResult),
    /// The request was rewritten from read+write to read-only; the caller
    /// must narrow the OS call and report the rewrite explicitly.
    NarrowedToRead(AccessCheckResult),
}

impl ReadWriteCheck {
    pub fn result(&self) -> AccessCheckResult {
        match *self {
            Self::Full(result) | Self::NarrowedToRead(result) => result,
        }
    }
}

/// Policy and global flags bound to one concrete path: the object access
/// checks are evaluated against.
#[derive(Debug, Clone)]
pub struct PolicyResult {
    path: CanonicalPath,
    flags: ManifestFlags,
    cursor: PolicySearchCursor,
}

impl PolicyResult {
    pub fn new(path: CanonicalPath, flags: ManifestFlags, cursor: PolicySearchCursor) -> Self {
        Self { path, flags, cursor }
    }

    pub fn path(&self) -> &CanonicalPath {
        &self.path
    }

    pub fn policy(&self) -> AccessPolicy {
        self.cursor.policy
    }

    pub fn scope(&self) -> ScopeFlags {
        self.cursor.scope
    }

    pub fn flags(&self) -> ManifestFlags {
        self.flags
    }

    /// Replace the path while keeping the policy cursor. Used by the
    /// multi-hardlink fallback, which re-evaluates the same operation against
    /// the last looked-up path.
    pub(crate) fn with_path(&self, path: CanonicalPath, cursor: PolicySearchCursor) -> Self {
        Self {
            path,
            flags: self.flags,
            cursor,
        }
    }

    fn allows(&self, policy: AccessPolicy) -> bool {
        self.cursor.policy.contains(policy)
    }

    /// Whether this path is invisible to the engine.
    pub fn is_untracked(&self) -> bool {
        self.allows(AccessPolicy::UNTRACKED)
    }

    /// Deny-or-Warn: `Deny` when the manifest fails unexpected accesses,
    /// otherwise `Warn` (report but proceed).
    fn deny_or_warn(&self, requested: RequestedAccess) -> AccessCheckResult {
        let action = if self.flags.contains(ManifestFlags::FAIL_UNEXPECTED_ACCESSES) {
            ResultAction::Deny
        } else {
            ResultAction::Warn
        };
        AccessCheckResult::new(requested, action, ReportLevel::Report)
    }

    /// Report level for an allowed access, given what we know about the
    /// file's existence.
    fn report_level(&self, existence: Option<FileExistence>) -> ReportLevel {
        if self.is_untracked() {
            return ReportLevel::Ignore;
        }
        let conditional = match existence {
            Some(FileExistence::Existent) => self.allows(AccessPolicy::REPORT_ACCESS_IF_EXISTENT),
            Some(FileExistence::Nonexistent) | Some(FileExistence::InvalidPath) => {
                self.allows(AccessPolicy::REPORT_ACCESS_IF_NONEXISTENT)
            }
            None => false,
        };
        if self.allows(AccessPolicy::REPORT_ACCESS)
            || conditional
            || self.flags.contains(ManifestFlags::REPORT_ANY_ACCESS)
        {
            ReportLevel::Report
        } else {
            ReportLevel::Ignore
        }
    }

    /// Check a write access.
    pub fn check_write_access(&self) -> AccessCheckResult {
        if self.is_untracked() || self.allows(AccessPolicy::ALLOW_WRITE) {
            AccessCheckResult::new(
                RequestedAccess::WRITE,
                ResultAction::Allow,
                self.report_level(None),
            )
        } else {
            self.deny_or_warn(RequestedAccess::WRITE)
        }
    }

    /// Check a read-level access given the observed file facts.
    pub fn check_read_access(
        &self,
        requested: RequestedReadAccess,
        ctx: FileReadContext,
    ) -> AccessCheckResult {
        let bits = RequestedAccess::from(requested);
        let validity = PathValidity::from(ctx.existence);

        if self.is_untracked() {
            return AccessCheckResult::new(bits, ResultAction::Allow, ReportLevel::Ignore)
                .with_validity(validity);
        }

        let allow_read = self.allows(AccessPolicy::ALLOW_READ);
        let allow_if_nonexistent = self.allows(AccessPolicy::ALLOW_READ_IF_NONEXISTENT);
        // InvalidPath can never name an existing file, so the nonexistence
        // rules apply to it as well.
        let nonexistent = ctx.existence != FileExistence::Existent;

        let result = match requested {
            RequestedReadAccess::Probe => {
                if nonexistent && (allow_read || allow_if_nonexistent) {
                    // Probes for files that are absent (and allowed to be
                    // read) are uninteresting to the engine.
                    AccessCheckResult::new(bits, ResultAction::Allow, ReportLevel::Ignore)
                } else if !nonexistent && allow_read {
                    AccessCheckResult::new(
                        bits,
                        ResultAction::Allow,
                        self.report_level(Some(ctx.existence)),
                    )
                } else {
                    self.deny_or_warn(bits)
                }
            }
            RequestedReadAccess::Read => {
                if allow_read || (nonexistent && allow_if_nonexistent) {
                    AccessCheckResult::new(
                        bits,
                        ResultAction::Allow,
                        self.report_level(Some(ctx.existence)),
                    )
                } else {
                    self.deny_or_warn(bits)
                }
            }
            RequestedReadAccess::Enumerate => {
                // Enumerations are always allowed. A scope that asks for
                // directory enumerations gets them reported explicitly;
                // otherwise the ordinary report rules apply (in particular
                // the global report-everything upgrade).
                let report_level = if self
                    .scope()
                    .contains(ScopeFlags::REPORT_DIRECTORY_ENUMERATION)
                {
                    ReportLevel::ReportExplicit
                } else {
                    self.report_level(Some(ctx.existence))
                };
                AccessCheckResult::new(bits, ResultAction::Allow, report_level)
            }
            RequestedReadAccess::EnumerationProbe => {
                // Historical contract: enumeration probes are never denied,
                // but a probe that policy would have rejected is reported.
                if allow_read || (nonexistent && allow_if_nonexistent) {
                    AccessCheckResult::new(bits, ResultAction::Allow, ReportLevel::Ignore)
                } else {
                    AccessCheckResult::new(bits, ResultAction::Allow, ReportLevel::Report)
                }
            }
            RequestedReadAccess::Lookup => {
                // Lookups are advisory (they feed the last-looked-up-path
                // slot) and are never blocked, but a lookup outside policy is
                // still worth reporting.
                if allow_read || (nonexistent && allow_if_nonexistent) {
                    AccessCheckResult::new(bits, ResultAction::Allow, ReportLevel::Ignore)
                } else {
                    AccessCheckResult::new(bits, ResultAction::Allow, ReportLevel::Report)
                }
            }
        };

        result.with_validity(validity)
    }

    /// Shorthand for a read of a file known to exist.
    pub fn check_existing_file_read_access(&self) -> AccessCheckResult {
        self.check_read_access(
            RequestedReadAccess::Read,
            FileReadContext::new(FileExistence::Existent, false),
        )
    }

    /// Check a directory creation.
    ///
    /// With `DIRECTORY_CREATION_ACCESS_ENFORCEMENT` the creation requires
    /// explicit create-directory (or write) policy; without it, creations are
    /// tolerated and merely reported, matching the lenient legacy behavior.
    pub fn check_create_directory_access(&self) -> AccessCheckResult {
        if self.is_untracked()
            || self.allows(AccessPolicy::ALLOW_CREATE_DIRECTORY)
            || self.allows(AccessPolicy::ALLOW_WRITE)
        {
            AccessCheckResult::new(
                RequestedAccess::WRITE,
                ResultAction::Allow,
                self.report_level(None),
            )
        } else if self
            .flags
            .contains(ManifestFlags::DIRECTORY_CREATION_ACCESS_ENFORCEMENT)
        {
            self.deny_or_warn(RequestedAccess::WRITE)
        } else {
            AccessCheckResult::new(RequestedAccess::WRITE, ResultAction::Allow, ReportLevel::Report)
        }
    }

    /// Check a symbolic-link creation.
    pub fn check_symlink_creation_access(&self) -> AccessCheckResult {
        if self.is_untracked() || self.allows(AccessPolicy::ALLOW_SYMLINK_CREATION) {
            AccessCheckResult::new(
                RequestedAccess::WRITE,
                ResultAction::Allow,
                self.report_level(None),
            )
        } else {
            self.deny_or_warn(RequestedAccess::WRITE)
        }
    }

    /// Check a combined read+write request, applying the read-only rewrite
    /// when enabled.
    ///
    /// When the requested access is read+write but policy allows only read,
    /// and the manifest (or the path's scope) enables the rewrite, the
    /// request is narrowed to read-only: the result is Allow at
    /// `ReportExplicit` level and the caller must reissue the OS call with
    /// the reduced access.
    pub fn check_read_write_access(&self, ctx: FileReadContext) -> ReadWriteCheck {
        let write = self.check_write_access();
        let read = self.check_read_access(RequestedReadAccess::Read, ctx);

        let rewrite_enabled = self
            .flags
            .contains(ManifestFlags::FORCE_READ_ONLY_FOR_REQUESTED_READ_WRITE)
            || self.scope().contains(ScopeFlags::FORCE_READ_ONLY_FOR_READ_WRITE);

        if write.action != ResultAction::Allow && read.action == ResultAction::Allow && rewrite_enabled
        {
            ReadWriteCheck::NarrowedToRead(
                AccessCheckResult::new(
                    RequestedAccess::READ,
                    ResultAction::Allow,
                    ReportLevel::ReportExplicit,
                )
                .with_validity(read.validity),
            )
        } else {
            ReadWriteCheck::Full(write.combine(read))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        manifest::{AccessPolicy, Manifest, ManifestFlags, ManifestNode},
        path::{CanonicalPath, PathStyle},
        policy::PolicyTree,
    };

    use anyhow::Error as AnyError;
    use pretty_assertions::assert_eq;

    fn policy_for(
        policy: AccessPolicy,
        flags: ManifestFlags,
        path: &str,
    ) -> Result<PolicyResult, AnyError> {
        let mut manifest = Manifest::new(1, flags, PathStyle::Posix, AccessPolicy::empty());
        manifest.root = ManifestNode::new("", AccessPolicy::empty())
            .with_child(ManifestNode::new("data", policy).with_default_child_policy(policy));
        let tree = PolicyTree::build(&manifest)?;
        let path = CanonicalPath::canonicalize(path)?;
        let cursor = tree.lookup(&path);
        Ok(PolicyResult::new(path, flags, cursor))
    }

    fn existent() -> FileReadContext {
        FileReadContext::new(FileExistence::Existent, false)
    }

    fn nonexistent() -> FileReadContext {
        FileReadContext::new(FileExistence::Nonexistent, false)
    }

    #[test]
    fn write_allowed_and_denied() -> Result<(), AnyError> {
        let allowed = policy_for(
            AccessPolicy::ALLOW_WRITE,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/out.bin",
        )?;
        assert_eq!(allowed.check_write_access().action, ResultAction::Allow);

        let denied = policy_for(
            AccessPolicy::ALLOW_READ,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/out.bin",
        )?;
        let result = denied.check_write_access();
        assert_eq!(result.action, ResultAction::Deny);
        assert_eq!(result.report_level, ReportLevel::Report);
        assert_eq!(result.denial_errno(), libc::EACCES);
        Ok(())
    }

    #[test]
    fn deny_or_warn_depends_on_global_flag() -> Result<(), AnyError> {
        let warn = policy_for(AccessPolicy::empty(), ManifestFlags::empty(), "/data/x")?;
        let result = warn.check_write_access();
        assert_eq!(
            result.action,
            ResultAction::Warn,
            "without FAIL_UNEXPECTED_ACCESSES an unexpected write only warns"
        );
        assert!(result.should_report());
        assert!(!result.should_deny(), "Warn-level results must not block");
        Ok(())
    }

    #[test]
    fn probe_nonexistent_with_read_policy_is_quietly_allowed() -> Result<(), AnyError> {
        for policy in [AccessPolicy::ALLOW_READ, AccessPolicy::ALLOW_READ_IF_NONEXISTENT] {
            let result = policy_for(policy, ManifestFlags::FAIL_UNEXPECTED_ACCESSES, "/data/h")?
                .check_read_access(RequestedReadAccess::Probe, nonexistent());
            assert_eq!(result.action, ResultAction::Allow);
            assert_eq!(result.report_level, ReportLevel::Ignore);
        }
        Ok(())
    }

    #[test]
    fn probe_existent_follows_read_policy() -> Result<(), AnyError> {
        let allowed = policy_for(
            AccessPolicy::ALLOW_READ | AccessPolicy::REPORT_ACCESS,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/h",
        )?
        .check_read_access(RequestedReadAccess::Probe, existent());
        assert_eq!(allowed.action, ResultAction::Allow);
        assert_eq!(allowed.report_level, ReportLevel::Report);

        let denied = policy_for(
            AccessPolicy::empty(),
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/h",
        )?
        .check_read_access(RequestedReadAccess::Probe, existent());
        assert_eq!(denied.action, ResultAction::Deny);
        Ok(())
    }

    #[test]
    fn read_nonexistent_with_read_if_nonexistent_is_allowed() -> Result<(), AnyError> {
        let result = policy_for(
            AccessPolicy::ALLOW_READ_IF_NONEXISTENT,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/h",
        )?
        .check_read_access(RequestedReadAccess::Read, nonexistent());
        assert_eq!(result.action, ResultAction::Allow);

        // ...but not when the file turns out to exist.
        let result = policy_for(
            AccessPolicy::ALLOW_READ_IF_NONEXISTENT,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/h",
        )?
        .check_read_access(RequestedReadAccess::Read, existent());
        assert_eq!(result.action, ResultAction::Deny);
        Ok(())
    }

    #[test]
    fn enumerate_reports_per_scope() -> Result<(), AnyError> {
        let quiet = policy_for(AccessPolicy::empty(), ManifestFlags::FAIL_UNEXPECTED_ACCESSES, "/data")?
            .check_read_access(RequestedReadAccess::Enumerate, existent());
        assert_eq!(quiet.action, ResultAction::Allow, "enumerations never deny");
        assert_eq!(quiet.report_level, ReportLevel::Ignore);

        let mut manifest = Manifest::new(
            1,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            PathStyle::Posix,
            AccessPolicy::empty(),
        );
        manifest.root = ManifestNode::new("", AccessPolicy::empty()).with_child(
            ManifestNode::new("data", AccessPolicy::empty())
                .with_scope(crate::manifest::ScopeFlags::REPORT_DIRECTORY_ENUMERATION),
        );
        let tree = PolicyTree::build(&manifest)?;
        let path = CanonicalPath::canonicalize("/data")?;
        let cursor = tree.lookup(&path);
        let loud = PolicyResult::new(path, manifest.flags, cursor)
            .check_read_access(RequestedReadAccess::Enumerate, existent());
        assert_eq!(
            loud.report_level,
            ReportLevel::ReportExplicit,
            "the enumeration scope flag reports explicitly"
        );
        Ok(())
    }

    #[test]
    fn report_any_access_covers_enumerations() -> Result<(), AnyError> {
        let result = policy_for(
            AccessPolicy::empty(),
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES | ManifestFlags::REPORT_ANY_ACCESS,
            "/data",
        )?
        .check_read_access(RequestedReadAccess::Enumerate, existent());
        assert_eq!(result.action, ResultAction::Allow);
        assert_eq!(
            result.report_level,
            ReportLevel::Report,
            "without the scope flag, the report-everything upgrade still applies"
        );
        Ok(())
    }

    #[test]
    fn enumeration_probe_never_denies() -> Result<(), AnyError> {
        let result = policy_for(
            AccessPolicy::empty(),
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/entry",
        )?
        .check_read_access(RequestedReadAccess::EnumerationProbe, existent());
        assert_eq!(
            result.action,
            ResultAction::Allow,
            "enumeration probes are never denied, even on policy mismatch"
        );
        assert_eq!(
            result.report_level,
            ReportLevel::Report,
            "...but a mismatch is reported"
        );
        Ok(())
    }

    #[test]
    fn untracked_paths_are_invisible() -> Result<(), AnyError> {
        let result = policy_for(
            AccessPolicy::UNTRACKED,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES | ManifestFlags::REPORT_ANY_ACCESS,
            "/data/scratch",
        )?;
        assert_eq!(result.check_write_access().action, ResultAction::Allow);
        assert_eq!(result.check_write_access().report_level, ReportLevel::Ignore);
        assert_eq!(
            result
                .check_read_access(RequestedReadAccess::Read, existent())
                .report_level,
            ReportLevel::Ignore,
        );
        Ok(())
    }

    #[test]
    fn report_any_access_upgrades_ignore() -> Result<(), AnyError> {
        let result = policy_for(
            AccessPolicy::ALLOW_READ,
            ManifestFlags::REPORT_ANY_ACCESS,
            "/data/in.txt",
        )?
        .check_read_access(RequestedReadAccess::Read, existent());
        assert_eq!(result.report_level, ReportLevel::Report);
        Ok(())
    }

    #[test]
    fn create_directory_enforcement() -> Result<(), AnyError> {
        let allowed = policy_for(
            AccessPolicy::ALLOW_CREATE_DIRECTORY,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES
                | ManifestFlags::DIRECTORY_CREATION_ACCESS_ENFORCEMENT,
            "/data/newdir",
        )?;
        assert_eq!(
            allowed.check_create_directory_access().action,
            ResultAction::Allow
        );

        let enforced = policy_for(
            AccessPolicy::ALLOW_READ,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES
                | ManifestFlags::DIRECTORY_CREATION_ACCESS_ENFORCEMENT,
            "/data/newdir",
        )?;
        assert_eq!(
            enforced.check_create_directory_access().action,
            ResultAction::Deny,
            "enforcement requires create-directory (or write) policy"
        );

        let lenient = policy_for(
            AccessPolicy::ALLOW_READ,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/newdir",
        )?;
        let result = lenient.check_create_directory_access();
        assert_eq!(
            result.action,
            ResultAction::Allow,
            "without enforcement, directory creation is tolerated"
        );
        assert_eq!(result.report_level, ReportLevel::Report, "...but reported");
        Ok(())
    }

    #[test]
    fn symlink_creation_needs_its_own_bit() -> Result<(), AnyError> {
        let allowed = policy_for(
            AccessPolicy::ALLOW_SYMLINK_CREATION,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/link",
        )?;
        assert_eq!(
            allowed.check_symlink_creation_access().action,
            ResultAction::Allow
        );

        // Plain write policy is not enough for symlink creation.
        let denied = policy_for(
            AccessPolicy::ALLOW_WRITE,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/link",
        )?;
        assert_eq!(
            denied.check_symlink_creation_access().action,
            ResultAction::Deny
        );
        Ok(())
    }

    #[test]
    fn checks_are_deterministic() -> Result<(), AnyError> {
        let policy = policy_for(
            AccessPolicy::ALLOW_READ,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/f",
        )?;
        let first = policy.check_read_access(RequestedReadAccess::Read, existent());
        let second = policy.check_read_access(RequestedReadAccess::Read, existent());
        assert_eq!(first, second, "identical inputs must yield identical results");
        Ok(())
    }

    #[test]
    fn combine_laws() {
        let a = AccessCheckResult::new(RequestedAccess::READ, ResultAction::Allow, ReportLevel::Report);
        let b = AccessCheckResult {
            requested: RequestedAccess::WRITE,
            action: ResultAction::Deny,
            report_level: ReportLevel::Ignore,
            validity: PathValidity::PathComponentMissing,
        };
        let c = AccessCheckResult::new(
            RequestedAccess::PROBE,
            ResultAction::Warn,
            ReportLevel::ReportExplicit,
        );

        assert_eq!(a.combine(b), b.combine(a), "combine is commutative");
        assert_eq!(
            a.combine(b).combine(c),
            a.combine(b.combine(c)),
            "combine is associative"
        );
        let identity = AccessCheckResult::allow_none();
        assert_eq!(a.combine(identity), a, "allow_none is the identity");
        assert_eq!(identity.combine(b), b, "allow_none is the identity");
    }

    #[test]
    fn combine_takes_most_restrictive() {
        let allow = AccessCheckResult::new(RequestedAccess::READ, ResultAction::Allow, ReportLevel::Ignore);
        let warn = AccessCheckResult::new(RequestedAccess::WRITE, ResultAction::Warn, ReportLevel::Report);
        let combined = allow.combine(warn);
        assert_eq!(combined.action, ResultAction::Warn);
        assert_eq!(combined.report_level, ReportLevel::Report);
        assert_eq!(combined.requested, RequestedAccess::READ | RequestedAccess::WRITE);
    }

    #[test]
    fn denial_errno_follows_validity() {
        let base = AccessCheckResult::new(RequestedAccess::READ, ResultAction::Deny, ReportLevel::Report);
        assert_eq!(base.denial_errno(), libc::EACCES);
        assert_eq!(
            base.with_validity(PathValidity::PathComponentMissing).denial_errno(),
            libc::ENOENT
        );
        assert_eq!(
            base.with_validity(PathValidity::PathSyntaxInvalid).denial_errno(),
            libc::EINVAL
        );
    }

    #[test]
    fn read_write_rewrite() -> Result<(), AnyError> {
        // With the flag: narrowed to read-only, explicit report.
        let policy = policy_for(
            AccessPolicy::ALLOW_READ,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES
                | ManifestFlags::FORCE_READ_ONLY_FOR_REQUESTED_READ_WRITE,
            "/data/in.bin",
        )?;
        match policy.check_read_write_access(existent()) {
            ReadWriteCheck::NarrowedToRead(result) => {
                assert_eq!(result.action, ResultAction::Allow);
                assert_eq!(result.report_level, ReportLevel::ReportExplicit);
                assert_eq!(result.requested, RequestedAccess::READ);
            }
            other => panic!("expected NarrowedToRead, got {other:?}"),
        }

        // Without the flag: denied.
        let policy = policy_for(
            AccessPolicy::ALLOW_READ,
            ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
            "/data/in.bin",
        )?;
        match policy.check_read_write_access(existent()) {
            ReadWriteCheck::Full(result) => assert_eq!(result.action, ResultAction::Deny),
            other => panic!("expected Full deny, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn infer_existence_from_errno() {
        let mut ctx = FileReadContext::default();
        ctx.infer_existence_from_errno(libc::ENOENT);
        assert_eq!(ctx.existence, FileExistence::Nonexistent);
        ctx.infer_existence_from_errno(0);
        assert_eq!(ctx.existence, FileExistence::Existent);
        ctx.infer_existence_from_errno(libc::ENOTDIR);
        assert_eq!(ctx.existence, FileExistence::InvalidPath);
        ctx.infer_existence_from_errno(libc::EACCES);
        assert_eq!(ctx.existence, FileExistence::Existent);
    }
}
