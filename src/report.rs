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

//! The report record.
//!
//! Every observed access (allowed or denied) and every process-lifecycle
//! event is described by one fixed-size [`Report`]. Reports are what the
//! build engine consumes to discover dynamic inputs and to fence off a pip's
//! lifetime, so their shape is wire-level: a closed operation enum, flat
//! integer fields, and a fixed-length path buffer.

use crate::check::RequestedAccess;

use std::{fmt, time::Instant};

use once_cell::sync::Lazy;
use static_assertions::{assert_impl_all, const_assert};

/// Size of the fixed path buffer in a report. Larger paths are truncated.
pub const MAX_REPORT_PATH: usize = 1024;

const_assert!(MAX_REPORT_PATH.is_power_of_two());

/// Common Win32-style access words used when synthesizing operation contexts.
pub const GENERIC_READ: u32 = 0x8000_0000;
pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const GENERIC_EXECUTE: u32 = 0x2000_0000;
pub const FILE_SHARE_READ: u32 = 0x1;
pub const FILE_SHARE_WRITE: u32 = 0x2;

/// Creation dispositions mirrored from CreateFile.
pub const DISPOSITION_CREATE_ALWAYS: u32 = 2;
pub const DISPOSITION_OPEN_EXISTING: u32 = 3;
pub const DISPOSITION_OPEN_ALWAYS: u32 = 4;

/// The closed set of reportable operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReportOp {
    ProcessTreeCompleted = 0,
    ProcessExit,
    ProcessExec,
    ChildSpawned,
    Lookup,
    Readlink,
    FileOpen,
    FileRead,
    FileWrite,
    FileProbe,
    FileEnumerate,
    DirCreate,
    DirDelete,
    FileDelete,
    SymlinkCreate,
    MoveSource,
    MoveDest,
    ExchangeSource,
    ExchangeDest,
    LinkSource,
    LinkDest,
    CopySource,
    CopyDest,
    FileClose,
    ReparsePointTarget,
    ChangedReadWriteToReadAccess,
    CannotDeterminePolicy,
}

impl ReportOp {
    /// The operation's wire name.
    pub fn name(self) -> &'static str {
        match self {
            Self::ProcessTreeCompleted => "ProcessTreeCompleted",
            Self::ProcessExit => "ProcessExit",
            Self::ProcessExec => "ProcessExec",
            Self::ChildSpawned => "ChildSpawned",
            Self::Lookup => "Lookup",
            Self::Readlink => "Readlink",
            Self::FileOpen => "FileOpen",
            Self::FileRead => "FileRead",
            Self::FileWrite => "FileWrite",
            Self::FileProbe => "FileProbe",
            Self::FileEnumerate => "FileEnumerate",
            Self::DirCreate => "DirCreate",
            Self::DirDelete => "DirDelete",
            Self::FileDelete => "FileDelete",
            Self::SymlinkCreate => "SymlinkCreate",
            Self::MoveSource => "MoveSource",
            Self::MoveDest => "MoveDest",
            Self::ExchangeSource => "ExchangeSource",
            Self::ExchangeDest => "ExchangeDest",
            Self::LinkSource => "LinkSource",
            Self::LinkDest => "LinkDest",
            Self::CopySource => "CopySource",
            Self::CopyDest => "CopyDest",
            Self::FileClose => "FileClose",
            Self::ReparsePointTarget => "ReparsePointTarget",
            Self::ChangedReadWriteToReadAccess => "ChangedReadWriteToReadAccess",
            Self::CannotDeterminePolicy => "CannotDeterminePolicy",
        }
    }
}

/// Status of the reported access as the engine sees it.
///
/// Warning-level failures (reported but not blocked) are reported as
/// `Denied`; the engine decides what to make of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileAccessStatus {
    Allowed = 0,
    Denied,
    CannotDeterminePolicy,
}

/// The (semi-)static context of one mediated call: operation name plus the
/// raw access words the tool passed to the OS.
#[derive(Debug, Clone, Copy)]
pub struct FileOperationContext {
    pub desired_access: u32,
    pub share_mode: u32,
    pub disposition: u32,
    pub flags: u32,
}

impl FileOperationContext {
    pub fn new(desired_access: u32, share_mode: u32, disposition: u32, flags: u32) -> Self {
        Self {
            desired_access,
            share_mode,
            disposition,
            flags,
        }
    }

    /// A context for an operation that reads existing content.
    pub fn for_read() -> Self {
        Self::new(GENERIC_READ, FILE_SHARE_READ, DISPOSITION_OPEN_EXISTING, 0)
    }

    /// A context for an operation that writes content.
    pub fn for_write() -> Self {
        Self::new(GENERIC_WRITE, FILE_SHARE_READ, DISPOSITION_OPEN_ALWAYS, 0)
    }

    /// A context for an operation that creates a filesystem entry.
    pub fn for_create() -> Self {
        Self::new(GENERIC_WRITE, FILE_SHARE_READ, DISPOSITION_CREATE_ALWAYS, 0)
    }
}

/// A fixed-length, truncating path buffer.
#[derive(Clone, Copy)]
pub struct ReportPath {
    len: u16,
    bytes: [u8; MAX_REPORT_PATH],
}

impl ReportPath {
    pub fn new(path: &str) -> Self {
        let mut bytes = [0u8; MAX_REPORT_PATH];
        // Truncate on a char boundary so as_str stays valid UTF-8.
        let mut len = path.len().min(MAX_REPORT_PATH);
        while !path.is_char_boundary(len) {
            len -= 1;
        }
        bytes[..len].copy_from_slice(&path.as_bytes()[..len]);
        Self {
            len: len as u16,
            bytes,
        }
    }

    pub fn as_str(&self) -> &str {
        // The buffer is only ever filled from a &str prefix.
        std::str::from_utf8(&self.bytes[..usize::from(self.len)]).unwrap_or("")
    }
}

impl fmt::Debug for ReportPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl PartialEq for ReportPath {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for ReportPath {}

impl From<&str> for ReportPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Queueing statistics stamped onto a report as it moves through the
/// pipeline. All values are monotonic nanoseconds relative to the crate
/// epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportStats {
    pub creation_ts: u64,
    pub enqueue_ts: u64,
    pub dequeue_ts: u64,
}

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since the crate epoch (first use).
pub(crate) fn monotonic_nanos() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// One observed access or lifecycle event, in its wire-level shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub operation: ReportOp,
    pub pid: u32,
    pub root_pid: u32,
    pub client_pid: u32,
    pub pip_id: u64,
    pub requested: RequestedAccess,
    pub status: FileAccessStatus,
    pub report_explicit: bool,
    pub error_code: u32,
    pub desired_access: u32,
    pub share_mode: u32,
    pub disposition: u32,
    pub flags: u32,
    pub path: ReportPath,
    pub stats: ReportStats,
}

assert_impl_all!(Report: Send, Sync);

impl Report {
    /// A file-access report.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn file_access(
        operation: ReportOp,
        pid: u32,
        root_pid: u32,
        client_pid: u32,
        pip_id: u64,
        requested: RequestedAccess,
        status: FileAccessStatus,
        report_explicit: bool,
        error_code: u32,
        op_context: FileOperationContext,
        path: &str,
    ) -> Self {
        Self {
            operation,
            pid,
            root_pid,
            client_pid,
            pip_id,
            requested,
            status,
            report_explicit,
            error_code,
            desired_access: op_context.desired_access,
            share_mode: op_context.share_mode,
            disposition: op_context.disposition,
            flags: op_context.flags,
            path: path.into(),
            stats: ReportStats {
                creation_ts: monotonic_nanos(),
                ..ReportStats::default()
            },
        }
    }

    /// A process-lifecycle report.
    pub(crate) fn process_event(
        operation: ReportOp,
        pid: u32,
        root_pid: u32,
        client_pid: u32,
        pip_id: u64,
        path: &str,
    ) -> Self {
        Self::file_access(
            operation,
            pid,
            root_pid,
            client_pid,
            pip_id,
            RequestedAccess::empty(),
            FileAccessStatus::Allowed,
            false,
            0,
            FileOperationContext::for_read(),
            path,
        )
    }
}
