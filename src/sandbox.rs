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

//! Hook dispatch.
//!
//! [`Sandbox`] is the single entry point the OS-specific hook glue calls
//! into: "process P performed operation O on path X". It owns the process
//! registry, the report pipeline and the [`SandboxFs`] handle, and is passed
//! explicitly through hook registration -- there is no module-level mutable
//! state.
//!
//! Every decision hook follows the same shape: look up the owning process
//! record (untracked pid: allow, no report), canonicalize the path, walk the
//! policy tree, run the access check, emit deduplicated reports, and hand
//! an allow/deny (or narrowed-access) verdict back to the OS. Hooks never
//! block on the sandboxed process's own filesystem work, and a client whose
//! report queues have failed gets silent fail-open treatment.

use crate::{
    check::{
        AccessCheckResult, FileReadContext, PolicyResult, ReadWriteCheck, ReportLevel,
        RequestedAccess, RequestedReadAccess, ResultAction,
    },
    error::{Error, ErrorImpl},
    manifest::{Manifest, ManifestFlags},
    metadata::{override_timestamps_for_input_file, FileTimestamps},
    path::CanonicalPath,
    policy::CompiledManifest,
    queue::{ClientId, EmitMode, FailureCallback, ReportPipeline},
    registry::{Pid, PipSnapshot, ProcessRecord, ProcessRegistry, ReportDisposition},
    reparse::{describe_chain, resolve_chain, SandboxFs},
    report::{FileAccessStatus, FileOperationContext, Report, ReportOp},
};

use std::sync::Arc;

use bitflags::bitflags;
use crossbeam_channel::Receiver;

bitflags! {
    /// Raw access bits as the OS hook encodes them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessBits: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const PROBE = 1 << 3;
    }
}

/// The verdict a decision hook hands back to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    /// Let the operation proceed.
    Allow,
    /// Let the operation proceed, but reissue the underlying OS call with
    /// the narrowed access (the read/write-to-read rewrite).
    AllowNarrowed(AccessBits),
    /// Block the operation and fail the OS call with this errno.
    Deny(i32),
}

impl HookDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Deny(_))
    }
}

/// What kind of filesystem entry a create hook is about to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    File,
    Directory,
    Symlink,
}

/// File operations reported through [`Sandbox::on_file_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    /// `src` is deleted, `dst` is written.
    Rename,
    /// `src` is read, `dst` (the new link) is written.
    Link,
    /// Contents of `src` and `dst` swap; both are written.
    Exchange,
    /// `src` is read, `dst` is written.
    Copy,
    /// `src` is deleted.
    Delete,
    /// `src` is opened for reading existing content.
    Open,
    /// `src` is closed; `modified` says whether it was written to.
    Close,
}

/// Sub-operations of the set-file-information family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileInfoClass {
    /// Rename the file to `target`.
    Rename,
    /// Create a hard link at `target`.
    Link,
    /// Mark the file for deletion.
    Disposition,
    /// Extended disposition; carries the raw flags word.
    DispositionEx(u32),
    /// Timestamps and attributes.
    Basic,
    /// Permission bits.
    Mode,
    /// Short-name change.
    Name,
    /// Allocation / end-of-file size changes.
    Allocation,
}

/// `FILE_DISPOSITION_FLAG_DELETE` from the extended disposition word.
pub const FILE_DISPOSITION_FLAG_DELETE: u32 = 0x1;

/// Hook-installation gates for one tracked pid, for the glue layer to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HookGates {
    /// Whether Nt-family create/open hooks should run read-level checks.
    pub monitor_nt_create_file: bool,
    /// Whether Zw-family hooks should be installed at all.
    pub monitor_zw_create_open_query_file: bool,
    /// Whether close events should be drained on a worker thread.
    pub use_extra_thread_to_drain_nt_close: bool,
}

/// Counters describing the sandbox's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSnapshot {
    pub attached_clients: usize,
    pub tracked_processes: usize,
    pub pips: Vec<PipSnapshot>,
}

/// The access-mediation core: process registry, report pipeline and policy
/// enforcement behind one dispatch surface.
pub struct Sandbox {
    registry: ProcessRegistry,
    pipeline: ReportPipeline,
    fs: Box<dyn SandboxFs>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("registry", &self.registry)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a sandbox around the hook layer's filesystem primitives.
    pub fn new(fs: Box<dyn SandboxFs>) -> Self {
        Self {
            registry: ProcessRegistry::new(),
            pipeline: ReportPipeline::new(),
            fs,
        }
    }

    /// Attach a client and hand back the consumer ends of its report queues.
    pub fn attach_client(
        &self,
        client_id: ClientId,
        queue_size_bytes: usize,
        queue_count: usize,
        on_failure: Option<FailureCallback>,
    ) -> Vec<Receiver<Report>> {
        self.pipeline
            .attach_client(client_id, queue_size_bytes, queue_count, on_failure)
    }

    /// Detach a client: drop its queues and untrack any process trees still
    /// referencing it (the client may have crashed without closing down).
    pub fn detach_client(&self, client_id: ClientId) {
        self.pipeline.detach_client(client_id);
        self.registry.release_client(client_id);
    }

    /// Start tracking `pid` as the root process of a build step.
    ///
    /// A manifest that fails structural checks rejects the root: a
    /// `CannotDeterminePolicy` report is emitted, the process is not
    /// tracked, and the error is returned so the engine can terminate the
    /// step.
    pub fn track_root_process(
        &self,
        client_id: ClientId,
        pid: Pid,
        manifest: &Manifest,
    ) -> Result<(), Error> {
        let compiled = match CompiledManifest::build(manifest) {
            Ok(compiled) => Arc::new(compiled),
            Err(err) => {
                tracing::error!(pid, client_id, %err, "rejecting root process: bad manifest");
                let report = Report::file_access(
                    ReportOp::CannotDeterminePolicy,
                    pid,
                    pid,
                    client_id,
                    manifest.pip_id,
                    RequestedAccess::empty(),
                    FileAccessStatus::CannotDeterminePolicy,
                    false,
                    0,
                    FileOperationContext::for_read(),
                    "",
                );
                let _ = self.pipeline.emit(client_id, report, EmitMode::RoundRobin);
                return Err(err);
            }
        };

        let (_, displaced) = self.registry.track_root(client_id, pid, compiled);
        if let Some(displaced) = displaced {
            // A nested client re-announced a pid we were already tracking;
            // wind down the displaced tree if this was its last member.
            if displaced.tree_completed {
                self.broadcast_tree_completed(&displaced.record);
            }
        }
        Ok(())
    }

    /// Summarize clients, processes and pips.
    pub fn introspect(&self) -> SandboxSnapshot {
        SandboxSnapshot {
            attached_clients: self.pipeline.client_count(),
            tracked_processes: self.registry.tracked_count(),
            pips: self.registry.introspect(),
        }
    }

    /// The hook gates for `pid`, for the glue layer to decide which hook
    /// families to install and how to drain them.
    pub fn hook_gates(&self, pid: Pid) -> HookGates {
        match self.registry.find(pid) {
            Some(record) => {
                let flags = record.flags();
                HookGates {
                    monitor_nt_create_file: flags.contains(ManifestFlags::MONITOR_NT_CREATE_FILE),
                    monitor_zw_create_open_query_file: flags
                        .contains(ManifestFlags::MONITOR_ZW_CREATE_OPEN_QUERY_FILE),
                    use_extra_thread_to_drain_nt_close: flags
                        .contains(ManifestFlags::USE_EXTRA_THREAD_TO_DRAIN_NT_CLOSE),
                }
            }
            None => HookGates::default(),
        }
    }

    /// Rewrite the timestamps an attribute read by `pid` will observe for
    /// the input file at `path`.
    pub fn normalize_input_timestamps(&self, pid: Pid, path: &str, timestamps: &mut FileTimestamps) {
        let Some(record) = self.tracked(pid) else {
            return;
        };
        let Ok(path) = CanonicalPath::canonicalize(path) else {
            return;
        };
        let cursor = record.manifest().tree.lookup(&path);
        override_timestamps_for_input_file(timestamps, record.flags(), cursor.scope);
    }

    // === Inbound hook events ===

    /// Advisory: a name lookup was observed. Updates the per-thread
    /// last-looked-up-path slot; never denies.
    pub fn on_lookup(&self, pid: Pid, absolute_path: &str) {
        let Some(record) = self.tracked(pid) else {
            return;
        };
        let Ok(path) = CanonicalPath::canonicalize(absolute_path) else {
            return;
        };
        record.set_last_lookup(path.clone());

        if self.failed(&record) {
            return;
        }
        let policy = self.policy_for(&record, path);
        let check = policy.check_read_access(
            RequestedReadAccess::Lookup,
            FileReadContext::default(),
        );
        self.emit_access_report(
            &record,
            pid,
            ReportOp::Lookup,
            &policy,
            &check,
            FileOperationContext::for_read(),
        );
    }

    /// A symlink target is about to be read.
    pub fn on_readlink(&self, pid: Pid, path: &str) -> HookDecision {
        let Some(record) = self.tracked(pid) else {
            return HookDecision::Allow;
        };
        if self.failed(&record) {
            return HookDecision::Allow;
        }
        let path = match CanonicalPath::canonicalize(path) {
            Ok(path) => path,
            Err(err) => return self.indeterminate(&record, pid, path, &err),
        };

        let policy = self.policy_for(&record, path);
        let (policy, check) =
            self.check_with_lookup_fallback(&record, policy, |policy| {
                policy.check_existing_file_read_access()
            });
        self.emit_access_report(
            &record,
            pid,
            ReportOp::Readlink,
            &policy,
            &check,
            FileOperationContext::for_read(),
        );
        decision(check)
    }

    /// Informational: `pid` replaced its image. Tracking does not change
    /// (exec does not create a process).
    pub fn on_exec(&self, pid: Pid, image_path: &str) {
        let Some(record) = self.tracked(pid) else {
            return;
        };
        if self.failed(&record) {
            return;
        }
        self.emit_process_report(&record, ReportOp::ProcessExec, pid, image_path);
    }

    /// Informational: a tracked process forked/spawned a child.
    pub fn on_fork(&self, parent_pid: Pid, child_pid: Pid) {
        let Some(record) = self.registry.track_child(parent_pid, child_pid) else {
            return;
        };
        if self.failed(&record) {
            return;
        }
        self.emit_process_report(&record, ReportOp::ChildSpawned, child_pid, "");
    }

    /// Informational: `pid` exited. May complete its tree, in which case the
    /// terminal event is broadcast to every queue of the owning client.
    pub fn on_exit(&self, pid: Pid) {
        let Some(outcome) = self.registry.untrack(pid) else {
            return;
        };
        let record = outcome.record;
        if self.pipeline.is_failed(record.client_id()) {
            return;
        }

        self.emit_process_report(&record, ReportOp::ProcessExit, pid, "");
        if outcome.tree_completed {
            self.broadcast_tree_completed(&record);
        }
    }

    /// A filesystem entry is about to be created.
    pub fn on_vnode_create(&self, pid: Pid, path: &str, kind: VnodeKind) -> HookDecision {
        let Some(record) = self.tracked(pid) else {
            return HookDecision::Allow;
        };
        if self.failed(&record) {
            return HookDecision::Allow;
        }
        let path = match CanonicalPath::canonicalize(path) {
            Ok(path) => path,
            Err(err) => return self.indeterminate(&record, pid, path, &err),
        };

        let policy = self.policy_for(&record, path);
        let (op, check) = match kind {
            VnodeKind::Symlink => (
                ReportOp::SymlinkCreate,
                policy.check_symlink_creation_access(),
            ),
            VnodeKind::Directory => (ReportOp::DirCreate, policy.check_create_directory_access()),
            VnodeKind::File => (ReportOp::FileWrite, policy.check_write_access()),
        };
        self.emit_access_report(
            &record,
            pid,
            op,
            &policy,
            &check,
            FileOperationContext::for_create(),
        );
        decision(check)
    }

    /// A vnode-level access (read/write/execute/probe bits) is about to
    /// happen.
    pub fn on_vnode_access(&self, pid: Pid, path: &str, bits: AccessBits) -> HookDecision {
        let Some(record) = self.tracked(pid) else {
            return HookDecision::Allow;
        };
        if self.failed(&record) {
            return HookDecision::Allow;
        }
        let path = match CanonicalPath::canonicalize(path) {
            Ok(path) => path,
            Err(err) => return self.indeterminate(&record, pid, path, &err),
        };

        let ctx = self.fs.probe(&path);
        let is_dir = ctx.opened_directory;
        let policy = self.policy_for(&record, path);

        // The read/write-to-read rewrite is tried first: when it applies,
        // the request is narrowed instead of walking the per-bit checks.
        if bits.contains(AccessBits::READ | AccessBits::WRITE) && !is_dir {
            if let ReadWriteCheck::NarrowedToRead(check) = policy.check_read_write_access(ctx) {
                self.emit_access_report(
                    &record,
                    pid,
                    ReportOp::ChangedReadWriteToReadAccess,
                    &policy,
                    &check,
                    FileOperationContext::new(
                        crate::report::GENERIC_READ,
                        crate::report::FILE_SHARE_READ,
                        crate::report::DISPOSITION_OPEN_EXISTING,
                        0,
                    ),
                );
                return HookDecision::AllowNarrowed(bits - AccessBits::WRITE);
            }
        }

        let mut combined = AccessCheckResult::allow_none();

        if bits.contains(AccessBits::PROBE) {
            let (policy, check) = self.check_with_lookup_fallback(&record, policy.clone(), |p| {
                p.check_read_access(RequestedReadAccess::Probe, ctx)
            });
            self.emit_access_report(
                &record,
                pid,
                ReportOp::FileProbe,
                &policy,
                &check,
                FileOperationContext::for_read(),
            );
            combined = combined.combine(check);
        }

        if bits.contains(AccessBits::EXECUTE) {
            // Executing a directory is traversal (a probe); executing a file
            // reads its contents.
            let requested = if is_dir {
                RequestedReadAccess::Probe
            } else {
                RequestedReadAccess::Read
            };
            let (policy, check) = self.check_with_lookup_fallback(&record, policy.clone(), |p| {
                p.check_read_access(requested, ctx)
            });
            self.emit_access_report(
                &record,
                pid,
                if is_dir { ReportOp::FileProbe } else { ReportOp::FileRead },
                &policy,
                &check,
                FileOperationContext::new(
                    crate::report::GENERIC_READ | crate::report::GENERIC_EXECUTE,
                    crate::report::FILE_SHARE_READ,
                    crate::report::DISPOSITION_OPEN_EXISTING,
                    0,
                ),
            );
            combined = combined.combine(check);
        }

        if bits.contains(AccessBits::READ) {
            // Reading a directory is an enumeration.
            let requested = if is_dir {
                RequestedReadAccess::Enumerate
            } else {
                RequestedReadAccess::Read
            };
            let (policy, check) = self.check_with_lookup_fallback(&record, policy.clone(), |p| {
                p.check_read_access(requested, ctx)
            });
            self.emit_access_report(
                &record,
                pid,
                if is_dir { ReportOp::FileEnumerate } else { ReportOp::FileRead },
                &policy,
                &check,
                FileOperationContext::for_read(),
            );
            combined = combined.combine(check);
        }

        if bits.contains(AccessBits::WRITE) {
            // Writes to a directory vnode (attribute churn, entry creation
            // handled elsewhere) are treated as probes.
            let (policy, check) = self.check_with_lookup_fallback(&record, policy.clone(), |p| {
                if is_dir {
                    p.check_read_access(RequestedReadAccess::Probe, ctx)
                } else {
                    p.check_write_access()
                }
            });
            self.emit_access_report(
                &record,
                pid,
                if is_dir { ReportOp::FileProbe } else { ReportOp::FileWrite },
                &policy,
                &check,
                FileOperationContext::for_write(),
            );
            combined = combined.combine(check);
        }

        decision(combined)
    }

    /// A multi-path file operation is about to happen.
    pub fn on_file_op(
        &self,
        pid: Pid,
        op: FileOp,
        src: &str,
        dst: Option<&str>,
        modified: bool,
    ) -> HookDecision {
        let Some(record) = self.tracked(pid) else {
            return HookDecision::Allow;
        };
        if self.failed(&record) {
            return HookDecision::Allow;
        }
        let src = match CanonicalPath::canonicalize(src) {
            Ok(src) => src,
            Err(err) => return self.indeterminate(&record, pid, src, &err),
        };

        let mut combined = AccessCheckResult::allow_none();
        match op {
            FileOp::Rename => {
                let Some(dst) = self.canon_dst(&record, pid, dst) else {
                    return HookDecision::Allow;
                };
                combined = combined
                    .combine(self.write_leg(&record, pid, &src, ReportOp::MoveSource))
                    .combine(self.write_leg(&record, pid, &dst, ReportOp::MoveDest));
            }
            FileOp::Link => {
                let Some(dst) = self.canon_dst(&record, pid, dst) else {
                    return HookDecision::Allow;
                };
                combined = combined
                    .combine(self.read_leg(&record, pid, &src, ReportOp::LinkSource))
                    .combine(self.write_leg(&record, pid, &dst, ReportOp::LinkDest));
            }
            FileOp::Exchange => {
                let Some(dst) = self.canon_dst(&record, pid, dst) else {
                    return HookDecision::Allow;
                };
                combined = combined
                    .combine(self.write_leg(&record, pid, &src, ReportOp::ExchangeSource))
                    .combine(self.write_leg(&record, pid, &dst, ReportOp::ExchangeDest));
            }
            FileOp::Copy => {
                let Some(dst) = self.canon_dst(&record, pid, dst) else {
                    return HookDecision::Allow;
                };
                combined = combined
                    .combine(self.read_leg(&record, pid, &src, ReportOp::CopySource))
                    .combine(self.write_leg(&record, pid, &dst, ReportOp::CopyDest));
            }
            FileOp::Delete => {
                if let Some(chain) = self.maybe_enforce_chain(&record, pid, &src, true, false) {
                    combined = combined.combine(chain);
                } else {
                    let op = if self.fs.probe(&src).opened_directory {
                        ReportOp::DirDelete
                    } else {
                        ReportOp::FileDelete
                    };
                    combined = combined.combine(self.write_leg(&record, pid, &src, op));
                }
            }
            FileOp::Open => {
                if let Some(chain) = self.maybe_enforce_chain(&record, pid, &src, false, true) {
                    combined = combined.combine(chain);
                } else {
                    combined = combined.combine(self.read_leg(&record, pid, &src, ReportOp::FileOpen));
                }
            }
            FileOp::Close => {
                if modified {
                    combined = combined.combine(self.write_leg(&record, pid, &src, ReportOp::FileWrite));
                } else {
                    // Closes never decide anything, but a close of a read
                    // file is the engine's signal that the read is finished.
                    let policy = self.policy_for(&record, src);
                    let check = policy.check_existing_file_read_access();
                    self.emit_access_report(
                        &record,
                        pid,
                        ReportOp::FileClose,
                        &policy,
                        &check,
                        FileOperationContext::for_read(),
                    );
                    return HookDecision::Allow;
                }
            }
        }

        decision(combined)
    }

    /// A set-file-information sub-operation is about to happen.
    pub fn on_file_info_change(
        &self,
        pid: Pid,
        class: FileInfoClass,
        path: &str,
        target: Option<&str>,
    ) -> HookDecision {
        let Some(record) = self.tracked(pid) else {
            return HookDecision::Allow;
        };
        if self.failed(&record) {
            return HookDecision::Allow;
        }
        // Set-information hooks are mediated unconditionally; only the two
        // ignore flags can opt individual sub-operations out.
        let flags = record.flags();
        let ignore_rename = flags.contains(ManifestFlags::IGNORE_ZW_RENAME_FILE_INFORMATION);
        let ignore_other = flags.contains(ManifestFlags::IGNORE_ZW_OTHER_FILE_INFORMATION);

        match class {
            FileInfoClass::Rename if ignore_rename => HookDecision::Allow,
            FileInfoClass::Rename => self.on_file_op(pid, FileOp::Rename, path, target, false),
            _ if ignore_other => HookDecision::Allow,
            FileInfoClass::Link => self.on_file_op(pid, FileOp::Link, path, target, false),
            FileInfoClass::Name => match target {
                Some(_) => self.on_file_op(pid, FileOp::Rename, path, target, false),
                None => self.single_write(&record, pid, path, ReportOp::FileWrite),
            },
            FileInfoClass::Disposition => self.on_file_op(pid, FileOp::Delete, path, None, false),
            FileInfoClass::DispositionEx(disposition_flags) => {
                if disposition_flags & FILE_DISPOSITION_FLAG_DELETE != 0 {
                    self.on_file_op(pid, FileOp::Delete, path, None, false)
                } else {
                    HookDecision::Allow
                }
            }
            FileInfoClass::Basic | FileInfoClass::Mode | FileInfoClass::Allocation => {
                self.single_write(&record, pid, path, ReportOp::FileWrite)
            }
        }
    }

    // === Internals ===

    fn tracked(&self, pid: Pid) -> Option<Arc<ProcessRecord>> {
        let record = self.registry.find(pid)?;
        if record.flags().contains(ManifestFlags::DISABLE_HOOKS) {
            return None;
        }
        Some(record)
    }

    fn failed(&self, record: &ProcessRecord) -> bool {
        self.pipeline.is_failed(record.client_id())
    }

    fn policy_for(&self, record: &ProcessRecord, path: CanonicalPath) -> PolicyResult {
        let cursor = record.manifest().tree.lookup(&path);
        PolicyResult::new(path, record.flags(), cursor)
    }

    /// Run `check`; on a Deny, retry against the thread's last looked-up
    /// path. A vnode-derived path can be the "wrong" name for a file with
    /// multiple hard links, and the path the tool actually opened may well
    /// be within policy. Only if both paths deny does the operation deny.
    fn check_with_lookup_fallback(
        &self,
        record: &ProcessRecord,
        policy: PolicyResult,
        check: impl Fn(&PolicyResult) -> AccessCheckResult,
    ) -> (PolicyResult, AccessCheckResult) {
        let result = check(&policy);
        if !result.should_deny() {
            return (policy, result);
        }

        if let Some(lookup_path) = record.last_lookup() {
            if lookup_path != *policy.path() {
                let cursor = record.manifest().tree.lookup(&lookup_path);
                let fallback = policy.with_path(lookup_path, cursor);
                let fallback_result = check(&fallback);
                if !fallback_result.should_deny() {
                    tracing::debug!(
                        vnode_path = %policy.path(),
                        lookup_path = %fallback.path(),
                        "hardlink fallback rescued a denied access"
                    );
                    return (fallback, fallback_result);
                }
            }
        }
        (policy, result)
    }

    /// One read-checked leg of a multi-path operation.
    fn read_leg(
        &self,
        record: &Arc<ProcessRecord>,
        pid: Pid,
        path: &CanonicalPath,
        op: ReportOp,
    ) -> AccessCheckResult {
        let ctx = self.fs.probe(path);
        let policy = self.policy_for(record, path.clone());
        let (policy, check) = self.check_with_lookup_fallback(record, policy, |p| {
            p.check_read_access(RequestedReadAccess::Read, ctx)
        });
        self.emit_access_report(record, pid, op, &policy, &check, FileOperationContext::for_read());
        check
    }

    /// One write-checked leg of a multi-path operation.
    fn write_leg(
        &self,
        record: &Arc<ProcessRecord>,
        pid: Pid,
        path: &CanonicalPath,
        op: ReportOp,
    ) -> AccessCheckResult {
        let policy = self.policy_for(record, path.clone());
        let (policy, check) =
            self.check_with_lookup_fallback(record, policy, PolicyResult::check_write_access);
        self.emit_access_report(record, pid, op, &policy, &check, FileOperationContext::for_write());
        check
    }

    fn single_write(
        &self,
        record: &Arc<ProcessRecord>,
        pid: Pid,
        path: &str,
        op: ReportOp,
    ) -> HookDecision {
        let path = match CanonicalPath::canonicalize(path) {
            Ok(path) => path,
            Err(err) => return self.indeterminate(record, pid, path, &err),
        };
        decision(self.write_leg(record, pid, &path, op))
    }

    fn canon_dst(
        &self,
        record: &Arc<ProcessRecord>,
        pid: Pid,
        dst: Option<&str>,
    ) -> Option<CanonicalPath> {
        let Some(dst) = dst else {
            // Two-path operations always carry a destination; a hook event
            // without one is glue-layer breakage. Fail open in release.
            debug_assert!(false, "two-path file operation without a destination");
            let err: Error = ErrorImpl::HookInternal {
                description: "two-path file operation without a destination path".into(),
            }
            .into();
            tracing::error!(%err, "hook dispatch failing open");
            return None;
        };
        match CanonicalPath::canonicalize(dst) {
            Ok(dst) => Some(dst),
            Err(err) => {
                self.indeterminate(record, pid, dst, &err);
                None
            }
        }
    }

    /// Enforce policy over the whole reparse chain of `start`, if chain
    /// resolution applies to this operation.
    ///
    /// Returns `None` when the path is not a reparse point or the manifest
    /// disables resolution for this operation class; the caller then runs
    /// its ordinary single-path check.
    fn maybe_enforce_chain(
        &self,
        record: &Arc<ProcessRecord>,
        pid: Pid,
        start: &CanonicalPath,
        write: bool,
        open_like: bool,
    ) -> Option<AccessCheckResult> {
        let flags = record.flags();
        if flags.contains(ManifestFlags::IGNORE_REPARSE_POINTS) {
            return None;
        }
        if !open_like && flags.contains(ManifestFlags::IGNORE_NON_CREATE_FILE_REPARSE_POINTS) {
            return None;
        }
        self.fs.reparse_kind(start)?;

        let chain = match resolve_chain(self.fs.as_ref(), start) {
            Ok(chain) => chain,
            Err(err) => {
                // Resolution failure makes the whole path policy-indeterminate.
                tracing::warn!(path = %start, %err, "reparse chain resolution failed");
                self.report_indeterminate(record, pid, start.as_str(), &err);
                return Some(AccessCheckResult::allow_none());
            }
        };
        tracing::trace!(chain = %describe_chain(&chain), "enforcing reparse chain");

        // Every path in the chain is an input the engine must know about:
        // reporting only the final target would under-report dynamic
        // dependencies and cause under-building.
        let mut combined = AccessCheckResult::allow_none();
        for path in &chain {
            let ctx = self.fs.probe(path);
            let policy = self.policy_for(record, path.clone());
            let (policy, check) = self.check_with_lookup_fallback(record, policy, |p| {
                if write {
                    p.check_write_access()
                } else {
                    p.check_read_access(RequestedReadAccess::Read, ctx)
                }
            });
            self.emit_access_report(
                record,
                pid,
                ReportOp::ReparsePointTarget,
                &policy,
                &check,
                if write {
                    FileOperationContext::for_write()
                } else {
                    FileOperationContext::for_read()
                },
            );
            combined = combined.combine(check);
        }
        Some(combined)
    }

    /// Report a path we could not compute policy for, then fail open.
    fn indeterminate(&self, record: &ProcessRecord, pid: Pid, raw_path: &str, err: &Error) -> HookDecision {
        self.report_indeterminate(record, pid, raw_path, err);
        HookDecision::Allow
    }

    fn report_indeterminate(&self, record: &ProcessRecord, pid: Pid, raw_path: &str, err: &Error) {
        let report = Report::file_access(
            ReportOp::CannotDeterminePolicy,
            pid,
            record.root_pid(),
            record.client_id(),
            record.pip_id(),
            RequestedAccess::empty(),
            FileAccessStatus::CannotDeterminePolicy,
            false,
            err.kind().errno().unwrap_or(0) as u32,
            FileOperationContext::for_read(),
            raw_path,
        );
        let _ = self
            .pipeline
            .emit(record.client_id(), report, EmitMode::RoundRobin);
    }

    /// Emit one access report, subject to report level and per-tree dedup.
    fn emit_access_report(
        &self,
        record: &ProcessRecord,
        pid: Pid,
        op: ReportOp,
        policy: &PolicyResult,
        check: &AccessCheckResult,
        op_context: FileOperationContext,
    ) {
        if !check.should_report() {
            return;
        }
        if record.mark_reported(op, policy.path()) == ReportDisposition::Skipped {
            return;
        }

        let status = if check.action == ResultAction::Allow {
            FileAccessStatus::Allowed
        } else {
            // Warning-level results proceed, but the engine sees them as
            // denied accesses.
            FileAccessStatus::Denied
        };
        let error_code = if check.should_deny() {
            check.denial_errno() as u32
        } else {
            0
        };

        let report = Report::file_access(
            op,
            pid,
            record.root_pid(),
            record.client_id(),
            record.pip_id(),
            check.requested,
            status,
            check.report_level == ReportLevel::ReportExplicit,
            error_code,
            op_context,
            policy.path().as_str(),
        );
        let _ = self
            .pipeline
            .emit(record.client_id(), report, EmitMode::RoundRobin);
    }

    /// Emit one lifecycle report. Lifecycle events bypass the dedup cache.
    fn emit_process_report(&self, record: &ProcessRecord, op: ReportOp, pid: Pid, path: &str) {
        let report = Report::process_event(
            op,
            pid,
            record.root_pid(),
            record.client_id(),
            record.pip_id(),
            path,
        );
        let _ = self
            .pipeline
            .emit(record.client_id(), report, EmitMode::RoundRobin);
    }

    /// Broadcast the terminal tree-completed event to every queue of the
    /// owning client. Emitted exactly once per tree, strictly after every
    /// access report for the tree.
    fn broadcast_tree_completed(&self, record: &ProcessRecord) {
        tracing::debug!(
            root_pid = record.root_pid(),
            pip_id = record.pip_id(),
            "process tree completed"
        );
        let report = Report::process_event(
            ReportOp::ProcessTreeCompleted,
            record.root_pid(),
            record.root_pid(),
            record.client_id(),
            record.pip_id(),
            "",
        );
        let _ = self
            .pipeline
            .emit(record.client_id(), report, EmitMode::Broadcast);
    }
}

fn decision(check: AccessCheckResult) -> HookDecision {
    if check.should_deny() {
        HookDecision::Deny(check.denial_errno())
    } else {
        HookDecision::Allow
    }
}
