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

//! The process registry.
//!
//! The sandbox follows a root build-step process and every descendant it
//! spawns. Each tracked pid maps to a [`ProcessRecord`]; all records of one
//! tree share a single [`RootProcess`] (and through it, one immutable
//! compiled manifest), forming a leaf-to-root DAG with no cycles.
//!
//! The root's tree counter equals the number of live records referencing it.
//! It starts at 1 when the root is tracked, moves with births and deaths,
//! and when it reaches 0 the tree is complete: the caller broadcasts the
//! terminal event exactly once and the record is retired.
//!
//! Lookup is called on every hooked operation of every process on the
//! system, so it has to be cheap -- a sharded concurrent map gives O(1)
//! wait-free reads, and mutations only briefly block writers of the same
//! shard.

use crate::{
    manifest::ManifestFlags,
    path::CanonicalPath,
    policy::CompiledManifest,
    queue::ClientId,
    report::ReportOp,
};

use std::{
    sync::{
        atomic::{AtomicI32, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use dashmap::{DashMap, DashSet};

/// A process identifier as the hook layer reports it.
pub type Pid = u32;

/// Dedup key for the per-tree report cache.
type ReportKey = (ReportOp, String);

/// Whether a report attempt was fresh or suppressed by the dedup cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDisposition {
    /// First sighting of this `(operation, path)` key; the report goes out.
    Reported,
    /// The key was already reported for this tree; the report is skipped.
    Skipped,
}

/// Shared state of one tracked process tree, owned by its root.
#[derive(Debug)]
pub struct RootProcess {
    client_id: ClientId,
    root_pid: Pid,
    manifest: Arc<CompiledManifest>,
    tree_count: AtomicI32,
    report_cache: DashSet<ReportKey>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    /// Most recent path observed at the lookup hook, per hook thread. Used
    /// as a fallback when a vnode-derived path is ambiguous (multiple hard
    /// links).
    last_lookup: DashMap<ThreadId, CanonicalPath>,
}

impl RootProcess {
    fn new(client_id: ClientId, root_pid: Pid, manifest: Arc<CompiledManifest>) -> Self {
        Self {
            client_id,
            root_pid,
            manifest,
            tree_count: AtomicI32::new(1),
            report_cache: DashSet::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            last_lookup: DashMap::new(),
        }
    }

    /// Number of live records referencing this root (including itself).
    pub fn tree_count(&self) -> i32 {
        self.tree_count.load(Ordering::SeqCst)
    }
}

/// One tracked process. Descendants hold a strong reference to their tree's
/// [`RootProcess`]; the root's record references it too.
#[derive(Debug)]
pub struct ProcessRecord {
    pid: Pid,
    root: Arc<RootProcess>,
}

impl ProcessRecord {
    fn new(pid: Pid, root: Arc<RootProcess>) -> Self {
        Self { pid, root }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn root_pid(&self) -> Pid {
        self.root.root_pid
    }

    pub fn client_id(&self) -> ClientId {
        self.root.client_id
    }

    pub fn pip_id(&self) -> u64 {
        self.root.manifest.pip_id
    }

    pub fn flags(&self) -> ManifestFlags {
        self.root.manifest.flags
    }

    pub fn manifest(&self) -> &Arc<CompiledManifest> {
        &self.root.manifest
    }

    pub fn tree_count(&self) -> i32 {
        self.root.tree_count()
    }

    /// Atomically test-and-mark the `(operation, path)` dedup key.
    ///
    /// The first caller for a key gets [`ReportDisposition::Reported`] and
    /// must emit the report; everyone after gets `Skipped`. The cache is
    /// append-only for the life of the tree, so double emissions cannot
    /// occur even under concurrent hooks on the same path.
    pub fn mark_reported(&self, operation: ReportOp, path: &CanonicalPath) -> ReportDisposition {
        let key = (operation, path.fold_case());
        if self.root.report_cache.insert(key) {
            self.root.cache_misses.fetch_add(1, Ordering::Relaxed);
            ReportDisposition::Reported
        } else {
            self.root.cache_hits.fetch_add(1, Ordering::Relaxed);
            ReportDisposition::Skipped
        }
    }

    /// Record the path most recently looked up on the current thread.
    pub fn set_last_lookup(&self, path: CanonicalPath) {
        self.root.last_lookup.insert(thread::current().id(), path);
    }

    /// The path most recently looked up on the current thread, if any.
    pub fn last_lookup(&self) -> Option<CanonicalPath> {
        self.root
            .last_lookup
            .get(&thread::current().id())
            .map(|entry| entry.clone())
    }
}

/// Introspection summary for one tracked tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipSnapshot {
    pub pip_id: u64,
    pub root_pid: Pid,
    pub client_id: ClientId,
    pub tree_count: i32,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub children: Vec<Pid>,
}

/// The registry of tracked processes.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: DashMap<Pid, Arc<ProcessRecord>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the record tracking `pid`.
    ///
    /// This is called on every hooked operation of every process, tracked or
    /// not, so the miss path must stay O(1).
    pub fn find(&self, pid: Pid) -> Option<Arc<ProcessRecord>> {
        self.processes.get(&pid).map(|entry| Arc::clone(&entry))
    }

    /// Number of tracked pids.
    pub fn tracked_count(&self) -> usize {
        self.processes.len()
    }

    /// Track `pid` as the root of a new tree.
    ///
    /// If a mapping for `pid` already exists it is untracked first (this can
    /// happen with nested clients); the displaced record is returned so the
    /// caller can finish its tree bookkeeping.
    pub fn track_root(
        &self,
        client_id: ClientId,
        pid: Pid,
        manifest: Arc<CompiledManifest>,
    ) -> (Arc<ProcessRecord>, Option<UntrackOutcome>) {
        let displaced = self.untrack(pid);
        if displaced.is_some() {
            tracing::debug!(pid, "untracked existing mapping before re-tracking as root");
        }

        let root = Arc::new(RootProcess::new(client_id, pid, manifest));
        let record = Arc::new(ProcessRecord::new(pid, root));
        self.processes.insert(pid, Arc::clone(&record));
        tracing::debug!(pid, client_id, pip_id = record.pip_id(), "tracking root process");
        (record, displaced)
    }

    /// Track `child_pid` as a member of `parent_pid`'s tree.
    ///
    /// Returns the child's record when tracking took effect; `None` when the
    /// parent is untracked (not an error: the child simply is not ours) or
    /// the child is already tracked.
    pub fn track_child(&self, parent_pid: Pid, child_pid: Pid) -> Option<Arc<ProcessRecord>> {
        let parent = self.find(parent_pid)?;

        if let Some(existing) = self.find(child_pid) {
            tracing::debug!(
                child_pid,
                existing_root = existing.root_pid(),
                intended_root = parent.root_pid(),
                "child process already tracked"
            );
            return None;
        }

        let record = Arc::new(ProcessRecord::new(child_pid, Arc::clone(&parent.root)));
        self.processes.insert(child_pid, Arc::clone(&record));
        record.root.tree_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            child_pid,
            parent_pid,
            tree_count = record.tree_count(),
            "tracking child process"
        );
        Some(record)
    }

    /// Remove the mapping for `pid` and decrement its tree counter.
    pub fn untrack(&self, pid: Pid) -> Option<UntrackOutcome> {
        let (_, record) = self.processes.remove(&pid)?;
        let previous = record.root.tree_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "tree count undercounted live records");
        tracing::debug!(pid, tree_count = previous - 1, "untracked process");
        Some(UntrackOutcome {
            record,
            tree_completed: previous == 1,
        })
    }

    /// Untrack every record belonging to `client_id`.
    ///
    /// A client that exited abnormally leaves its trees dangling; this is
    /// the cleanup that runs when its queues are freed. Returns the pids
    /// that were removed.
    pub fn release_client(&self, client_id: ClientId) -> Vec<Pid> {
        let doomed: Vec<Pid> = self
            .processes
            .iter()
            .filter(|entry| entry.client_id() == client_id)
            .map(|entry| entry.pid())
            .collect();

        for &pid in &doomed {
            self.untrack(pid);
        }
        if !doomed.is_empty() {
            tracing::debug!(client_id, removed = doomed.len(), "released dangling processes");
        }
        doomed
    }

    /// Summarize the tracked trees.
    pub fn introspect(&self) -> Vec<PipSnapshot> {
        let mut pips: Vec<PipSnapshot> = Vec::new();
        for entry in self.processes.iter() {
            let root = &entry.root;
            match pips.iter_mut().find(|pip| pip.root_pid == root.root_pid) {
                Some(pip) => pip.children.push(entry.pid()),
                None => pips.push(PipSnapshot {
                    pip_id: root.manifest.pip_id,
                    root_pid: root.root_pid,
                    client_id: root.client_id,
                    tree_count: root.tree_count(),
                    cache_hits: root.cache_hits.load(Ordering::Relaxed),
                    cache_misses: root.cache_misses.load(Ordering::Relaxed),
                    children: vec![entry.pid()],
                }),
            }
        }
        for pip in &mut pips {
            pip.children.sort_unstable();
        }
        pips.sort_unstable_by_key(|pip| pip.root_pid);
        pips
    }
}

/// The result of removing one pid from the registry.
#[derive(Debug)]
pub struct UntrackOutcome {
    /// The removed record (still referencing its root).
    pub record: Arc<ProcessRecord>,
    /// Whether this removal completed the tree (counter hit zero). The
    /// caller must broadcast the terminal event exactly once.
    pub tree_completed: bool,
}
