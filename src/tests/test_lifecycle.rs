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

use crate::{
    error::ErrorKind,
    manifest::{AccessPolicy, ManifestFlags, ManifestNode},
    metadata::{FileTimestamps, NEW_INPUT_TIMESTAMP},
    report::{FileAccessStatus, Report, ReportOp},
    tests::common::{drain, posix_manifest, subtree, MockFs},
    HookDecision, Sandbox, VnodeKind,
};

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Error as AnyError;
use pretty_assertions::assert_eq;

const CLIENT: u32 = 1;

fn basic_manifest(pip_id: u64) -> crate::manifest::Manifest {
    posix_manifest(
        pip_id,
        ManifestFlags::FAIL_UNEXPECTED_ACCESSES,
        vec![subtree(
            "out",
            AccessPolicy::ALLOW_WRITE | AccessPolicy::REPORT_ACCESS,
        )],
    )
}

fn ops(reports: &[Report]) -> Vec<(ReportOp, u32)> {
    reports
        .iter()
        .map(|report| (report.operation, report.pid))
        .collect()
}

#[test]
fn process_tree_lifecycle() -> Result<(), AnyError> {
    let sandbox = Sandbox::new(Box::new(MockFs::new()));
    let queues = sandbox.attach_client(CLIENT, 0, 2, None);
    sandbox.track_root_process(CLIENT, 100, &basic_manifest(0x300))?;

    sandbox.on_fork(100, 101);
    sandbox.on_fork(101, 102);
    sandbox.on_exit(102);
    sandbox.on_exit(101);
    sandbox.on_exit(100);

    let expected = vec![
        (ReportOp::ChildSpawned, 101),
        (ReportOp::ChildSpawned, 102),
        (ReportOp::ProcessExit, 102),
        (ReportOp::ProcessExit, 101),
        (ReportOp::ProcessExit, 100),
        (ReportOp::ProcessTreeCompleted, 100),
    ];

    let mut seen: Vec<(ReportOp, u32)> = Vec::new();
    for rx in &queues {
        let reports = drain(rx);
        assert!(!reports.is_empty(), "round-robin spreads reports across queues");

        // Per-queue order must be a subsequence of the global emit order.
        let queue_ops = ops(&reports);
        let mut cursor = expected.iter();
        for op in &queue_ops {
            assert!(
                cursor.any(|expected_op| expected_op == op),
                "out-of-order report {op:?} on a queue"
            );
        }

        // The terminal event appears on *every* queue, last.
        assert_eq!(
            *queue_ops.last().unwrap(),
            (ReportOp::ProcessTreeCompleted, 100),
            "the terminal event is broadcast and nothing follows it"
        );

        seen.extend(queue_ops);
    }

    // Every lifecycle event was observed exactly once, except the terminal
    // broadcast which lands once per queue.
    for expected_op in &expected[..5] {
        assert_eq!(
            seen.iter().filter(|op| *op == expected_op).count(),
            1,
            "{expected_op:?} must appear exactly once across the queues"
        );
    }
    assert_eq!(
        seen.iter()
            .filter(|op| **op == (ReportOp::ProcessTreeCompleted, 100))
            .count(),
        queues.len(),
        "the terminal event lands on every queue"
    );

    assert_eq!(sandbox.introspect().tracked_processes, 0);
    Ok(())
}

#[test]
fn exec_reports_but_does_not_track() -> Result<(), AnyError> {
    let sandbox = Sandbox::new(Box::new(MockFs::new()));
    let queues = sandbox.attach_client(CLIENT, 0, 1, None);
    sandbox.track_root_process(CLIENT, 100, &basic_manifest(0x301))?;

    sandbox.on_exec(100, "/usr/bin/cc");
    let reports = drain(&queues[0]);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].operation, ReportOp::ProcessExec);
    assert_eq!(reports[0].path.as_str(), "/usr/bin/cc");
    assert_eq!(
        sandbox.introspect().tracked_processes,
        1,
        "exec must not change tracking"
    );
    Ok(())
}

#[test]
fn invalid_manifest_rejects_the_root() {
    let sandbox = Sandbox::new(Box::new(MockFs::new()));
    let queues = sandbox.attach_client(CLIENT, 0, 1, None);

    let mut manifest = basic_manifest(0x302);
    manifest.root = ManifestNode::new("", AccessPolicy::empty())
        .with_child(ManifestNode::new("dup", AccessPolicy::ALLOW_READ))
        .with_child(ManifestNode::new("dup", AccessPolicy::ALLOW_WRITE));

    let err = sandbox
        .track_root_process(CLIENT, 100, &manifest)
        .expect_err("duplicate siblings must reject the manifest");
    assert_eq!(err.kind(), ErrorKind::ManifestInvalid);

    let reports = drain(&queues[0]);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].operation, ReportOp::CannotDeterminePolicy);
    assert_eq!(reports[0].status, FileAccessStatus::CannotDeterminePolicy);
    assert_eq!(
        sandbox.introspect().tracked_processes,
        0,
        "a rejected root is never tracked"
    );
}

#[test]
fn queue_failure_fails_open_silently() -> Result<(), AnyError> {
    static CALLBACKS: AtomicUsize = AtomicUsize::new(0);

    let sandbox = Sandbox::new(Box::new(MockFs::new()));
    // One queue with room for exactly one report.
    let queues = sandbox.attach_client(
        CLIENT,
        std::mem::size_of::<Report>(),
        1,
        Some(Box::new(|_| {
            CALLBACKS.fetch_add(1, Ordering::SeqCst);
        })),
    );
    sandbox.track_root_process(CLIENT, 100, &basic_manifest(0x303))?;

    // First write fills the queue; the second one's report overflows it and
    // latches the failure.
    assert_eq!(
        sandbox.on_vnode_create(100, "/out/a", VnodeKind::File),
        HookDecision::Allow,
    );
    sandbox.on_vnode_create(100, "/out/b", VnodeKind::File);
    assert_eq!(CALLBACKS.load(Ordering::SeqCst), 1, "failure callback fired once");

    // From here on every hook for this client fails open: even an access
    // that policy would deny is silently allowed, and nothing is emitted.
    assert_eq!(
        sandbox.on_vnode_create(100, "/src/forbidden.h", VnodeKind::File),
        HookDecision::Allow,
        "hooks after the failure latch fail open"
    );
    assert_eq!(CALLBACKS.load(Ordering::SeqCst), 1, "callback fires exactly once");

    let reports = drain(&queues[0]);
    assert_eq!(reports.len(), 1, "only the pre-failure report is delivered");
    assert_eq!(reports[0].path.as_str(), "/out/a");
    Ok(())
}

#[test]
fn nested_client_retrack_displaces_the_old_tree() -> Result<(), AnyError> {
    let sandbox = Sandbox::new(Box::new(MockFs::new()));
    let _q1 = sandbox.attach_client(1, 0, 1, None);
    let q2 = sandbox.attach_client(2, 0, 1, None);

    sandbox.track_root_process(1, 100, &basic_manifest(0x304))?;
    // The same pid is announced again by a nested client; the old singleton
    // tree winds down with its terminal broadcast.
    sandbox.track_root_process(2, 100, &basic_manifest(0x305))?;

    let snapshot = sandbox.introspect();
    assert_eq!(snapshot.tracked_processes, 1);
    assert_eq!(snapshot.pips[0].client_id, 2);

    drop(q2);
    Ok(())
}

#[test]
fn detach_client_unhooks_dangling_trees() -> Result<(), AnyError> {
    let sandbox = Sandbox::new(Box::new(MockFs::new()));
    let _queues = sandbox.attach_client(CLIENT, 0, 1, None);
    sandbox.track_root_process(CLIENT, 100, &basic_manifest(0x306))?;
    sandbox.on_fork(100, 101);

    sandbox.detach_client(CLIENT);
    let snapshot = sandbox.introspect();
    assert_eq!(snapshot.attached_clients, 0);
    assert_eq!(snapshot.tracked_processes, 0, "dangling records are released");
    Ok(())
}

#[test]
fn introspect_counts_pips() -> Result<(), AnyError> {
    let sandbox = Sandbox::new(Box::new(MockFs::new()));
    let _queues = sandbox.attach_client(CLIENT, 0, 1, None);
    sandbox.track_root_process(CLIENT, 100, &basic_manifest(0x307))?;
    sandbox.on_fork(100, 101);

    let snapshot = sandbox.introspect();
    assert_eq!(snapshot.attached_clients, 1);
    assert_eq!(snapshot.tracked_processes, 2);
    assert_eq!(snapshot.pips.len(), 1);
    assert_eq!(snapshot.pips[0].pip_id, 0x307);
    assert_eq!(snapshot.pips[0].tree_count, 2);
    Ok(())
}

#[test]
fn hook_gates_follow_manifest_flags() -> Result<(), AnyError> {
    let sandbox = Sandbox::new(Box::new(MockFs::new()));
    let _queues = sandbox.attach_client(CLIENT, 0, 1, None);
    let mut manifest = basic_manifest(0x308);
    manifest.flags |= ManifestFlags::MONITOR_NT_CREATE_FILE
        | ManifestFlags::USE_EXTRA_THREAD_TO_DRAIN_NT_CLOSE;
    sandbox.track_root_process(CLIENT, 100, &manifest)?;

    let gates = sandbox.hook_gates(100);
    assert!(gates.monitor_nt_create_file);
    assert!(!gates.monitor_zw_create_open_query_file);
    assert!(gates.use_extra_thread_to_drain_nt_close);

    assert_eq!(
        sandbox.hook_gates(999),
        crate::HookGates::default(),
        "untracked pids get default gates"
    );
    Ok(())
}

#[test]
fn timestamps_normalize_through_the_sandbox() -> Result<(), AnyError> {
    let sandbox = Sandbox::new(Box::new(MockFs::new()));
    let _queues = sandbox.attach_client(CLIENT, 0, 1, None);
    let mut manifest = basic_manifest(0x309);
    manifest.flags |= ManifestFlags::NORMALIZE_READ_TIMESTAMPS;
    sandbox.track_root_process(CLIENT, 100, &manifest)?;

    let mut timestamps = FileTimestamps::new(1, 2, 3, 4);
    sandbox.normalize_input_timestamps(100, "/out/in.txt", &mut timestamps);
    assert_eq!(timestamps.modified, NEW_INPUT_TIMESTAMP);

    // Untracked pids see real timestamps.
    let mut untouched = FileTimestamps::new(1, 2, 3, 4);
    sandbox.normalize_input_timestamps(999, "/out/in.txt", &mut untouched);
    assert_eq!(untouched, FileTimestamps::new(1, 2, 3, 4));
    Ok(())
}
