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

//! The report pipeline.
//!
//! Each attached client owns a set of bounded report queues. Ordinary access
//! reports are directed to one queue per emission (round-robin, for
//! throughput); the terminal process-tree-completed event is broadcast to
//! every queue of the client, because no consumer may miss it.
//!
//! Back-pressure is deliberately blunt: there are no retry loops. A full
//! queue latches the client into an unrecoverable-failure state (one atomic
//! flag), the client's registered failure callback fires exactly once, and
//! every further emission for that client returns
//! [`ReportQueueFull`](crate::error::ErrorKind::ReportQueueFull) immediately.
//! Hooks observing that state fail open.

use crate::{
    error::{Error, ErrorImpl},
    report::{monotonic_nanos, Report},
};

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::Mutex;

/// Identifier of an attached client process.
pub type ClientId = u32;

/// Default per-queue backing size when the client does not configure one.
pub const DEFAULT_QUEUE_SIZE_BYTES: usize = 1024 * 1024;

/// Upper bound on the configurable per-queue backing size.
pub const MAX_QUEUE_SIZE_BYTES: usize = 64 * 1024 * 1024;

/// How an emission is routed across the client's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    /// Send to one queue, rotating across emissions.
    RoundRobin,
    /// Send to every queue of the client. Used for the terminal
    /// process-tree-completed event.
    Broadcast,
}

/// Why a client's pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFailure {
    /// A bounded queue was full at emission time.
    NoSpace,
}

/// Callback a client registers to learn (exactly once, asynchronously with
/// respect to its consumers) that its pipeline has failed.
pub type FailureCallback = Box<dyn FnOnce(QueueFailure) + Send>;

struct ClientQueues {
    senders: Vec<Sender<Report>>,
    next: AtomicUsize,
    failed: AtomicBool,
    on_failure: Mutex<Option<FailureCallback>>,
}

impl ClientQueues {
    /// Latch the unrecoverable-failure flag and fire the callback if this is
    /// the first failure.
    fn latch_failure(&self, failure: QueueFailure) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            if let Some(callback) = self.on_failure.lock().take() {
                callback(failure);
            }
        }
    }
}

/// Entry capacity for a queue backed by `queue_size_bytes` of report storage.
///
/// Out-of-range sizes fall back to the default, mirroring the original's
/// queue-size clamping.
pub fn queue_entry_count(queue_size_bytes: usize) -> usize {
    let bytes = if queue_size_bytes == 0 || queue_size_bytes > MAX_QUEUE_SIZE_BYTES {
        DEFAULT_QUEUE_SIZE_BYTES
    } else {
        queue_size_bytes
    };
    (bytes / std::mem::size_of::<Report>()).max(1)
}

/// All report queues, bucketed per client.
#[derive(Default)]
pub struct ReportPipeline {
    clients: DashMap<ClientId, Arc<ClientQueues>>,
}

impl std::fmt::Debug for ReportPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportPipeline")
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl ReportPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a client, creating `queue_count` bounded queues of
    /// `queue_size_bytes` each and returning their consumer ends.
    ///
    /// An already-attached client is re-attached: its old queues are dropped.
    pub fn attach_client(
        &self,
        client_id: ClientId,
        queue_size_bytes: usize,
        queue_count: usize,
        on_failure: Option<FailureCallback>,
    ) -> Vec<Receiver<Report>> {
        let entries = queue_entry_count(queue_size_bytes);
        let queue_count = queue_count.max(1);

        let mut senders = Vec::with_capacity(queue_count);
        let mut receivers = Vec::with_capacity(queue_count);
        for _ in 0..queue_count {
            let (tx, rx) = bounded(entries);
            senders.push(tx);
            receivers.push(rx);
        }

        tracing::debug!(client_id, queue_count, entries, "attached report queues");
        self.clients.insert(
            client_id,
            Arc::new(ClientQueues {
                senders,
                next: AtomicUsize::new(0),
                failed: AtomicBool::new(false),
                on_failure: Mutex::new(on_failure),
            }),
        );
        receivers
    }

    /// Detach a client and drop its queues.
    pub fn detach_client(&self, client_id: ClientId) -> bool {
        self.clients.remove(&client_id).is_some()
    }

    /// Whether this client has entered the unrecoverable-failure state.
    pub fn is_failed(&self, client_id: ClientId) -> bool {
        self.clients
            .get(&client_id)
            .map(|queues| queues.failed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Whether this client is attached at all.
    pub fn is_attached(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Emit one report to the client's queues.
    pub fn emit(&self, client_id: ClientId, mut report: Report, mode: EmitMode) -> Result<(), Error> {
        // Clone the Arc out of the map entry so no map shard lock is held
        // across the sends.
        let queues = match self.clients.get(&client_id) {
            Some(entry) => Arc::clone(&entry),
            None => {
                return Err(ErrorImpl::InvalidArgument {
                    name: "client_id".into(),
                    description: format!("client {client_id} is not attached").into(),
                }
                .into())
            }
        };

        if queues.failed.load(Ordering::SeqCst) {
            return Err(ErrorImpl::ReportQueueFull { client_id }.into());
        }

        report.stats.enqueue_ts = monotonic_nanos();

        let pushed = match mode {
            EmitMode::RoundRobin => {
                let idx = queues.next.fetch_add(1, Ordering::Relaxed) % queues.senders.len();
                try_push(&queues.senders[idx], report)
            }
            EmitMode::Broadcast => {
                // Attempt every queue even if one fails: consumers that still
                // have space should see the terminal event.
                let mut ok = true;
                for sender in &queues.senders {
                    ok &= try_push(sender, report);
                }
                ok
            }
        };

        if pushed {
            Ok(())
        } else {
            tracing::error!(client_id, operation = report.operation.name(), "report queue full");
            queues.latch_failure(QueueFailure::NoSpace);
            Err(ErrorImpl::ReportQueueFull { client_id }.into())
        }
    }
}

fn try_push(sender: &Sender<Report>, report: Report) -> bool {
    match sender.try_send(report) {
        Ok(()) => true,
        // A disconnected consumer is as unrecoverable as a full queue.
        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
    }
}
