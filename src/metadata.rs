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

//! Timestamp overrides for input files.
//!
//! Attribute reads of input files return a canonical "new input" timestamp so
//! that tools cannot observe (and bake into their outputs) the real
//! modification times of cached inputs, which would break build determinism.

use crate::manifest::{ManifestFlags, ScopeFlags};

/// UTC unix seconds for February 2, 2002 2:02:02 AM.
///
/// Why this date? It has a lot of 2s in it, and is in the past. Since it is
/// fairly uncommon for file times to be more than a brief moment in the
/// future (unlucky clock adjustment), it is quite possible that there are
/// latent bugs in which tools assume that (current time - file time) is
/// positive.
pub const NEW_INPUT_TIMESTAMP: u64 = 1_012_615_322;

/// The timestamp set of one file, as unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimestamps {
    pub created: u64,
    pub accessed: u64,
    pub modified: u64,
    pub changed: u64,
}

impl FileTimestamps {
    pub fn new(created: u64, accessed: u64, modified: u64, changed: u64) -> Self {
        Self {
            created,
            accessed,
            modified,
            changed,
        }
    }
}

/// Rewrite the timestamps an attribute read of an input file will observe.
///
/// With `NORMALIZE_READ_TIMESTAMPS` every field becomes the canonical input
/// timestamp unconditionally; otherwise each field is clamped up to it
/// (`max(real, canonical)`). Scopes carrying `ALLOW_REAL_INPUT_TIMESTAMPS`
/// are exempt.
pub fn override_timestamps_for_input_file(
    timestamps: &mut FileTimestamps,
    flags: ManifestFlags,
    scope: ScopeFlags,
) {
    if scope.contains(ScopeFlags::ALLOW_REAL_INPUT_TIMESTAMPS) {
        return;
    }

    if flags.contains(ManifestFlags::NORMALIZE_READ_TIMESTAMPS) {
        *timestamps = FileTimestamps::new(
            NEW_INPUT_TIMESTAMP,
            NEW_INPUT_TIMESTAMP,
            NEW_INPUT_TIMESTAMP,
            NEW_INPUT_TIMESTAMP,
        );
    } else {
        timestamps.created = timestamps.created.max(NEW_INPUT_TIMESTAMP);
        timestamps.accessed = timestamps.accessed.max(NEW_INPUT_TIMESTAMP);
        timestamps.modified = timestamps.modified.max(NEW_INPUT_TIMESTAMP);
        timestamps.changed = timestamps.changed.max(NEW_INPUT_TIMESTAMP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_is_unconditional() {
        let mut ts = FileTimestamps::new(
            NEW_INPUT_TIMESTAMP + 100,
            NEW_INPUT_TIMESTAMP + 200,
            1,
            2,
        );
        override_timestamps_for_input_file(
            &mut ts,
            ManifestFlags::NORMALIZE_READ_TIMESTAMPS,
            ScopeFlags::empty(),
        );
        assert_eq!(
            ts,
            FileTimestamps::new(
                NEW_INPUT_TIMESTAMP,
                NEW_INPUT_TIMESTAMP,
                NEW_INPUT_TIMESTAMP,
                NEW_INPUT_TIMESTAMP
            ),
            "normalization overrides even newer-than-canonical values"
        );
    }

    #[test]
    fn default_clamps_up_only() {
        let newer = NEW_INPUT_TIMESTAMP + 500;
        let mut ts = FileTimestamps::new(1, newer, 2, newer);
        override_timestamps_for_input_file(&mut ts, ManifestFlags::empty(), ScopeFlags::empty());
        assert_eq!(
            ts,
            FileTimestamps::new(NEW_INPUT_TIMESTAMP, newer, NEW_INPUT_TIMESTAMP, newer),
            "without the flag only older-than-canonical values are raised"
        );
    }

    #[test]
    fn real_timestamp_scopes_are_exempt() {
        let original = FileTimestamps::new(1, 2, 3, 4);
        let mut ts = original;
        override_timestamps_for_input_file(
            &mut ts,
            ManifestFlags::NORMALIZE_READ_TIMESTAMPS,
            ScopeFlags::ALLOW_REAL_INPUT_TIMESTAMPS,
        );
        assert_eq!(ts, original, "scope flag suppresses every override");
    }
}
