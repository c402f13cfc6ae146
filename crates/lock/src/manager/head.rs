// Copyright 2025 FerroDB Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::request::{LockRequest, RequestStatus};
use crate::types::{Deadline, LockMode, LockResult, ResourceId, INTENT_MODES_MASK, LOCK_MODES_COUNT};

/// Per-resource queue state: the granted set, the FIFO conflict queue, and
/// pending conversions (which stay on the granted list with their target mode
/// pre-counted). All methods require the owning bucket mutex.
pub(crate) struct LockHead {
    resource: ResourceId,
    /// Granted requests, including those with a pending conversion.
    granted: Vec<Arc<LockRequest>>,
    /// Waiting requests in grant order (front is next).
    conflict: VecDeque<Arc<LockRequest>>,
    granted_counts: [u32; LOCK_MODES_COUNT],
    granted_modes: u32,
    conflict_counts: [u32; LOCK_MODES_COUNT],
    conflict_modes: u32,
    /// Number of granted requests with a pending conversion.
    conversions_count: u32,
    /// Number of granted requests carrying the compatibleFirst flag. While
    /// nonzero, the grant scan may promote compatible waiters past queued
    /// conflicting requests.
    compatible_first_count: u32,
    /// Partition indices holding intent requests for this resource, in
    /// placement order (duplicates allowed).
    partitions: Vec<usize>,
}

impl LockHead {
    pub(crate) fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            granted: Vec::new(),
            conflict: VecDeque::new(),
            granted_counts: [0; LOCK_MODES_COUNT],
            granted_modes: 0,
            conflict_counts: [0; LOCK_MODES_COUNT],
            conflict_modes: 0,
            conversions_count: 0,
            compatible_first_count: 0,
            partitions: Vec::new(),
        }
    }

    pub(crate) fn resource(&self) -> ResourceId {
        self.resource
    }

    fn inc_granted(&mut self, mode: LockMode) {
        let idx = mode as usize;
        self.granted_counts[idx] += 1;
        if self.granted_counts[idx] == 1 {
            self.granted_modes |= mode.mask();
        }
    }

    fn dec_granted(&mut self, mode: LockMode) {
        let idx = mode as usize;
        debug_assert!(self.granted_counts[idx] > 0);
        self.granted_counts[idx] -= 1;
        if self.granted_counts[idx] == 0 {
            self.granted_modes &= !mode.mask();
        }
    }

    fn inc_conflict(&mut self, mode: LockMode) {
        let idx = mode as usize;
        self.conflict_counts[idx] += 1;
        if self.conflict_counts[idx] == 1 {
            self.conflict_modes |= mode.mask();
        }
    }

    fn dec_conflict(&mut self, mode: LockMode) {
        let idx = mode as usize;
        debug_assert!(self.conflict_counts[idx] > 0);
        self.conflict_counts[idx] -= 1;
        if self.conflict_counts[idx] == 0 {
            self.conflict_modes &= !mode.mask();
        }
    }

    pub(crate) fn granted_count_for(&self, mode: LockMode) -> u32 {
        self.granted_counts[mode as usize]
    }

    /// Whether this head has intent requests parked in partitions.
    pub(crate) fn is_partitioned(&self) -> bool {
        !self.partitions.is_empty()
    }

    /// Intent requests may bypass the head only while every grant is an
    /// intent mode and nothing is queued.
    pub(crate) fn accepts_partitioned(&self) -> bool {
        (self.granted_modes & !INTENT_MODES_MASK) == 0 && self.conflict_modes == 0
    }

    pub(crate) fn note_partition(&mut self, index: usize) {
        self.partitions.push(index);
    }

    pub(crate) fn take_partitions(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.partitions)
    }

    pub(crate) fn partition_indices(&self) -> &[usize] {
        &self.partitions
    }

    /// Eligible for garbage collection: no grants, no waiters, no pending
    /// conversions, no partitioned residue.
    pub(crate) fn is_unused(&self) -> bool {
        self.granted.is_empty() && self.conflict.is_empty() && self.partitions.is_empty()
    }

    /// Re-home a request migrated out of a partition onto the granted list.
    pub(crate) fn adopt_granted(&mut self, request: Arc<LockRequest>, mode: LockMode) {
        self.inc_granted(mode);
        self.granted.push(request);
    }

    /// Enqueue or grant a fresh request.
    pub(crate) fn new_request(
        &mut self,
        request: &Arc<LockRequest>,
        mode: LockMode,
        deadline: Deadline,
    ) -> LockResult {
        let mut state = request.state();
        debug_assert_eq!(state.nest_count, 0);
        state.mode = mode;
        state.deadline = deadline;
        state.nest_count = 1;
        state.partition = None;

        // A request may jump the queue while a compatibleFirst holder is
        // granted; otherwise anything already waiting blocks it (FIFO).
        let conflicts = mode.conflicts_with(self.granted_modes)
            || (self.compatible_first_count == 0 && mode.conflicts_with(self.conflict_modes));

        if conflicts {
            state.status = RequestStatus::Waiting;
            drop(state);
            if request.enqueue_at_front() {
                self.conflict.push_front(request.clone());
            } else {
                self.conflict.push_back(request.clone());
            }
            self.inc_conflict(mode);
            LockResult::Waiting
        } else {
            state.status = RequestStatus::Granted;
            drop(state);
            self.granted.push(request.clone());
            self.inc_granted(mode);
            if request.compatible_first() {
                self.compatible_first_count += 1;
            }
            LockResult::Granted
        }
    }

    /// Upgrade a granted request to a stronger mode. Conversions that
    /// conflict with other holders wait with absolute priority over the
    /// conflict queue; their target mode is counted as granted immediately
    /// so no new conflicting grants slip in underneath.
    pub(crate) fn convert(&mut self, request: &Arc<LockRequest>, new_mode: LockMode) -> LockResult {
        let mut state = request.state();
        assert_eq!(
            state.status,
            RequestStatus::Granted,
            "conversion requires a granted request on {}",
            self.resource
        );

        let mut granted_without_self = 0u32;
        for idx in 1..LOCK_MODES_COUNT {
            let holds = (state.mode as usize == idx) as u32;
            if self.granted_counts[idx] > holds {
                granted_without_self |= 1 << idx;
            }
        }

        if new_mode.conflicts_with(granted_without_self) {
            state.status = RequestStatus::Converting;
            state.convert_mode = new_mode;
            self.conversions_count += 1;
            self.inc_granted(new_mode);
            LockResult::Waiting
        } else {
            let old_mode = state.mode;
            state.mode = new_mode;
            drop(state);
            self.dec_granted(old_mode);
            self.inc_granted(new_mode);
            LockResult::Granted
        }
    }

    /// Remove a granted request from the granted list without rescanning.
    /// The caller follows up with `on_granted_changed`.
    pub(crate) fn remove_granted(&mut self, request: &Arc<LockRequest>) -> LockMode {
        let position = self
            .granted
            .iter()
            .position(|r| Arc::ptr_eq(r, request))
            .expect("request not on the granted list");
        self.granted.remove(position);
        let mode = {
            let state = request.state();
            debug_assert_eq!(state.status, RequestStatus::Granted);
            state.mode
        };
        self.dec_granted(mode);
        if request.compatible_first() {
            debug_assert!(self.compatible_first_count > 0);
            self.compatible_first_count -= 1;
        }
        mode
    }

    /// Remove a waiting request from the conflict queue (timeout or
    /// abandoned enqueue). Returns false when the request is no longer
    /// queued, i.e. a grant raced the removal.
    pub(crate) fn remove_waiting(&mut self, request: &Arc<LockRequest>) -> bool {
        let Some(position) = self.conflict.iter().position(|r| Arc::ptr_eq(r, request)) else {
            return false;
        };
        let _ = self.conflict.remove(position);
        self.dec_conflict(request.state().mode);
        true
    }

    /// Abort a pending conversion, restoring the previously granted mode.
    pub(crate) fn cancel_conversion(&mut self, request: &Arc<LockRequest>) {
        let mut state = request.state();
        assert_eq!(state.status, RequestStatus::Converting);
        let target = state.convert_mode;
        state.convert_mode = LockMode::None;
        state.status = RequestStatus::Granted;
        drop(state);
        self.conversions_count -= 1;
        self.dec_granted(target);
    }

    /// In-place reduction of a granted request's mode. Never waits; only
    /// rescans the queues for newly grantable waiters.
    pub(crate) fn downgrade(&mut self, request: &Arc<LockRequest>, new_mode: LockMode) {
        let mut state = request.state();
        assert_eq!(
            state.status,
            RequestStatus::Granted,
            "downgrade requires a granted request on {}",
            self.resource
        );
        assert!(
            new_mode.is_covered_by(state.mode),
            "downgrade must weaken the mode: {} -> {} on {}",
            state.mode,
            new_mode,
            self.resource
        );
        let old_mode = state.mode;
        state.mode = new_mode;
        drop(state);
        self.inc_granted(new_mode);
        self.dec_granted(old_mode);
        self.on_granted_changed(true);
    }

    /// Rescan after any granted-set change. Pending conversions are
    /// re-examined first; then, if `check_conflict_queue`, waiters are
    /// granted front to back, stopping at the first conflict unless a
    /// compatibleFirst holder permits skipping past it.
    pub(crate) fn on_granted_changed(&mut self, check_conflict_queue: bool) {
        // Conversions have absolute priority over the conflict queue.
        if self.conversions_count > 0 {
            for index in 0..self.granted.len() {
                if self.conversions_count == 0 {
                    break;
                }
                let request = self.granted[index].clone();
                let mut state = request.state();
                if state.status != RequestStatus::Converting {
                    continue;
                }

                // Granted mask without this request's own hold and its
                // pre-counted conversion target.
                let mut granted_without_self = 0u32;
                for idx in 1..LOCK_MODES_COUNT {
                    let holds = (state.mode as usize == idx) as u32;
                    let waits = (state.convert_mode as usize == idx) as u32;
                    if self.granted_counts[idx] > holds + waits {
                        granted_without_self |= 1 << idx;
                    }
                }

                if !state.convert_mode.conflicts_with(granted_without_self) {
                    self.conversions_count -= 1;
                    let old_mode = state.mode;
                    state.mode = state.convert_mode;
                    state.convert_mode = LockMode::None;
                    state.status = RequestStatus::Granted;
                    drop(state);
                    self.dec_granted(old_mode);
                    request.notify();
                }
            }
        }

        let mut index = 0;
        while check_conflict_queue && index < self.conflict.len() {
            let request = self.conflict[index].clone();
            let mode = request.state().mode;

            if mode.conflicts_with(self.granted_modes) {
                // FIFO: stop at the first conflicting waiter. With a
                // compatibleFirst holder granted, skip it and keep promoting
                // compatible waiters behind it, preserving their queue slots.
                if self.compatible_first_count == 0 {
                    break;
                }
                index += 1;
                continue;
            }

            let _ = self.conflict.remove(index);
            self.dec_conflict(mode);
            {
                let mut state = request.state();
                state.status = RequestStatus::Granted;
            }
            self.granted.push(request.clone());
            self.inc_granted(mode);
            if request.compatible_first() {
                self.compatible_first_count += 1;
            }
            tracing::trace!(resource = %self.resource, mode = %mode, "granted queued request");
            request.notify();

            // Nothing is compatible with a newly granted exclusive.
            if mode == LockMode::Exclusive {
                break;
            }
        }
    }
}

/// Granted-only head for hot intent traffic. Requests parked here are always
/// compatible with each other; the first non-intent request on the resource
/// migrates them back onto the main head. Guarded by the partition mutex.
pub(crate) struct PartitionedLockHead {
    granted: Vec<Arc<LockRequest>>,
}

impl PartitionedLockHead {
    pub(crate) fn new() -> Self {
        Self { granted: Vec::new() }
    }

    pub(crate) fn new_request(
        &mut self,
        request: &Arc<LockRequest>,
        mode: LockMode,
        deadline: Deadline,
        partition_index: usize,
    ) {
        debug_assert!(mode.is_intent());
        let mut state = request.state();
        state.status = RequestStatus::Granted;
        state.mode = mode;
        state.deadline = deadline;
        state.nest_count = 1;
        state.partition = Some(partition_index);
        drop(state);
        self.granted.push(request.clone());
    }

    pub(crate) fn remove(&mut self, request: &Arc<LockRequest>) -> bool {
        let Some(position) = self.granted.iter().position(|r| Arc::ptr_eq(r, request)) else {
            return false;
        };
        self.granted.remove(position);
        true
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<LockRequest>> {
        std::mem::take(&mut self.granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RESOURCE_ID_GLOBAL;

    fn request(locker_id: u64) -> Arc<LockRequest> {
        LockRequest::new(locker_id, RESOURCE_ID_GLOBAL, false, false)
    }

    fn strong_request(locker_id: u64) -> Arc<LockRequest> {
        LockRequest::new(locker_id, RESOURCE_ID_GLOBAL, true, true)
    }

    #[test]
    fn test_compatible_grants_accumulate() {
        let mut head = LockHead::new(RESOURCE_ID_GLOBAL);
        let r1 = request(1);
        let r2 = request(2);

        assert_eq!(
            head.new_request(&r1, LockMode::IntentShared, Deadline::never()),
            LockResult::Granted
        );
        assert_eq!(
            head.new_request(&r2, LockMode::IntentExclusive, Deadline::never()),
            LockResult::Granted
        );
        assert_eq!(head.granted_count_for(LockMode::IntentShared), 1);
        assert_eq!(head.granted_count_for(LockMode::IntentExclusive), 1);
    }

    #[test]
    fn test_fifo_stops_at_first_conflict() {
        let mut head = LockHead::new(RESOURCE_ID_GLOBAL);
        let holder = request(1);
        let writer = request(2);
        let reader = request(3);

        assert_eq!(
            head.new_request(&holder, LockMode::Shared, Deadline::never()),
            LockResult::Granted
        );
        assert_eq!(
            head.new_request(&writer, LockMode::Exclusive, Deadline::never()),
            LockResult::Waiting
        );
        // IS is compatible with the granted S, but a conflicting X waits
        // ahead of it and no compatibleFirst holder is granted.
        assert_eq!(
            head.new_request(&reader, LockMode::IntentShared, Deadline::never()),
            LockResult::Waiting
        );

        head.remove_granted(&holder);
        head.on_granted_changed(true);
        assert!(writer.is_granted());
        assert!(!reader.is_granted());
    }

    #[test]
    fn test_compatible_first_promotes_past_exclusive() {
        let mut head = LockHead::new(RESOURCE_ID_GLOBAL);
        let holder = strong_request(1);
        let writer = request(2);
        let reader = request(3);

        // compatibleFirst S holder, with an X parked behind it.
        assert_eq!(
            head.new_request(&holder, LockMode::Shared, Deadline::never()),
            LockResult::Granted
        );
        assert_eq!(
            head.new_request(&writer, LockMode::Exclusive, Deadline::never()),
            LockResult::Waiting
        );
        // The IS bypasses the queued X entirely.
        assert_eq!(
            head.new_request(&reader, LockMode::IntentShared, Deadline::never()),
            LockResult::Granted
        );
    }

    #[test]
    fn test_conversion_waits_for_other_holders() {
        let mut head = LockHead::new(RESOURCE_ID_GLOBAL);
        let up = request(1);
        let other = request(2);

        assert_eq!(
            head.new_request(&up, LockMode::IntentExclusive, Deadline::never()),
            LockResult::Granted
        );
        assert_eq!(
            head.new_request(&other, LockMode::IntentShared, Deadline::never()),
            LockResult::Granted
        );

        // IX -> X conflicts with the other IS holder.
        assert_eq!(head.convert(&up, LockMode::Exclusive), LockResult::Waiting);

        // Releasing the IS holder completes the conversion.
        head.remove_granted(&other);
        head.on_granted_changed(true);
        assert!(up.is_granted());
        assert_eq!(up.granted_mode(), LockMode::Exclusive);
    }

    #[test]
    fn test_conversion_has_priority_over_conflict_queue() {
        let mut head = LockHead::new(RESOURCE_ID_GLOBAL);
        let up = request(1);
        let holder = request(2);
        let waiter = request(3);

        head.new_request(&up, LockMode::IntentShared, Deadline::never());
        head.new_request(&holder, LockMode::IntentShared, Deadline::never());
        assert_eq!(head.convert(&up, LockMode::Shared), LockResult::Granted);

        // Queue an IX behind the granted IS+S set, then ask for S -> X.
        assert_eq!(
            head.new_request(&waiter, LockMode::IntentExclusive, Deadline::never()),
            LockResult::Waiting
        );
        assert_eq!(head.convert(&up, LockMode::Exclusive), LockResult::Waiting);

        head.remove_granted(&holder);
        head.on_granted_changed(true);

        // The conversion wins; the queued IX stays parked behind the X.
        assert_eq!(up.granted_mode(), LockMode::Exclusive);
        assert!(!waiter.is_granted());
    }

    #[test]
    fn test_downgrade_unblocks_waiters() {
        let mut head = LockHead::new(RESOURCE_ID_GLOBAL);
        let holder = request(1);
        let waiter = request(2);

        head.new_request(&holder, LockMode::Exclusive, Deadline::never());
        assert_eq!(
            head.new_request(&waiter, LockMode::IntentExclusive, Deadline::never()),
            LockResult::Waiting
        );

        head.downgrade(&holder, LockMode::IntentExclusive);
        assert!(waiter.is_granted());
        assert_eq!(holder.granted_mode(), LockMode::IntentExclusive);
    }

    #[test]
    fn test_removed_waiter_unblocks_queue_behind_it() {
        let mut head = LockHead::new(RESOURCE_ID_GLOBAL);
        let holder = request(1);
        let blocked_writer = request(2);
        let reader = request(3);

        head.new_request(&holder, LockMode::Shared, Deadline::never());
        head.new_request(&blocked_writer, LockMode::Exclusive, Deadline::never());
        head.new_request(&reader, LockMode::IntentShared, Deadline::never());

        // Cancelling the queued X lets the IS behind it through.
        assert!(head.remove_waiting(&blocked_writer));
        head.on_granted_changed(true);
        assert!(reader.is_granted());
    }
}
