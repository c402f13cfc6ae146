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

//! Core lock table.
//!
//! The manager owns a sharded hash table of per-resource lock heads, one
//! bucket mutex per shard, plus an array of partitions that absorb hot
//! intent-only traffic. Verbs here never block: `lock` either grants or
//! enqueues, and waiting happens on the request's own condition variable
//! (see [`LockRequest::wait_until`]). All signals are return codes.
//!
//! Lock ordering, everywhere: bucket mutex, then partition mutex, then
//! request state mutex.

mod head;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::LockManagerConfig;
use crate::request::{LockRequest, RequestStatus};
use crate::types::{Deadline, LockMode, LockResult, ResourceId};

use head::{LockHead, PartitionedLockHead};

type PartitionMap = HashMap<ResourceId, PartitionedLockHead>;

/// Hierarchy-agnostic lock table with FIFO queueing, compatibleFirst
/// promotion, conversions, downgrades, and intent partitioning.
pub struct LockManager {
    buckets: Vec<Mutex<HashMap<ResourceId, LockHead>>>,
    partitions: Vec<Mutex<PartitionMap>>,
    bucket_mask: usize,
    partition_mask: usize,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        let bucket_count = config.bucket_count.next_power_of_two().max(1);
        let partition_count = config.partition_count.next_power_of_two().max(1);
        Self {
            buckets: (0..bucket_count).map(|_| Mutex::new(HashMap::new())).collect(),
            partitions: (0..partition_count).map(|_| Mutex::new(PartitionMap::new())).collect(),
            bucket_mask: bucket_count - 1,
            partition_mask: partition_count - 1,
        }
    }

    fn bucket_index(&self, resource: ResourceId) -> usize {
        resource.raw() as usize & self.bucket_mask
    }

    fn partition_index(&self, locker_id: u64) -> usize {
        locker_id as usize & self.partition_mask
    }

    /// Attempt to grant a fresh request; enqueue it on conflict.
    ///
    /// Returns `Granted` or `Waiting`; a waiting caller blocks on the
    /// request and resolves its deadline with [`Self::cancel_waiting`].
    /// Intent requests on an intent-only head are parked in a partition and
    /// granted immediately.
    pub fn lock(&self, request: &Arc<LockRequest>, mode: LockMode, deadline: Deadline) -> LockResult {
        let resource = request.resource();
        let mut bucket = self.buckets[self.bucket_index(resource)].lock();
        let head = bucket.entry(resource).or_insert_with(|| LockHead::new(resource));

        if mode.is_intent() && head.accepts_partitioned() {
            let partition_index = self.partition_index(request.locker_id());
            let mut partition = self.partitions[partition_index].lock();
            let partitioned = partition.entry(resource).or_insert_with(PartitionedLockHead::new);
            partitioned.new_request(request, mode, deadline, partition_index);
            head.note_partition(partition_index);
            return LockResult::Granted;
        }

        // The first non-partitionable request consolidates the partitions
        // into the main head before the grant decision.
        if head.is_partitioned() {
            self.migrate_partitioned(head);
        }

        head.new_request(request, mode, deadline)
    }

    /// Upgrade an existing granted request.
    ///
    /// Re-acquisitions at a covered mode only bump the nest count. A real
    /// upgrade either succeeds in place or waits on the conversion queue,
    /// which has priority over the conflict queue.
    pub fn convert(&self, request: &Arc<LockRequest>, new_mode: LockMode) -> LockResult {
        {
            let mut state = request.state();
            assert_eq!(
                state.status,
                RequestStatus::Granted,
                "conversion requires a granted request on {}",
                request.resource()
            );
            state.nest_count += 1;

            // Fast path: nested acquisition at a covered mode. Safe without
            // the bucket mutex because only the owning locker converts.
            if new_mode.is_covered_by(state.mode) {
                return LockResult::Granted;
            }
            assert!(
                state.mode.is_covered_by(new_mode),
                "unsupported lock conversion {} -> {} on {}",
                state.mode,
                new_mode,
                request.resource()
            );
        }

        let resource = request.resource();
        let mut bucket = self.buckets[self.bucket_index(resource)].lock();
        let head = bucket.get_mut(&resource).expect("converting a request with no lock head");
        // The request itself may be parked in a partition (intent upgrade).
        if head.is_partitioned() {
            self.migrate_partitioned(head);
        }
        head.convert(request, new_mode)
    }

    /// Decrement the nest count; on the last release remove the grant and
    /// hand the resource to every newly compatible waiter. Returns whether
    /// the request was fully released.
    pub fn unlock(&self, request: &Arc<LockRequest>) -> bool {
        {
            let mut state = request.state();
            assert_eq!(
                state.status,
                RequestStatus::Granted,
                "unlock of a request that is not granted on {}",
                request.resource()
            );
            debug_assert!(state.nest_count > 0);
            if state.nest_count > 1 {
                state.nest_count -= 1;
                return false;
            }
        }

        let resource = request.resource();

        // Fast path for partitioned intent grants: only the partition mutex.
        let parked = request.state().partition;
        if let Some(partition_index) = parked {
            let mut partition = self.partitions[partition_index].lock();
            let still_parked = {
                let mut state = request.state();
                if state.partition == Some(partition_index) {
                    state.partition = None;
                    state.nest_count = 0;
                    true
                } else {
                    false
                }
            };
            if still_parked {
                if let Some(partitioned) = partition.get_mut(&resource) {
                    partitioned.remove(request);
                    if partitioned.is_empty() {
                        partition.remove(&resource);
                    }
                }
                return true;
            }
            // Migrated to the main head while we were looking; fall through.
        }

        let mut bucket = self.buckets[self.bucket_index(resource)].lock();
        let head = bucket.get_mut(&resource).expect("unlock of a request with no lock head");
        request.state().nest_count = 0;
        let mode = head.remove_granted(request);
        head.on_granted_changed(head.granted_count_for(mode) == 0);
        if head.is_unused() {
            bucket.remove(&resource);
        }
        true
    }

    /// In-place mode reduction of a granted request; never waits, then
    /// rescans for newly grantable waiters.
    pub fn downgrade(&self, request: &Arc<LockRequest>, new_mode: LockMode) {
        let resource = request.resource();
        let mut bucket = self.buckets[self.bucket_index(resource)].lock();
        let head = bucket.get_mut(&resource).expect("downgrade of a request with no lock head");
        head.downgrade(request, new_mode);
    }

    /// Remove a request whose wait timed out or was abandoned. If the grant
    /// raced the deadline and won, the grant is released again so a timed-out
    /// acquisition leaves no side effect either way.
    pub fn cancel_waiting(&self, request: &Arc<LockRequest>) {
        let resource = request.resource();
        let mut bucket = self.buckets[self.bucket_index(resource)].lock();
        let head = bucket.get_mut(&resource).expect("cancelling a request with no lock head");

        if head.remove_waiting(request) {
            request.state().nest_count = 0;
            // Waiters behind the removed request may now be grantable.
            head.on_granted_changed(true);
        } else {
            tracing::debug!(resource = %resource, "grant raced a timed-out wait; releasing it");
            let mode = head.remove_granted(request);
            {
                let mut state = request.state();
                state.status = RequestStatus::Waiting;
                state.nest_count = 0;
            }
            head.on_granted_changed(head.granted_count_for(mode) == 0);
        }
        if head.is_unused() {
            bucket.remove(&resource);
        }
    }

    /// Abort a timed-out conversion, restoring the pre-conversion grant. If
    /// the conversion raced the deadline and completed, the request is
    /// downgraded back to `previous_mode` instead.
    pub fn cancel_conversion(&self, request: &Arc<LockRequest>, previous_mode: LockMode) {
        let resource = request.resource();
        let mut bucket = self.buckets[self.bucket_index(resource)].lock();
        let head = bucket.get_mut(&resource).expect("cancelling a conversion with no lock head");

        let status = request.state().status;
        match status {
            RequestStatus::Converting => {
                head.cancel_conversion(request);
                request.state().nest_count -= 1;
                head.on_granted_changed(true);
            }
            RequestStatus::Granted => {
                tracing::debug!(resource = %resource, "conversion raced a timed-out wait; downgrading");
                request.state().nest_count -= 1;
                head.downgrade(request, previous_mode);
            }
            RequestStatus::Waiting => unreachable!("conversion cancel on a waiting request"),
        }
    }

    /// Drop lock heads whose only residue is empty partition bookkeeping.
    /// Heads with grants, waiters, or live partitioned requests are kept.
    pub fn cleanup_unused(&self) -> usize {
        let mut cleaned = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            let resources: Vec<ResourceId> = bucket.keys().copied().collect();
            for resource in resources {
                let head = bucket.get_mut(&resource).unwrap();
                if !head.is_partitioned() {
                    if head.is_unused() {
                        bucket.remove(&resource);
                        cleaned += 1;
                    }
                    continue;
                }
                let live = head
                    .partition_indices()
                    .iter()
                    .any(|&index| self.partitions[index].lock().contains_key(&resource));
                if !live {
                    head.take_partitions();
                    if head.is_unused() {
                        bucket.remove(&resource);
                        cleaned += 1;
                    }
                }
            }
        }
        cleaned
    }

    fn migrate_partitioned(&self, head: &mut LockHead) {
        let resource = head.resource();
        for partition_index in head.take_partitions() {
            let mut partition = self.partitions[partition_index].lock();
            if let Some(mut partitioned) = partition.remove(&resource) {
                for request in partitioned.drain() {
                    let mode = {
                        let mut state = request.state();
                        state.partition = None;
                        state.mode
                    };
                    head.adopt_granted(request, mode);
                }
            }
        }
        tracing::trace!(resource = %resource, "consolidated partitioned lock heads");
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockManagerConfig::default())
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("buckets", &self.buckets.len())
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceType, RESOURCE_ID_GLOBAL};
    use std::time::Duration;

    fn fresh(locker_id: u64, resource: ResourceId) -> Arc<LockRequest> {
        LockRequest::new(locker_id, resource, false, false)
    }

    #[test]
    fn test_grant_and_unlock_roundtrip() {
        let manager = LockManager::default();
        let db = ResourceId::new(ResourceType::Database, "db");
        let request = fresh(1, db);

        assert_eq!(manager.lock(&request, LockMode::Exclusive, Deadline::never()), LockResult::Granted);
        assert_eq!(request.granted_mode(), LockMode::Exclusive);
        assert!(manager.unlock(&request));
        assert_eq!(request.granted_mode(), LockMode::None);
    }

    #[test]
    fn test_nested_acquisition_releases_in_steps() {
        let manager = LockManager::default();
        let db = ResourceId::new(ResourceType::Database, "db");
        let request = fresh(1, db);

        manager.lock(&request, LockMode::Shared, Deadline::never());
        assert_eq!(manager.convert(&request, LockMode::Shared), LockResult::Granted);
        assert!(!manager.unlock(&request));
        assert_eq!(request.granted_mode(), LockMode::Shared);
        assert!(manager.unlock(&request));
    }

    #[test]
    fn test_conflicting_request_waits_and_times_out() {
        let manager = LockManager::default();
        let db = ResourceId::new(ResourceType::Database, "db");
        let holder = fresh(1, db);
        let waiter = fresh(2, db);

        manager.lock(&holder, LockMode::Exclusive, Deadline::never());
        let deadline = Deadline::after(Duration::from_millis(20));
        assert_eq!(manager.lock(&waiter, LockMode::Shared, deadline), LockResult::Waiting);
        assert!(!waiter.wait_until(deadline));
        manager.cancel_waiting(&waiter);
        assert_eq!(waiter.granted_mode(), LockMode::None);

        // The holder is unaffected and the waiter is fully gone.
        assert_eq!(holder.granted_mode(), LockMode::Exclusive);
        assert!(manager.unlock(&holder));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let manager = Arc::new(LockManager::default());
        let db = ResourceId::new(ResourceType::Database, "db");
        let holder = fresh(1, db);
        let waiter = fresh(2, db);

        manager.lock(&holder, LockMode::Exclusive, Deadline::never());
        assert_eq!(manager.lock(&waiter, LockMode::Shared, Deadline::never()), LockResult::Waiting);

        let releaser = manager.clone();
        let held = holder.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            releaser.unlock(&held);
        });

        assert!(waiter.wait_until(Deadline::after(Duration::from_secs(5))));
        assert_eq!(waiter.granted_mode(), LockMode::Shared);
        handle.join().unwrap();
        manager.unlock(&waiter);
    }

    #[test]
    fn test_intent_requests_use_partitions() {
        let manager = LockManager::default();
        let a = fresh(1, RESOURCE_ID_GLOBAL);
        let b = fresh(2, RESOURCE_ID_GLOBAL);

        assert_eq!(manager.lock(&a, LockMode::IntentShared, Deadline::never()), LockResult::Granted);
        assert_eq!(manager.lock(&b, LockMode::IntentExclusive, Deadline::never()), LockResult::Granted);
        assert!(a.state().partition.is_some());
        assert!(b.state().partition.is_some());

        assert!(manager.unlock(&a));
        assert!(manager.unlock(&b));
        assert_eq!(a.granted_mode(), LockMode::None);
    }

    #[test]
    fn test_non_intent_request_consolidates_partitions() {
        let manager = LockManager::default();
        let intent = fresh(1, RESOURCE_ID_GLOBAL);
        let strong = fresh(2, RESOURCE_ID_GLOBAL);

        manager.lock(&intent, LockMode::IntentExclusive, Deadline::never());
        assert!(intent.state().partition.is_some());

        // S conflicts with the migrated IX, so it must observe it and wait.
        assert_eq!(manager.lock(&strong, LockMode::Shared, Deadline::never()), LockResult::Waiting);
        assert!(intent.state().partition.is_none());

        assert!(manager.unlock(&intent));
        assert!(strong.wait_until(Deadline::after(Duration::from_secs(5))));
        assert!(manager.unlock(&strong));
    }

    #[test]
    fn test_conversion_after_partitioned_grant() {
        let manager = LockManager::default();
        let request = fresh(1, RESOURCE_ID_GLOBAL);

        manager.lock(&request, LockMode::IntentShared, Deadline::never());
        assert!(request.state().partition.is_some());

        // IS -> S upgrade migrates the request onto the main head first.
        assert_eq!(manager.convert(&request, LockMode::Shared), LockResult::Granted);
        assert_eq!(request.granted_mode(), LockMode::Shared);
        assert!(request.state().partition.is_none());

        assert!(!manager.unlock(&request));
        assert!(manager.unlock(&request));
    }

    #[test]
    fn test_cancel_conversion_restores_previous_mode() {
        let manager = LockManager::default();
        let db = ResourceId::new(ResourceType::Database, "db");
        let up = fresh(1, db);
        let other = fresh(2, db);

        manager.lock(&up, LockMode::IntentExclusive, Deadline::never());
        manager.lock(&other, LockMode::IntentShared, Deadline::never());

        assert_eq!(manager.convert(&up, LockMode::Exclusive), LockResult::Waiting);
        manager.cancel_conversion(&up, LockMode::IntentExclusive);
        assert_eq!(up.granted_mode(), LockMode::IntentExclusive);

        // The cancelled conversion no longer blocks anything exclusive-ish.
        let reader = fresh(3, db);
        assert_eq!(manager.lock(&reader, LockMode::IntentShared, Deadline::never()), LockResult::Granted);

        manager.unlock(&reader);
        manager.unlock(&other);
        assert!(manager.unlock(&up));
    }

    #[test]
    fn test_cleanup_unused_drops_stale_heads() {
        let manager = LockManager::default();
        let request = fresh(1, RESOURCE_ID_GLOBAL);

        manager.lock(&request, LockMode::IntentShared, Deadline::never());
        manager.unlock(&request);

        // The partitioned release leaves only head bookkeeping behind.
        assert!(manager.cleanup_unused() >= 1);
        assert_eq!(manager.cleanup_unused(), 0);
    }
}
