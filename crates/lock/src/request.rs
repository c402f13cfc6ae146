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

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

use crate::types::{Deadline, LockMode, ResourceId};

/// Queue status of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestStatus {
    /// Held; on the granted list of its lock head.
    Granted,
    /// Enqueued on the conflict list, not yet granted.
    Waiting,
    /// Granted at `mode` with a pending upgrade to `convert_mode`.
    Converting,
}

/// Mutable request state. Queue membership and the fields below are mutated
/// only under the owning bucket (or partition) mutex; the request mutex
/// additionally serializes them against the waiter. Lock order is always
/// bucket, then partition, then request.
#[derive(Debug)]
pub(crate) struct RequestState {
    pub status: RequestStatus,
    /// Granted (or requested, while waiting) mode.
    pub mode: LockMode,
    /// Target mode of a pending conversion; `None` otherwise.
    pub convert_mode: LockMode,
    /// Number of nested acquisitions folded into this request.
    pub nest_count: u32,
    /// Releases deferred to the end of the current write unit of work.
    pub unlock_pending: u32,
    /// Absolute deadline fixed at enqueue time.
    pub deadline: Deadline,
    /// Index of the partition parking this request, when intent traffic is
    /// being absorbed by partitioned lock heads.
    pub partition: Option<usize>,
}

/// A single locker's request for one resource.
///
/// The owning `Locker` keeps the request in its table; lock head queues hold
/// `Arc` clones, so no cross-owner raw pointers exist. Identity comparisons
/// in the queues are by pointer.
pub struct LockRequest {
    locker_id: u64,
    resource: ResourceId,
    /// Strong global requests jump to the front of the conflict queue.
    enqueue_at_front: bool,
    /// Eligible to pull compatible waiters past queued exclusive requests.
    compatible_first: bool,
    state: Mutex<RequestState>,
    grant_cv: Condvar,
}

impl LockRequest {
    pub fn new(
        locker_id: u64,
        resource: ResourceId,
        enqueue_at_front: bool,
        compatible_first: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            locker_id,
            resource,
            enqueue_at_front,
            compatible_first,
            state: Mutex::new(RequestState {
                status: RequestStatus::Waiting,
                mode: LockMode::None,
                convert_mode: LockMode::None,
                nest_count: 0,
                unlock_pending: 0,
                deadline: Deadline::never(),
                partition: None,
            }),
            grant_cv: Condvar::new(),
        })
    }

    pub fn locker_id(&self) -> u64 {
        self.locker_id
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub(crate) fn enqueue_at_front(&self) -> bool {
        self.enqueue_at_front
    }

    pub(crate) fn compatible_first(&self) -> bool {
        self.compatible_first
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock()
    }

    /// Wake the waiter after a status change made under the queue locks.
    pub(crate) fn notify(&self) {
        self.grant_cv.notify_all();
    }

    /// Granted mode, or `LockMode::None` when not granted. A pending
    /// conversion reports the currently held (pre-conversion) mode.
    pub fn granted_mode(&self) -> LockMode {
        let state = self.state.lock();
        match state.status {
            RequestStatus::Granted | RequestStatus::Converting => state.mode,
            RequestStatus::Waiting => LockMode::None,
        }
    }

    pub fn is_granted(&self) -> bool {
        self.state.lock().status == RequestStatus::Granted
    }

    /// Block until the request is granted or `deadline` expires. Returns
    /// whether the grant is held. A deadline at or before now degrades to a
    /// single status check.
    pub fn wait_until(&self, deadline: Deadline) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.status == RequestStatus::Granted {
                return true;
            }
            match deadline.instant() {
                None => self.grant_cv.wait(&mut state),
                Some(instant) => {
                    if self.grant_cv.wait_until(&mut state, instant).timed_out() {
                        // The grant may have raced the deadline; report
                        // whatever is true now, the caller resolves the race
                        // under the queue locks.
                        return state.status == RequestStatus::Granted;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LockRequest")
            .field("locker_id", &self.locker_id)
            .field("resource", &self.resource)
            .field("status", &state.status)
            .field("mode", &state.mode)
            .field("nest_count", &state.nest_count)
            .finish()
    }
}
