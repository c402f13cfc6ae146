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

//! Per-operation lock holder.
//!
//! The locker enforces the hierarchical protocol and the ticket rule on top
//! of the [`LockManager`]: it records every granted request, folds nested
//! acquisitions into one request per resource, brackets write units of work
//! (deferring exclusive releases to the end), and drives snapshot
//! abandonment and ticket lifetime off the last global release.
//!
//! A locker's own state is single-writer: only the owning operation's thread
//! acquires and releases through it. Other threads may call the
//! introspection queries, which is why the request table sits behind a
//! mutex that is never held across a blocking wait.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::LockerOptions;
use crate::context::{GlobalLockAcquisitionTracker, RecoveryUnit};
use crate::manager::LockManager;
use crate::request::LockRequest;
use crate::ticket::TicketHolder;
use crate::types::{
    Deadline, LockMode, LockResult, ResourceId, ResourceType, RESOURCE_ID_GLOBAL,
    RESOURCE_ID_JOURNAL_FLUSH,
};

static NEXT_LOCKER_ID: AtomicU64 = AtomicU64::new(1);

/// Captured lock stack for a temporary release; see
/// [`Locker::save_state_and_unlock`].
#[derive(Debug)]
pub struct LockSnapshot {
    global_mode: LockMode,
    locks: Vec<(ResourceId, LockMode)>,
}

#[derive(Clone, Copy)]
struct PendingGlobal {
    /// Mode held before a pending upgrade, `None` for a fresh request.
    converting_from: Option<LockMode>,
}

#[derive(Default)]
struct Throttling {
    reader: Option<Arc<TicketHolder>>,
    writer: Option<Arc<TicketHolder>>,
}

struct LockerInner {
    /// One request per resource; nesting lives on the request.
    requests: HashMap<ResourceId, Arc<LockRequest>>,
    /// Resource ids in first-acquisition order, for snapshot/restore and
    /// end-of-WUOW release ordering.
    order: Vec<ResourceId>,
    wuow_level: u32,
    /// Global acquisition context: the mode the ticket decision was made
    /// for, `LockMode::None` outside any global hold.
    ticket_mode: LockMode,
    /// The holder our ticket came from, if one was taken.
    ticket: Option<Arc<TicketHolder>>,
    pending_global: Option<PendingGlobal>,
}

/// Per-operation lock state.
pub struct Locker {
    id: u64,
    manager: Arc<LockManager>,
    options: LockerOptions,
    inner: Mutex<LockerInner>,
    /// Resource currently being waited for, readable from other threads.
    waiting_on: Mutex<Option<ResourceId>>,
    should_acquire_ticket: AtomicBool,
    throttling: Mutex<Throttling>,
    recovery_unit: Mutex<Option<Arc<dyn RecoveryUnit>>>,
    tracker: GlobalLockAcquisitionTracker,
}

impl Locker {
    pub fn new(manager: Arc<LockManager>) -> Self {
        Self::with_options(manager, LockerOptions::default())
    }

    pub fn with_options(manager: Arc<LockManager>, options: LockerOptions) -> Self {
        Self {
            id: NEXT_LOCKER_ID.fetch_add(1, Ordering::Relaxed),
            manager,
            options,
            inner: Mutex::new(LockerInner {
                requests: HashMap::new(),
                order: Vec::new(),
                wuow_level: 0,
                ticket_mode: LockMode::None,
                ticket: None,
                pending_global: None,
            }),
            waiting_on: Mutex::new(None),
            should_acquire_ticket: AtomicBool::new(true),
            throttling: Mutex::new(Throttling::default()),
            recovery_unit: Mutex::new(None),
            tracker: GlobalLockAcquisitionTracker::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn supports_document_locking(&self) -> bool {
        self.options.supports_document_locking
    }

    // ---- global acquisition -------------------------------------------------

    /// Acquire the global resource, blocking until granted or `deadline`.
    pub fn lock_global(&self, mode: LockMode, deadline: Deadline) -> LockResult {
        match self.lock_global_begin(mode, deadline) {
            LockResult::Waiting => self.lock_global_complete(deadline),
            result => result,
        }
    }

    /// Admission plus enqueue: takes a ticket when required, then either
    /// grants the global resource immediately or leaves the request queued
    /// for [`Self::lock_global_complete`].
    pub fn lock_global_begin(&self, mode: LockMode, deadline: Deadline) -> LockResult {
        debug_assert_ne!(mode, LockMode::None);

        let needs_admission = self.inner.lock().ticket_mode == LockMode::None;
        if needs_admission {
            // One ticket per locker, taken for the first global acquisition
            // only. Shared and intent acquisitions are throttled; exclusive
            // ones bypass the admission gate.
            let holder = if self.should_acquire_ticket.load(Ordering::Relaxed) {
                let throttling = self.throttling.lock();
                match mode {
                    LockMode::IntentShared | LockMode::Shared => throttling.reader.clone(),
                    LockMode::IntentExclusive => throttling.writer.clone(),
                    LockMode::Exclusive | LockMode::None => None,
                }
            } else {
                None
            };

            if let Some(holder) = holder {
                if !holder.wait_until(deadline) {
                    tracing::debug!(locker = self.id, mode = %mode, "timed out waiting for a ticket");
                    return LockResult::TimedOut;
                }
                let mut inner = self.inner.lock();
                inner.ticket = Some(holder);
                inner.ticket_mode = mode;
            } else {
                self.inner.lock().ticket_mode = mode;
            }
        }

        let (result, _request, converting_from) =
            self.acquire_begin(RESOURCE_ID_GLOBAL, mode, deadline);
        match result {
            LockResult::Granted => {
                self.on_global_granted(mode);
                LockResult::Granted
            }
            LockResult::Waiting => {
                self.inner.lock().pending_global = Some(PendingGlobal { converting_from });
                LockResult::Waiting
            }
            LockResult::TimedOut => unreachable!("enqueue never times out"),
        }
    }

    /// Wait for an enqueued global acquisition until `wait_deadline` (capped
    /// by the request's own deadline). Returns `Granted`; or `Waiting` when
    /// the wait bound passed but the request deadline has not, leaving the
    /// request queued for a later call; or `TimedOut` once the request
    /// deadline expires, after removing the request and undoing admission.
    pub fn lock_global_complete(&self, wait_deadline: Deadline) -> LockResult {
        let (request, pending) = {
            let inner = self.inner.lock();
            let pending = inner
                .pending_global
                .expect("no pending global acquisition to wait for");
            let request = inner
                .requests
                .get(&RESOURCE_ID_GLOBAL)
                .expect("pending global acquisition with no request")
                .clone();
            (request, pending)
        };
        let request_deadline = request.state().deadline;
        let effective = wait_deadline.earliest(request_deadline);

        *self.waiting_on.lock() = Some(RESOURCE_ID_GLOBAL);
        let granted = request.wait_until(effective);
        *self.waiting_on.lock() = None;

        if granted {
            let mode = request.state().mode;
            self.inner.lock().pending_global = None;
            self.on_global_granted(mode);
            return LockResult::Granted;
        }

        if !request_deadline.has_passed() {
            return LockResult::Waiting;
        }

        self.abandon_pending_global(&request, pending);
        LockResult::TimedOut
    }

    /// Abandon a still-queued global acquisition (enqueue-only scope exit).
    pub fn cancel_global_enqueue(&self) {
        let (request, pending) = {
            let inner = self.inner.lock();
            let Some(pending) = inner.pending_global else {
                return;
            };
            let request = inner
                .requests
                .get(&RESOURCE_ID_GLOBAL)
                .expect("pending global acquisition with no request")
                .clone();
            (request, pending)
        };
        // The grant may have slipped in; resolving that race is exactly what
        // the timeout path does.
        self.abandon_pending_global(&request, pending);
    }

    fn abandon_pending_global(&self, request: &Arc<LockRequest>, pending: PendingGlobal) {
        match pending.converting_from {
            None => {
                self.manager.cancel_waiting(request);
                let mut inner = self.inner.lock();
                inner.requests.remove(&RESOURCE_ID_GLOBAL);
                inner.order.retain(|r| *r != RESOURCE_ID_GLOBAL);
                inner.pending_global = None;
                if let Some(ticket) = inner.ticket.take() {
                    ticket.release();
                }
                inner.ticket_mode = LockMode::None;
            }
            Some(previous_mode) => {
                // An outer scope still holds the global; only the upgrade
                // attempt is undone.
                self.manager.cancel_conversion(request, previous_mode);
                self.inner.lock().pending_global = None;
            }
        }
    }

    /// Side effects of a successful global grant: the sticky exclusive bit
    /// and, on the legacy engine, the coupled journal-flush lock.
    fn on_global_granted(&self, mode: LockMode) {
        if matches!(mode, LockMode::IntentExclusive | LockMode::Exclusive) {
            self.tracker.set_global_exclusive_lock_taken();
        }
        if self.options.couples_journal_flush {
            let flush_mode = if mode.is_shared() {
                LockMode::IntentShared
            } else {
                LockMode::IntentExclusive
            };
            let result = self.lock(RESOURCE_ID_JOURNAL_FLUSH, flush_mode, Deadline::never());
            assert!(result.is_granted(), "journal-flush lock must follow the global lock");
        }
    }

    /// Release one nesting level of the global lock (and its coupled
    /// journal-flush lock). Returns whether the global was fully released.
    pub fn unlock_global(&self) -> bool {
        if self.options.couples_journal_flush {
            self.unlock(RESOURCE_ID_JOURNAL_FLUSH);
        }
        self.unlock(RESOURCE_ID_GLOBAL)
    }

    // ---- generic acquisition ------------------------------------------------

    /// Acquire `resource` at `mode`, blocking until granted or `deadline`.
    /// Not for the global resource; use [`Self::lock_global`], which also
    /// handles admission.
    pub fn lock(&self, resource: ResourceId, mode: LockMode, deadline: Deadline) -> LockResult {
        assert_ne!(
            resource.resource_type(),
            ResourceType::Global,
            "global acquisitions go through lock_global"
        );
        debug_assert!(
            !matches!(
                resource.resource_type(),
                ResourceType::Database | ResourceType::Collection
            ) || self.is_locked(),
            "hierarchy violation: {resource} without a global lock"
        );

        let (result, request, converting_from) = self.acquire_begin(resource, mode, deadline);
        if result != LockResult::Waiting {
            return result;
        }

        *self.waiting_on.lock() = Some(resource);
        let granted = request.wait_until(deadline);
        *self.waiting_on.lock() = None;
        if granted {
            return LockResult::Granted;
        }

        tracing::debug!(locker = self.id, resource = %resource, mode = %mode, "lock wait timed out");
        match converting_from {
            None => {
                self.manager.cancel_waiting(&request);
                let mut inner = self.inner.lock();
                inner.requests.remove(&resource);
                inner.order.retain(|r| *r != resource);
            }
            Some(previous_mode) => {
                self.manager.cancel_conversion(&request, previous_mode);
            }
        }
        LockResult::TimedOut
    }

    fn acquire_begin(
        &self,
        resource: ResourceId,
        mode: LockMode,
        deadline: Deadline,
    ) -> (LockResult, Arc<LockRequest>, Option<LockMode>) {
        let existing = self.inner.lock().requests.get(&resource).cloned();
        if let Some(request) = existing {
            let previous_mode = request.state().mode;
            let result = self.manager.convert(&request, mode);
            let converting_from = if result == LockResult::Waiting {
                // The pending conversion waits against this acquisition's
                // deadline, not the one fixed at first enqueue.
                request.state().deadline = deadline;
                Some(previous_mode)
            } else {
                None
            };
            return (result, request, converting_from);
        }

        // Strong global-scope requests are served ahead of the queue and
        // seed the compatibleFirst policy for read-mostly workloads.
        let strong_global = matches!(
            resource.resource_type(),
            ResourceType::Global | ResourceType::JournalFlush
        ) && matches!(mode, LockMode::Shared | LockMode::Exclusive);

        let request = LockRequest::new(self.id, resource, strong_global, strong_global);
        {
            let mut inner = self.inner.lock();
            inner.requests.insert(resource, request.clone());
            inner.order.push(resource);
        }
        let result = self.manager.lock(&request, mode, deadline);
        (result, request, None)
    }

    // ---- release ------------------------------------------------------------

    /// Release one nesting level of `resource`. Inside a write unit of work
    /// exclusive holds are deferred until `end_write_unit_of_work`. Returns
    /// whether the resource was fully released.
    pub fn unlock(&self, resource: ResourceId) -> bool {
        let request = {
            let inner = self.inner.lock();
            let request = inner
                .requests
                .get(&resource)
                .unwrap_or_else(|| panic!("unlock of {resource}, which is not held"))
                .clone();
            if inner.wuow_level > 0 && Self::should_delay_unlock(resource, &request) {
                request.state().unlock_pending += 1;
                return false;
            }
            request
        };
        self.unlock_internal(resource, &request)
    }

    /// Two-phase locking: exclusive holds taken under a write unit of work
    /// outlive their guard until the unit ends.
    fn should_delay_unlock(resource: ResourceId, request: &Arc<LockRequest>) -> bool {
        if resource.resource_type() == ResourceType::Mutex {
            return false;
        }
        matches!(
            request.state().mode,
            LockMode::IntentExclusive | LockMode::Exclusive
        )
    }

    fn unlock_internal(&self, resource: ResourceId, request: &Arc<LockRequest>) -> bool {
        if !self.manager.unlock(request) {
            return false;
        }

        let mut inner = self.inner.lock();
        inner.requests.remove(&resource);
        inner.order.retain(|r| *r != resource);

        if resource == RESOURCE_ID_GLOBAL {
            if let Some(ticket) = inner.ticket.take() {
                ticket.release();
            }
            inner.ticket_mode = LockMode::None;
            let in_wuow = inner.wuow_level > 0;
            drop(inner);
            if !in_wuow {
                let recovery_unit = self.recovery_unit.lock().clone();
                if let Some(recovery_unit) = recovery_unit {
                    recovery_unit.abandon_snapshot();
                }
            }
        }
        true
    }

    /// In-place reduction of a held mode (e.g. global X to IX after an
    /// out-of-order scope destruction). The resource must be held at a mode
    /// dominating `new_mode`.
    pub fn downgrade(&self, resource: ResourceId, new_mode: LockMode) {
        let request = self
            .inner
            .lock()
            .requests
            .get(&resource)
            .unwrap_or_else(|| panic!("downgrade of {resource}, which is not held"))
            .clone();
        self.manager.downgrade(&request, new_mode);
    }

    // ---- write unit of work -------------------------------------------------

    pub fn begin_write_unit_of_work(&self) {
        self.inner.lock().wuow_level += 1;
    }

    pub fn end_write_unit_of_work(&self) {
        let deferred: Vec<(ResourceId, u32, Arc<LockRequest>)> = {
            let mut inner = self.inner.lock();
            assert!(inner.wuow_level > 0, "end_write_unit_of_work without a matching begin");
            inner.wuow_level -= 1;
            if inner.wuow_level > 0 {
                return;
            }
            // Children first, global last, so the snapshot hook fires after
            // the whole deferred stack has drained.
            let mut deferred = Vec::new();
            for resource in inner.order.iter().rev() {
                let request = inner.requests[resource].clone();
                let pending = {
                    let mut state = request.state();
                    std::mem::take(&mut state.unlock_pending)
                };
                if pending > 0 {
                    deferred.push((*resource, pending, request));
                }
            }
            deferred
        };

        for (resource, pending, request) in deferred {
            for _ in 0..pending {
                self.unlock_internal(resource, &request);
            }
        }
    }

    pub fn in_write_unit_of_work(&self) -> bool {
        self.inner.lock().wuow_level > 0
    }

    // ---- temporary release --------------------------------------------------

    /// Capture and release the entire lock stack for a temporary yield.
    ///
    /// Returns `None` (and releases nothing) when there is nothing safe to
    /// yield: no global lock is held, or the global request is nested,
    /// meaning enclosing scopes still rely on it. Resource mutexes are never
    /// yielded. Must not be called inside a write unit of work.
    pub fn save_state_and_unlock(&self) -> Option<LockSnapshot> {
        let (snapshot, release_order) = {
            let inner = self.inner.lock();
            assert_eq!(
                inner.wuow_level, 0,
                "cannot temporarily release locks inside a write unit of work"
            );

            let Some(global) = inner.requests.get(&RESOURCE_ID_GLOBAL) else {
                for resource in inner.requests.keys() {
                    assert_eq!(
                        resource.resource_type(),
                        ResourceType::Mutex,
                        "non-mutex lock {resource} held without a global lock"
                    );
                }
                return None;
            };

            let global_mode = {
                let state = global.state();
                if state.nest_count > 1 {
                    return None;
                }
                state.mode
            };

            let mut locks = Vec::new();
            let mut release_order = Vec::new();
            for resource in &inner.order {
                match resource.resource_type() {
                    // Mutexes stay held; the flush lock is re-derived from
                    // the global mode on restore.
                    ResourceType::Mutex => continue,
                    ResourceType::Global | ResourceType::JournalFlush => {}
                    _ => {
                        let state = inner.requests[resource].state();
                        assert_eq!(
                            state.nest_count, 1,
                            "cannot temporarily release nested lock on {resource}"
                        );
                        locks.push((*resource, state.mode));
                    }
                }
                release_order.push(*resource);
            }

            (LockSnapshot { global_mode, locks }, release_order)
        };

        for resource in release_order.into_iter().rev() {
            let fully = self.unlock(resource);
            debug_assert!(fully, "temporary release left {resource} held");
        }
        Some(snapshot)
    }

    /// Reacquire a lock stack captured by [`Self::save_state_and_unlock`],
    /// in the original order and modes. Blocks without a deadline.
    pub fn restore_state(&self, snapshot: LockSnapshot) {
        assert!(!self.is_locked(), "restoring lock state over held locks");
        let result = self.lock_global(snapshot.global_mode, Deadline::never());
        assert!(result.is_granted());
        for (resource, mode) in snapshot.locks {
            let result = self.lock(resource, mode, Deadline::never());
            assert!(result.is_granted());
        }
    }

    // ---- introspection ------------------------------------------------------

    /// Currently held mode for `resource`, `LockMode::None` when not held.
    pub fn lock_mode(&self, resource: ResourceId) -> LockMode {
        match self.inner.lock().requests.get(&resource) {
            Some(request) => request.granted_mode(),
            None => LockMode::None,
        }
    }

    /// Whether any global lock is held.
    pub fn is_locked(&self) -> bool {
        self.lock_mode(RESOURCE_ID_GLOBAL) != LockMode::None
    }

    /// Global lock held exactly at S.
    pub fn is_r(&self) -> bool {
        self.lock_mode(RESOURCE_ID_GLOBAL) == LockMode::Shared
    }

    /// Global lock held exactly at X.
    pub fn is_w(&self) -> bool {
        self.lock_mode(RESOURCE_ID_GLOBAL) == LockMode::Exclusive
    }

    /// Global lock dominating IS (any read access).
    pub fn is_read_locked(&self) -> bool {
        self.is_lock_held_for_mode(RESOURCE_ID_GLOBAL, LockMode::IntentShared)
    }

    /// Global lock dominating IX (any write access).
    pub fn is_write_locked(&self) -> bool {
        self.is_lock_held_for_mode(RESOURCE_ID_GLOBAL, LockMode::IntentExclusive)
    }

    /// Whether the held mode on `resource` dominates `mode`.
    pub fn is_lock_held_for_mode(&self, resource: ResourceId, mode: LockMode) -> bool {
        mode.is_covered_by(self.lock_mode(resource))
    }

    /// Whether the database is effectively locked for `mode`, accounting for
    /// global S/X short-circuits.
    pub fn is_db_locked_for_mode(&self, db_name: &str, mode: LockMode) -> bool {
        if self.is_w() {
            return true;
        }
        if self.is_r() && mode.is_shared() {
            return true;
        }
        self.is_lock_held_for_mode(ResourceId::new(ResourceType::Database, db_name), mode)
    }

    /// Whether the collection namespace (`db.collection`) is effectively
    /// locked for `mode`.
    pub fn is_collection_locked_for_mode(&self, namespace: &str, mode: LockMode) -> bool {
        let db_name = namespace.split('.').next().unwrap_or(namespace);
        debug_assert!(
            namespace.len() > db_name.len(),
            "collection lock check requires a db.collection namespace"
        );

        if self.is_w() {
            return true;
        }
        if self.is_r() && mode.is_shared() {
            return true;
        }

        match self.lock_mode(ResourceId::new(ResourceType::Database, db_name)) {
            LockMode::Exclusive => true,
            LockMode::Shared => mode.is_shared(),
            LockMode::IntentShared | LockMode::IntentExclusive => self.is_lock_held_for_mode(
                ResourceId::new(ResourceType::Collection, namespace),
                mode,
            ),
            LockMode::None => false,
        }
    }

    /// Resource this locker is blocked on, if any. Readable from other
    /// threads; observes either the pre- or post-wait value.
    pub fn waiting_resource(&self) -> Option<ResourceId> {
        *self.waiting_on.lock()
    }

    // ---- collaborator wiring ------------------------------------------------

    pub fn set_should_acquire_ticket(&self, should: bool) {
        self.should_acquire_ticket.store(should, Ordering::Relaxed);
    }

    /// Install (or clear) the admission gates for shared and write-intent
    /// global acquisitions. The caller must keep the holders alive until the
    /// locker's tickets are returned.
    pub fn set_global_throttling(
        &self,
        reader: Option<Arc<TicketHolder>>,
        writer: Option<Arc<TicketHolder>>,
    ) {
        let mut throttling = self.throttling.lock();
        throttling.reader = reader;
        throttling.writer = writer;
    }

    pub fn set_recovery_unit(&self, recovery_unit: Option<Arc<dyn RecoveryUnit>>) {
        *self.recovery_unit.lock() = recovery_unit;
    }

    pub fn acquisition_tracker(&self) -> &GlobalLockAcquisitionTracker {
        &self.tracker
    }
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Locker")
            .field("id", &self.id)
            .field("held_resources", &inner.order)
            .field("wuow_level", &inner.wuow_level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockerOptions;

    fn manager() -> Arc<LockManager> {
        Arc::new(LockManager::default())
    }

    fn db(name: &str) -> ResourceId {
        ResourceId::new(ResourceType::Database, name)
    }

    #[test]
    fn test_global_roundtrip() {
        let locker = Locker::new(manager());
        assert!(!locker.is_locked());

        assert!(locker.lock_global(LockMode::Exclusive, Deadline::never()).is_granted());
        assert!(locker.is_locked());
        assert!(locker.is_w());
        assert!(!locker.is_r());
        assert!(locker.is_write_locked());
        assert!(locker.is_read_locked());

        assert!(locker.unlock_global());
        assert!(!locker.is_locked());
        assert_eq!(locker.lock_mode(RESOURCE_ID_GLOBAL), LockMode::None);
    }

    #[test]
    fn test_nested_global_releases_in_steps() {
        let locker = Locker::new(manager());
        assert!(locker.lock_global(LockMode::IntentExclusive, Deadline::never()).is_granted());
        assert!(locker.lock_global(LockMode::IntentExclusive, Deadline::never()).is_granted());

        assert!(!locker.unlock_global());
        assert!(locker.is_locked());
        assert!(locker.unlock_global());
        assert!(!locker.is_locked());
    }

    #[test]
    fn test_nested_global_upgrades_to_stronger_mode() {
        let locker = Locker::new(manager());
        assert!(locker.lock_global(LockMode::IntentExclusive, Deadline::never()).is_granted());
        assert!(locker.lock_global(LockMode::Exclusive, Deadline::never()).is_granted());
        assert!(locker.is_w());

        // Releasing the inner nest keeps the upgraded mode; the lock table
        // holds one request whose mode only drops via downgrade.
        assert!(!locker.unlock_global());
        assert!(locker.is_w());
        assert!(locker.unlock_global());
        assert!(!locker.is_locked());
    }

    #[test]
    fn test_db_lock_hierarchy_and_modes() {
        let locker = Locker::new(manager());
        assert!(locker.lock_global(LockMode::IntentExclusive, Deadline::never()).is_granted());
        assert!(locker.lock(db("app"), LockMode::Exclusive, Deadline::never()).is_granted());

        assert!(locker.is_db_locked_for_mode("app", LockMode::IntentShared));
        assert!(locker.is_db_locked_for_mode("app", LockMode::IntentExclusive));
        assert!(locker.is_db_locked_for_mode("app", LockMode::Shared));
        assert!(locker.is_db_locked_for_mode("app", LockMode::Exclusive));
        assert!(!locker.is_db_locked_for_mode("other", LockMode::IntentShared));

        assert!(locker.unlock(db("app")));
        assert!(locker.unlock_global());
    }

    #[test]
    fn test_shared_db_mode_dominance() {
        let locker = Locker::new(manager());
        locker.lock_global(LockMode::IntentShared, Deadline::never());
        locker.lock(db("app"), LockMode::Shared, Deadline::never());

        assert!(locker.is_db_locked_for_mode("app", LockMode::IntentShared));
        assert!(!locker.is_db_locked_for_mode("app", LockMode::IntentExclusive));
        assert!(locker.is_db_locked_for_mode("app", LockMode::Shared));
        assert!(!locker.is_db_locked_for_mode("app", LockMode::Exclusive));

        locker.unlock(db("app"));
        locker.unlock_global();
    }

    #[test]
    fn test_downgrade_global() {
        let locker = Locker::new(manager());
        locker.lock_global(LockMode::Exclusive, Deadline::never());
        assert!(locker.is_w());

        locker.downgrade(RESOURCE_ID_GLOBAL, LockMode::IntentExclusive);
        assert!(!locker.is_w());
        assert!(locker.is_write_locked());
        assert_eq!(locker.lock_mode(RESOURCE_ID_GLOBAL), LockMode::IntentExclusive);

        locker.unlock_global();
        assert!(!locker.is_locked());
    }

    #[test]
    fn test_tracker_set_by_exclusive_intents_only() {
        let locker = Locker::new(manager());
        locker.lock_global(LockMode::IntentShared, Deadline::never());
        locker.unlock_global();
        locker.lock_global(LockMode::Shared, Deadline::never());
        locker.unlock_global();
        assert!(!locker.acquisition_tracker().global_exclusive_lock_taken());

        locker.lock_global(LockMode::IntentExclusive, Deadline::never());
        locker.unlock_global();
        assert!(locker.acquisition_tracker().global_exclusive_lock_taken());
    }

    #[test]
    fn test_temp_release_requires_single_global_nest() {
        let locker = Locker::new(manager());

        // Nothing held: nothing to save.
        assert!(locker.save_state_and_unlock().is_none());

        locker.lock_global(LockMode::Exclusive, Deadline::never());
        locker.lock_global(LockMode::Exclusive, Deadline::never());
        // Nested global: the save is a no-op and releases nothing.
        assert!(locker.save_state_and_unlock().is_none());
        assert!(locker.is_w());
        locker.unlock_global();
        locker.unlock_global();
    }

    #[test]
    fn test_temp_release_restores_stack() {
        let locker = Locker::new(manager());
        locker.lock_global(LockMode::IntentExclusive, Deadline::never());
        locker.lock(db("app"), LockMode::IntentExclusive, Deadline::never());

        let snapshot = locker.save_state_and_unlock().expect("stack should be saved");
        assert!(!locker.is_locked());
        assert_eq!(locker.lock_mode(db("app")), LockMode::None);

        locker.restore_state(snapshot);
        assert_eq!(locker.lock_mode(RESOURCE_ID_GLOBAL), LockMode::IntentExclusive);
        assert_eq!(locker.lock_mode(db("app")), LockMode::IntentExclusive);

        locker.unlock(db("app"));
        locker.unlock_global();
    }

    #[test]
    fn test_journal_flush_coupling() {
        let locker = Locker::with_options(manager(), LockerOptions::legacy_journaled());
        locker.lock_global(LockMode::Exclusive, Deadline::never());
        assert_eq!(
            locker.lock_mode(RESOURCE_ID_JOURNAL_FLUSH),
            LockMode::IntentExclusive
        );

        // A downgrade of the global leaves the flush lock untouched.
        locker.downgrade(RESOURCE_ID_GLOBAL, LockMode::IntentExclusive);
        assert_eq!(
            locker.lock_mode(RESOURCE_ID_JOURNAL_FLUSH),
            LockMode::IntentExclusive
        );

        locker.unlock_global();
        assert_eq!(locker.lock_mode(RESOURCE_ID_JOURNAL_FLUSH), LockMode::None);
        assert!(!locker.is_locked());
    }

    #[test]
    fn test_wuow_defers_exclusive_release() {
        let locker = Locker::new(manager());
        locker.begin_write_unit_of_work();

        locker.lock_global(LockMode::IntentExclusive, Deadline::never());
        assert!(!locker.unlock_global());
        // Still held: the release is deferred to the end of the unit.
        assert!(locker.is_locked());

        locker.end_write_unit_of_work();
        assert!(!locker.is_locked());
    }

    #[test]
    fn test_wuow_does_not_defer_shared_release() {
        let locker = Locker::new(manager());
        locker.begin_write_unit_of_work();

        locker.lock_global(LockMode::IntentShared, Deadline::never());
        assert!(locker.unlock_global());
        assert!(!locker.is_locked());

        locker.end_write_unit_of_work();
    }
}
