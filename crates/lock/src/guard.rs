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

//! Scoped acquisition helpers.
//!
//! Each helper acquires on construction and releases on `Drop`, on every
//! exit path. Failed acquisitions are reported through `is_locked()`, never
//! as errors. The helpers compose the hierarchy: a [`DbLock`] embeds the
//! global lock it rides on, a [`CollectionLock`] requires its database lock
//! to be held by the caller.

use std::sync::Arc;

use crate::locker::Locker;
use crate::types::{Deadline, LockMode, LockResult, ResourceId, ResourceType};

/// Database whose write locks are escalated to X, serializing direct writes
/// to the privilege collections.
pub const SYSTEM_DB_NAME: &str = "admin";

/// Scoped global lock at an arbitrary mode.
///
/// Construction with [`GlobalLock::new`] blocks until granted or the
/// deadline expires. [`GlobalLock::enqueue_only`] enqueues without waiting;
/// drive it with [`GlobalLock::wait_for_lock_until`], which may be called
/// repeatedly while the request's own deadline has not expired.
pub struct GlobalLock<'a> {
    locker: &'a Locker,
    result: LockResult,
}

impl<'a> GlobalLock<'a> {
    pub fn new(locker: &'a Locker, mode: LockMode, deadline: Deadline) -> Self {
        // Admission itself may time out, in which case there is nothing to
        // wait for.
        let mut lock = Self::enqueue_only(locker, mode, deadline);
        if lock.result == LockResult::Waiting {
            lock.wait_for_lock_until(deadline);
        }
        lock
    }

    /// Enqueue without waiting for the grant.
    pub fn enqueue_only(locker: &'a Locker, mode: LockMode, deadline: Deadline) -> Self {
        let result = locker.lock_global_begin(mode, deadline);
        Self { locker, result }
    }

    /// Wait for a pending grant until `deadline` (capped by the deadline
    /// given at enqueue). Leaves the request queued if only the wait bound
    /// expired; removes it once its own deadline has passed. Calling this
    /// again after a timeout is a contract violation.
    pub fn wait_for_lock_until(&mut self, deadline: Deadline) {
        assert_ne!(
            self.result,
            LockResult::TimedOut,
            "wait_for_lock_until on a timed-out global lock"
        );
        if self.result == LockResult::Waiting {
            self.result = self.locker.lock_global_complete(deadline);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.result.is_granted()
    }
}

impl Drop for GlobalLock<'_> {
    fn drop(&mut self) {
        match self.result {
            LockResult::Granted => {
                self.locker.unlock_global();
            }
            LockResult::Waiting => {
                self.locker.cancel_global_enqueue();
            }
            LockResult::TimedOut => {}
        }
    }
}

/// Scoped global S lock.
pub struct GlobalRead<'a> {
    lock: GlobalLock<'a>,
}

impl<'a> GlobalRead<'a> {
    pub fn new(locker: &'a Locker) -> Self {
        Self::with_deadline(locker, Deadline::never())
    }

    pub fn with_deadline(locker: &'a Locker, deadline: Deadline) -> Self {
        Self {
            lock: GlobalLock::new(locker, LockMode::Shared, deadline),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Scoped global X lock.
pub struct GlobalWrite<'a> {
    lock: GlobalLock<'a>,
}

impl<'a> GlobalWrite<'a> {
    pub fn new(locker: &'a Locker) -> Self {
        Self::with_deadline(locker, Deadline::never())
    }

    pub fn with_deadline(locker: &'a Locker, deadline: Deadline) -> Self {
        Self {
            lock: GlobalLock::new(locker, LockMode::Exclusive, deadline),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Scoped database lock.
///
/// Acquires the global lock at the matching intent mode first (IS for
/// shared requests, IX otherwise), then the database resource itself, so a
/// write-mode database lock has the side effect of taking global IX.
/// Non-shared locks on the system database are escalated to X.
pub struct DbLock<'a> {
    locker: &'a Locker,
    resource: ResourceId,
    result: LockResult,
    mode: LockMode,
    // Field order keeps the database release (in drop) ahead of the global
    // release (field drop).
    _global: GlobalLock<'a>,
}

impl<'a> DbLock<'a> {
    pub fn new(locker: &'a Locker, db_name: &str, mode: LockMode) -> Self {
        Self::with_deadline(locker, db_name, mode, Deadline::never())
    }

    pub fn with_deadline(locker: &'a Locker, db_name: &str, mode: LockMode, deadline: Deadline) -> Self {
        assert!(
            !db_name.is_empty() && !db_name.contains('.'),
            "need a valid database name, got '{db_name}'"
        );

        let global_mode = if mode.is_shared() {
            LockMode::IntentShared
        } else {
            LockMode::IntentExclusive
        };
        let global = GlobalLock::new(locker, global_mode, deadline);

        let effective_mode = if db_name == SYSTEM_DB_NAME && !mode.is_shared() {
            LockMode::Exclusive
        } else {
            mode
        };

        let resource = ResourceId::new(ResourceType::Database, db_name);
        let result = if global.is_locked() {
            locker.lock(resource, effective_mode, deadline)
        } else {
            LockResult::TimedOut
        };

        Self {
            locker,
            resource,
            result,
            mode: effective_mode,
            _global: global,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.result.is_granted()
    }

    /// The effective mode taken, after any system-database escalation.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for DbLock<'_> {
    fn drop(&mut self) {
        if self.result.is_granted() {
            self.locker.unlock(self.resource);
        }
    }
}

/// Scoped collection lock.
///
/// The caller must already hold the parent database at a compatible intent
/// (or stronger) mode. On engines without document-level locking the
/// requested mode is promoted to the collection level: IS is taken as S and
/// IX as X, so `is_collection_locked_for_mode` reports the promoted mode.
pub struct CollectionLock<'a> {
    locker: &'a Locker,
    resource: ResourceId,
    result: LockResult,
}

impl<'a> CollectionLock<'a> {
    pub fn new(locker: &'a Locker, namespace: &str, mode: LockMode) -> Self {
        Self::with_deadline(locker, namespace, mode, Deadline::never())
    }

    pub fn with_deadline(
        locker: &'a Locker,
        namespace: &str,
        mode: LockMode,
        deadline: Deadline,
    ) -> Self {
        let (db_name, collection) = namespace
            .split_once('.')
            .unwrap_or_else(|| panic!("need a db.collection namespace, got '{namespace}'"));
        assert!(!collection.is_empty(), "need a db.collection namespace, got '{namespace}'");
        assert!(
            locker.is_db_locked_for_mode(
                db_name,
                if mode.is_shared() {
                    LockMode::IntentShared
                } else {
                    LockMode::IntentExclusive
                }
            ),
            "collection lock on '{namespace}' without a compatible database lock"
        );

        let effective_mode = if locker.supports_document_locking() {
            mode
        } else if mode.is_shared() {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };

        let resource = ResourceId::new(ResourceType::Collection, namespace);
        let result = locker.lock(resource, effective_mode, deadline);
        Self { locker, resource, result }
    }

    pub fn is_locked(&self) -> bool {
        self.result.is_granted()
    }
}

impl Drop for CollectionLock<'_> {
    fn drop(&mut self) {
        if self.result.is_granted() {
            self.locker.unlock(self.resource);
        }
    }
}

/// Named multi-reader/single-writer mutex at the `Mutex` resource level.
///
/// Participates in the general lock table (and thus the FIFO and
/// compatibleFirst policies) but never touches tickets or the global
/// hierarchy. Clone-able handle; clones name the same underlying resource.
#[derive(Debug, Clone)]
pub struct ResourceMutex {
    resource: ResourceId,
    label: Arc<str>,
}

impl ResourceMutex {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        let label = label.into();
        Self {
            resource: ResourceId::new(ResourceType::Mutex, &label),
            label,
        }
    }

    pub fn name(&self) -> &str {
        &self.label
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource
    }
}

/// Scoped lock on an arbitrary resource, with re-lock support.
pub struct ResourceLock<'a> {
    locker: &'a Locker,
    resource: ResourceId,
    locked: bool,
}

impl<'a> ResourceLock<'a> {
    pub fn new(locker: &'a Locker, resource: ResourceId, mode: LockMode) -> Self {
        let mut lock = Self {
            locker,
            resource,
            locked: false,
        };
        lock.lock(mode);
        lock
    }

    /// Acquire (or re-acquire after `unlock`) at `mode`, blocking without a
    /// deadline.
    pub fn lock(&mut self, mode: LockMode) {
        assert!(!self.locked, "resource lock on {} is already held", self.resource);
        let result = self.locker.lock(self.resource, mode, Deadline::never());
        self.locked = result.is_granted();
    }

    pub fn unlock(&mut self) {
        assert!(self.locked, "resource lock on {} is not held", self.resource);
        self.locker.unlock(self.resource);
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for ResourceLock<'_> {
    fn drop(&mut self) {
        if self.locked {
            self.unlock();
        }
    }
}

/// Shared (IS) hold on a [`ResourceMutex`].
pub struct SharedLock<'a> {
    inner: ResourceLock<'a>,
}

impl<'a> SharedLock<'a> {
    pub fn new(locker: &'a Locker, mutex: &ResourceMutex) -> Self {
        Self {
            inner: ResourceLock::new(locker, mutex.resource_id(), LockMode::IntentShared),
        }
    }

    pub fn lock(&mut self, mode: LockMode) {
        self.inner.lock(mode);
    }

    pub fn unlock(&mut self) {
        self.inner.unlock();
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Exclusive (X) hold on a [`ResourceMutex`].
pub struct ExclusiveLock<'a> {
    inner: ResourceLock<'a>,
}

impl<'a> ExclusiveLock<'a> {
    pub fn new(locker: &'a Locker, mutex: &ResourceMutex) -> Self {
        Self {
            inner: ResourceLock::new(locker, mutex.resource_id(), LockMode::Exclusive),
        }
    }

    pub fn lock(&mut self, mode: LockMode) {
        self.inner.lock(mode);
    }

    pub fn unlock(&mut self) {
        self.inner.unlock();
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Temporarily release every lock the operation holds; reacquire on scope
/// exit, blocking without a deadline.
///
/// A no-op when the hierarchy beneath the global lock is non-empty (the
/// global request is nested) or when no global lock is held at all, so a
/// TempRelease nested inside enclosing scopes leaves the outer state
/// unchanged throughout.
pub struct TempRelease<'a> {
    locker: &'a Locker,
    snapshot: Option<crate::locker::LockSnapshot>,
}

impl<'a> TempRelease<'a> {
    pub fn new(locker: &'a Locker) -> Self {
        Self {
            locker,
            snapshot: locker.save_state_and_unlock(),
        }
    }

    /// Whether any locks were actually released.
    pub fn released(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl Drop for TempRelease<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            debug_assert!(!self.locker.is_locked());
            self.locker.restore_state(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LockManager;
    use crate::types::{RESOURCE_ID_GLOBAL, ResourceType};

    fn locker() -> Locker {
        Locker::new(Arc::new(LockManager::default()))
    }

    #[test]
    fn test_global_read_and_write() {
        let locker = locker();
        {
            let read = GlobalRead::new(&locker);
            assert!(read.is_locked());
            assert!(locker.is_r());
        }
        assert!(!locker.is_locked());
        {
            let write = GlobalWrite::new(&locker);
            assert!(write.is_locked());
            assert!(locker.is_w());
        }
        assert!(!locker.is_locked());
    }

    #[test]
    fn test_global_write_then_read_keeps_exclusive() {
        let locker = locker();
        let _write = GlobalWrite::new(&locker);
        assert!(locker.is_w());
        {
            let read = GlobalRead::new(&locker);
            assert!(read.is_locked());
            assert!(locker.is_w());
        }
        assert!(locker.is_w());
    }

    #[test]
    fn test_db_lock_takes_global_intent() {
        let locker = locker();
        let db = DbLock::new(&locker, "app", LockMode::Shared);
        assert!(db.is_locked());
        assert_eq!(locker.lock_mode(RESOURCE_ID_GLOBAL), LockMode::IntentShared);
        assert_eq!(
            locker.lock_mode(ResourceId::new(ResourceType::Database, "app")),
            LockMode::Shared
        );
    }

    #[test]
    fn test_system_db_write_escalates_to_exclusive() {
        let locker = locker();
        {
            let db = DbLock::new(&locker, SYSTEM_DB_NAME, LockMode::IntentExclusive);
            assert_eq!(db.mode(), LockMode::Exclusive);
            assert!(locker.is_db_locked_for_mode(SYSTEM_DB_NAME, LockMode::Exclusive));
        }
        {
            let db = DbLock::new(&locker, SYSTEM_DB_NAME, LockMode::IntentShared);
            assert_eq!(db.mode(), LockMode::IntentShared);
        }
    }

    #[test]
    fn test_resource_mutex_labels() {
        let mutex = ResourceMutex::new("index-builds");
        assert_eq!(mutex.name(), "index-builds");
        let other = ResourceMutex::new("oplog-truncation");
        assert_eq!(other.name(), "oplog-truncation");
        assert_ne!(mutex.resource_id(), other.resource_id());
    }

    #[test]
    fn test_shared_lock_relock() {
        let manager_locker = locker();
        let mutex = ResourceMutex::new("relock");
        let mut shared = SharedLock::new(&manager_locker, &mutex);
        assert!(shared.is_locked());
        shared.unlock();
        assert!(!shared.is_locked());
        shared.lock(LockMode::IntentShared);
        assert!(shared.is_locked());
    }

    #[test]
    fn test_mutex_stays_out_of_global_hierarchy() {
        let locker = locker();
        let mutex = ResourceMutex::new("standalone");
        let exclusive = ExclusiveLock::new(&locker, &mutex);
        assert!(exclusive.is_locked());
        assert!(!locker.is_locked());
    }

    #[test]
    fn test_temp_release_around_global_write() {
        let locker = locker();
        let _write = GlobalWrite::new(&locker);
        {
            let release = TempRelease::new(&locker);
            assert!(release.released());
            assert!(!locker.is_locked());
        }
        assert!(locker.is_w());
    }

    #[test]
    fn test_temp_release_nested_is_noop() {
        let locker = locker();
        let _write = GlobalWrite::new(&locker);
        let _db = DbLock::new(&locker, "app", LockMode::Exclusive);
        {
            let release = TempRelease::new(&locker);
            assert!(!release.released());
            assert!(locker.is_w());
            assert!(locker.is_db_locked_for_mode("app", LockMode::Exclusive));
        }
        assert!(locker.is_w());
    }
}
