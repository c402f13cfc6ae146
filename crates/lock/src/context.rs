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

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::LockerOptions;
use crate::locker::Locker;
use crate::manager::LockManager;

/// Storage-engine snapshot collaborator. The locker invokes
/// `abandon_snapshot` when the last global lock is released outside a write
/// unit of work.
pub trait RecoveryUnit: Send + Sync {
    fn abandon_snapshot(&self);
}

/// Per-operation sticky bit recording whether a global exclusive intent
/// (X or IX) was ever successfully taken. Monotone: once set it stays set;
/// timed-out attempts and shared acquisitions never set it.
#[derive(Debug, Default)]
pub struct GlobalLockAcquisitionTracker {
    global_exclusive_lock_taken: AtomicBool,
}

impl GlobalLockAcquisitionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global_exclusive_lock_taken(&self) -> bool {
        self.global_exclusive_lock_taken.load(Ordering::Acquire)
    }

    pub(crate) fn set_global_exclusive_lock_taken(&self) {
        self.global_exclusive_lock_taken.store(true, Ordering::Release);
    }
}

/// Per-operation diagnostics counters.
#[derive(Debug, Default)]
pub struct OpDebug {
    write_conflicts: AtomicU64,
}

impl OpDebug {
    pub fn write_conflicts(&self) -> u64 {
        self.write_conflicts.load(Ordering::Relaxed)
    }

    pub fn record_write_conflict(&self) {
        self.write_conflicts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Opaque per-operation handle: the locker plus operation diagnostics.
/// Collaborators (recovery unit, ticket holders) are wired through the
/// locker.
pub struct OperationContext {
    locker: Locker,
    op_debug: OpDebug,
}

impl OperationContext {
    pub fn new(manager: Arc<LockManager>) -> Self {
        Self {
            locker: Locker::new(manager),
            op_debug: OpDebug::default(),
        }
    }

    pub fn with_options(manager: Arc<LockManager>, options: LockerOptions) -> Self {
        Self {
            locker: Locker::with_options(manager, options),
            op_debug: OpDebug::default(),
        }
    }

    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    pub fn op_debug(&self) -> &OpDebug {
        &self.op_debug
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("locker_id", &self.locker.id())
            .field("write_conflicts", &self.op_debug.write_conflicts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_is_monotone() {
        let tracker = GlobalLockAcquisitionTracker::new();
        assert!(!tracker.global_exclusive_lock_taken());
        tracker.set_global_exclusive_lock_taken();
        assert!(tracker.global_exclusive_lock_taken());
        tracker.set_global_exclusive_lock_taken();
        assert!(tracker.global_exclusive_lock_taken());
    }

    #[test]
    fn test_op_debug_counts_conflicts() {
        let debug = OpDebug::default();
        assert_eq!(debug.write_conflicts(), 0);
        debug.record_write_conflict();
        debug.record_write_conflict();
        assert_eq!(debug.write_conflicts(), 2);
    }
}
