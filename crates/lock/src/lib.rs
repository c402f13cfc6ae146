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

//! Hierarchical, multi-granularity lock manager for the FerroDB storage
//! engine.
//!
//! ## Core pieces
//!
//! 1. **Lock table** ([`LockManager`]) - sharded hash table of per-resource
//!    queues with FIFO conflict ordering, compatibleFirst promotion for
//!    read-dominated workloads, mode conversions, downgrades, and
//!    partitioned heads for hot intent-only traffic.
//! 2. **Per-operation holder** ([`Locker`]) - records every granted
//!    request, enforces the Global > Database > Collection hierarchy,
//!    drives ticket admission and the recovery-unit snapshot hook, and
//!    brackets write units of work with two-phase release.
//! 3. **Scoped helpers** ([`GlobalRead`], [`GlobalWrite`], [`GlobalLock`],
//!    [`DbLock`], [`CollectionLock`], [`ResourceMutex`], [`TempRelease`]) -
//!    RAII acquisition with release on every exit path.
//! 4. **Admission** ([`TicketHolder`]) - a counting semaphore bounding
//!    concurrent global acquisitions.
//!
//! Every blocking entry point takes an absolute [`Deadline`]; lock-level
//! outcomes are [`LockResult`] return codes, never errors.

pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod locker;
pub mod manager;
pub mod request;
pub mod retry;
pub mod ticket;
pub mod types;

pub use config::{LockManagerConfig, LockerOptions};
pub use context::{GlobalLockAcquisitionTracker, OpDebug, OperationContext, RecoveryUnit};
pub use error::{LockError, Result};
pub use guard::{
    CollectionLock, DbLock, ExclusiveLock, GlobalLock, GlobalRead, GlobalWrite, ResourceLock,
    ResourceMutex, SharedLock, TempRelease, SYSTEM_DB_NAME,
};
pub use locker::{LockSnapshot, Locker};
pub use manager::LockManager;
pub use request::LockRequest;
pub use retry::write_conflict_retry;
pub use ticket::TicketHolder;
pub use types::{
    Deadline, LockMode, LockResult, ResourceId, ResourceType, RESOURCE_ID_GLOBAL,
    RESOURCE_ID_JOURNAL_FLUSH,
};
