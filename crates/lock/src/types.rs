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

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Lock mode for a resource acquisition.
///
/// Intent modes declare the intention to take stronger locks further down the
/// hierarchy and are compatible with each other; `Shared`/`Exclusive` lock the
/// resource itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockMode {
    /// Not locked
    None = 0,
    /// Intent shared (IS)
    IntentShared = 1,
    /// Intent exclusive (IX)
    IntentExclusive = 2,
    /// Shared (S)
    Shared = 3,
    /// Exclusive (X)
    Exclusive = 4,
}

/// Number of distinct lock modes, for mode-indexed tables.
pub const LOCK_MODES_COUNT: usize = 5;

const fn bit(mode: LockMode) -> u32 {
    1 << (mode as u32)
}

/// Conflict mask per mode. Two modes are compatible iff neither appears in
/// the other's mask; the relation is symmetric.
const CONFLICT_TABLE: [u32; LOCK_MODES_COUNT] = [
    // None
    0,
    // IntentShared: conflicts with X
    bit(LockMode::Exclusive),
    // IntentExclusive: conflicts with S, X
    bit(LockMode::Shared) | bit(LockMode::Exclusive),
    // Shared: conflicts with IX, X
    bit(LockMode::IntentExclusive) | bit(LockMode::Exclusive),
    // Exclusive: conflicts with everything
    bit(LockMode::IntentShared)
        | bit(LockMode::IntentExclusive)
        | bit(LockMode::Shared)
        | bit(LockMode::Exclusive),
];

/// Bitmask of the intent modes, used to decide partitioned placement.
pub(crate) const INTENT_MODES_MASK: u32 =
    bit(LockMode::IntentShared) | bit(LockMode::IntentExclusive);

impl LockMode {
    /// Single-bit mask for this mode, for accumulating granted/conflict sets.
    #[inline]
    pub(crate) const fn mask(self) -> u32 {
        bit(self)
    }

    /// Whether this mode conflicts with any mode in `mode_mask`.
    #[inline]
    pub(crate) const fn conflicts_with(self, mode_mask: u32) -> bool {
        CONFLICT_TABLE[self as usize] & mode_mask != 0
    }

    /// Whether two individual modes are compatible.
    #[inline]
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        !self.conflicts_with(other.mask())
    }

    /// Whether holding `cover` satisfies a requirement for `self`.
    ///
    /// A mode is covered when the covering mode's conflict set is a superset
    /// of its own. This yields NONE < IS < {IX, S} < X, with IX and S
    /// mutually non-covering.
    #[inline]
    pub fn is_covered_by(self, cover: LockMode) -> bool {
        CONFLICT_TABLE[self as usize] | CONFLICT_TABLE[cover as usize]
            == CONFLICT_TABLE[cover as usize]
    }

    /// Shared-flavor modes (IS, S) request read access.
    #[inline]
    pub fn is_shared(self) -> bool {
        matches!(self, LockMode::IntentShared | LockMode::Shared)
    }

    /// Intent modes (IS, IX) only declare intent and lock nothing themselves.
    #[inline]
    pub fn is_intent(self) -> bool {
        matches!(self, LockMode::IntentShared | LockMode::IntentExclusive)
    }

    /// Short diagnostic name, matching the conventional mode vocabulary.
    pub fn name(self) -> &'static str {
        match self {
            LockMode::None => "NONE",
            LockMode::IntentShared => "IS",
            LockMode::IntentExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::Exclusive => "X",
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resource granularity levels.
///
/// `Global` and `JournalFlush` are singletons; the rest are named. `Mutex`
/// resources stand outside the global hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceType {
    Invalid = 0,
    Global = 1,
    JournalFlush = 2,
    Database = 3,
    Collection = 4,
    Mutex = 5,
}

impl ResourceType {
    fn from_bits(bits: u64) -> ResourceType {
        match bits {
            1 => ResourceType::Global,
            2 => ResourceType::JournalFlush,
            3 => ResourceType::Database,
            4 => ResourceType::Collection,
            5 => ResourceType::Mutex,
            _ => ResourceType::Invalid,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceType::Invalid => "Invalid",
            ResourceType::Global => "Global",
            ResourceType::JournalFlush => "JournalFlush",
            ResourceType::Database => "Database",
            ResourceType::Collection => "Collection",
            ResourceType::Mutex => "Mutex",
        }
    }
}

/// Well-known ids for the singleton resources.
pub const SINGLETON_GLOBAL: u64 = 1;
pub const SINGLETON_JOURNAL_FLUSH: u64 = 2;

const RESOURCE_TYPE_BITS: u32 = 3;
const RESOURCE_ID_BITS: u32 = 64 - RESOURCE_TYPE_BITS;
const RESOURCE_ID_MASK: u64 = (1 << RESOURCE_ID_BITS) - 1;

/// 64-bit resource identity: the resource type in the top bits and a
/// deterministic hash of the resource name (or a singleton id) below.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Identity for a named resource. The same (type, name) pair always
    /// produces the same id within a process.
    pub fn new(resource_type: ResourceType, name: &str) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut hasher);
        Self::from_parts(resource_type, hasher.finish())
    }

    /// Identity for a singleton resource with a well-known id.
    pub const fn singleton(resource_type: ResourceType, id: u64) -> Self {
        Self::from_parts(resource_type, id)
    }

    const fn from_parts(resource_type: ResourceType, id: u64) -> Self {
        ResourceId(((resource_type as u64) << RESOURCE_ID_BITS) | (id & RESOURCE_ID_MASK))
    }

    pub fn resource_type(&self) -> ResourceType {
        ResourceType::from_bits(self.0 >> RESOURCE_ID_BITS)
    }

    /// The full 64-bit value, usable as a stable hash key.
    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.resource_type() != ResourceType::Invalid
    }
}

/// The singleton resource guarding the entire namespace; always the
/// outermost lock in the hierarchy.
pub const RESOURCE_ID_GLOBAL: ResourceId =
    ResourceId::singleton(ResourceType::Global, SINGLETON_GLOBAL);

/// The singleton resource serializing journal flushes on the legacy engine.
pub const RESOURCE_ID_JOURNAL_FLUSH: ResourceId =
    ResourceId::singleton(ResourceType::JournalFlush, SINGLETON_JOURNAL_FLUSH);

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.resource_type().name(), self.0 & RESOURCE_ID_MASK)
    }
}

impl std::fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceId({self})")
    }
}

/// Outcome of a lock operation. All signals are in the return code; the
/// manager never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockResult {
    /// The request is granted and the caller holds the resource.
    Granted,
    /// The request is enqueued; the caller must wait for the grant.
    Waiting,
    /// The deadline expired before grant. The request has been removed and
    /// no side effects persist.
    TimedOut,
}

impl LockResult {
    pub fn is_granted(self) -> bool {
        self == LockResult::Granted
    }
}

/// Absolute deadline for a blocking acquisition.
///
/// `Deadline::never()` waits forever; a deadline at or before the current
/// instant turns the acquisition into a try-lock. Cancellation is expressed
/// as an already-expired deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Never time out.
    pub const fn never() -> Self {
        Deadline(None)
    }

    /// Expire immediately: a pure try-lock.
    pub fn now() -> Self {
        Deadline(Some(Instant::now()))
    }

    /// Expire after `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    /// Expire at the given instant.
    pub const fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    pub fn is_never(&self) -> bool {
        self.0.is_none()
    }

    pub fn has_passed(&self) -> bool {
        match self.0 {
            Some(instant) => instant <= Instant::now(),
            None => false,
        }
    }

    /// The earlier of two deadlines.
    pub fn earliest(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (Some(a), None) => Deadline(Some(a)),
            (None, b) => Deadline(b),
        }
    }

    /// The wait target, if bounded.
    pub(crate) fn instant(&self) -> Option<Instant> {
        self.0
    }
}
